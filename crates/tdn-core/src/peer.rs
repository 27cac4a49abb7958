use std::net::IpAddr;
use std::str::FromStr;

/// Network address of a peer.  Rendered as `ip:port` because the
/// peer-association repository persists addresses as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("peer address missing port: {s}"))?;
        Ok(Self {
            ip: ip.parse()?,
            port: port.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_addr_display_parse_roundtrip() {
        let addr = PeerAddr {
            ip: "10.0.0.7".parse().expect("valid ip"),
            port: 7320,
        };
        let parsed: PeerAddr = addr.to_string().parse().expect("parse back");
        assert_eq!(parsed, addr);
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert!("10.0.0.7".parse::<PeerAddr>().is_err());
    }
}
