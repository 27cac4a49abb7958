use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen: Option<SocketAddr>,
    /// Master switch: when off the node neither serves nor relays files.
    pub serving_enabled: bool,
    /// When off, inbound requests are never forwarded on behalf of a
    /// third party; relay leads are left to expire.
    pub relay_enabled: bool,
    /// Upper bound on any single peer request, including the dial.
    pub request_timeout: Duration,
    /// Lifetime of a relay lead; longer than `request_timeout` to cover
    /// the extra hop.
    pub relay_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: Some("0.0.0.0:7320".parse().expect("valid socket")),
            serving_enabled: true,
            relay_enabled: true,
            request_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}
