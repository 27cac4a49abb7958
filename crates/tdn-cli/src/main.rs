use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use tdn_core::{
    content::DataDescriptor, ContentHash, FetchService, NodeConfig, RetainAll, Signature,
    SqliteAssociations, SystemClock, TcpNetwork, TransactionLookup,
};

#[derive(Parser)]
#[command(name = "tdn")]
#[command(about = "Transaction data network node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve and relay data files on the network.
    Serve {
        /// Directory holding the content store and association database.
        #[arg(long, default_value = "tdn-data")]
        data_dir: PathBuf,
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Answer requests from local storage only; never forward on
        /// behalf of a third party.
        #[arg(long)]
        no_relay: bool,
    },
    /// Print the content hash of a local file.
    Hash { path: PathBuf },
}

/// Stands in for the blockchain transaction store until one is wired
/// in: every signature is unknown, so the node serves and relays but
/// never fetches on its own.
struct NoChain;

#[async_trait]
impl TransactionLookup for NoChain {
    async fn data_descriptor(
        &self,
        _signature: &Signature,
    ) -> anyhow::Result<Option<DataDescriptor>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            data_dir,
            listen,
            no_relay,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .init();

            let mut config = NodeConfig::default();
            if let Some(listen) = listen {
                config.listen = Some(listen);
            }
            config.relay_enabled = !no_relay;

            let store = Arc::new(tdn_core::DiskStore::open(data_dir.join("files"))?);
            let associations = SqliteAssociations::open(data_dir.join("associations.db"))?;
            let network = TcpNetwork::new(config.request_timeout);
            let policy = Arc::new(RetainAll);

            let bind = config
                .listen
                .ok_or_else(|| anyhow::anyhow!("no listen address configured"))?;
            let service = FetchService::new(
                store,
                Arc::new(NoChain),
                associations,
                policy.clone(),
                policy,
                network,
                Arc::new(SystemClock),
                config,
            );
            service.spawn_sweeper();

            let listener = TcpListener::bind(bind).await?;
            tracing::info!("tdn: serving data files on {bind}");
            tdn_core::serve(listener, service).await?;
        }
        Command::Hash { path } => {
            let bytes = std::fs::read(&path)?;
            println!("{}", ContentHash::from_bytes(&bytes));
        }
    }

    Ok(())
}
