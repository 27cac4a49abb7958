pub mod clock;
pub mod config;
pub mod content;
pub mod fetch;
pub mod ids;
pub mod net;
pub mod peer;
pub mod relay;
pub mod repository;
pub mod requests;
pub mod store;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NodeConfig;
pub use content::{ChunkManifest, DataDescriptor, DataFile};
pub use fetch::FetchService;
pub use ids::{ContentHash, Signature};
pub use net::{handle_connection, read_envelope, serve, write_envelope, Network, TcpNetwork};
pub use peer::PeerAddr;
pub use relay::{RelayCache, RelayLead};
pub use repository::{
    ContentCache, MemoryAssociations, PeerAssociations, RetainAll, SqliteAssociations,
    StoragePolicy, TransactionLookup,
};
pub use requests::PendingRequests;
pub use store::{ContentStore, DiskStore, MemoryStore};
pub use wire::{
    Envelope, MsgType, SignaturesAnnounce, WirePayload, FLAG_ERROR, FLAG_RESPONSE,
    MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES,
};
