//! Serverless LAN messenger engine: UDP presence discovery, encrypted
//! length-prefixed TCP transport, room-scoped gossip with vector-clock
//! history, and negotiated streaming file transfer.
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod history;
pub mod protocol;
pub mod stager;
pub mod throttle;
pub mod transfer;
pub mod transport;

pub use crypto::SessionCrypto;
pub use discovery::{Peer, PeerDiscovery};
pub use engine::{Engine, EngineConfig, EngineEvent};
pub use history::HistoryLog;
pub use protocol::{Message, MessageKind};
pub use stager::TransferSource;
