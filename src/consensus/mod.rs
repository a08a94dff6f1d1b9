//! Leader-based replicated log: a compact Raft core, its wire protocol,
//! the state machine it drives, and file-based snapshots.

pub mod distributed;
pub mod fsm;
pub mod node;
pub mod rpc;
pub mod snapshot;
pub mod transport;

pub use distributed::DistributedLog;
pub use fsm::LogFsm;
pub use node::{Raft, RaftConfig};
pub use snapshot::{SnapshotMeta, SnapshotStore};
