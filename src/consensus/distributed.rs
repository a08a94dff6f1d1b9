//! The distributed log pairs the local data log with the raft node:
//! appends are proposed through consensus, reads serve the locally
//! applied state.

use crate::api::v1::Record;
use crate::consensus::fsm::append_command;
use crate::consensus::node::Raft;
use crate::errors::ServerError;
use crate::storage::log::Log;
use crate::{ConsensusResult, ServerResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;

pub struct DistributedLog {
    log: Arc<Log>,
    raft: Raft,
}

impl DistributedLog {
    pub fn new(log: Arc<Log>, raft: Raft) -> Self {
        Self { log, raft }
    }

    /// Proposes the record through consensus and returns its offset once
    /// a majority has accepted it and it is applied locally.
    pub async fn append(&self, record: Record) -> ConsensusResult<u64> {
        self.raft.propose(append_command(&record)).await
    }

    /// Reads the locally applied state. Reads on a follower can lag the
    /// leader.
    pub fn read(&self, offset: u64) -> ServerResult<Record> {
        self.log.read(offset).map_err(ServerError::from)
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn leader_addr(&self) -> Option<String> {
        self.raft.leader_addr()
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> ConsensusResult<String> {
        self.raft.wait_for_leader(timeout).await
    }

    pub async fn add_voter(&self, id: &str, addr: &str) -> ConsensusResult<()> {
        self.raft.add_voter(id, addr).await
    }

    pub async fn remove_server(&self, id: &str) -> ConsensusResult<()> {
        self.raft.remove_server(id).await
    }

    /// Writes a snapshot of the applied state to the snapshot store.
    pub async fn take_snapshot(&self) -> ConsensusResult<()> {
        self.raft.take_snapshot().await
    }

    pub fn notified(&self) -> Notified<'_> {
        self.log.notified()
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }
}
