use crate::ServerResult;
use crate::api::v1::Record;
use crate::consensus::DistributedLog;
use tokio::sync::futures::Notified;

pub mod grpc;
pub mod mux;
pub mod registry;

/// The commit log behind the RPC server. The production implementation
/// routes appends through consensus; reads always serve local state.
#[tonic::async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> ServerResult<u64>;
    fn read(&self, offset: u64) -> ServerResult<Record>;
    /// Resolves after the next append; grab it before re-checking the
    /// offset being tailed.
    fn notified(&self) -> Notified<'_>;
}

#[tonic::async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> ServerResult<u64> {
        Ok(DistributedLog::append(self, record).await?)
    }

    fn read(&self, offset: u64) -> ServerResult<Record> {
        DistributedLog::read(self, offset)
    }

    fn notified(&self) -> Notified<'_> {
        DistributedLog::notified(self)
    }
}

/// Plain local log, used by server tests that do not need a cluster.
#[cfg(test)]
#[tonic::async_trait]
impl CommitLog for crate::storage::log::Log {
    async fn append(&self, mut record: Record) -> ServerResult<u64> {
        Ok(crate::storage::log::Log::append(self, &mut record)?)
    }

    fn read(&self, offset: u64) -> ServerResult<Record> {
        Ok(crate::storage::log::Log::read(self, offset)?)
    }

    fn notified(&self) -> Notified<'_> {
        crate::storage::log::Log::notified(self)
    }
}
