//! The replicated state machine: committed consensus entries carry tagged
//! commands that are applied, in order, to the data log on every node.

use crate::ConsensusResult;
use crate::api::v1::Record;
use crate::errors::ConsensusError;
use crate::storage::log::{Log, LogReader};
use prost::Message;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::instrument;

/// Command tag for appending a record. Tags above this are reserved for
/// future commands.
pub const APPEND_REQUEST_TYPE: u8 = 0;

/// Encodes an append command: one tag byte followed by the prost-encoded
/// record.
pub fn append_command(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + record.encoded_len());
    buf.push(APPEND_REQUEST_TYPE);
    buf.extend_from_slice(&record.encode_to_vec());
    buf
}

/// Applies replicated commands to a single data [`Log`].
pub struct LogFsm {
    log: Arc<Log>,
}

impl LogFsm {
    pub fn new(log: Arc<Log>) -> Self {
        Self { log }
    }

    /// Applies one committed command and returns the offset the record
    /// landed at. The leader hands the offset back to the proposer;
    /// followers discard it.
    #[instrument(skip(self, command), fields(command_len = command.len()))]
    pub fn apply(&self, term: u64, command: &[u8]) -> ConsensusResult<u64> {
        let (tag, payload) = command.split_first().ok_or_else(|| ConsensusError::Frame {
            reason: "empty command".to_string(),
        })?;

        match *tag {
            APPEND_REQUEST_TYPE => {
                let mut record =
                    Record::decode(payload).map_err(|source| ConsensusError::CommandDecode { source })?;
                record.term = term;
                Ok(self.log.append(&mut record)?)
            }
            tag => Err(ConsensusError::UnknownCommand { tag }),
        }
    }

    /// Returns a handle that streams the whole data log.
    pub fn snapshot(&self) -> ConsensusResult<FsmSnapshot> {
        Ok(FsmSnapshot {
            reader: self.log.reader()?,
        })
    }

    /// Replaces the data log with the length-prefixed record stream read
    /// from `reader`. Atomic with respect to readers of the log.
    pub fn restore(&self, reader: &mut impl Read) -> ConsensusResult<u64> {
        Ok(self.log.restore_from(reader)?)
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }
}

/// A point-in-time capture of the FSM state.
pub struct FsmSnapshot {
    reader: LogReader,
}

impl FsmSnapshot {
    /// Copies the captured state to `writer`, returning the byte count.
    pub fn persist<W: Write>(mut self, writer: &mut W) -> io::Result<u64> {
        io::copy(&mut self.reader, writer)
    }
}
