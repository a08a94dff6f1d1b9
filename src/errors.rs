use std::io;
use thiserror::Error;

/// Storage (store file) errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open store file: {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write to store at position {position}")]
    WriteFailed {
        position: u64,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read from store at position {position}")]
    ReadFailed {
        position: u64,
        #[source]
        source: io::Error,
    },

    #[error("Read position {position} is beyond store size {size}")]
    ReadBeyondEnd { position: u64, size: u64 },

    #[error("Failed to flush store buffer")]
    FlushFailed {
        #[source]
        source: io::Error,
    },

    #[error("Failed to truncate store to {size} bytes")]
    TruncateFailed {
        size: u64,
        #[source]
        source: io::Error,
    },
}

/// Index-related errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to open index file: {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Memory mapping failed for size {size}")]
    MmapFailed {
        size: u64,
        #[source]
        source: io::Error,
    },

    /// The index is empty, the entry is out of range, or the mapped
    /// region is exhausted. Exhaustion is the segment rollover signal.
    #[error("Index entry out of bounds")]
    Eof,

    #[error("Index file is corrupted: {reason}")]
    CorruptedFile { reason: String },

    #[error("Failed to flush and shrink index file")]
    CloseFailed {
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("Segment is maxed: base={base_offset}")]
    Maxed { base_offset: u64 },

    #[error("Offset {offset} out of range for segment {base_offset}..{next_offset}")]
    OffsetOutOfRange {
        offset: u64,
        base_offset: u64,
        next_offset: u64,
    },

    #[error("Failed to decode record at offset {offset}")]
    Decode {
        offset: u64,
        #[source]
        source: prost::DecodeError,
    },

    #[error("Failed to remove segment file: {path}")]
    RemoveFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Directory error for path {path}")]
    DirectoryError {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },

    #[error("Log is closed")]
    Closed,

    #[error("Failed to open segment files for reading")]
    ReaderFailed {
        #[source]
        source: io::Error,
    },

    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),
}

/// Consensus-related errors
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Not the leader, current leader is {leader_hint:?}")]
    NotLeader { leader_hint: Option<String> },

    #[error("No leader elected")]
    NoLeader,

    #[error("Unknown command type: {tag}")]
    UnknownCommand { tag: u8 },

    #[error("Failed to decode command payload")]
    CommandDecode {
        #[source]
        source: prost::DecodeError,
    },

    #[error("Failed to persist consensus state")]
    StateStore {
        #[source]
        source: io::Error,
    },

    #[error("Snapshot I/O failed")]
    Snapshot {
        #[source]
        source: io::Error,
    },

    #[error("Consensus transport failed")]
    Transport {
        #[source]
        source: io::Error,
    },

    #[error("Bad consensus frame: {reason}")]
    Frame { reason: String },

    #[error("Consensus node is shut down")]
    Shutdown,

    #[error("Log error: {0}")]
    Log(#[from] LogError),
}

/// Membership (gossip) errors
#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Failed to bind gossip socket at {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Bad gossip frame: {reason}")]
    Frame { reason: String },

    #[error("Membership has left the cluster")]
    Left,
}

/// Policy engine errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{subject} not permitted to {action} to {object}")]
    Denied {
        subject: String,
        object: String,
        action: String,
    },

    #[error("Failed to read ACL model file: {path}")]
    Model {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read ACL policy file: {path}")]
    Policy {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Malformed policy rule at {path}:{line}")]
    Malformed { path: String, line: usize },
}

/// TLS and addressing configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("No private key found in {path}")]
    NoPrivateKey { path: String },

    #[error("TLS configuration rejected: {reason}")]
    Tls { reason: String },

    #[error("Invalid address: {addr}")]
    InvalidAddr { addr: String },
}

/// Errors surfaced by the commit log behind the RPC server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to bind RPC listener at {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}
