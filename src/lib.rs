pub mod agent;
pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod membership;
pub mod server;
pub mod storage;

use crate::errors::*;

/// Type aliases for Results in this crate
pub type StorageResult<T> = Result<T, StorageError>;
pub type IndexResult<T> = Result<T, IndexError>;
pub type SegmentResult<T> = Result<T, SegmentError>;
pub type LogResult<T> = Result<T, LogError>;
pub type ConsensusResult<T> = Result<T, ConsensusError>;
pub type MembershipResult<T> = Result<T, MembershipError>;
pub type AuthResult<T> = Result<T, AuthError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ServerResult<T> = Result<T, ServerError>;
pub type AgentResult<T> = Result<T, AgentError>;
