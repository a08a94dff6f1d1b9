//! Consensus wire messages and their length-prefixed bincode framing.

use crate::ConsensusResult;
use crate::errors::ConsensusError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Snapshots travel inline, so this has to
/// accommodate a full log snapshot.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// A replicated log entry. `index` and `term` place it in the raft log;
/// `command` is an opaque FSM command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// A voting member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub leader_addr: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
    /// Current voter set. Followers adopt it, which is how configuration
    /// changes reach the rest of the cluster.
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success, the follower's last replicated index. On failure, a
    /// hint for where the leader should back up to.
    pub match_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub leader_addr: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub peers: Vec<Peer>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    Vote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> ConsensusResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ConsensusError::Frame {
            reason: e.to_string(),
        })?;

    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(|source| ConsensusError::Transport { source })?;
    writer
        .write_all(&body)
        .await
        .map_err(|source| ConsensusError::Transport { source })?;
    writer
        .flush()
        .await
        .map_err(|source| ConsensusError::Transport { source })?;

    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> ConsensusResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|source| ConsensusError::Transport { source })?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ConsensusError::Frame {
            reason: format!("frame of {len} bytes exceeds limit"),
        });
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|source| ConsensusError::Transport { source })?;

    bincode::serde::decode_from_slice(&body, bincode::config::standard())
        .map(|(msg, _)| msg)
        .map_err(|e| ConsensusError::Frame {
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() -> ConsensusResult<()> {
        let req = RaftRequest::AppendEntries(AppendEntriesRequest {
            term: 3,
            leader_id: "0".to_string(),
            leader_addr: "127.0.0.1:9001".to_string(),
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![Entry {
                index: 8,
                term: 3,
                command: b"payload".to_vec(),
            }],
            leader_commit: 7,
            peers: vec![Peer {
                id: "0".to_string(),
                addr: "127.0.0.1:9001".to_string(),
            }],
        });

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await?;

        let decoded: RaftRequest = read_frame(&mut &buf[..]).await?;
        match decoded {
            RaftRequest::AppendEntries(a) => {
                assert_eq!(a.term, 3);
                assert_eq!(a.entries.len(), 1);
                assert_eq!(a.entries[0].command, b"payload");
            }
            other => panic!("decoded the wrong variant: {other:?}"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let res: ConsensusResult<RaftRequest> = read_frame(&mut &buf[..]).await;
        assert!(matches!(res, Err(ConsensusError::Frame { .. })));
    }
}
