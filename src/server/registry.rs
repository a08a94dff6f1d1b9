//! Enumerates cluster members for clients. Addresses come from gossip
//! membership; the leader flag comes from consensus.

use crate::api::v1::Server;
use crate::consensus::Raft;
use crate::membership::{MemberStatus, Membership};
use std::sync::Arc;

/// Sources the `GetServers` RPC. Implemented by the production registry
/// and by test stubs.
pub trait ServerProvider: Send + Sync + 'static {
    fn get_servers(&self) -> Vec<Server>;
}

pub struct ServerRegistry {
    membership: Arc<Membership>,
    raft: Raft,
}

impl ServerRegistry {
    pub fn new(membership: Arc<Membership>, raft: Raft) -> Self {
        Self { membership, raft }
    }
}

impl ServerProvider for ServerRegistry {
    fn get_servers(&self) -> Vec<Server> {
        let leader_addr = self.raft.leader_addr();
        self.membership
            .members()
            .into_iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .map(|m| Server {
                id: m.name,
                is_leader: leader_addr.as_deref() == Some(m.rpc_addr.as_str()),
                rpc_addr: m.rpc_addr,
            })
            .collect()
    }
}
