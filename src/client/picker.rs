//! Per-RPC address selection: writes go to the leader, reads rotate over
//! the followers and fall back to the leader when none exist.

use crate::client::resolver::ResolverState;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Produce,
    Consume,
}

#[derive(Debug, Default)]
pub struct Picker {
    round_robin: AtomicU64,
}

impl Picker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks an address for one RPC, or `None` when the state has no
    /// server that can handle it.
    pub fn pick(&self, state: &ResolverState, kind: RpcKind) -> Option<String> {
        match kind {
            RpcKind::Produce => state.leader().map(|a| a.addr.clone()),
            RpcKind::Consume => {
                let followers = state.followers();
                if followers.is_empty() {
                    return state.leader().map(|a| a.addr.clone());
                }
                let turn = self.round_robin.fetch_add(1, Ordering::Relaxed);
                Some(followers[(turn % followers.len() as u64) as usize].addr.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::resolver::ResolvedAddr;

    fn state(addrs: &[(&str, bool)]) -> ResolverState {
        ResolverState {
            addrs: addrs
                .iter()
                .map(|(addr, is_leader)| ResolvedAddr {
                    addr: addr.to_string(),
                    is_leader: *is_leader,
                })
                .collect(),
        }
    }

    #[test]
    fn test_writes_pick_the_leader() {
        let picker = Picker::new();
        let state = state(&[("A", true), ("B", false)]);

        assert_eq!(picker.pick(&state, RpcKind::Produce).as_deref(), Some("A"));
        assert_eq!(picker.pick(&state, RpcKind::Consume).as_deref(), Some("B"));
    }

    #[test]
    fn test_no_leader_fails_writes() {
        let picker = Picker::new();
        let state = state(&[("B", false)]);

        assert_eq!(picker.pick(&state, RpcKind::Produce), None);
    }

    #[test]
    fn test_reads_round_robin_over_followers() {
        let picker = Picker::new();
        let state = state(&[("A", true), ("B", false), ("C", false)]);

        let picks: Vec<String> = (0..4)
            .map(|_| picker.pick(&state, RpcKind::Consume).unwrap())
            .collect();

        assert_eq!(picks, vec!["B", "C", "B", "C"]);
        assert!(picks.iter().all(|p| p != "A"));
    }

    #[test]
    fn test_reads_fall_back_to_leader() {
        let picker = Picker::new();
        let state = state(&[("A", true)]);

        assert_eq!(picker.pick(&state, RpcKind::Consume).as_deref(), Some("A"));
    }

    #[test]
    fn test_empty_state_picks_nothing() {
        let picker = Picker::new();
        let state = ResolverState::default();

        assert_eq!(picker.pick(&state, RpcKind::Produce), None);
        assert_eq!(picker.pick(&state, RpcKind::Consume), None);
    }
}
