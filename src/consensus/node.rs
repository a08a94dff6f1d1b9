//! A compact Raft node. One event-loop task owns all volatile state;
//! replication and vote traffic run in short-lived tasks that post their
//! results back to the loop. Entries live in a dedicated storage log whose
//! offsets are the raft indexes (starting at 1); term and vote are
//! persisted before any RPC that depends on them is answered.

use crate::ConsensusResult;
use crate::api::v1::Record;
use crate::consensus::fsm::LogFsm;
use crate::consensus::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Entry, InstallSnapshotRequest,
    InstallSnapshotResponse, Peer, RaftRequest, RaftResponse, VoteRequest, VoteResponse,
};
use crate::consensus::snapshot::{SnapshotMeta, SnapshotStore};
use crate::consensus::transport::RaftClient;
use crate::errors::ConsensusError;
use crate::storage::log::Log;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// How many entries ride in one AppendEntries request.
const REPLICATION_BATCH: u64 = 64;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Stable identifier of this node in the cluster.
    pub node_name: String,
    /// Client-facing RPC address advertised to peers.
    pub rpc_addr: String,
    /// Form a single-node cluster on first boot.
    pub bootstrap: bool,
    /// Directory for hard state, the entry log, and snapshots.
    pub data_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
}

impl RaftConfig {
    pub fn new(node_name: impl Into<String>, rpc_addr: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_name: node_name.into(),
            rpc_addr: rpc_addr.into(),
            bootstrap: false,
            data_dir: data_dir.into(),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Term and vote, persisted before they take effect.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HardState {
    term: u64,
    voted_for: Option<String>,
}

struct Progress {
    addr: String,
    next_index: u64,
    match_index: u64,
}

enum RaftMsg {
    Rpc {
        req: RaftRequest,
        reply: oneshot::Sender<RaftResponse>,
    },
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<ConsensusResult<u64>>,
    },
    AddVoter {
        id: String,
        addr: String,
        reply: oneshot::Sender<ConsensusResult<()>>,
    },
    RemoveServer {
        id: String,
        reply: oneshot::Sender<ConsensusResult<()>>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<ConsensusResult<()>>,
    },
    VoteResult {
        term: u64,
        from: String,
        granted: bool,
    },
    AppendResult {
        peer: String,
        term: u64,
        success: bool,
        match_index: u64,
        sent_up_to: u64,
    },
    SnapshotSent {
        peer: String,
        term: u64,
        last_included: u64,
        ok: bool,
    },
    PeerUnreachable {
        peer: String,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

struct SharedState {
    node_name: String,
    leader: parking_lot::Mutex<Option<Peer>>,
    leader_notify: Notify,
    is_leader: AtomicBool,
}

impl SharedState {
    fn set_leader(&self, leader: Option<Peer>) {
        let is_self = leader
            .as_ref()
            .is_some_and(|l| l.id == self.node_name);
        *self.leader.lock() = leader;
        self.is_leader.store(is_self, Ordering::Release);
        self.leader_notify.notify_waiters();
    }
}

/// Cloneable handle to a running raft node.
#[derive(Clone)]
pub struct Raft {
    tx: mpsc::UnboundedSender<RaftMsg>,
    shared: Arc<SharedState>,
}

impl Raft {
    /// Starts the raft event loop. `log` holds the raft entries (its
    /// initial offset must be 1); `fsm` receives committed commands.
    pub fn spawn(
        config: RaftConfig,
        log: Arc<Log>,
        fsm: Arc<LogFsm>,
        snapshots: SnapshotStore,
        client: Arc<RaftClient>,
    ) -> ConsensusResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            node_name: config.node_name.clone(),
            leader: parking_lot::Mutex::new(None),
            leader_notify: Notify::new(),
            is_leader: AtomicBool::new(false),
        });

        let node = Node::new(config, log, fsm, snapshots, client, shared.clone(), tx.clone())?;
        tokio::spawn(node.run(rx));

        Ok(Self { tx, shared })
    }

    /// Proposes a command for replication. Resolves with the FSM's result
    /// once the command is committed and applied on this node. Fails with
    /// [`ConsensusError::NotLeader`] on followers.
    pub async fn propose(&self, command: Vec<u8>) -> ConsensusResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftMsg::Propose { command, reply })
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)?
    }

    /// Dispatches an inbound RPC to the node.
    pub async fn handle_request(&self, req: RaftRequest) -> ConsensusResult<RaftResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftMsg::Rpc { req, reply })
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    /// Adds a voting member. Leader-only; idempotent for re-joins.
    pub async fn add_voter(&self, id: &str, addr: &str) -> ConsensusResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftMsg::AddVoter {
                id: id.to_string(),
                addr: addr.to_string(),
                reply,
            })
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)?
    }

    /// Removes a member. Leader-only.
    pub async fn remove_server(&self, id: &str) -> ConsensusResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftMsg::RemoveServer {
                id: id.to_string(),
                reply,
            })
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)?
    }

    /// Writes a snapshot of the FSM state to the snapshot store.
    pub async fn take_snapshot(&self) -> ConsensusResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RaftMsg::TakeSnapshot { reply })
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)?
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::Acquire)
    }

    pub fn leader_addr(&self) -> Option<String> {
        self.shared.leader.lock().as_ref().map(|l| l.addr.clone())
    }

    /// Blocks until some node is known to be leader, returning its RPC
    /// address.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ConsensusResult<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.leader_notify.notified();
            if let Some(leader) = self.shared.leader.lock().clone() {
                return Ok(leader.addr);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ConsensusError::NoLeader);
            }
        }
    }

    /// Stops the event loop, failing outstanding proposals. Returns once
    /// the node has stopped touching its logs.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(RaftMsg::Shutdown { ack }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Node {
    config: RaftConfig,
    log: Arc<Log>,
    fsm: Arc<LogFsm>,
    snapshots: SnapshotStore,
    client: Arc<RaftClient>,
    shared: Arc<SharedState>,
    tx: mpsc::UnboundedSender<RaftMsg>,

    role: Role,
    term: u64,
    voted_for: Option<String>,
    peers: HashMap<String, Progress>,
    votes: HashSet<String>,

    last_index: u64,
    last_term: u64,
    commit_index: u64,
    last_applied: u64,
    snapshot_last_index: u64,
    snapshot_last_term: u64,

    pending: BTreeMap<u64, oneshot::Sender<ConsensusResult<u64>>>,
    in_flight: HashSet<String>,
    election_deadline: Instant,
}

impl Node {
    fn new(
        config: RaftConfig,
        log: Arc<Log>,
        fsm: Arc<LogFsm>,
        snapshots: SnapshotStore,
        client: Arc<RaftClient>,
        shared: Arc<SharedState>,
        tx: mpsc::UnboundedSender<RaftMsg>,
    ) -> ConsensusResult<Self> {
        fs::create_dir_all(&config.data_dir)
            .map_err(|source| ConsensusError::StateStore { source })?;

        let hard_state = load_state::<HardState>(&config.data_dir.join("state"))?.unwrap_or_default();
        let mut peer_list = load_state::<Vec<Peer>>(&config.data_dir.join("peers"))?.unwrap_or_default();

        if peer_list.is_empty() && config.bootstrap {
            peer_list.push(Peer {
                id: config.node_name.clone(),
                addr: config.rpc_addr.clone(),
            });
            save_state(&config.data_dir.join("peers"), &peer_list)?;
        }

        // a raft log that starts past 1 was reset by a snapshot install
        let lowest = log.lowest_offset()?;
        let (snapshot_last_index, snapshot_last_term) = if lowest > 1 {
            let term = snapshots
                .latest()?
                .map(|(meta, _)| meta.term)
                .unwrap_or_default();
            (lowest - 1, term)
        } else {
            (0, 0)
        };

        let (last_index, last_term) = match log.highest_offset()? {
            Some(index) => (index, log.read(index)?.term),
            None => (snapshot_last_index, snapshot_last_term),
        };

        // entries at or below this were already applied to the FSM; a
        // restart must not feed them through again
        let applied = load_state::<u64>(&config.data_dir.join("applied"))?
            .unwrap_or(0)
            .max(snapshot_last_index)
            .min(last_index);

        let peers = peer_list
            .into_iter()
            .map(|p| {
                (
                    p.id,
                    Progress {
                        addr: p.addr,
                        next_index: last_index + 1,
                        match_index: 0,
                    },
                )
            })
            .collect();

        let mut node = Node {
            config,
            log,
            fsm,
            snapshots,
            client,
            shared,
            tx,
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            peers,
            votes: HashSet::new(),
            last_index,
            last_term,
            commit_index: applied,
            last_applied: applied,
            snapshot_last_index,
            snapshot_last_term,
            pending: BTreeMap::new(),
            in_flight: HashSet::new(),
            election_deadline: Instant::now(),
        };
        node.reset_election_deadline();

        info!(
            node = node.config.node_name,
            term = node.term,
            last_index,
            peers = node.peers.len(),
            "Raft node initialized"
        );

        Ok(node)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RaftMsg>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.role == Role::Leader {
                        self.broadcast_append();
                    } else if Instant::now() >= self.election_deadline && self.in_cluster() {
                        self.start_election();
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        None => break,
                        Some(RaftMsg::Shutdown { ack }) => {
                            shutdown_ack = Some(ack);
                            break;
                        }
                        Some(msg) => self.handle(msg),
                    }
                }
            }
        }

        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(ConsensusError::Shutdown));
        }
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        info!(node = self.config.node_name, "Raft node stopped");
    }

    fn handle(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::Rpc { req, reply } => {
                let resp = match req {
                    RaftRequest::Vote(v) => RaftResponse::Vote(self.handle_vote(v)),
                    RaftRequest::AppendEntries(a) => {
                        RaftResponse::AppendEntries(self.handle_append_entries(a))
                    }
                    RaftRequest::InstallSnapshot(s) => {
                        RaftResponse::InstallSnapshot(self.handle_install_snapshot(s))
                    }
                };
                let _ = reply.send(resp);
            }
            RaftMsg::Propose { command, reply } => self.handle_propose(command, reply),
            RaftMsg::AddVoter { id, addr, reply } => {
                let _ = reply.send(self.handle_add_voter(id, addr));
            }
            RaftMsg::RemoveServer { id, reply } => {
                let _ = reply.send(self.handle_remove_server(id));
            }
            RaftMsg::TakeSnapshot { reply } => {
                let _ = reply.send(self.handle_take_snapshot());
            }
            RaftMsg::VoteResult { term, from, granted } => {
                self.handle_vote_result(term, from, granted)
            }
            RaftMsg::AppendResult {
                peer,
                term,
                success,
                match_index,
                sent_up_to,
            } => self.handle_append_result(peer, term, success, match_index, sent_up_to),
            RaftMsg::SnapshotSent {
                peer,
                term,
                last_included,
                ok,
            } => self.handle_snapshot_sent(peer, term, last_included, ok),
            RaftMsg::PeerUnreachable { peer } => {
                self.in_flight.remove(&peer);
            }
            RaftMsg::Shutdown { .. } => unreachable!("handled by the run loop"),
        }
    }

    // ---- elections ----

    fn in_cluster(&self) -> bool {
        self.peers.contains_key(&self.config.node_name)
    }

    fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn reset_election_deadline(&mut self) {
        let base = self.config.election_timeout;
        let jitter = rand::rng().random_range(0..=base.as_millis() as u64);
        self.election_deadline = Instant::now() + base + Duration::from_millis(jitter);
    }

    #[instrument(skip(self), fields(node = %self.config.node_name))]
    fn start_election(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.config.node_name.clone());
        self.votes = HashSet::from([self.config.node_name.clone()]);
        self.reset_election_deadline();

        if let Err(e) = self.save_hard_state() {
            error!(error = %e, "Failed to persist term before election");
            return;
        }

        debug!(term = self.term, "Starting election");

        if self.votes.len() >= self.majority() {
            self.become_leader();
            return;
        }

        let req = RaftRequest::Vote(VoteRequest {
            term: self.term,
            candidate_id: self.config.node_name.clone(),
            last_log_index: self.last_index,
            last_log_term: self.last_term,
        });

        for (id, progress) in &self.peers {
            if *id == self.config.node_name {
                continue;
            }
            let client = self.client.clone();
            let tx = self.tx.clone();
            let addr = progress.addr.clone();
            let from = id.clone();
            let req = req.clone();
            tokio::spawn(async move {
                if let Ok(RaftResponse::Vote(resp)) = client.send(&addr, &req).await {
                    let _ = tx.send(RaftMsg::VoteResult {
                        term: resp.term,
                        from,
                        granted: resp.vote_granted,
                    });
                }
            });
        }
    }

    fn handle_vote_result(&mut self, term: u64, from: String, granted: bool) {
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Candidate || term < self.term || !granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        info!(
            node = self.config.node_name,
            term = self.term,
            "Won election, becoming leader"
        );
        self.role = Role::Leader;
        for progress in self.peers.values_mut() {
            progress.next_index = self.last_index + 1;
            progress.match_index = 0;
        }
        self.shared.set_leader(Some(Peer {
            id: self.config.node_name.clone(),
            addr: self.config.rpc_addr.clone(),
        }));

        // an empty entry commits everything from earlier terms
        if let Err(e) = self.append_local(Vec::new()) {
            error!(error = %e, "Failed to append leadership marker");
        }
        self.advance_commit();
        self.broadcast_append();
    }

    fn step_down(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            if let Err(e) = self.save_hard_state() {
                error!(error = %e, "Failed to persist term while stepping down");
            }
        }
        if self.role == Role::Leader {
            self.shared.set_leader(None);
        }
        self.role = Role::Follower;
        self.votes.clear();
        let leader_hint = self.shared.leader.lock().as_ref().map(|l| l.addr.clone());
        self.fail_pending(ConsensusError::NotLeader { leader_hint });
        self.reset_election_deadline();
    }

    fn fail_pending(&mut self, err: ConsensusError) {
        if self.pending.is_empty() {
            return;
        }
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(clone_not_leader(&err)));
        }
    }

    // ---- inbound RPCs ----

    fn handle_vote(&mut self, req: VoteRequest) -> VoteResponse {
        if req.term > self.term {
            self.step_down(req.term);
        }

        let up_to_date = req.last_log_term > self.last_term
            || (req.last_log_term == self.last_term && req.last_log_index >= self.last_index);
        let granted = req.term == self.term
            && up_to_date
            && self
                .voted_for
                .as_ref()
                .is_none_or(|v| *v == req.candidate_id);

        if granted {
            self.voted_for = Some(req.candidate_id.clone());
            if let Err(e) = self.save_hard_state() {
                error!(error = %e, "Failed to persist vote");
                return VoteResponse {
                    term: self.term,
                    vote_granted: false,
                };
            }
            self.reset_election_deadline();
        }

        debug!(
            candidate = req.candidate_id,
            term = req.term,
            granted,
            "Vote requested"
        );

        VoteResponse {
            term: self.term,
            vote_granted: granted,
        }
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        if req.term < self.term {
            return AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: 0,
            };
        }

        if req.term > self.term || self.role != Role::Follower {
            self.step_down(req.term);
        }
        self.reset_election_deadline();
        self.shared.set_leader(Some(Peer {
            id: req.leader_id.clone(),
            addr: req.leader_addr.clone(),
        }));
        self.adopt_peers(req.peers);

        // consistency check on the entry preceding the batch
        if req.prev_log_index > self.last_index {
            return AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: self.last_index,
            };
        }
        if req.prev_log_index > 0 {
            match self.term_at(req.prev_log_index) {
                Ok(term) if term == req.prev_log_term => {}
                _ => {
                    return AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        match_index: req.prev_log_index.saturating_sub(1),
                    };
                }
            }
        }

        let mut match_index = req.prev_log_index;
        for entry in req.entries {
            if entry.index <= self.last_index {
                match self.term_at(entry.index) {
                    Ok(term) if term == entry.term => {
                        match_index = entry.index;
                        continue;
                    }
                    _ => {
                        if let Err(e) = self.truncate_from(entry.index) {
                            error!(error = %e, "Failed to drop conflicting entries");
                            return AppendEntriesResponse {
                                term: self.term,
                                success: false,
                                match_index,
                            };
                        }
                    }
                }
            }
            if let Err(e) = self.append_entry(&entry) {
                error!(error = %e, index = entry.index, "Failed to append replicated entry");
                return AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index,
                };
            }
            match_index = entry.index;
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_index);
            self.apply_committed();
        }

        AppendEntriesResponse {
            term: self.term,
            success: true,
            match_index,
        }
    }

    fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        if req.term < self.term {
            return InstallSnapshotResponse { term: self.term };
        }
        if req.term > self.term || self.role != Role::Follower {
            self.step_down(req.term);
        }
        self.reset_election_deadline();
        self.shared.set_leader(Some(Peer {
            id: req.leader_id.clone(),
            addr: req.leader_addr.clone(),
        }));
        self.adopt_peers(req.peers);

        if req.last_included_index <= self.commit_index {
            // nothing newer than what is already applied
            return InstallSnapshotResponse { term: self.term };
        }

        info!(
            last_included_index = req.last_included_index,
            "Installing snapshot from leader"
        );

        let result: ConsensusResult<()> = (|| {
            self.fsm.restore(&mut &req.data[..])?;
            self.snapshots.create(
                SnapshotMeta {
                    term: req.last_included_term,
                    index: req.last_included_index,
                },
                &mut &req.data[..],
            )?;
            self.log.reset_to(req.last_included_index + 1)?;
            Ok(())
        })();

        if let Err(e) = result {
            error!(error = %e, "Snapshot installation failed");
            return InstallSnapshotResponse { term: self.term };
        }

        self.snapshot_last_index = req.last_included_index;
        self.snapshot_last_term = req.last_included_term;
        self.last_index = req.last_included_index;
        self.last_term = req.last_included_term;
        self.commit_index = req.last_included_index;
        self.last_applied = req.last_included_index;
        if let Err(e) = save_state(&self.config.data_dir.join("applied"), &self.last_applied) {
            error!(error = %e, "Failed to persist applied index");
        }

        InstallSnapshotResponse { term: self.term }
    }

    fn adopt_peers(&mut self, peers: Vec<Peer>) {
        if peers.is_empty() {
            return;
        }
        let changed = peers.len() != self.peers.len()
            || peers
                .iter()
                .any(|p| self.peers.get(&p.id).is_none_or(|e| e.addr != p.addr));
        if !changed {
            return;
        }

        let next = self.last_index + 1;
        self.peers = peers
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    Progress {
                        addr: p.addr.clone(),
                        next_index: next,
                        match_index: 0,
                    },
                )
            })
            .collect();
        if let Err(e) = self.save_peers() {
            error!(error = %e, "Failed to persist peer set");
        }
    }

    // ---- proposals and replication ----

    fn handle_propose(&mut self, command: Vec<u8>, reply: oneshot::Sender<ConsensusResult<u64>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(ConsensusError::NotLeader {
                leader_hint: self.shared.leader.lock().as_ref().map(|l| l.addr.clone()),
            }));
            return;
        }

        match self.append_local(command) {
            Ok(index) => {
                self.pending.insert(index, reply);
                self.advance_commit();
                self.broadcast_append();
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn append_local(&mut self, command: Vec<u8>) -> ConsensusResult<u64> {
        let mut record = Record {
            value: command,
            offset: 0,
            term: self.term,
        };
        let index = self.log.append(&mut record)?;
        self.last_index = index;
        self.last_term = self.term;
        if let Some(me) = self.peers.get_mut(&self.config.node_name) {
            me.match_index = index;
        }
        Ok(index)
    }

    fn append_entry(&mut self, entry: &Entry) -> ConsensusResult<()> {
        let mut record = Record {
            value: entry.command.clone(),
            offset: 0,
            term: entry.term,
        };
        let index = self.log.append(&mut record)?;
        if index != entry.index {
            return Err(ConsensusError::Frame {
                reason: format!("entry index {} landed at {index}", entry.index),
            });
        }
        self.last_index = index;
        self.last_term = entry.term;
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> ConsensusResult<()> {
        self.log.truncate_from(index)?;
        self.last_index = index.saturating_sub(1).max(self.snapshot_last_index);
        self.last_term = self.term_at(self.last_index).unwrap_or(0);
        Ok(())
    }

    fn broadcast_append(&mut self) {
        let ids: Vec<String> = self
            .peers
            .keys()
            .filter(|id| **id != self.config.node_name)
            .cloned()
            .collect();
        for id in ids {
            self.replicate_to(&id);
        }
    }

    fn replicate_to(&mut self, id: &str) {
        if self.in_flight.contains(id) {
            return;
        }
        let Some((addr, next_index)) = self
            .peers
            .get(id)
            .map(|p| (p.addr.clone(), p.next_index))
        else {
            return;
        };

        if next_index <= self.snapshot_last_index {
            self.send_snapshot_to(id, addr);
            return;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = match self.term_at(prev_log_index) {
            Ok(term) => term,
            Err(e) => {
                warn!(peer = id, error = %e, "Cannot resolve term for replication");
                return;
            }
        };

        let up_to = self
            .last_index
            .min(prev_log_index + REPLICATION_BATCH);
        let mut entries = Vec::new();
        for index in next_index..=up_to {
            match self.log.read(index) {
                Ok(record) => entries.push(Entry {
                    index,
                    term: record.term,
                    command: record.value,
                }),
                Err(e) => {
                    warn!(peer = id, index, error = %e, "Cannot read entry for replication");
                    return;
                }
            }
        }

        let req = RaftRequest::AppendEntries(AppendEntriesRequest {
            term: self.term,
            leader_id: self.config.node_name.clone(),
            leader_addr: self.config.rpc_addr.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
            peers: self.peer_list(),
        });

        let sent_up_to = up_to.max(prev_log_index);
        let peer = id.to_string();
        let client = self.client.clone();
        let tx = self.tx.clone();
        self.in_flight.insert(peer.clone());

        tokio::spawn(async move {
            match client.send(&addr, &req).await {
                Ok(RaftResponse::AppendEntries(resp)) => {
                    let _ = tx.send(RaftMsg::AppendResult {
                        peer,
                        term: resp.term,
                        success: resp.success,
                        match_index: resp.match_index,
                        sent_up_to,
                    });
                }
                _ => {
                    let _ = tx.send(RaftMsg::PeerUnreachable { peer });
                }
            }
        });
    }

    fn send_snapshot_to(&mut self, id: &str, addr: String) {
        let snapshot = match self.snapshots.latest() {
            Ok(Some((meta, mut file))) => {
                let mut data = Vec::new();
                match file.read_to_end(&mut data) {
                    Ok(_) => Some((meta, data)),
                    Err(source) => {
                        error!(error = %source, "Failed to read snapshot for peer");
                        None
                    }
                }
            }
            Ok(None) => {
                warn!(peer = id, "Peer needs a snapshot but none exists");
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to open snapshot store");
                None
            }
        };
        let Some((meta, data)) = snapshot else {
            return;
        };

        let req = RaftRequest::InstallSnapshot(InstallSnapshotRequest {
            term: self.term,
            leader_id: self.config.node_name.clone(),
            leader_addr: self.config.rpc_addr.clone(),
            last_included_index: meta.index,
            last_included_term: meta.term,
            peers: self.peer_list(),
            data,
        });

        let peer = id.to_string();
        let client = self.client.clone();
        let tx = self.tx.clone();
        self.in_flight.insert(peer.clone());

        tokio::spawn(async move {
            match client.send(&addr, &req).await {
                Ok(RaftResponse::InstallSnapshot(resp)) => {
                    let _ = tx.send(RaftMsg::SnapshotSent {
                        peer,
                        term: resp.term,
                        last_included: meta.index,
                        ok: true,
                    });
                }
                _ => {
                    let _ = tx.send(RaftMsg::PeerUnreachable { peer });
                }
            }
        });
    }

    fn handle_append_result(
        &mut self,
        peer: String,
        term: u64,
        success: bool,
        match_index: u64,
        sent_up_to: u64,
    ) {
        self.in_flight.remove(&peer);
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Leader {
            return;
        }

        if success {
            let behind = {
                let Some(progress) = self.peers.get_mut(&peer) else {
                    return;
                };
                progress.match_index = progress.match_index.max(sent_up_to.max(match_index));
                progress.next_index = progress.match_index + 1;
                progress.match_index < self.last_index
            };
            self.advance_commit();
            if behind {
                self.replicate_to(&peer);
            }
        } else {
            // back up to the follower's hint and retry
            if let Some(progress) = self.peers.get_mut(&peer) {
                progress.next_index = match_index
                    .saturating_add(1)
                    .min(progress.next_index.saturating_sub(1))
                    .max(1);
            }
            self.replicate_to(&peer);
        }
    }

    fn handle_snapshot_sent(&mut self, peer: String, term: u64, last_included: u64, ok: bool) {
        self.in_flight.remove(&peer);
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Leader || !ok {
            return;
        }
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.match_index = progress.match_index.max(last_included);
            progress.next_index = last_included + 1;
        }
        self.replicate_to(&peer);
    }

    fn advance_commit(&mut self) {
        let mut matches: Vec<u64> = self
            .peers
            .values()
            .map(|p| p.match_index)
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = matches.get(self.majority() - 1).copied().unwrap_or(0);

        if quorum_index > self.commit_index
            && self.term_at(quorum_index).is_ok_and(|t| t == self.term)
        {
            self.commit_index = quorum_index;
            self.apply_committed();
        }
    }

    fn apply_committed(&mut self) {
        let before = self.last_applied;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            if index <= self.snapshot_last_index {
                self.last_applied = self.snapshot_last_index;
                continue;
            }

            let record = match self.log.read(index) {
                Ok(record) => record,
                Err(e) => {
                    error!(index, error = %e, "Cannot read committed entry");
                    return;
                }
            };

            let result = if record.value.is_empty() {
                // leadership marker, nothing to apply
                Ok(index)
            } else {
                self.fsm.apply(record.term, &record.value)
            };

            if let Err(e) = &result {
                error!(index, error = %e, "FSM apply failed");
            }
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(result);
            }
            self.last_applied = index;
        }

        if self.last_applied != before
            && let Err(e) = save_state(
                &self.config.data_dir.join("applied"),
                &self.last_applied,
            )
        {
            error!(error = %e, "Failed to persist applied index");
        }
    }

    // ---- membership ----

    fn handle_add_voter(&mut self, id: String, addr: String) -> ConsensusResult<()> {
        if self.role != Role::Leader {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.shared.leader.lock().as_ref().map(|l| l.addr.clone()),
            });
        }

        if let Some(progress) = self.peers.get_mut(&id) {
            if progress.addr == addr {
                return Ok(());
            }
            // re-join with a new address
            progress.addr = addr;
        } else {
            info!(id = %id, addr = %addr, "Adding voter");
            let next_index = self.last_index + 1;
            self.peers.insert(
                id,
                Progress {
                    addr,
                    next_index,
                    match_index: 0,
                },
            );
        }
        self.save_peers()?;
        self.broadcast_append();
        Ok(())
    }

    fn handle_remove_server(&mut self, id: String) -> ConsensusResult<()> {
        if self.role != Role::Leader {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.shared.leader.lock().as_ref().map(|l| l.addr.clone()),
            });
        }
        if self.peers.remove(&id).is_some() {
            info!(id = %id, "Removing server");
            self.in_flight.remove(&id);
            self.save_peers()?;
            self.broadcast_append();
        }
        Ok(())
    }

    fn handle_take_snapshot(&mut self) -> ConsensusResult<()> {
        if self.last_applied == 0 {
            return Ok(());
        }
        let term = self.term_at(self.last_applied)?;
        let snapshot = self.fsm.snapshot()?;
        let mut data = Vec::new();
        snapshot
            .persist(&mut data)
            .map_err(|source| ConsensusError::Snapshot { source })?;
        self.snapshots.create(
            SnapshotMeta {
                term,
                index: self.last_applied,
            },
            &mut &data[..],
        )
    }

    // ---- persistence helpers ----

    fn term_at(&self, index: u64) -> ConsensusResult<u64> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.snapshot_last_index {
            return Ok(self.snapshot_last_term);
        }
        Ok(self.log.read(index)?.term)
    }

    fn peer_list(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .map(|(id, p)| Peer {
                id: id.clone(),
                addr: p.addr.clone(),
            })
            .collect()
    }

    fn save_hard_state(&self) -> ConsensusResult<()> {
        save_state(
            &self.config.data_dir.join("state"),
            &HardState {
                term: self.term,
                voted_for: self.voted_for.clone(),
            },
        )
    }

    fn save_peers(&self) -> ConsensusResult<()> {
        save_state(&self.config.data_dir.join("peers"), &self.peer_list())
    }
}

fn clone_not_leader(err: &ConsensusError) -> ConsensusError {
    match err {
        ConsensusError::NotLeader { leader_hint } => ConsensusError::NotLeader {
            leader_hint: leader_hint.clone(),
        },
        _ => ConsensusError::NoLeader,
    }
}

fn save_state<T: Serialize>(path: &PathBuf, value: &T) -> ConsensusResult<()> {
    let data = bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        ConsensusError::Frame {
            reason: e.to_string(),
        }
    })?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &data).map_err(|source| ConsensusError::StateStore { source })?;
    fs::rename(&tmp, path).map_err(|source| ConsensusError::StateStore { source })
}

fn load_state<T: serde::de::DeserializeOwned>(path: &PathBuf) -> ConsensusResult<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConsensusError::StateStore { source }),
    };
    bincode::serde::decode_from_slice(&data, bincode::config::standard())
        .map(|(v, _)| Some(v))
        .map_err(|e| ConsensusError::Frame {
            reason: e.to_string(),
        })
}
