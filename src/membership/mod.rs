//! Gossip membership over UDP. Each node keeps a member table and pushes
//! it to a random peer every interval; tables merge by incarnation
//! number. A member whose entries stop refreshing is marked failed after
//! the suspicion timeout; a clean shutdown announces `Left`. Join, leave,
//! and failure transitions are reported to an [`EventHandler`] — on the
//! leader these become consensus voter changes.

use crate::MembershipResult;
use crate::errors::MembershipError;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub node_name: String,
    /// UDP bind address for gossip (host:port)
    pub bind_addr: String,
    /// Client-facing RPC address advertised as this member's tag
    pub rpc_addr: String,
    /// Seeds pushed to at startup
    pub start_join_addrs: Vec<String>,
    pub gossip_interval: Duration,
    pub suspicion_timeout: Duration,
}

impl MembershipConfig {
    pub fn new(
        node_name: impl Into<String>,
        bind_addr: impl Into<String>,
        rpc_addr: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr: bind_addr.into(),
            rpc_addr: rpc_addr.into(),
            start_join_addrs: Vec::new(),
            gossip_interval: Duration::from_millis(200),
            suspicion_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Failed,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Client-facing RPC address this member advertises.
    pub rpc_addr: String,
    /// UDP address this member gossips from.
    pub gossip_addr: String,
    pub incarnation: u64,
    pub status: MemberStatus,
}

#[derive(Debug, Serialize, Deserialize)]
struct Gossip {
    members: Vec<Member>,
}

/// Observes membership transitions. Handlers run on the gossip task and
/// must not block; spawn for anything that does I/O.
pub trait EventHandler: Send + Sync + 'static {
    fn handle_join(&self, name: &str, rpc_addr: &str);
    fn handle_leave(&self, name: &str);
}

struct Tracked {
    member: Member,
    last_seen: Instant,
}

pub struct Membership {
    config: MembershipConfig,
    socket: Arc<UdpSocket>,
    members: Mutex<HashMap<String, Tracked>>,
    handler: Arc<dyn EventHandler>,
    left: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Membership {
    /// Binds the gossip socket, seeds the member table with ourselves,
    /// pushes to the join addresses, and starts the gossip task.
    #[instrument(skip_all, fields(node = %config.node_name, bind = %config.bind_addr))]
    pub async fn start(
        config: MembershipConfig,
        handler: Arc<dyn EventHandler>,
    ) -> MembershipResult<Arc<Self>> {
        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|source| MembershipError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;

        // advertise the resolved address so binding port 0 works
        let gossip_addr = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| config.bind_addr.clone());

        let mut members = HashMap::new();
        members.insert(
            config.node_name.clone(),
            Tracked {
                member: Member {
                    name: config.node_name.clone(),
                    rpc_addr: config.rpc_addr.clone(),
                    gossip_addr,
                    incarnation: 1,
                    status: MemberStatus::Alive,
                },
                last_seen: Instant::now(),
            },
        );

        let membership = Arc::new(Self {
            config,
            socket: Arc::new(socket),
            members: Mutex::new(members),
            handler,
            left: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        for seed in membership.config.start_join_addrs.clone() {
            membership.push_to(&seed).await;
        }

        let task = tokio::spawn(membership.clone().run());
        *membership.task.lock() = Some(task);

        info!("Membership started");
        Ok(membership)
    }

    /// Every member we know about, including ourselves and the departed.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .lock()
            .values()
            .map(|t| t.member.clone())
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Announces departure to every known peer and stops gossiping.
    pub async fn leave(&self) -> MembershipResult<()> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Err(MembershipError::Left);
        }

        let targets: Vec<String> = {
            let mut members = self.members.lock();
            if let Some(me) = members.get_mut(&self.config.node_name) {
                me.member.status = MemberStatus::Left;
                me.member.incarnation += 1;
            }
            members
                .values()
                .filter(|t| t.member.name != self.config.node_name)
                .map(|t| t.member.gossip_addr.clone())
                .collect()
        };

        for addr in targets {
            self.push_to(&addr).await;
        }

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        info!(node = %self.config.node_name, "Left the cluster");
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = ticker.tick() => self.gossip_round().await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, _)) => {
                        match bincode::serde::decode_from_slice::<Gossip, _>(
                            &buf[..n],
                            bincode::config::standard(),
                        ) {
                            Ok((gossip, _)) => self.merge(gossip),
                            Err(e) => debug!(error = %e, "Dropping bad gossip datagram"),
                        }
                    }
                    Err(e) => warn!(error = %e, "Gossip receive failed"),
                },
            }
        }
    }

    async fn gossip_round(&self) {
        let target = {
            let mut members = self.members.lock();

            // our entry is our heartbeat; refresh it every round
            let now = Instant::now();
            if let Some(me) = members.get_mut(&self.config.node_name) {
                me.member.incarnation += 1;
                me.last_seen = now;
            }

            // members whose entries stopped refreshing have failed
            let mut failed = Vec::new();
            for tracked in members.values_mut() {
                if tracked.member.name != self.config.node_name
                    && tracked.member.status == MemberStatus::Alive
                    && now.duration_since(tracked.last_seen) > self.config.suspicion_timeout
                {
                    tracked.member.status = MemberStatus::Failed;
                    failed.push(tracked.member.name.clone());
                }
            }
            for name in failed {
                info!(member = %name, "Member failed");
                self.handler.handle_leave(&name);
            }

            members
                .values()
                .filter(|t| {
                    t.member.name != self.config.node_name
                        && t.member.status == MemberStatus::Alive
                })
                .map(|t| t.member.gossip_addr.clone())
                .choose(&mut rand::rng())
        };

        if let Some(addr) = target {
            self.push_to(&addr).await;
        }
    }

    async fn push_to(&self, addr: &str) {
        let gossip = Gossip {
            members: self.members(),
        };
        let data = match bincode::serde::encode_to_vec(&gossip, bincode::config::standard()) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode gossip");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&data, addr).await {
            debug!(addr, error = %e, "Gossip push failed");
        }
    }

    fn merge(&self, gossip: Gossip) {
        let mut events = Vec::new();
        {
            let mut members = self.members.lock();
            for incoming in gossip.members {
                if incoming.name == self.config.node_name {
                    // refute rumors of our death
                    if incoming.status != MemberStatus::Alive
                        && !self.left.load(Ordering::Acquire)
                        && let Some(me) = members.get_mut(&self.config.node_name)
                    {
                        me.member.incarnation = me.member.incarnation.max(incoming.incarnation) + 1;
                        me.member.status = MemberStatus::Alive;
                    }
                    continue;
                }

                match members.get_mut(&incoming.name) {
                    None => {
                        if incoming.status == MemberStatus::Alive {
                            events.push(Event::Join(
                                incoming.name.clone(),
                                incoming.rpc_addr.clone(),
                            ));
                        }
                        members.insert(
                            incoming.name.clone(),
                            Tracked {
                                member: incoming,
                                last_seen: Instant::now(),
                            },
                        );
                    }
                    Some(existing) => {
                        if incoming.incarnation <= existing.member.incarnation {
                            continue;
                        }
                        let was = existing.member.status;
                        let addr_changed = existing.member.rpc_addr != incoming.rpc_addr;
                        existing.last_seen = Instant::now();
                        existing.member = incoming;

                        match (was, existing.member.status) {
                            (MemberStatus::Alive, MemberStatus::Failed | MemberStatus::Left) => {
                                events.push(Event::Leave(existing.member.name.clone()));
                            }
                            (MemberStatus::Failed | MemberStatus::Left, MemberStatus::Alive) => {
                                events.push(Event::Join(
                                    existing.member.name.clone(),
                                    existing.member.rpc_addr.clone(),
                                ));
                            }
                            (MemberStatus::Alive, MemberStatus::Alive) if addr_changed => {
                                // re-join with a new address
                                events.push(Event::Join(
                                    existing.member.name.clone(),
                                    existing.member.rpc_addr.clone(),
                                ));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        for event in events {
            match event {
                Event::Join(name, rpc_addr) => {
                    info!(member = %name, %rpc_addr, "Member joined");
                    self.handler.handle_join(&name, &rpc_addr);
                }
                Event::Leave(name) => {
                    info!(member = %name, "Member left");
                    self.handler.handle_leave(&name);
                }
            }
        }
    }
}

enum Event {
    Join(String, String),
    Leave(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingHandler {
        joins: PlMutex<Vec<(String, String)>>,
        leaves: PlMutex<Vec<String>>,
    }

    impl EventHandler for RecordingHandler {
        fn handle_join(&self, name: &str, rpc_addr: &str) {
            self.joins
                .lock()
                .push((name.to_string(), rpc_addr.to_string()));
        }

        fn handle_leave(&self, name: &str) {
            self.leaves.lock().push(name.to_string());
        }
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_join_and_leave_propagate() -> MembershipResult<()> {
        let handler0 = Arc::new(RecordingHandler::default());
        let m0 = Membership::start(
            MembershipConfig::new("node-0", "127.0.0.1:0", "127.0.0.1:9001"),
            handler0.clone(),
        )
        .await?;
        let seed = m0.members()[0].gossip_addr.clone();

        let mut config1 = MembershipConfig::new("node-1", "127.0.0.1:0", "127.0.0.1:9002");
        config1.start_join_addrs = vec![seed];
        let handler1 = Arc::new(RecordingHandler::default());
        let m1 = Membership::start(config1, handler1.clone()).await?;

        // both sides converge on a two-member cluster
        assert!(
            wait_until(Duration::from_secs(5), || {
                m0.members().len() == 2 && m1.members().len() == 2
            })
            .await
        );
        assert!(
            handler0
                .joins
                .lock()
                .contains(&("node-1".to_string(), "127.0.0.1:9002".to_string()))
        );

        m1.leave().await?;
        assert!(
            wait_until(Duration::from_secs(5), || {
                handler0.leaves.lock().contains(&"node-1".to_string())
            })
            .await
        );

        m0.leave().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_silent_member_marked_failed() -> MembershipResult<()> {
        let handler0 = Arc::new(RecordingHandler::default());
        let mut config0 = MembershipConfig::new("node-0", "127.0.0.1:0", "127.0.0.1:9001");
        config0.suspicion_timeout = Duration::from_millis(600);
        let m0 = Membership::start(config0, handler0.clone()).await?;
        let seed = m0.members()[0].gossip_addr.clone();

        let mut config1 = MembershipConfig::new("node-1", "127.0.0.1:0", "127.0.0.1:9002");
        config1.start_join_addrs = vec![seed];
        let handler1 = Arc::new(RecordingHandler::default());
        let m1 = Membership::start(config1, handler1.clone()).await?;

        assert!(wait_until(Duration::from_secs(5), || m0.members().len() == 2).await);

        // kill node-1 without a leave announcement
        if let Some(task) = m1.task.lock().take() {
            task.abort();
        }

        assert!(
            wait_until(Duration::from_secs(5), || {
                handler0.leaves.lock().contains(&"node-1".to_string())
            })
            .await
        );
        assert!(
            m0.members()
                .iter()
                .any(|m| m.name == "node-1" && m.status == MemberStatus::Failed)
        );

        m0.leave().await?;
        Ok(())
    }
}
