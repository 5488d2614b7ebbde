//! Bully-variant leader election among a small static set of supervisors.
//! Grounded on `agenda-raft::node::LocalRaftNode`'s shape (an `Arc`-wrapped
//! node with an internal `RwLock<State>`, a spawned background timer, and a
//! transport trait object so the network can be faked in tests) applied to
//! a simpler two-message-type-fewer protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Unknown,
    Election,
    Ok,
    Coordinator,
    Heartbeat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionMessage {
    pub sender_id: String,
    pub leader_id: Option<String>,
    pub epoch: u64,
    pub message_type: MessageType,
}

/// Point-to-point transport for `ElectionMessage`; `grpc::SupervisorClient`
/// is the real implementation, a direct in-memory router stands in for it
/// in tests.
#[async_trait]
pub trait SupervisorTransport: Send + Sync {
    async fn send_message(
        &self,
        peer_address: &str,
        message: ElectionMessage,
    ) -> anyhow::Result<ElectionMessage>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct State {
    role: Role,
    current_leader: Option<String>,
    current_epoch: u64,
    last_heartbeat: Instant,
}

#[derive(Clone, Debug)]
pub struct ElectorConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    pub desync_max: Duration,
}

impl Default for ElectorConfig {
    fn default() -> Self {
        ElectorConfig {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: Duration::from_millis(350),
            desync_max: Duration::from_millis(50),
        }
    }
}

/// One supervisor's view of the Bully protocol. `id` participates in the
/// total order the protocol relies on via plain `String` (`Ord`) comparison.
pub struct Elector {
    id: String,
    peers: HashMap<String, String>,
    transport: Arc<dyn SupervisorTransport>,
    config: ElectorConfig,
    state: RwLock<State>,
}

impl Elector {
    /// Builds the elector and spawns its heartbeat-timeout monitor. `peers`
    /// excludes `id` itself and maps peer id to the address used to reach it.
    pub fn spawn(
        id: impl Into<String>,
        peers: HashMap<String, String>,
        transport: Arc<dyn SupervisorTransport>,
        config: ElectorConfig,
    ) -> Arc<Elector> {
        let elector = Arc::new(Elector {
            id: id.into(),
            peers,
            transport,
            config,
            state: RwLock::new(State {
                role: Role::Follower,
                current_leader: None,
                current_epoch: 0,
                last_heartbeat: Instant::now(),
            }),
        });
        tokio::spawn(elector.clone().run_heartbeat_monitor());
        elector
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn is_leader(&self) -> bool {
        matches!(self.state.read().await.role, Role::Leader)
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.state.read().await.current_leader.clone()
    }

    pub async fn current_epoch(&self) -> u64 {
        self.state.read().await.current_epoch
    }

    async fn run_heartbeat_monitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.election_timeout).await;
            let should_elect = {
                let state = self.state.read().await;
                !matches!(state.role, Role::Leader)
                    && state.last_heartbeat.elapsed() >= self.config.election_timeout
            };
            if should_elect {
                self.clone().start_election().await;
            }
        }
    }

    async fn start_election(self: Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if matches!(state.role, Role::Leader) {
                return;
            }
            state.role = Role::Candidate;
        }

        let desync_max = self.config.desync_max.as_millis().max(1) as u64;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..desync_max));
        tokio::time::sleep(delay).await;

        // A COORDINATOR/HEARTBEAT may have arrived during the desync delay.
        if !matches!(self.state.read().await.role, Role::Candidate) {
            return;
        }

        let epoch = self.current_epoch().await;
        let probe = ElectionMessage {
            sender_id: self.id.clone(),
            leader_id: None,
            epoch,
            message_type: MessageType::Election,
        };

        let higher_peers: Vec<&String> =
            self.peers.keys().filter(|peer_id| peer_id.as_str() > self.id.as_str()).collect();

        let mut any_ok = false;
        for peer_id in higher_peers {
            let address = &self.peers[peer_id];
            match self.transport.send_message(address, probe.clone()).await {
                Ok(reply) if reply.message_type == MessageType::Ok => any_ok = true,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(peer = %peer_id, %err, "election probe failed, treating as unresponsive");
                }
            }
        }

        if any_ok {
            tokio::time::sleep(self.config.election_timeout).await;
            if matches!(self.state.read().await.role, Role::Candidate) {
                // No COORDINATOR arrived in time — try again.
                tokio::spawn(self.clone().start_election());
            }
            return;
        }

        self.become_leader().await;
    }

    async fn become_leader(self: Arc<Self>) {
        let new_epoch = {
            let mut state = self.state.write().await;
            let new_epoch = state.current_epoch.saturating_add(1).max(now_ms());
            state.role = Role::Leader;
            state.current_leader = Some(self.id.clone());
            state.current_epoch = new_epoch;
            state.last_heartbeat = Instant::now();
            new_epoch
        };
        tracing::info!(id = %self.id, epoch = new_epoch, "became supervisor leader");
        self.clone().broadcast(MessageType::Coordinator, new_epoch).await;
        tokio::spawn(self.run_heartbeat_broadcaster());
    }

    async fn run_heartbeat_broadcaster(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            if !self.is_leader().await {
                return;
            }
            let epoch = self.current_epoch().await;
            self.clone().broadcast(MessageType::Heartbeat, epoch).await;
        }
    }

    async fn broadcast(self: Arc<Self>, message_type: MessageType, epoch: u64) {
        let message =
            ElectionMessage { sender_id: self.id.clone(), leader_id: Some(self.id.clone()), epoch, message_type };
        for address in self.peers.values() {
            let transport = self.transport.clone();
            let address = address.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.send_message(&address, message).await {
                    tracing::debug!(peer = %address, %err, "broadcast delivery failed");
                }
            });
        }
    }

    /// Entry point for the gRPC server: handles one inbound `ElectionMessage`
    /// and returns the reply the RPC sends back.
    pub async fn handle_message(self: &Arc<Self>, message: ElectionMessage) -> ElectionMessage {
        let reply_type = match message.message_type {
            MessageType::Election => {
                if self.id.as_str() > message.sender_id.as_str() {
                    let should_start_own_election =
                        matches!(self.state.read().await.role, Role::Follower);
                    if should_start_own_election {
                        tokio::spawn(self.clone().start_election());
                    }
                    MessageType::Ok
                } else {
                    MessageType::Unknown
                }
            }
            MessageType::Ok => MessageType::Ok,
            MessageType::Coordinator | MessageType::Heartbeat => {
                if self.try_accept(message.leader_id.clone(), message.epoch).await {
                    MessageType::Ok
                } else {
                    MessageType::Unknown
                }
            }
            MessageType::Unknown => MessageType::Unknown,
        };
        ElectionMessage { sender_id: self.id.clone(), leader_id: None, epoch: 0, message_type: reply_type }
    }

    /// Implements the acceptance rule from spec.md §4.5: strictly greater
    /// epoch, same epoch from the already-recognized leader, or a same-epoch
    /// tie broken by identifier dominance.
    async fn try_accept(&self, leader_id: Option<String>, epoch: u64) -> bool {
        let Some(leader_id) = leader_id else { return false };
        let mut state = self.state.write().await;
        let accept = epoch > state.current_epoch
            || (epoch == state.current_epoch && state.current_leader.as_deref() == Some(leader_id.as_str()))
            || (epoch == state.current_epoch
                && state
                    .current_leader
                    .as_deref()
                    .map(|current| leader_id.as_str() > current)
                    .unwrap_or(true));
        if accept {
            let losing_leadership =
                matches!(state.role, Role::Leader) && state.current_leader.as_deref() != Some(leader_id.as_str());
            if losing_leadership {
                tracing::info!(id = %self.id, new_leader = %leader_id, epoch, "stepping down: lost leadership");
            }
            state.role = if leader_id == self.id { Role::Leader } else { Role::Follower };
            state.current_leader = Some(leader_id);
            state.current_epoch = epoch;
            state.last_heartbeat = Instant::now();
        }
        accept
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Routes `send_message` straight into the target elector's
    /// `handle_message`, keyed by a shared registry rather than a real
    /// socket; a peer can be made "unresponsive" by never registering it
    /// (or by removing it), which stands in for process termination.
    struct InMemoryTransport {
        registry: Arc<Mutex<HashMap<String, Arc<Elector>>>>,
    }

    #[async_trait]
    impl SupervisorTransport for InMemoryTransport {
        async fn send_message(
            &self,
            peer_address: &str,
            message: ElectionMessage,
        ) -> anyhow::Result<ElectionMessage> {
            let target = self.registry.lock().unwrap().get(peer_address).cloned();
            match target {
                Some(elector) => Ok(elector.handle_message(message).await),
                None => Err(anyhow::anyhow!("peer {peer_address} unreachable")),
            }
        }
    }

    fn spawn_cluster(ids: &[&str]) -> (Arc<Mutex<HashMap<String, Arc<Elector>>>>, HashMap<String, Arc<Elector>>) {
        let registry = Arc::new(Mutex::new(HashMap::new()));
        let mut nodes = HashMap::new();
        for &id in ids {
            let peers: HashMap<String, String> = ids
                .iter()
                .filter(|&&peer| peer != id)
                .map(|&peer| (peer.to_string(), peer.to_string()))
                .collect();
            let transport = Arc::new(InMemoryTransport { registry: registry.clone() });
            let elector = Elector::spawn(id, peers, transport, ElectorConfig::default());
            registry.lock().unwrap().insert(id.to_string(), elector.clone());
            nodes.insert(id.to_string(), elector);
        }
        (registry, nodes)
    }

    #[tokio::test]
    async fn highest_id_wins_initial_election() {
        let (_registry, nodes) = spawn_cluster(&["s1", "s2", "s3"]);
        tokio::time::sleep(Duration::from_millis(700)).await;

        for elector in nodes.values() {
            assert_eq!(elector.current_leader().await.as_deref(), Some("s3"));
        }
        assert!(nodes["s3"].is_leader().await);
        assert!(!nodes["s1"].is_leader().await);
        assert!(!nodes["s2"].is_leader().await);
    }

    #[tokio::test]
    async fn second_highest_takes_over_when_leader_is_terminated() {
        let (registry, nodes) = spawn_cluster(&["s1", "s2", "s3"]);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(nodes["s3"].is_leader().await);

        // Terminate s3: remove it from the registry so probes/heartbeats to
        // it fail, matching spec.md §8 scenario 6.
        registry.lock().unwrap().remove("s3");

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(nodes["s2"].is_leader().await);
        assert_eq!(nodes["s1"].current_leader().await.as_deref(), Some("s2"));
    }
}
