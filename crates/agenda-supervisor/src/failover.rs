//! Broker liveness probing and promotion. Only runs its probe/promote logic
//! while `elector.is_leader()` holds; a leadership change observed either
//! before or after a probe abandons the in-flight attempt, per spec.md
//! §4.6 — the next leader re-observes broker health from scratch rather
//! than trusting a partially completed failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use crate::elector::Elector;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub id: String,
    pub address: String,
    pub priority: u32,
}

/// Broker liveness check, abstracted so tests can fake network failures
/// without a real broker process.
#[async_trait]
pub trait BrokerProbe: Send + Sync {
    async fn ping(&self, address: &str) -> bool;
}

/// Issues the actual promote-replica command against a broker.
#[async_trait]
pub trait BrokerController: Send + Sync {
    async fn promote_replica(&self, broker_id: &str) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct FailoverConfig {
    pub ping_interval: Duration,
    pub failure_threshold: u32,
}

struct FailoverState {
    primary_id: Option<String>,
    failure_counts: HashMap<String, u32>,
}

pub struct Failover {
    elector: Arc<Elector>,
    brokers: Vec<BrokerConfig>,
    probe: Arc<dyn BrokerProbe>,
    controller: Arc<dyn BrokerController>,
    config: FailoverConfig,
    state: RwLock<FailoverState>,
    primary_address_tx: watch::Sender<Option<String>>,
}

impl Failover {
    /// Spawns the probe loop and returns a `watch::Receiver` downstream
    /// `agenda-service` processes subscribe to in order to reconnect
    /// whenever the primary broker address changes.
    pub fn spawn(
        elector: Arc<Elector>,
        brokers: Vec<BrokerConfig>,
        initial_primary: Option<BrokerConfig>,
        probe: Arc<dyn BrokerProbe>,
        controller: Arc<dyn BrokerController>,
        config: FailoverConfig,
    ) -> (Arc<Failover>, watch::Receiver<Option<String>>) {
        let initial_address = initial_primary.as_ref().map(|b| b.address.clone());
        let initial_id = initial_primary.map(|b| b.id);
        let (tx, rx) = watch::channel(initial_address);
        let failover = Arc::new(Failover {
            elector,
            brokers,
            probe,
            controller,
            config,
            state: RwLock::new(FailoverState { primary_id: initial_id, failure_counts: HashMap::new() }),
            primary_address_tx: tx,
        });
        tokio::spawn(failover.clone().run());
        (failover, rx)
    }

    pub fn primary_address(&self) -> Option<String> {
        self.primary_address_tx.borrow().clone()
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        loop {
            ticker.tick().await;
            if !self.elector.is_leader().await {
                continue;
            }
            self.probe_once().await;
        }
    }

    async fn probe_once(self: &Arc<Self>) {
        let mut responsive = Vec::new();
        {
            let mut state = self.state.write().await;
            for broker in &self.brokers {
                let ok = self.probe.ping(&broker.address).await;
                let counter = state.failure_counts.entry(broker.id.clone()).or_insert(0);
                if ok {
                    *counter = 0;
                    responsive.push(broker.clone());
                } else {
                    *counter += 1;
                }
            }
        }

        let primary_down = {
            let state = self.state.read().await;
            match &state.primary_id {
                Some(primary_id) => {
                    state.failure_counts.get(primary_id).copied().unwrap_or(0) >= self.config.failure_threshold
                }
                None => true,
            }
        };
        if !primary_down {
            return;
        }

        // Leadership may have changed while probing; abandon rather than
        // promote under stale authority.
        if !self.elector.is_leader().await {
            return;
        }

        let current_primary = self.state.read().await.primary_id.clone();
        let mut candidates: Vec<&BrokerConfig> =
            responsive.iter().filter(|b| Some(&b.id) != current_primary.as_ref()).collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| b.id.cmp(&a.id)));

        let Some(chosen) = candidates.first().copied() else {
            tracing::warn!("broker primary down but no responsive replica to promote");
            return;
        };

        if let Err(err) = self.controller.promote_replica(&chosen.id).await {
            tracing::warn!(broker = %chosen.id, %err, "promote_replica failed");
            return;
        }

        {
            let mut state = self.state.write().await;
            state.primary_id = Some(chosen.id.clone());
            state.failure_counts.remove(&chosen.id);
        }
        let _ = self.primary_address_tx.send(Some(chosen.address.clone()));
        tracing::info!(broker = %chosen.id, address = %chosen.address, "promoted replica to primary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elector::{Elector, ElectorConfig, ElectionMessage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// No peers are configured in these tests, so this transport is never
    /// actually invoked; it exists only to satisfy `Elector::spawn`.
    struct UnreachableTransport;

    #[async_trait]
    impl crate::elector::SupervisorTransport for UnreachableTransport {
        async fn send_message(
            &self,
            _peer_address: &str,
            _message: ElectionMessage,
        ) -> anyhow::Result<ElectionMessage> {
            Err(anyhow::anyhow!("no peers configured"))
        }
    }

    struct FlakyProbe {
        down: Arc<AtomicBool>,
        down_address: &'static str,
    }

    #[async_trait]
    impl BrokerProbe for FlakyProbe {
        async fn ping(&self, address: &str) -> bool {
            !(address == self.down_address && self.down.load(Ordering::SeqCst))
        }
    }

    struct RecordingController {
        promoted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrokerController for RecordingController {
        async fn promote_replica(&self, broker_id: &str) -> anyhow::Result<()> {
            self.promoted.lock().unwrap().push(broker_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn promotes_highest_priority_replica_once_primary_is_down() {
        let elector = Elector::spawn("s1", HashMap::new(), Arc::new(UnreachableTransport), ElectorConfig::default());
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(elector.is_leader().await);

        let down = Arc::new(AtomicBool::new(true));
        let probe = Arc::new(FlakyProbe { down: down.clone(), down_address: "primary:1" });
        let controller = Arc::new(RecordingController { promoted: Mutex::new(Vec::new()) });

        let brokers = vec![
            BrokerConfig { id: "primary".into(), address: "primary:1".into(), priority: 10 },
            BrokerConfig { id: "replica-a".into(), address: "replica-a:1".into(), priority: 5 },
            BrokerConfig { id: "replica-b".into(), address: "replica-b:1".into(), priority: 7 },
        ];
        let initial = Some(brokers[0].clone());

        let (failover, mut primary_rx) = Failover::spawn(
            elector,
            brokers,
            initial,
            probe,
            controller.clone(),
            FailoverConfig { ping_interval: Duration::from_millis(20), failure_threshold: 2 },
        );

        primary_rx.changed().await.unwrap();
        let new_primary = primary_rx.borrow().clone();
        assert_eq!(new_primary.as_deref(), Some("replica-b:1"));
        assert_eq!(controller.promoted.lock().unwrap().as_slice(), &["replica-b".to_string()]);
        assert_eq!(failover.primary_address().as_deref(), Some("replica-b:1"));
    }
}
