//! HTTP-based [`BrokerProbe`]/[`BrokerController`] implementations for a
//! real deployment, where "broker" means whatever message-bus node the
//! failover loop is promoting/demoting. The bus itself is an external
//! collaborator (spec.md §1); this crate only needs *some* way to ask a
//! broker "are you up" and "become primary", so it reaches for `reqwest`
//! the same way `rust/` (this workspace's own client-facing crate) does for
//! outbound HTTP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::failover::{BrokerController, BrokerProbe};

/// Considers a broker live if its `/health` endpoint answers 2xx within
/// `timeout`. Connection refused, DNS failure, and timeout all count as
/// down — the failover loop only needs a boolean.
pub struct HttpBrokerProbe {
    client: Client,
}

impl HttpBrokerProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpBrokerProbe { client })
    }
}

#[async_trait]
impl BrokerProbe for HttpBrokerProbe {
    async fn ping(&self, address: &str) -> bool {
        let url = format!("http://{address}/health");
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(address, %err, "broker health probe failed");
                false
            }
        }
    }
}

/// Issues the promote-replica command over the broker's own admin HTTP
/// surface. `Failover` only ever hands back the `id` half of a
/// [`crate::failover::BrokerConfig`], so this controller carries its own
/// id→address map built from the same broker list at construction time.
pub struct HttpBrokerController {
    client: Client,
    addresses: HashMap<String, String>,
}

impl HttpBrokerController {
    pub fn new(timeout: Duration, addresses: HashMap<String, String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpBrokerController { client, addresses })
    }
}

#[async_trait]
impl BrokerController for HttpBrokerController {
    async fn promote_replica(&self, broker_id: &str) -> anyhow::Result<()> {
        let address = self
            .addresses
            .get(broker_id)
            .ok_or_else(|| anyhow::anyhow!("no known address for broker {broker_id}"))?;
        let url = format!("http://{address}/admin/promote");
        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("promote request to {broker_id} returned {}", response.status());
        }
        Ok(())
    }
}
