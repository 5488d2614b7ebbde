//! Correlation RPC layer: turns the fire-and-forget bus into request/reply.
//! One process-wide [`RpcClient`] owns a waiter registry keyed by `event_id`
//! and a dispatcher task per reply topic it cares about.
//!
//! Grounded on this workspace's existing `RwLock<Inner>`-around-a-plain-struct
//! convention (`bpmn-lite-core::store_memory::MemoryStore`) for the waiter
//! registry, and on `bpmn-lite-server::main`'s `tokio::spawn` + `tracing`
//! bootstrap for the dispatcher task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agenda_bus::Bus;
use agenda_types::envelope::{RequestEnvelope, ResponseEnvelope};
use agenda_types::error::AgendaError;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Default request timeout: 30 s, configurable per call site.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type Waiters = Arc<RwLock<HashMap<Uuid, oneshot::Sender<ResponseEnvelope>>>>;

/// Removes this request's waiter on drop, whichever way the future ends:
/// delivered (no-op, the dispatcher already removed it), timed out, or
/// cancelled by the caller dropping the request future early. This is the
/// whole cancellation mechanism — there is no separate cancellation code
/// path, just the registration's lifetime.
struct WaiterGuard {
    waiters: Waiters,
    id: Uuid,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let waiters = self.waiters.clone();
        let id = self.id;
        tokio::spawn(async move {
            waiters.write().await.remove(&id);
        });
    }
}

/// Process-wide correlation client: one instance per process, shared by
/// every outbound request. Construct once, spawn its dispatchers once, then
/// clone the handle (it is `Clone`) wherever a request needs to be made.
#[derive(Clone)]
pub struct RpcClient {
    bus: Arc<dyn Bus>,
    waiters: Waiters,
}

impl RpcClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        RpcClient {
            bus,
            waiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the dispatcher for one reply topic. Call once per reply topic
    /// the process needs to correlate responses on (there are three in this
    /// system: `users_events_response`, `events_response`,
    /// `group_events_response`). Wrapped in a restart loop: if the
    /// underlying subscription stream ends, it is re-established rather than
    /// silently leaving the process deaf on that topic.
    pub fn spawn_dispatcher(&self, reply_topic: impl Into<String>) {
        let bus = self.bus.clone();
        let waiters = self.waiters.clone();
        let reply_topic = reply_topic.into();

        tokio::spawn(async move {
            loop {
                match bus.subscribe(&reply_topic).await {
                    Ok(mut stream) => {
                        tracing::info!(topic = %reply_topic, "dispatcher subscribed");
                        while let Some(payload) = stream.next().await {
                            Self::dispatch_one(&waiters, payload).await;
                        }
                        tracing::warn!(topic = %reply_topic, "dispatcher stream ended, resubscribing");
                    }
                    Err(err) => {
                        tracing::error!(topic = %reply_topic, error = %err, "dispatcher subscribe failed, retrying");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });
    }

    async fn dispatch_one(waiters: &Waiters, payload: Bytes) {
        let response: ResponseEnvelope = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed response envelope");
                return;
            }
        };

        // Atomically remove-and-take: a second response for the same
        // event_id (duplicate delivery) finds no waiter and is dropped here,
        // giving at-most-one delivery per request.
        let sender = waiters.write().await.remove(&response.event_id);
        match sender {
            Some(sender) => {
                // The receiver may already be gone (timed out, cancelled);
                // `send` returning Err just means nobody is listening anymore.
                let _ = sender.send(response);
            }
            None => {
                tracing::warn!(
                    event_id = %response.event_id,
                    kind = %response.kind,
                    "orphaned response: no waiter (timed out or duplicate)"
                );
            }
        }
    }

    /// Send a request and wait for its correlated response, using
    /// [`DEFAULT_TIMEOUT`].
    pub async fn request(
        &self,
        request_topic: &str,
        verb: &str,
        data: Value,
        reply_to: &str,
    ) -> Result<ResponseEnvelope, AgendaError> {
        self.request_with_timeout(request_topic, verb, data, reply_to, DEFAULT_TIMEOUT)
            .await
    }

    /// Send a request and wait for its correlated response with an explicit
    /// timeout. The waiter is registered *before* publishing, so a reply
    /// that arrives unusually fast can never race ahead of its own
    /// registration.
    pub async fn request_with_timeout(
        &self,
        request_topic: &str,
        verb: &str,
        data: Value,
        reply_to: &str,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, AgendaError> {
        let envelope = RequestEnvelope::new(verb, data, reply_to);
        let id = envelope.id;

        let (tx, rx) = oneshot::channel();
        self.waiters.write().await.insert(id, tx);
        let _guard = WaiterGuard {
            waiters: self.waiters.clone(),
            id,
        };

        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| AgendaError::InvalidArgument(e.to_string()))?;
        self.bus
            .publish(request_topic, Bytes::from(payload))
            .await
            .map_err(|e| AgendaError::Transient(e.to_string()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without sending: treat like any other
            // unresolved wait, since the guard will already be cleaning up.
            Ok(Err(_)) => Err(AgendaError::Timeout),
            Err(_) => Err(AgendaError::Timeout),
        }
    }

    /// Number of requests currently awaiting a response. Exposed for tests
    /// and for operational introspection.
    pub async fn pending_count(&self) -> usize {
        self.waiters.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenda_bus::InMemoryBus;
    use serde_json::json;

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let client = RpcClient::new(bus.clone());
        client.spawn_dispatcher("reply.topic");

        // a fake responder: echoes back success with the same event_id
        let mut incoming = bus.subscribe("request.topic").await.unwrap();
        let bus_responder = bus.clone();
        tokio::spawn(async move {
            use tokio_stream::StreamExt;
            let payload = incoming.next().await.unwrap();
            let req: RequestEnvelope = serde_json::from_slice(&payload).unwrap();
            let resp = ResponseEnvelope::ok(req.id, "user.create", json!({"id": "abc"}));
            let body = serde_json::to_vec(&resp).unwrap();
            bus_responder
                .publish(&req.metadata.reply_to, Bytes::from(body))
                .await
                .unwrap();
        });

        let resp = client
            .request("request.topic", "user.create", json!({}), "reply.topic")
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["id"], "abc");
    }

    #[tokio::test]
    async fn timeout_when_nobody_replies() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let client = RpcClient::new(bus);
        client.spawn_dispatcher("reply.topic");

        let err = client
            .request_with_timeout(
                "request.topic",
                "user.create",
                json!({}),
                "reply.topic",
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err, AgendaError::Timeout);
    }

    #[tokio::test]
    async fn second_response_for_same_event_id_is_dropped() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let client = RpcClient::new(bus.clone());
        client.spawn_dispatcher("reply.topic");

        let mut incoming = bus.subscribe("request.topic").await.unwrap();
        let bus_responder = bus.clone();
        tokio::spawn(async move {
            use tokio_stream::StreamExt;
            let payload = incoming.next().await.unwrap();
            let req: RequestEnvelope = serde_json::from_slice(&payload).unwrap();
            for _ in 0..2 {
                let resp = ResponseEnvelope::ok(req.id, "user.create", json!({"id": "abc"}));
                let body = serde_json::to_vec(&resp).unwrap();
                bus_responder
                    .publish(&req.metadata.reply_to, Bytes::from(body))
                    .await
                    .unwrap();
            }
        });

        let resp = client
            .request("request.topic", "user.create", json!({}), "reply.topic")
            .await
            .unwrap();
        assert!(resp.success);
        // the waiter was consumed by the first response; nothing is left
        // pending for the (already dropped) duplicate to find.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_count().await, 0);
    }
}
