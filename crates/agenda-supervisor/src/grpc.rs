//! Wire transport for the Bully protocol: one unary `SendMessage` RPC,
//! generated via `tonic-build` exactly as `bpmn-lite-server::grpc` does for
//! `BpmnLite`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use crate::elector::{Elector, ElectionMessage, MessageType, SupervisorTransport};

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("agenda.supervisor.v1");
}

use proto::supervisor_server::Supervisor;
pub use proto::supervisor_client::SupervisorClient;
pub use proto::supervisor_server::SupervisorServer;

impl From<ElectionMessage> for proto::ElectionMessage {
    fn from(msg: ElectionMessage) -> Self {
        proto::ElectionMessage {
            sender_id: msg.sender_id,
            leader_id: msg.leader_id.unwrap_or_default(),
            epoch: msg.epoch,
            message_type: proto_message_type(msg.message_type) as i32,
        }
    }
}

impl From<proto::ElectionMessage> for ElectionMessage {
    fn from(msg: proto::ElectionMessage) -> Self {
        ElectionMessage {
            sender_id: msg.sender_id,
            leader_id: if msg.leader_id.is_empty() { None } else { Some(msg.leader_id) },
            epoch: msg.epoch,
            message_type: core_message_type(msg.message_type),
        }
    }
}

fn proto_message_type(t: MessageType) -> proto::MessageType {
    match t {
        MessageType::Unknown => proto::MessageType::Unknown,
        MessageType::Election => proto::MessageType::Election,
        MessageType::Ok => proto::MessageType::Ok,
        MessageType::Coordinator => proto::MessageType::Coordinator,
        MessageType::Heartbeat => proto::MessageType::Heartbeat,
    }
}

fn core_message_type(raw: i32) -> MessageType {
    match proto::MessageType::try_from(raw).unwrap_or(proto::MessageType::Unknown) {
        proto::MessageType::Unknown => MessageType::Unknown,
        proto::MessageType::Election => MessageType::Election,
        proto::MessageType::Ok => MessageType::Ok,
        proto::MessageType::Coordinator => MessageType::Coordinator,
        proto::MessageType::Heartbeat => MessageType::Heartbeat,
    }
}

/// gRPC service delegating every call straight to the elector's state
/// machine; mirrors `BpmnLiteService`'s thin-wrapper-over-a-facade shape.
pub struct SupervisorService {
    pub elector: Arc<Elector>,
}

#[tonic::async_trait]
impl Supervisor for SupervisorService {
    async fn send_message(
        &self,
        request: Request<proto::ElectionMessage>,
    ) -> Result<Response<proto::ElectionMessage>, Status> {
        let incoming: ElectionMessage = request.into_inner().into();
        let reply = self.elector.handle_message(incoming).await;
        Ok(Response::new(reply.into()))
    }
}

/// Client side of [`SupervisorTransport`]: one short-lived channel per call,
/// matching `agenda-raft::grpc::RaftGrpcTransport`'s connect-per-call shape
/// since supervisor peer sets are small and election traffic is bursty
/// rather than constant.
pub struct GrpcSupervisorTransport {
    connect_timeout: Duration,
}

impl GrpcSupervisorTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        GrpcSupervisorTransport { connect_timeout }
    }

    async fn connect(&self, peer_address: &str) -> anyhow::Result<SupervisorClient<Channel>> {
        let uri = if peer_address.starts_with("http://") || peer_address.starts_with("https://") {
            peer_address.to_string()
        } else {
            format!("http://{peer_address}")
        };
        let endpoint = Endpoint::from_shared(uri)?.connect_timeout(self.connect_timeout);
        let channel = endpoint.connect().await?;
        Ok(SupervisorClient::new(channel))
    }
}

#[async_trait]
impl SupervisorTransport for GrpcSupervisorTransport {
    async fn send_message(
        &self,
        peer_address: &str,
        message: ElectionMessage,
    ) -> anyhow::Result<ElectionMessage> {
        let mut client = self.connect(peer_address).await?;
        let response = client.send_message(Request::new(message.into())).await?;
        Ok(response.into_inner().into())
    }
}
