pub mod elector;
pub mod failover;
pub mod grpc;
pub mod http_probe;

pub use elector::{ElectionMessage, Elector, ElectorConfig, MessageType, SupervisorTransport};
pub use failover::{BrokerConfig, BrokerController, BrokerProbe, Failover, FailoverConfig};
pub use grpc::{GrpcSupervisorTransport, SupervisorClient, SupervisorServer, SupervisorService};
pub use http_probe::{HttpBrokerController, HttpBrokerProbe};
