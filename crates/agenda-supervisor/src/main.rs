//! Bootstraps one supervisor replica: a Bully elector reachable over gRPC
//! for peer probes/coordinator broadcasts, and a failover loop that watches
//! the configured broker set and promotes a replica once the current
//! primary stops responding. Mirrors `bpmn-lite-server::main`'s
//! env-then-default bootstrap shape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agenda_supervisor::{
    BrokerConfig, Elector, ElectorConfig, Failover, FailoverConfig, GrpcSupervisorTransport,
    HttpBrokerController, HttpBrokerProbe, SupervisorServer, SupervisorService,
};
use agenda_types::config::AgendaConfig;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = AgendaConfig::from_env();

    let peers: HashMap<String, String> = config.supervisor_peers.into_iter().collect();
    let transport = Arc::new(GrpcSupervisorTransport::new(Duration::from_secs(2)));
    let elector = Elector::spawn(config.supervisor_id.clone(), peers, transport, ElectorConfig::default());

    let bind_address: SocketAddr = config.supervisor_bind_address.parse()?;
    tracing::info!(%bind_address, id = %config.supervisor_id, "supervisor listening");
    let grpc_service = SupervisorService { elector: elector.clone() };
    tokio::spawn(async move {
        if let Err(err) =
            Server::builder().add_service(SupervisorServer::new(grpc_service)).serve(bind_address).await
        {
            tracing::error!(%err, "supervisor gRPC server exited");
        }
    });

    if config.broker_peers.is_empty() {
        tracing::warn!("no AGENDA_BROKER_PEERS configured, failover loop has nothing to probe");
        std::future::pending::<()>().await;
        return Ok(());
    }

    let brokers: Vec<BrokerConfig> = config
        .broker_peers
        .iter()
        .map(|b| BrokerConfig { id: b.id.clone(), address: b.address.clone(), priority: b.priority })
        .collect();
    let initial_primary =
        brokers.iter().max_by_key(|b| b.priority).cloned();
    let addresses: HashMap<String, String> =
        config.broker_peers.iter().map(|b| (b.id.clone(), b.address.clone())).collect();

    let probe_timeout = Duration::from_secs(2).min(config.ping_interval);
    let probe = Arc::new(HttpBrokerProbe::new(probe_timeout)?);
    let controller = Arc::new(HttpBrokerController::new(config.request_timeout, addresses)?);
    let (_failover, mut primary_rx) = Failover::spawn(
        elector,
        brokers,
        initial_primary,
        probe,
        controller,
        FailoverConfig { ping_interval: config.ping_interval, failure_threshold: config.failure_threshold },
    );

    loop {
        primary_rx.changed().await?;
        let primary = primary_rx.borrow().clone();
        tracing::info!(?primary, "broker primary changed");
    }
}
