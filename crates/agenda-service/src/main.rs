//! Bootstraps one storage-service replica and domain-service endpoint in a
//! single process: a Raft node joins the cluster named by `AGENDA_RAFT_PEERS`,
//! `AgendaRepository` drives the chosen `AgendaStore` from its apply channel,
//! `DomainService` dispatches bus verbs straight into that repository (no
//! extra RPC hop — this process *is* the storage-service replica it talks
//! to), and a small `axum` surface exposes `/raft/status`. Mirrors
//! `bpmn-lite-server::main`'s env-then-default bootstrap shape.

mod dispatch;
mod http;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agenda_bus::{Bus, InMemoryBus};
use agenda_raft::{LocalRaftNode, MemoryRaftStorage, RaftConfig, RaftGrpcService, RaftGrpcTransport, RaftServer};
use agenda_repository::AgendaRepository;
use agenda_storage::AgendaStore;
use agenda_types::config::AgendaConfig;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use dispatch::DomainService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = AgendaConfig::from_env();
    let node_id = std::env::var("AGENDA_NODE_ID").unwrap_or_else(|_| "node-1".to_string());
    let raft_bind_address =
        std::env::var("AGENDA_RAFT_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:7070".to_string());

    let store: Arc<dyn AgendaStore> = build_store().await?;

    let transport = Arc::new(RaftGrpcTransport::new(Duration::from_secs(2)));
    let raft_storage = Arc::new(MemoryRaftStorage::new());
    let (raft_node, apply_rx) = LocalRaftNode::spawn(
        node_id.clone(),
        config.raft_peer_urls.clone(),
        raft_storage,
        transport,
        RaftConfig::default(),
    );

    tokio::spawn(serve_raft(raft_bind_address, raft_node.clone()));

    let repo = AgendaRepository::new(raft_node, store, apply_rx);

    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
    let service = DomainService::new(bus, repo);

    let shutdown = CancellationToken::new();
    service.spawn(shutdown.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!(%addr, node = %node_id, "agenda-service listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let router = http::router(service);

    tokio::select! {
        result = axum::serve(listener, router) => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    Ok(())
}

/// Builds a `PostgresStore` when `DATABASE_URL` is set and the `postgres`
/// feature is enabled, falling back to `MemoryStore` otherwise — the same
/// branch `bpmn-lite-server::main::parse_database_url` takes.
async fn build_store() -> Result<Arc<dyn AgendaStore>, Box<dyn std::error::Error>> {
    let database_url = std::env::var("DATABASE_URL").ok();
    match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(&url).await?;
            let store = agenda_storage::PostgresStore::new(pool);
            store.migrate().await?;
            tracing::info!("using PostgresStore (migrations applied)");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("DATABASE_URL set but the postgres feature is not enabled, using MemoryStore");
            Ok(Arc::new(agenda_storage::MemoryStore::new()))
        }
        None => {
            tracing::info!("using MemoryStore (no DATABASE_URL configured)");
            Ok(Arc::new(agenda_storage::MemoryStore::new()))
        }
    }
}

async fn serve_raft(bind_address: String, node: Arc<LocalRaftNode>) {
    let addr: SocketAddr = match bind_address.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%err, bind_address, "invalid raft bind address, peer RPCs disabled");
            return;
        }
    };
    tracing::info!(%addr, "raft peer RPC listening");
    let service = RaftGrpcService { node };
    if let Err(err) = Server::builder().add_service(RaftServer::new(service)).serve(addr).await {
        tracing::error!(%err, "raft peer RPC server exited");
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
