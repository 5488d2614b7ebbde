//! Environment configuration. Reads the standard keys every `agenda-*`
//! binary recognizes, in the same "CLI-arg-then-env-var" precedence this
//! workspace already uses (see `bpmn-lite-server::main::parse_database_url`)
//! — here simplified to env-var-with-default since this crate has no CLI
//! surface of its own to speak of.

use std::env;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct AgendaConfig {
    pub bus_url: String,
    pub storage_service_url: String,
    pub raft_peer_urls: Vec<String>,
    pub supervisor_id: String,
    pub supervisor_bind_address: String,
    /// `id=address` pairs, parsed from a comma-separated env var.
    pub supervisor_peers: Vec<(String, String)>,
    pub http_port: u16,
    pub ping_interval: Duration,
    pub failure_threshold: u32,
    pub jwt_secret: String,
    pub jwt_expiration: Duration,
    pub request_timeout: Duration,
    /// Message-bus broker nodes the failover loop probes and promotes,
    /// as `id=address=priority` triples. Not one of spec.md §6's named
    /// config keys (the bus topology isn't enumerated there since the bus
    /// itself is an external collaborator) but the failover loop needs a
    /// concrete broker list to act on in a real deployment.
    pub broker_peers: Vec<BrokerPeer>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerPeer {
    pub id: String,
    pub address: String,
    pub priority: u32,
}

impl AgendaConfig {
    pub fn from_env() -> Self {
        AgendaConfig {
            bus_url: env_or("AGENDA_BUS_URL", "memory://local"),
            storage_service_url: env_or("AGENDA_STORAGE_URL", "http://127.0.0.1:8090"),
            raft_peer_urls: env::var("AGENDA_RAFT_PEERS")
                .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
            supervisor_id: env_or("AGENDA_SUPERVISOR_ID", "supervisor-1"),
            supervisor_bind_address: env_or("AGENDA_SUPERVISOR_BIND_ADDRESS", "0.0.0.0:9090"),
            supervisor_peers: env::var("AGENDA_SUPERVISOR_PEERS")
                .map(|v| parse_peers(&v))
                .unwrap_or_default(),
            http_port: env_parse_or("AGENDA_HTTP_PORT", 8080),
            ping_interval: Duration::from_millis(env_parse_or("AGENDA_PING_INTERVAL_MS", 1000)),
            failure_threshold: env_parse_or("AGENDA_FAILURE_THRESHOLD", 3),
            jwt_secret: env_or("AGENDA_JWT_SECRET", "development-secret-do-not-use-in-production"),
            jwt_expiration: Duration::from_secs(env_parse_or("AGENDA_JWT_EXPIRATION_SECS", 3600)),
            request_timeout: Duration::from_secs(env_parse_or("AGENDA_REQUEST_TIMEOUT_SECS", 30)),
            broker_peers: env::var("AGENDA_BROKER_PEERS")
                .map(|v| parse_broker_peers(&v))
                .unwrap_or_default(),
        }
    }
}

fn parse_broker_peers(raw: &str) -> Vec<BrokerPeer> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|triple| {
            let mut parts = triple.splitn(3, '=');
            let id = parts.next()?.to_string();
            let address = parts.next()?.to_string();
            let priority = parts.next()?.parse().ok()?;
            Some(BrokerPeer { id, address, priority })
        })
        .collect()
}

fn parse_peers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(id, addr)| (id.to_string(), addr.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_list_parses_id_equals_address_pairs() {
        let peers = parse_peers("s1=127.0.0.1:9001,s2=127.0.0.1:9002");
        assert_eq!(
            peers,
            vec![
                ("s1".to_string(), "127.0.0.1:9001".to_string()),
                ("s2".to_string(), "127.0.0.1:9002".to_string()),
            ]
        );
    }

    #[test]
    fn empty_peer_string_yields_empty_list() {
        assert!(parse_peers("").is_empty());
    }

    #[test]
    fn broker_peer_list_parses_id_address_priority_triples() {
        let brokers = parse_broker_peers("b1=127.0.0.1:9001=10,b2=127.0.0.1:9002=5");
        assert_eq!(
            brokers,
            vec![
                BrokerPeer { id: "b1".into(), address: "127.0.0.1:9001".into(), priority: 10 },
                BrokerPeer { id: "b2".into(), address: "127.0.0.1:9002".into(), priority: 5 },
            ]
        );
    }

    #[test]
    fn malformed_broker_peer_entry_is_skipped() {
        assert!(parse_broker_peers("not-a-valid-entry").is_empty());
    }
}
