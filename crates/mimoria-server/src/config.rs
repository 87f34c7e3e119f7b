//! Configuration loading (§6 "Configuration").
//!
//! Follows the `...Input`/resolved-`Config` split: the `Input` structs
//! mirror the TOML shape with everything optional, `resolve()` applies
//! defaults and validates, producing a fully-populated `Config`.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub backlog: Option<u32>,
    pub password: Option<String>,
    pub expire_check_interval_ms: Option<u64>,
    pub cluster: Option<ClusterConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfigInput {
    pub id: Option<u32>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub nodes: Vec<PeerConfigInput>,
    pub election: Option<ElectionConfigInput>,
    pub replication: Option<ReplicationConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerConfigInput {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ElectionConfigInput {
    pub leader_heartbeat_interval_ms: Option<u64>,
    pub leader_missing_timeout_ms: Option<u64>,
    pub election_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplicationConfigInput {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub interval_milliseconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub ip: String,
    pub port: u16,
    pub backlog: u32,
    pub password: String,
    pub expire_check_interval_ms: u64,
    pub cluster: Option<ClusterConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub id: u32,
    pub ip: String,
    pub port: u16,
    pub password: String,
    pub nodes: Vec<PeerConfig>,
    pub election: ElectionConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    pub leader_heartbeat_interval_ms: u64,
    pub leader_missing_timeout_ms: u64,
    pub election_timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_heartbeat_interval_ms: 1000,
            leader_missing_timeout_ms: 3000,
            election_timeout_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationConfig {
    Sync,
    Async { interval_milliseconds: u64 },
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig::Sync
    }
}

impl ConfigInput {
    pub fn resolve(self) -> Result<Config, String> {
        let cluster = self.cluster.map(ClusterConfigInput::resolve).transpose()?;
        Ok(Config {
            ip: self.ip.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(6379),
            backlog: self.backlog.unwrap_or(1024),
            password: self.password.unwrap_or_default(),
            expire_check_interval_ms: self.expire_check_interval_ms.unwrap_or(1000),
            cluster,
        })
    }
}

impl ClusterConfigInput {
    fn resolve(self) -> Result<ClusterConfig, String> {
        let id = self
            .id
            .ok_or_else(|| "cluster.id is required when [cluster] is present".to_string())?;
        let replication = match self.replication {
            None => ReplicationConfig::default(),
            Some(r) => match r.kind.as_deref() {
                None | Some("sync") => ReplicationConfig::Sync,
                Some("async") => {
                    let interval = r.interval_milliseconds.ok_or_else(|| {
                        "cluster.replication.interval_milliseconds is required for async replication"
                            .to_string()
                    })?;
                    ReplicationConfig::Async {
                        interval_milliseconds: interval,
                    }
                }
                Some(other) => return Err(format!("unknown replication type {other:?}")),
            },
        };

        let election = self.election.map(|e| ElectionConfig {
            leader_heartbeat_interval_ms: e
                .leader_heartbeat_interval_ms
                .unwrap_or(ElectionConfig::default().leader_heartbeat_interval_ms),
            leader_missing_timeout_ms: e
                .leader_missing_timeout_ms
                .unwrap_or(ElectionConfig::default().leader_missing_timeout_ms),
            election_timeout_ms: e
                .election_timeout_ms
                .unwrap_or(ElectionConfig::default().election_timeout_ms),
        });

        Ok(ClusterConfig {
            id,
            ip: self.ip.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(7070),
            password: self.password.unwrap_or_default(),
            nodes: self
                .nodes
                .into_iter()
                .map(|n| PeerConfig {
                    id: n.id,
                    host: n.host,
                    port: n.port,
                })
                .collect(),
            election: election.unwrap_or_default(),
            replication,
        })
    }
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return ConfigInput::default().resolve();
        }
        let parsed: ConfigInput =
            toml::from_str(input).map_err(|e| format!("invalid config TOML: {e}"))?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.ip, "0.0.0.0");
        assert_eq!(cfg.port, 6379);
        assert!(cfg.cluster.is_none());
    }

    #[test]
    fn parses_standalone_config() {
        let toml = r#"
            ip = "127.0.0.1"
            port = 9000
            backlog = 256
            password = "secret"
            expire_check_interval_ms = 500
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.backlog, 256);
        assert_eq!(cfg.password, "secret");
        assert_eq!(cfg.expire_check_interval_ms, 500);
    }

    #[test]
    fn parses_cluster_config_with_async_replication() {
        let toml = r#"
            [cluster]
            id = 1
            ip = "10.0.0.1"
            port = 7000
            password = "clusterpw"

            [[cluster.nodes]]
            id = 2
            host = "10.0.0.2"
            port = 7000

            [cluster.replication]
            type = "async"
            interval_milliseconds = 250
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        let cluster = cfg.cluster.unwrap();
        assert_eq!(cluster.id, 1);
        assert_eq!(cluster.nodes.len(), 1);
        assert_eq!(cluster.nodes[0].host, "10.0.0.2");
        assert_eq!(
            cluster.replication,
            ReplicationConfig::Async {
                interval_milliseconds: 250
            }
        );
    }

    #[test]
    fn async_replication_without_interval_is_rejected() {
        let toml = r#"
            [cluster]
            id = 1
            [cluster.replication]
            type = "async"
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn cluster_without_id_is_rejected() {
        let toml = r#"
            [cluster]
            port = 7000
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }
}
