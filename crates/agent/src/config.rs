use std::path::{Path, PathBuf};
use std::time::Duration;

use common::AgentId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MeshError, Result};

pub const CONFIG_ENV: &str = "FLEET_AGENT_CONFIG";
const CONFIG_FILE: &str = "agent.toml";

/// Resolve the agent data directory in a platform-appropriate location.
pub fn agent_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or(std::env::temp_dir()).join("fleet-agent")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host name peers use to reach this agent; defaults to the machine hostname.
    pub host: Option<String>,
    pub base_port: u16,
    /// Configured peers ("friends"), `host:base_port` each.
    pub friends: Vec<String>,
    /// `http` or `https`; used for every peer-to-peer request.
    pub scheme: String,
    pub data_dir: Option<PathBuf>,
    pub files_path: Option<PathBuf>,
    pub cdn_mapping_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_client_timeout_ms: u64,
    pub cdn_timeout_ms: u64,
    pub upload_limit_mb: usize,
    pub proxy: ProxyConfig,
    pub rest: RestConfig,
    pub pools: PoolConfig,
    pub schedulers: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: Option<String>,
    pub port: u16,
    pub login: Option<String>,
    pub password: Option<String>,
    /// Hosts reached directly; `*` matches any run of characters.
    pub bypass: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub login: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
}

impl RestConfig {
    pub fn is_secured(&self) -> bool {
        self.login.as_deref().is_some_and(|l| !l.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub download: usize,
    pub upload: usize,
    pub job: usize,
    pub ping: usize,
    pub cdn: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub get_new_jobs_interval_ms: u64,
    pub get_new_jobs_batch_size: usize,
    pub refresh_agents_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: None,
            base_port: 21000,
            friends: Vec::new(),
            scheme: "http".to_string(),
            data_dir: None,
            files_path: None,
            cdn_mapping_file: None,
            user_agent: format!("fleet-agent/{}", env!("CARGO_PKG_VERSION")),
            http_client_timeout_ms: 5000,
            cdn_timeout_ms: 3000,
            upload_limit_mb: 512,
            proxy: ProxyConfig::default(),
            rest: RestConfig::default(),
            pools: PoolConfig::default(),
            schedulers: SchedulerConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 3128,
            login: None,
            password: None,
            bypass: vec!["localhost".to_string(), "127.0.0.*".to_string()],
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { download: 4, upload: 2, job: 4, ping: 2, cdn: 4 }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            get_new_jobs_interval_ms: 1000,
            get_new_jobs_batch_size: 10,
            refresh_agents_interval_ms: 30_000,
        }
    }
}

impl AgentConfig {
    /// Load from `path`, then `$FLEET_AGENT_CONFIG`, then `<data dir>/agent.toml`.
    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => PathBuf::from(p),
                None => agent_data_dir().join(CONFIG_FILE),
            },
        };
        if !path.exists() {
            info!(path=%path.display(), "no agent config found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| MeshError::Configuration(format!("reading {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)
            .map_err(|e| MeshError::Configuration(format!("{}: {e}", path.display())))?;
        info!(path=%path.display(), "loaded agent config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn host(&self) -> String {
        match self.host.as_deref() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId::new(self.host(), self.base_port)
    }

    /// Configured peers in configuration order, duplicates dropped.
    pub fn peers(&self) -> Result<Vec<AgentId>> {
        let mut peers: Vec<AgentId> = Vec::new();
        for raw in self.friends.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
            let id: AgentId = raw
                .parse()
                .map_err(|e: common::ParseError| MeshError::Configuration(e.to_string()))?;
            if !peers.contains(&id) {
                peers.push(id);
            }
        }
        Ok(peers)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(agent_data_dir)
    }

    pub fn files_path(&self) -> PathBuf {
        self.files_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("files"))
    }

    pub fn cdn_mapping_file(&self) -> PathBuf {
        self.cdn_mapping_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("cdn.json"))
    }

    pub fn http_client_timeout(&self) -> Duration {
        Duration::from_millis(self.http_client_timeout_ms)
    }

    pub fn cdn_timeout(&self) -> Duration {
        Duration::from_millis(self.cdn_timeout_ms)
    }

    pub fn base_url(&self, host: &str, port: u16) -> String {
        format!("{}://{}:{}", self.scheme, host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.base_port, 21000);
        assert_eq!(cfg.pools.download, 4);
        assert_eq!(cfg.pools.job, 4);
        assert_eq!(cfg.pools.ping, 2);
        assert_eq!(cfg.pools.cdn, 4);
        assert_eq!(cfg.cdn_timeout(), Duration::from_millis(3000));
        assert_eq!(cfg.http_client_timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.proxy.port, 3128);
        assert_eq!(cfg.proxy.bypass, vec!["localhost", "127.0.0.*"]);
        assert_eq!(cfg.schedulers.get_new_jobs_batch_size, 10);
        assert!(!cfg.rest.is_secured());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = AgentConfig::from_toml(
            r#"
            host = "agent1"
            friends = ["agent2:21000", "agent3:22000", "agent2:21000"]

            [pools]
            download = 8

            [proxy]
            host = "proxy.local"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent_id(), AgentId::new("agent1", 21000));
        assert_eq!(cfg.pools.download, 8);
        assert_eq!(cfg.pools.upload, 2);
        assert_eq!(cfg.proxy.port, 3128);
        let peers = cfg.peers().unwrap();
        assert_eq!(peers, vec![AgentId::new("agent2", 21000), AgentId::new("agent3", 22000)]);
    }

    #[test]
    fn malformed_friend_is_configuration_error() {
        let cfg = AgentConfig {
            friends: vec!["agent2".to_string()],
            ..Default::default()
        };
        assert!(matches!(cfg.peers(), Err(MeshError::Configuration(_))));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.base_port, 21000);
    }

    #[test]
    fn malformed_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "base_port = \"not a number\"").unwrap();
        assert!(matches!(AgentConfig::load(Some(&path)), Err(MeshError::Configuration(_))));
    }
}
