use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{now_millis, AgentId, PingInfo, PingStatus, PING_PATH};
use reqwest::Method;

use crate::config::AgentConfig;
use crate::error::{MeshError, Result};
use crate::http::HttpClientProvider;

/// Builds this node's own PingInfo.
#[derive(Clone)]
pub struct PingInfoProvider {
    agent_id: AgentId,
    files_path: PathBuf,
}

impl PingInfoProvider {
    pub fn new(agent_id: AgentId, files_path: PathBuf) -> Self {
        Self { agent_id, files_path }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.agent_id(), config.files_path())
    }

    pub fn create_ping_info(&self) -> PingInfo {
        let mut info = PingInfo::new(self.agent_id.clone());
        info.version = env!("CARGO_PKG_VERSION").to_string();
        info.free_space = free_space(&self.files_path);
        info
    }
}

/// Available bytes on the disk holding `path` (longest matching mount point).
fn free_space(path: &std::path::Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Result of one timed ping, success or not.
#[derive(Debug, Clone)]
pub struct PingOutcome {
    pub status: PingStatus,
    pub info: Option<PingInfo>,
    pub elapsed: Duration,
}

pub struct PingSender {
    config: Arc<AgentConfig>,
    http: Arc<HttpClientProvider>,
    info_provider: PingInfoProvider,
}

impl PingSender {
    pub fn new(config: Arc<AgentConfig>, http: Arc<HttpClientProvider>, info_provider: PingInfoProvider) -> Self {
        Self { config, http, info_provider }
    }

    /// Send our PingInfo to `host:rest_port` and return the peer's, with its
    /// host replaced by the one we dialed.
    pub async fn ping(&self, host: &str, rest_port: u16, no_proxy: bool) -> Result<PingInfo> {
        let url = format!("{}{}", self.config.base_url(host, rest_port), PING_PATH);
        let mine = self.info_provider.create_ping_info();
        let response = self
            .http
            .bounded(Method::POST, &url, no_proxy)?
            .json(&mine)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MeshError::protocol_status(status));
        }
        let body = response.bytes().await?;
        let received: PingInfo = serde_json::from_slice(&body)
            .map_err(|e| MeshError::Protocol(format!("unparsable ping response: {e}")))?;
        let dialed = received.agent_id.with_host(host);
        Ok(PingInfo { agent_id: dialed, ..received })
    }

    /// Like [`ping`](Self::ping) but never fails: the outcome records the
    /// status and elapsed time on every path.
    pub async fn ping_timed(&self, host: &str, rest_port: u16, no_proxy: bool) -> PingOutcome {
        let started = Instant::now();
        let result = self.ping(host, rest_port, no_proxy).await;
        let mut status = PingStatus { time: now_millis(), ..Default::default() };
        let info = match result {
            Ok(info) => Some(info),
            Err(e) => {
                status.error = true;
                status.message = e.root_message();
                None
            }
        };
        PingOutcome { status, info, elapsed: started.elapsed() }
    }
}
