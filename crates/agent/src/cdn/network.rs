use std::sync::Arc;

use common::{AgentId, FileInfo, FILE_INFO_PATH};
use reqwest::{Method, StatusCode};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::mapping::ResourceIndex;
use crate::agent_manager::AgentManager;
use crate::config::AgentConfig;
use crate::error::{MeshError, Result};
use crate::http::HttpClientProvider;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;

/// One broadcast lookup in flight. Dropping it discards any answers that
/// have not been collected yet.
pub struct LookupRound {
    key: String,
    count: usize,
    results: mpsc::Receiver<Option<FileInfo>>,
}

impl LookupRound {
    /// Number of peers the request was dispatched to.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Resolves which peers hold a resource by asking every active peer at once.
pub struct CdnNetwork {
    config: Arc<AgentConfig>,
    agent_manager: Arc<AgentManager>,
    http: Arc<HttpClientProvider>,
    index: Arc<dyn ResourceIndex>,
    pool: WorkerPool,
    metrics: Arc<Metrics>,
}

impl CdnNetwork {
    pub fn new(
        config: Arc<AgentConfig>,
        agent_manager: Arc<AgentManager>,
        http: Arc<HttpClientProvider>,
        index: Arc<dyn ResourceIndex>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let pool = WorkerPool::new("cdn", config.pools.cdn);
        Self { config, agent_manager, http, index, pool, metrics }
    }

    /// Whether `key` belongs to a resource this mesh serves. Local only.
    pub fn is_available(&self, key: &str) -> bool {
        self.index.lookup(key).is_some()
    }

    pub fn index(&self) -> &Arc<dyn ResourceIndex> {
        &self.index
    }

    pub fn send_requests_to_active_agents(&self, key: &str) -> LookupRound {
        let key = key.trim_start_matches('/').to_string();
        let agents = self.agent_manager.get_active();
        let (tx, rx) = mpsc::channel(agents.len().max(1));
        Metrics::inc(&self.metrics.lookups_total);

        for agent in &agents {
            let tx = tx.clone();
            let url = format!(
                "{}{}/{}",
                self.config.base_url(agent.host(), agent.rest_port()),
                FILE_INFO_PATH,
                key
            );
            let http = self.http.clone();
            let agent = agent.clone();
            self.pool.spawn(async move {
                let answer = match fetch_file_info(&http, &url, &agent).await {
                    Ok(found) => found,
                    Err(e) => {
                        debug!(agent=%agent, error=%e, "file info request failed");
                        None
                    }
                };
                if tx.send(answer).await.is_err() {
                    debug!(agent=%agent, "late lookup response dropped");
                }
            });
        }
        debug!(%key, agents = agents.len(), "lookup dispatched");
        LookupRound { key, count: agents.len(), results: rx }
    }

    /// Positive answers that arrive within the lookup timeout.
    pub async fn get_responses_from_agents(&self, mut round: LookupRound) -> Vec<FileInfo> {
        let mut found = Vec::new();
        if round.count() == 0 {
            return found;
        }
        let deadline = Instant::now() + self.config.cdn_timeout();
        let mut received = 0;
        while received < round.count() {
            match timeout_at(deadline, round.results.recv()).await {
                Ok(Some(answer)) => {
                    received += 1;
                    found.extend(answer);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(key=%round.key, received, expected = round.count, "lookup timed out");
                    break;
                }
            }
        }
        Metrics::add(&self.metrics.lookup_hits_total, found.len() as u64);
        info!(key=%round.key, holders = found.len(), asked = round.count, "lookup complete");
        found
    }

    pub async fn locate(&self, key: &str) -> Vec<FileInfo> {
        let round = self.send_requests_to_active_agents(key);
        self.get_responses_from_agents(round).await
    }
}

async fn fetch_file_info(http: &HttpClientProvider, url: &str, agent: &AgentId) -> Result<Option<FileInfo>> {
    let response = http.bounded(Method::GET, url, false)?.send().await?;
    match response.status() {
        StatusCode::OK => {
            let body = response.bytes().await?;
            let mut info: FileInfo = serde_json::from_slice(&body)
                .map_err(|e| MeshError::Protocol(format!("unparsable file info: {e}")))?;
            info.agent_id = Some(agent.clone());
            Ok(Some(info))
        }
        StatusCode::NOT_FOUND => Ok(None),
        other => Err(MeshError::protocol_status(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_manager::tests::{live_peer, manager};
    use crate::cdn::mapping::{CdnResource, CdnResourceMapping};
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use common::{PingInfo, PING_PATH};
    use std::time::Duration;

    fn with_ping(router: Router) -> Router {
        router.route(
            PING_PATH,
            post(|Json(theirs): Json<PingInfo>| async move { Json(PingInfo::new(theirs.agent_id)) }),
        )
    }

    async fn holder(length: u64) -> AgentId {
        let router = Router::new().route(
            "/fileinfo/*location",
            get(move |Path(location): Path<String>| async move {
                Json(FileInfo { agent_id: None, location, length, last_modified: 1 })
            }),
        );
        live_peer(with_ping(router)).await
    }

    async fn network(peers: Vec<AgentId>, cdn_timeout_ms: u64) -> CdnNetwork {
        let mgr = Arc::new(manager(peers));
        mgr.refresh().await;
        let config = Arc::new(AgentConfig {
            host: Some("me".into()),
            cdn_timeout_ms,
            http_client_timeout_ms: 5000,
            ..Default::default()
        });
        let http = Arc::new(HttpClientProvider::new(&config).unwrap());
        let index = Arc::new(CdnResourceMapping::new(vec![CdnResource {
            url_prefix: "libs/".into(),
            provider_url: "http://origin.invalid".into(),
        }]));
        CdnNetwork::new(config, mgr, http, index, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn zero_active_agents_yields_empty_immediately() {
        let net = network(Vec::new(), 3000).await;
        let started = std::time::Instant::now();
        let round = net.send_requests_to_active_agents("libs/a.js");
        assert_eq!(round.count(), 0);
        assert!(net.get_responses_from_agents(round).await.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn not_found_answers_are_excluded() {
        let router = Router::new().route("/fileinfo/*location", get(|| async { StatusCode::NOT_FOUND }));
        let peer = live_peer(with_ping(router)).await;
        let net = network(vec![peer], 3000).await;

        let round = net.send_requests_to_active_agents("libs/a.js");
        assert_eq!(round.count(), 1);
        assert!(net.get_responses_from_agents(round).await.is_empty());
    }

    #[tokio::test]
    async fn answers_are_stamped_with_responding_agent() {
        let a = holder(10).await;
        let b = holder(20).await;
        let net = network(vec![a.clone(), b.clone()], 3000).await;

        let mut found = net.locate("/libs/jquery.js").await;
        assert_eq!(found.len(), 2);
        found.sort_by_key(|f| f.length);
        assert_eq!(found[0].agent_id.as_ref(), Some(&a));
        assert_eq!(found[1].agent_id.as_ref(), Some(&b));
        assert!(found.iter().all(|f| f.location == "libs/jquery.js"));
    }

    #[tokio::test]
    async fn slow_agent_is_cut_off_by_timeout() {
        let fast = holder(1).await;
        let router = Router::new().route(
            "/fileinfo/*location",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Json(FileInfo { agent_id: None, location: "late".into(), length: 0, last_modified: 0 })
            }),
        );
        let slow = live_peer(with_ping(router)).await;
        let net = network(vec![fast.clone(), slow], 300).await;

        let started = std::time::Instant::now();
        let found = net.locate("libs/x").await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id.as_ref(), Some(&fast));
    }

    #[tokio::test]
    async fn failed_and_unparsable_answers_are_dropped() {
        let holds = holder(42).await;
        let missing = live_peer(with_ping(
            Router::new().route("/fileinfo/*location", get(|| async { StatusCode::NOT_FOUND })),
        ))
        .await;
        let broken = live_peer(with_ping(
            Router::new().route("/fileinfo/*location", get(|| async { StatusCode::INTERNAL_SERVER_ERROR })),
        ))
        .await;
        let garbled = live_peer(with_ping(
            Router::new().route("/fileinfo/*location", get(|| async { "{\"location\": 7" })),
        ))
        .await;
        let net = network(vec![holds.clone(), missing, broken, garbled], 3000).await;

        let round = net.send_requests_to_active_agents("libs/a.js");
        assert_eq!(round.count(), 4);
        let found = net.get_responses_from_agents(round).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id.as_ref(), Some(&holds));
        assert_eq!(found[0].length, 42);
    }

    #[tokio::test]
    async fn availability_is_local_only() {
        let net = network(Vec::new(), 3000).await;
        assert!(net.is_available("libs/jquery.js"));
        assert!(!net.is_available("other/file"));
    }
}
