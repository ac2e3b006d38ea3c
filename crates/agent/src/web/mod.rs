mod handlers;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::Engine as _;
use common::{FILE_INFO_PATH, NEW_JOBS_PATH, PING_PATH, WHAT_IS_MY_IP_PATH};
use tower::ServiceBuilder;
use tracing::info;

use crate::agent_manager::AgentManager;
use crate::cdn::CdnNetwork;
use crate::config::{AgentConfig, RestConfig};
use crate::error::MeshError;
use crate::job_manager::{JobManager, JobTicket};
use crate::metrics::Metrics;
use crate::ping::PingInfoProvider;
use crate::storage::FileStore;

const DEFAULT_REALM: &str = "fleet-agent";

/// Everything the HTTP handlers reach into.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub ping_info: PingInfoProvider,
    pub agents: Arc<AgentManager>,
    pub cdn: Arc<CdnNetwork>,
    pub jobs: Arc<JobManager>,
    pub store: FileStore,
    pub metrics: Arc<Metrics>,
    /// Origin downloads started by CDN misses, by resource key.
    pub(crate) pending_fetches: Arc<Mutex<HashMap<String, JobTicket>>>,
}

impl AppState {
    pub fn new(
        config: Arc<AgentConfig>,
        ping_info: PingInfoProvider,
        agents: Arc<AgentManager>,
        cdn: Arc<CdnNetwork>,
        jobs: Arc<JobManager>,
        store: FileStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            ping_info,
            agents,
            cdn,
            jobs,
            store,
            metrics,
            pending_fetches: Arc::default(),
        }
    }
}

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let status = match &self {
            MeshError::Validation(_) | MeshError::UnsupportedJobClass(_) => StatusCode::BAD_REQUEST,
            MeshError::Transport(_) | MeshError::Protocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Routes served on the REST port. Everything except `/ping` and
/// `/whatismyip` sits behind
/// basic auth when REST credentials are configured.
pub fn rest_router(state: AppState) -> Router {
    let upload_limit = state.config.upload_limit_mb.saturating_mul(1024 * 1024);
    let protected = Router::new()
        .route(&format!("{FILE_INFO_PATH}/*location"), get(handlers::file_info))
        .route("/files/*location", get(handlers::files))
        .route(
            "/upload/*location",
            post(handlers::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/cdn/*key", get(handlers::cdn))
        .route("/lookup/*key", get(handlers::lookup))
        .route("/agents", get(handlers::agents))
        .route("/agents/active", get(handlers::active_agents))
        .route("/jobs", get(handlers::list_jobs).post(handlers::submit_job))
        .route(NEW_JOBS_PATH, get(handlers::new_jobs))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/metrics", get(handlers::metrics))
        .route_layer(ServiceBuilder::new().layer(middleware::from_fn_with_state(state.clone(), require_auth)));

    Router::new()
        .route(PING_PATH, post(handlers::ping))
        .route(WHAT_IS_MY_IP_PATH, get(handlers::whatismyip))
        .merge(protected)
        .with_state(state)
}

/// Public routes served on the CDN port: `GET /<key>` resolves a resource.
pub fn cdn_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::missing_key).fallback(handlers::not_implemented))
        .route("/*key", get(handlers::cdn).fallback(handlers::not_implemented))
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let rest = &state.config.rest;
    if !rest.is_secured() || authorized(rest, request.headers()) {
        return next.run(request).await;
    }
    let realm = rest.realm.as_deref().unwrap_or(DEFAULT_REALM);
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, format!("Basic realm=\"{realm}\""))],
    )
        .into_response()
}

fn authorized(rest: &RestConfig, headers: &HeaderMap) -> bool {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let expected = format!(
        "{}:{}",
        rest.login.as_deref().unwrap_or_default(),
        rest.password.as_deref().unwrap_or_default()
    );
    decoded == expected.as_bytes()
}

/// Bind `addr` and serve `router` until the task is dropped. Handlers see
/// the peer address through `ConnectInfo`.
pub async fn serve(name: &'static str, addr: SocketAddr, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {name} listener on {addr}"))?;
    info!(server = name, %addr, "listening");
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .with_context(|| format!("{name} server"))
}
