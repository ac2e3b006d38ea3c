use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path as FsPath, PathBuf};

use axum::{
    extract::{multipart::Field, ConnectInfo, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use common::{serialize_message, AgentId, FileInfo, JobClass, JobDetail, JobState, PingInfo};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info, warn};

use super::AppState;
use crate::error::{MeshError, Result};
use crate::jobs::{PARAM_LOCATION, PARAM_URL};
use crate::storage::is_valid_location;

const UPLOAD_FIELD: &str = "file";
const RETRY_AFTER_SECS: &str = "5";
const DEFAULT_LIST_LIMIT: usize = 50;

pub async fn ping(State(state): State<AppState>, Json(theirs): Json<PingInfo>) -> Json<PingInfo> {
    debug!(from=%theirs.agent_id, "ping received");
    Json(state.ping_info.create_ping_info())
}

/// The caller's address as this agent sees it.
pub async fn whatismyip(ConnectInfo(caller): ConnectInfo<SocketAddr>) -> String {
    caller.ip().to_canonical().to_string()
}

pub async fn file_info(State(state): State<AppState>, Path(location): Path<String>) -> Response {
    match state.store.file_info(&location) {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn files(State(state): State<AppState>, Path(location): Path<String>, request: Request) -> Response {
    match state.store.file_by_location(&location) {
        Some(path) => serve_path(path, request).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_path(path: PathBuf, request: Request) -> Response {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

pub async fn upload(State(state): State<AppState>, Path(location): Path<String>, mut form: Multipart) -> Response {
    let target = match state.store.target_file(&location) {
        Ok(target) => target,
        Err(e) => return e.into_response(),
    };
    loop {
        match form.next_field().await {
            Ok(Some(field)) if field.name() == Some(UPLOAD_FIELD) => {
                return match save_field(field, &target).await {
                    Ok(bytes) => {
                        info!(%location, bytes, "file uploaded");
                        StatusCode::CREATED.into_response()
                    }
                    Err(e) => {
                        warn!(%location, error=%e, "upload failed");
                        e.into_response()
                    }
                };
            }
            Ok(Some(_)) => continue,
            Ok(None) => return (StatusCode::BAD_REQUEST, "file field is missing").into_response(),
            Err(e) => return (e.status(), e.body_text()).into_response(),
        }
    }
}

async fn save_field(field: Field<'_>, target: &FsPath) -> Result<u64> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".uploading");
    let partial = PathBuf::from(partial);

    let result = match write_field(field, &partial).await {
        Ok(bytes) => tokio::fs::rename(&partial, target).await.map(|_| bytes).map_err(MeshError::from),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    result
}

async fn write_field(mut field: Field<'_>, path: &FsPath) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| MeshError::Validation(e.body_text()))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Serve a mesh resource: from local disk, else by redirecting to a peer
/// that holds it, else by starting an origin download and asking the client
/// to retry.
pub async fn cdn(State(state): State<AppState>, Path(key): Path<String>, request: Request) -> Response {
    let key = key.trim_start_matches('/').to_string();
    if !is_valid_location(&key) {
        return (StatusCode::BAD_REQUEST, format!("invalid resource key {key:?}")).into_response();
    }
    if !state.cdn.is_available(&key) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(path) = state.store.file_by_location(&key) {
        return serve_path(path, request).await;
    }

    let holder = state
        .cdn
        .locate(&key)
        .await
        .into_iter()
        .find_map(|info| info.agent_id);
    if let Some(agent) = holder {
        let url = format!("{}/{}", state.config.base_url(agent.host(), agent.cdn_port()), key);
        debug!(%key, agent=%agent, "redirecting to peer");
        return Redirect::temporary(&url).into_response();
    }

    let Some(origin) = state.cdn.index().lookup(&key).and_then(|r| r.origin_url(&key)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Err(e) = start_fetch(&state, &key, &origin).await {
        return e.into_response();
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
        "resource is being fetched",
    )
        .into_response()
}

pub async fn missing_key() -> Response {
    (StatusCode::BAD_REQUEST, "resource key is missing").into_response()
}

pub async fn not_implemented() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

async fn start_fetch(state: &AppState, key: &str, origin: &str) -> Result<()> {
    let busy = state
        .pending_fetches
        .lock()
        .map(|pending| pending.get(key).is_some_and(|t| !t.is_finished()))
        .unwrap_or(false);
    if busy {
        return Ok(());
    }
    let detail = JobDetail::new(JobClass::Download, BTreeMap::new())
        .with_param(PARAM_URL, origin)
        .with_param(PARAM_LOCATION, key);
    let ticket = state.jobs.submit(detail).await?;
    info!(%key, %origin, job=%ticket.id(), "fetching resource from origin");
    if let Ok(mut pending) = state.pending_fetches.lock() {
        pending.retain(|_, t| !t.is_finished());
        pending.insert(key.to_string(), ticket);
    }
    Ok(())
}

pub async fn lookup(State(state): State<AppState>, Path(key): Path<String>) -> Json<Vec<FileInfo>> {
    Json(state.cdn.locate(&key).await)
}

pub async fn agents(State(state): State<AppState>) -> Json<Vec<AgentId>> {
    Json(state.agents.get_all())
}

pub async fn active_agents(State(state): State<AppState>) -> Json<Vec<PingInfo>> {
    Json(state.agents.active_with_info().into_iter().map(|(_, info)| info).collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJob {
    pub job_class: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub recipient: Option<AgentId>,
}

pub async fn submit_job(State(state): State<AppState>, Json(request): Json<SubmitJob>) -> Response {
    let mut detail = JobDetail::with_class_tag(request.job_class, request.parameters);
    if let Some(recipient) = request.recipient {
        detail = detail.addressed_to(recipient);
    }
    match state.jobs.submit(detail).await {
        Ok(ticket) => (StatusCode::ACCEPTED, Json(ticket.detail().clone())).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_jobs(State(state): State<AppState>, Query(query): Query<JobQuery>) -> Response {
    let filter = match query.state.as_deref().map(str::parse::<JobState>).transpose() {
        Ok(filter) => filter,
        Err(e) => return MeshError::from(e).into_response(),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Json(state.jobs.list(filter, limit).await).into_response()
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.jobs.query(&id).await {
        Some(detail) => Json(detail).into_response(),
        None => (StatusCode::NOT_FOUND, format!("job '{id}' not found")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct NewJobsQuery {
    pub agent: String,
    pub limit: Option<usize>,
    /// Comma-separated ids of jobs the caller took in on its previous pull.
    #[serde(default)]
    pub ack: String,
}

/// Jobs parked for the calling agent. The caller must connect from the host
/// it claims to be.
pub async fn new_jobs(
    State(state): State<AppState>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    Query(query): Query<NewJobsQuery>,
) -> Response {
    let agent: AgentId = match query.agent.parse() {
        Ok(agent) => agent,
        Err(e) => return MeshError::from(e).into_response(),
    };
    if !is_caller(agent.host(), caller.ip()).await {
        warn!(claimed=%agent, %caller, "job pull from a different host refused");
        return (StatusCode::FORBIDDEN, format!("caller is not {agent}")).into_response();
    }
    let limit = query
        .limit
        .unwrap_or(state.config.schedulers.get_new_jobs_batch_size);
    let acknowledged: Vec<String> = query
        .ack
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    let jobs = state.jobs.take_outbox(&agent, &acknowledged, limit).await;
    match serialize_message(&jobs) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => MeshError::from(e).into_response(),
    }
}

/// Whether `host` names or resolves to the address a request came from.
async fn is_caller(host: &str, caller: IpAddr) -> bool {
    let caller = caller.to_canonical();
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.to_canonical() == caller;
    }
    match tokio::net::lookup_host((host, 0)).await {
        Ok(mut addrs) => addrs.any(|addr| addr.ip().to_canonical() == caller),
        Err(e) => {
            debug!(%host, error=%e, "cannot resolve claimed agent host");
            false
        }
    }
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_manager::tests::manager;
    use crate::cdn::{CdnNetwork, CdnResource, CdnResourceMapping};
    use crate::http::HttpClientProvider;
    use crate::job_manager::tests::{harness, Harness};
    use crate::metrics::Metrics;
    use crate::ping::PingInfoProvider;
    use crate::web::{cdn_router, rest_router};
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::Router;
    use base64::Engine as _;
    use std::sync::Arc;

    const LOCAL_CALLER: [u8; 4] = [127, 0, 0, 1];

    struct TestApp {
        router: Router,
        state: AppState,
        h: Harness,
    }

    /// REST routes as seen by a client connecting from `ip`.
    fn rest_from(state: &AppState, ip: [u8; 4]) -> Router {
        rest_router(state.clone()).layer(MockConnectInfo(SocketAddr::from((ip, 40000))))
    }

    fn app(secured: bool) -> TestApp {
        let h = harness();
        let mut config = (*h.config).clone();
        if secured {
            config.rest.login = Some("admin".into());
            config.rest.password = Some("pw".into());
        }
        let config = Arc::new(config);
        let agents = Arc::new(manager(Vec::new()));
        let http = Arc::new(HttpClientProvider::new(&config).unwrap());
        let index = Arc::new(CdnResourceMapping::new(vec![CdnResource {
            url_prefix: "libs/".into(),
            provider_url: "http://127.0.0.1:9/origin".into(),
        }]));
        let metrics = Arc::new(Metrics::new());
        let cdn = Arc::new(CdnNetwork::new(config.clone(), agents.clone(), http, index, metrics.clone()));
        let state = AppState::new(
            config.clone(),
            PingInfoProvider::new(config.agent_id(), h.store.root().to_path_buf()),
            agents,
            cdn,
            h.manager.clone(),
            h.store.clone(),
            metrics,
        );
        TestApp { router: rest_from(&state, LOCAL_CALLER), state, h }
    }

    async fn call(router: &Router, request: axum::http::Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn ping_answers_without_credentials() {
        let app = app(true);
        let theirs = PingInfo::new(AgentId::new("agent2", 21000));
        let (status, body) = call(&app.router, post_json("/ping", serde_json::to_value(&theirs).unwrap())).await;
        assert_eq!(status, StatusCode::OK);
        let mine: PingInfo = serde_json::from_slice(&body).unwrap();
        assert_eq!(mine.agent_id, AgentId::new("me", 21000));
        assert!(!mine.version.is_empty());
    }

    #[tokio::test]
    async fn protected_routes_require_basic_auth() {
        let app = app(true);
        let (status, _) = call(&app.router, get("/agents")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = base64::engine::general_purpose::STANDARD.encode("admin:pw");
        let request = axum::http::Request::get("/agents")
            .header(header::AUTHORIZATION, format!("Basic {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");
    }

    #[tokio::test]
    async fn file_info_and_file_download() {
        let app = app(false);
        std::fs::write(app.h.store.target_file("docs/a.txt").unwrap(), "hello").unwrap();

        let (status, body) = call(&app.router, get("/fileinfo/docs/a.txt")).await;
        assert_eq!(status, StatusCode::OK);
        let info: FileInfo = serde_json::from_slice(&body).unwrap();
        assert_eq!(info.length, 5);
        assert_eq!(info.location, "docs/a.txt");

        let (status, body) = call(&app.router, get("/files/docs/a.txt")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"hello");

        let (status, _) = call(&app.router, get("/fileinfo/docs/missing.txt")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn multipart_upload_is_saved() {
        let app = app(false);
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"n.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nuploaded bytes\r\n--{boundary}--\r\n"
        );
        let request = axum::http::Request::post("/upload/in/n.txt")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let (status, _) = call(&app.router, request).await;
        assert_eq!(status, StatusCode::CREATED);
        let saved = app.h.store.file_by_location("in/n.txt").unwrap();
        assert_eq!(std::fs::read_to_string(saved).unwrap(), "uploaded bytes");
    }

    #[tokio::test]
    async fn job_submission_and_query() {
        let app = app(false);
        let (status, _) = call(
            &app.router,
            post_json("/jobs", serde_json::json!({ "jobClass": "com.example.TwitterJob" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app.router,
            post_json("/jobs", serde_json::json!({ "jobClass": "download", "parameters": { "location": "x" } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let submitted: JobDetail = serde_json::from_slice(&body).unwrap();
        assert_eq!(submitted.state, JobState::Pending);

        let mut last = None;
        for _ in 0..50 {
            let (status, body) = call(&app.router, get(&format!("/jobs/{}", submitted.id))).await;
            assert_eq!(status, StatusCode::OK);
            let detail: JobDetail = serde_json::from_slice(&body).unwrap();
            if detail.is_terminal() {
                last = Some(detail);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let done = last.unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.message.as_deref(), Some("url is missing"));

        let (status, _) = call(&app.router, get("/jobs/no-such-job")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app.router, get("/jobs?state=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn park_for(app: &TestApp, recipient: &str) {
        let body = serde_json::json!({
            "jobClass": "download",
            "parameters": { "url": "http://o/x", "location": "x" },
            "recipient": recipient
        });
        let (status, _) = call(&app.router, post_json("/jobs", body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn new_jobs_hands_over_parked_jobs_until_acknowledged() {
        let app = app(false);
        park_for(&app, "127.0.0.1:21000").await;

        let (status, body) = call(&app.router, get("/jobs/new?agent=127.0.0.1:21000&limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        let jobs: Vec<JobDetail> = serde_json::from_slice(&body).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].parameters.get("url").map(String::as_str), Some("http://o/x"));
        let id = jobs[0].id.clone();

        // response lost: the next pull carries no acknowledgement
        let (_, body) = call(&app.router, get("/jobs/new?agent=127.0.0.1:21000")).await;
        let again: Vec<JobDetail> = serde_json::from_slice(&body).unwrap();
        assert_eq!(again.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), [id.as_str()]);
        assert_eq!(app.h.manager.query(&id).await.unwrap().state, JobState::Pending);

        let (_, body) = call(&app.router, get(&format!("/jobs/new?agent=127.0.0.1:21000&ack={id}"))).await;
        assert_eq!(body, b"[]");
        let local = app.h.manager.query(&id).await.unwrap();
        assert_eq!(local.state, JobState::Finished);
        assert_eq!(local.message.as_deref(), Some("delivered to 127.0.0.1:21000"));

        let (status, _) = call(&app.router, get("/jobs/new?agent=nonsense")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn new_jobs_refuses_caller_claiming_another_host() {
        let app = app(false);
        park_for(&app, "10.1.2.3:21000").await;

        let (status, _) = call(&app.router, get("/jobs/new?agent=10.1.2.3:21000")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(app.h.manager.ledger().outbox_len(&AgentId::new("10.1.2.3", 21000)).await, 1);

        let from_recipient = rest_from(&app.state, [10, 1, 2, 3]);
        let (status, body) = call(&from_recipient, get("/jobs/new?agent=10.1.2.3:21000")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Vec<JobDetail>>(&body).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn whatismyip_reports_the_caller_address() {
        let app = app(true);
        let (status, body) = call(&rest_from(&app.state, [192, 168, 7, 9]), get("/whatismyip")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"192.168.7.9");
    }

    #[tokio::test]
    async fn cdn_port_rejects_bad_keys_and_other_methods() {
        let app = app(false);
        let cdn = cdn_router(app.state.clone());
        std::fs::write(app.h.store.target_file("libs/a.js").unwrap(), "a()").unwrap();

        let (status, body) = call(&cdn, get("/libs/a.js")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"a()");

        let delete = axum::http::Request::delete("/libs/a.js").body(Body::empty()).unwrap();
        assert_eq!(call(&cdn, delete).await.0, StatusCode::NOT_IMPLEMENTED);
        let post = axum::http::Request::post("/libs/a.js").body(Body::empty()).unwrap();
        assert_eq!(call(&cdn, post).await.0, StatusCode::NOT_IMPLEMENTED);

        assert_eq!(call(&cdn, get("/")).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(call(&cdn, get("/libs/..%2Fsecret")).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(call(&cdn, get("/libs/a%3Cb.js")).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(call(&cdn, get("/unmapped/file")).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cdn_serves_local_and_fetches_missing() {
        let app = app(false);
        let (status, _) = call(&app.router, get("/cdn/unmapped/file")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        std::fs::write(app.h.store.target_file("libs/a.js").unwrap(), "a()").unwrap();
        let (status, body) = call(&app.router, get("/cdn/libs/a.js")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"a()");

        let response = app.router.clone().oneshot(get("/cdn/libs/b.js")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], RETRY_AFTER_SECS);
        let downloads = app.h.manager.list(None, 10).await;
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].parameters.get(PARAM_URL).map(String::as_str), Some("http://127.0.0.1:9/origin/b.js"));
    }

    #[tokio::test]
    async fn metrics_are_prometheus_text() {
        let app = app(false);
        let (status, body) = call(&app.router, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("agent_jobs_submitted_total 0"));
    }
}
