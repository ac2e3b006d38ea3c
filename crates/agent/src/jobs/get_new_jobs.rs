use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use common::{deserialize_message, AgentId, JobDetail, NEW_JOBS_PATH};
use reqwest::Method;
use tokio::sync::mpsc;
use tracing::debug;

use super::{required, PARAM_AGENT, PARAM_LIMIT};
use crate::config::AgentConfig;
use crate::error::{MeshError, Result};
use crate::http::HttpClientProvider;

/// Pulls jobs other agents have addressed to us and hands them to the local
/// job manager through the intake channel.
///
/// Ids of the jobs taken in on one pull are acknowledged on the next pull to
/// the same agent, which only then closes its own record of them.
pub struct GetJobsClient {
    config: Arc<AgentConfig>,
    http: Arc<HttpClientProvider>,
    self_id: AgentId,
    intake: mpsc::Sender<JobDetail>,
    received: Mutex<HashMap<AgentId, Vec<String>>>,
}

impl GetJobsClient {
    pub fn new(
        config: Arc<AgentConfig>,
        http: Arc<HttpClientProvider>,
        intake: mpsc::Sender<JobDetail>,
    ) -> Self {
        let self_id = config.agent_id();
        Self { config, http, self_id, intake, received: Mutex::new(HashMap::new()) }
    }

    pub async fn fetch(&self, agent: &AgentId, limit: usize) -> Result<Vec<JobDetail>> {
        let url = format!(
            "{}{}",
            self.config.base_url(agent.host(), agent.rest_port()),
            NEW_JOBS_PATH
        );
        let response = self
            .http
            .bounded(Method::GET, &url, false)?
            .query(&[
                ("agent", self.self_id.to_string()),
                ("limit", limit.to_string()),
                ("ack", self.acknowledgements(agent).join(",")),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MeshError::protocol_status(response.status()));
        }
        let body = response.bytes().await?;
        deserialize_message(&body).map_err(|e| MeshError::Protocol(format!("unparsable job list: {e}")))
    }

    /// Queue each job received from `agent` locally as a fresh submission.
    pub async fn accept(&self, agent: &AgentId, jobs: Vec<JobDetail>) -> Result<usize> {
        let mut taken = Vec::with_capacity(jobs.len());
        let mut outcome = Ok(());
        for job in jobs {
            if self.intake.send(job.resubmission()).await.is_err() {
                outcome = Err(MeshError::Configuration("job intake is closed".into()));
                break;
            }
            taken.push(job.id);
        }
        let count = taken.len();
        self.set_acknowledgements(agent, taken);
        outcome.map(|()| count)
    }

    fn acknowledgements(&self, agent: &AgentId) -> Vec<String> {
        let received = self.received.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        received.get(agent).cloned().unwrap_or_default()
    }

    fn set_acknowledgements(&self, agent: &AgentId, ids: Vec<String>) {
        let mut received = self.received.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if ids.is_empty() {
            received.remove(agent);
        } else {
            received.insert(agent.clone(), ids);
        }
    }
}

pub(super) async fn execute(
    client: &GetJobsClient,
    default_limit: usize,
    params: &BTreeMap<String, String>,
) -> Result<Option<String>> {
    let agent: AgentId = required(params, PARAM_AGENT)?.parse()?;
    let limit = match params.get(PARAM_LIMIT) {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| MeshError::Validation(format!("{PARAM_LIMIT} is not a number: {raw}")))?,
        None => default_limit,
    };
    let jobs = client.fetch(&agent, limit).await?;
    let received = client.accept(&agent, jobs).await?;
    if received > 0 {
        debug!(agent=%agent, received, "received new jobs");
    }
    Ok(Some(format!("{received} jobs received from {agent}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_manager::tests::live_peer;
    use axum::{extract::Query, routing::get, Json, Router};
    use common::JobClass;

    fn client_for(intake: mpsc::Sender<JobDetail>) -> GetJobsClient {
        let config = Arc::new(AgentConfig { host: Some("me".into()), ..Default::default() });
        let http = Arc::new(HttpClientProvider::new(&config).unwrap());
        GetJobsClient::new(config, http, intake)
    }

    fn remote_job(id: &str) -> JobDetail {
        let mut sent = JobDetail::new(JobClass::Download, BTreeMap::new())
            .with_param("url", "http://origin/x")
            .addressed_to(AgentId::new("me", 21000));
        sent.id = id.into();
        sent
    }

    #[tokio::test]
    async fn fetched_jobs_are_resubmitted_through_intake() {
        let router = Router::new().route(
            NEW_JOBS_PATH,
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("agent").map(String::as_str), Some("me:21000"));
                assert_eq!(q.get("limit").map(String::as_str), Some("5"));
                Json(vec![remote_job("remote-1")])
            }),
        );
        let peer = live_peer(router).await;
        let (tx, mut rx) = mpsc::channel(4);
        let client = client_for(tx);

        let params = BTreeMap::from([
            (PARAM_AGENT.to_string(), peer.to_string()),
            (PARAM_LIMIT.to_string(), "5".to_string()),
        ]);
        let message = execute(&client, 10, &params).await.unwrap();
        assert_eq!(message.as_deref(), Some(format!("1 jobs received from {peer}").as_str()));

        let queued = rx.recv().await.unwrap();
        assert!(queued.id.is_empty());
        assert!(queued.recipient.is_none());
        assert_eq!(queued.job_class, "download");
        assert_eq!(queued.parameters.get("url").map(String::as_str), Some("http://origin/x"));
    }

    #[tokio::test]
    async fn next_pull_acknowledges_jobs_taken_in() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new().route(
            NEW_JOBS_PATH,
            get({
                let seen = seen.clone();
                move |Query(q): Query<HashMap<String, String>>| async move {
                    let ack = q.get("ack").cloned().unwrap_or_default();
                    let first = ack.is_empty();
                    seen.lock().unwrap().push(ack);
                    Json(if first { vec![remote_job("r1"), remote_job("r2")] } else { Vec::new() })
                }
            }),
        );
        let peer = live_peer(router).await;
        let (tx, _rx) = mpsc::channel(4);
        let client = client_for(tx);
        let params = BTreeMap::from([(PARAM_AGENT.to_string(), peer.to_string())]);

        execute(&client, 10, &params).await.unwrap();
        execute(&client, 10, &params).await.unwrap();
        execute(&client, 10, &params).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), ["", "r1,r2", ""]);
    }

    #[tokio::test]
    async fn failed_pull_keeps_pending_acknowledgements() {
        let (tx, _rx) = mpsc::channel(4);
        let client = client_for(tx);
        let peer = AgentId::new("me", 21000);
        client.accept(&peer, vec![remote_job("r1")]).await.unwrap();

        let dead = crate::agent_manager::tests::dead_peer().await;
        assert!(client.fetch(&dead, 5).await.is_err());
        assert_eq!(client.acknowledgements(&peer), ["r1"]);
    }

    #[tokio::test]
    async fn closed_intake_acknowledges_only_jobs_taken_in() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let client = client_for(tx);
        let peer = AgentId::new("me", 21000);
        let err = client.accept(&peer, vec![remote_job("r1")]).await.unwrap_err();
        assert!(matches!(err, MeshError::Configuration(_)));
        assert!(client.acknowledgements(&peer).is_empty());
    }

    #[tokio::test]
    async fn missing_agent_is_validation_error() {
        let config = Arc::new(AgentConfig::default());
        let http = Arc::new(HttpClientProvider::new(&config).unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let client = GetJobsClient::new(config, http, tx);
        let err = execute(&client, 10, &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "agent is missing");
    }
}
