pub mod job;
pub mod lookup;
pub mod ping;

pub use job::{download, job_status, list_jobs, upload};
pub use lookup::lookup;
pub use ping::ping;

use anyhow::{bail, Context};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::config::AgentConfig;

/// REST client for the agent running on this machine.
pub struct LocalAgent {
    base_url: String,
    client: Client,
    credentials: Option<(String, String)>,
}

impl LocalAgent {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .timeout(config.http_client_timeout().max(config.cdn_timeout()) * 2)
            .user_agent(config.user_agent.clone())
            .build()
            .context("build http client")?;
        let credentials = config.rest.is_secured().then(|| {
            (
                config.rest.login.clone().unwrap_or_default(),
                config.rest.password.clone().unwrap_or_default(),
            )
        });
        Ok(Self {
            base_url: config.base_url("127.0.0.1", config.agent_id().rest_port()),
            client,
            credentials,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.credentials {
            Some((login, password)) => req.basic_auth(login, Some(password)),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> anyhow::Result<T> {
        let response = req
            .send()
            .await
            .with_context(|| format!("agent at {} is not reachable", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("agent answered {status}: {text}");
        }
        response.json().await.context("parse agent response")
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    pub async fn post_json<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> anyhow::Result<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }
}
