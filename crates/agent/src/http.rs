use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use common::AgentId;
use reqwest::{Client, Method, RequestBuilder, Response};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{MeshError, Result};

/// Receives the configured roster after every membership refresh.
pub trait RosterListener: Send + Sync {
    fn roster_refreshed(&self, agents: &[AgentId]);
}

/// Shared HTTP executor for every peer-bound request: applies the proxy
/// policy and REST credentials for known mesh peers.
///
/// Clients carry a connect timeout and a per-read idle timeout, so a long
/// transfer lives as long as bytes keep flowing. Short control calls (ping,
/// lookup, job pulls) go through [`bounded`](Self::bounded), which adds a
/// deadline for the whole exchange.
pub struct HttpClientProvider {
    direct: Client,
    request_timeout: Duration,
    proxied: Option<Client>,
    bypass: Vec<String>,
    rest_credentials: Option<(String, String)>,
    // (host, rest port) pairs that receive REST credentials
    credential_scope: RwLock<HashSet<(String, u16)>>,
}

impl HttpClientProvider {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let timeout = config.http_client_timeout();
        let builder = || {
            Client::builder()
                .user_agent(config.user_agent.clone())
                .connect_timeout(timeout)
                .read_timeout(timeout)
        };

        let direct = builder()
            .no_proxy()
            .build()
            .map_err(|e| MeshError::Configuration(format!("http client: {e}")))?;

        let proxied = match config.proxy.host.as_deref().filter(|h| !h.is_empty()) {
            Some(host) => {
                let url = format!("http://{}:{}", host, config.proxy.port);
                let mut proxy = reqwest::Proxy::all(&url)
                    .map_err(|e| MeshError::Configuration(format!("proxy {url}: {e}")))?;
                if let Some(login) = config.proxy.login.as_deref().filter(|l| !l.is_empty()) {
                    proxy = proxy.basic_auth(login, config.proxy.password.as_deref().unwrap_or(""));
                }
                let client = builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| MeshError::Configuration(format!("http client: {e}")))?;
                Some(client)
            }
            None => None,
        };

        let rest_credentials = if config.rest.is_secured() {
            Some((
                config.rest.login.clone().unwrap_or_default(),
                config.rest.password.clone().unwrap_or_default(),
            ))
        } else {
            None
        };

        Ok(Self {
            direct,
            request_timeout: timeout,
            proxied,
            bypass: config.proxy.bypass.clone(),
            rest_credentials,
            credential_scope: RwLock::new(HashSet::new()),
        })
    }

    fn client_for(&self, host: &str, no_proxy: bool) -> &Client {
        match &self.proxied {
            Some(proxied) if !no_proxy && !bypass_proxy(&self.bypass, host) => proxied,
            _ => &self.direct,
        }
    }

    fn has_credentials_for(&self, host: &str, port: u16) -> bool {
        self.credential_scope
            .read()
            .map(|scope| scope.contains(&(host.to_string(), port)))
            .unwrap_or(false)
    }

    pub fn request(&self, method: Method, url: &str, no_proxy: bool) -> Result<RequestBuilder> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| MeshError::Validation(format!("invalid url {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| MeshError::Validation(format!("url without host: {url}")))?;
        let port = parsed.port_or_known_default().unwrap_or(80);

        let mut req = self.client_for(host, no_proxy).request(method, parsed.clone());
        if let Some((login, password)) = &self.rest_credentials {
            if self.has_credentials_for(host, port) {
                req = req.basic_auth(login, Some(password));
            }
        }
        Ok(req)
    }

    /// Like [`request`](Self::request), with a deadline covering connect
    /// through the last body byte.
    pub fn bounded(&self, method: Method, url: &str, no_proxy: bool) -> Result<RequestBuilder> {
        Ok(self.request(method, url, no_proxy)?.timeout(self.request_timeout))
    }

    /// Send without an overall deadline; only idle reads time out.
    pub async fn execute(&self, method: Method, url: &str, no_proxy: bool) -> Result<Response> {
        debug!(%method, %url, no_proxy, "http request");
        Ok(self.request(method, url, no_proxy)?.send().await?)
    }
}

impl RosterListener for HttpClientProvider {
    fn roster_refreshed(&self, agents: &[AgentId]) {
        let scope: HashSet<(String, u16)> = agents
            .iter()
            .map(|a| (a.host().to_string(), a.rest_port()))
            .collect();
        if let Ok(mut current) = self.credential_scope.write() {
            *current = scope;
        }
    }
}

/// Whether `host` matches any bypass pattern; `*` matches any run of characters.
pub fn bypass_proxy(patterns: &[String], host: &str) -> bool {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .any(|p| wildcard_match(&p.to_ascii_lowercase(), &host.to_ascii_lowercase()))
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let segments: Vec<&str> = parts.collect();
    let Some((last, middle)) = segments.split_last() else {
        // no wildcard at all
        return rest.is_empty();
    };
    for seg in middle {
        match rest.find(seg) {
            Some(pos) => rest = &rest[pos + seg.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
