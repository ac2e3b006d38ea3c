use std::sync::Arc;

use crate::config::AgentConfig;
use crate::http::HttpClientProvider;
use crate::ping::{PingInfoProvider, PingSender};

/// Ping `host:port` directly from this process.
pub async fn ping(config: AgentConfig, host: String, port: u16, no_proxy: bool) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let http = Arc::new(HttpClientProvider::new(&config)?);
    let sender = PingSender::new(config.clone(), http, PingInfoProvider::from_config(&config));
    let outcome = sender.ping_timed(&host, port, no_proxy).await;
    println!("{} in {} ms", outcome.status, outcome.elapsed.as_millis());
    if let Some(info) = outcome.info {
        println!("{}", serde_json::to_string_pretty(&info)?);
    }
    Ok(())
}
