use common::FileInfo;

use super::LocalAgent;
use crate::config::AgentConfig;

/// Ask the local agent which peers hold `key`.
pub async fn lookup(config: &AgentConfig, key: String) -> anyhow::Result<()> {
    let agent = LocalAgent::new(config)?;
    let found: Vec<FileInfo> = agent
        .get(&format!("/lookup/{}", key.trim_start_matches('/')))
        .await?;
    if found.is_empty() {
        println!("{key}: not found on any active agent");
    }
    for info in found {
        let holder = info.agent_id.map(|a| a.to_string()).unwrap_or_default();
        println!("{holder}\t{}\t{} bytes", info.location, info.length);
    }
    Ok(())
}
