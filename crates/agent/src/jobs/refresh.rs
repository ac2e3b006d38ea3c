use crate::agent_manager::AgentManager;
use crate::error::Result;

pub(super) async fn execute(agents: &AgentManager) -> Result<Option<String>> {
    let report = agents.refresh().await;
    Ok(Some(format!("{} active, {} inactive", report.active, report.inactive)))
}
