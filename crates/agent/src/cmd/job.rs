use std::collections::BTreeMap;

use common::{AgentId, JobClass, JobDetail};
use serde_json::json;

use super::LocalAgent;
use crate::config::AgentConfig;
use crate::jobs::{PARAM_LOCATION, PARAM_NOPROXY, PARAM_URL};

fn transfer_params(url: String, location: String, no_proxy: bool) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert(PARAM_URL.to_string(), url);
    params.insert(PARAM_LOCATION.to_string(), location);
    if no_proxy {
        params.insert(PARAM_NOPROXY.to_string(), "true".to_string());
    }
    params
}

async fn submit(
    config: &AgentConfig,
    class: JobClass,
    parameters: BTreeMap<String, String>,
    recipient: Option<AgentId>,
) -> anyhow::Result<()> {
    let agent = LocalAgent::new(config)?;
    let body = json!({
        "jobClass": class.as_str(),
        "parameters": parameters,
        "recipient": recipient,
    });
    let detail: JobDetail = agent.post_json("/jobs", &body).await?;
    match &detail.recipient {
        Some(to) => println!("{} queued for {}", detail.id, to),
        None => println!("{} submitted", detail.id),
    }
    Ok(())
}

pub async fn download(
    config: &AgentConfig,
    url: String,
    location: String,
    no_proxy: bool,
    to: Option<String>,
) -> anyhow::Result<()> {
    let recipient = to.map(|raw| raw.parse::<AgentId>()).transpose()?;
    submit(config, JobClass::Download, transfer_params(url, location, no_proxy), recipient).await
}

pub async fn upload(config: &AgentConfig, location: String, url: String, no_proxy: bool) -> anyhow::Result<()> {
    submit(config, JobClass::Upload, transfer_params(url, location, no_proxy), None).await
}

pub async fn job_status(config: &AgentConfig, id: String) -> anyhow::Result<()> {
    let agent = LocalAgent::new(config)?;
    let detail: JobDetail = agent.get(&format!("/jobs/{id}")).await?;
    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

pub async fn list_jobs(config: &AgentConfig, state: Option<String>, limit: usize) -> anyhow::Result<()> {
    let agent = LocalAgent::new(config)?;
    let mut path = format!("/jobs?limit={limit}");
    if let Some(state) = state {
        path.push_str(&format!("&state={state}"));
    }
    let jobs: Vec<JobDetail> = agent.get(&path).await?;
    if jobs.is_empty() {
        println!("no jobs");
    }
    for job in jobs {
        println!("{job}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noproxy_only_when_requested() {
        let params = transfer_params("http://o/x".into(), "x".into(), false);
        assert!(!params.contains_key(PARAM_NOPROXY));
        let params = transfer_params("http://o/x".into(), "x".into(), true);
        assert_eq!(params.get(PARAM_NOPROXY).map(String::as_str), Some("true"));
    }
}
