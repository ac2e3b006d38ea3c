use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{AgentId, JobClass, JobDetail};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{PARAM_AGENT, PARAM_LIMIT};
use crate::agent_manager::AgentManager;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::job_manager::{JobManager, JobTicket};
use crate::metrics::Metrics;

/// Run `tick` every `period` until the task is aborted. A failed tick is
/// logged and counted; the next tick runs on schedule.
pub fn spawn_scheduler<F, Fut>(
    name: &'static str,
    period: Duration,
    metrics: Arc<Metrics>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(scheduler = name, period_ms = period.as_millis() as u64, "scheduler started");
        loop {
            ticker.tick().await;
            if let Err(e) = tick().await {
                Metrics::inc(&metrics.scheduler_errors_total);
                warn!(scheduler = name, error=%e, "scheduler tick failed");
            }
        }
    })
}

/// Each tick, ask every active peer for jobs addressed to us. A peer whose
/// previous request is still queued or running is skipped.
pub fn start_get_new_jobs(
    manager: Arc<JobManager>,
    agents: Arc<AgentManager>,
    config: &SchedulerConfig,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    let batch = config.get_new_jobs_batch_size;
    let in_flight: Arc<Mutex<HashMap<AgentId, JobTicket>>> = Arc::default();
    let period = Duration::from_millis(config.get_new_jobs_interval_ms);
    spawn_scheduler("get-new-jobs", period, metrics, move || {
        let manager = manager.clone();
        let agents = agents.clone();
        let in_flight = in_flight.clone();
        async move {
            for agent in agents.get_active() {
                if is_busy(&in_flight, &agent) {
                    debug!(agent=%agent, "previous get-new-jobs still pending");
                    continue;
                }
                let detail = JobDetail::new(JobClass::GetNewJobs, BTreeMap::new())
                    .with_param(PARAM_AGENT, agent.to_string())
                    .with_param(PARAM_LIMIT, batch.to_string());
                let ticket = manager.submit(detail).await?;
                if let Ok(mut map) = in_flight.lock() {
                    map.insert(agent, ticket);
                }
            }
            Ok(())
        }
    })
}

pub fn start_refresh_agents(
    manager: Arc<JobManager>,
    config: &SchedulerConfig,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    let last: Arc<Mutex<Option<JobTicket>>> = Arc::default();
    let period = Duration::from_millis(config.refresh_agents_interval_ms);
    spawn_scheduler("refresh-agents", period, metrics, move || {
        let manager = manager.clone();
        let last = last.clone();
        async move {
            let busy = last
                .lock()
                .map(|t| t.as_ref().is_some_and(|t| !t.is_finished()))
                .unwrap_or(false);
            if busy {
                debug!("previous refresh still pending");
                return Ok(());
            }
            let ticket = manager
                .submit(JobDetail::new(JobClass::RefreshAgents, BTreeMap::new()))
                .await?;
            if let Ok(mut slot) = last.lock() {
                *slot = Some(ticket);
            }
            Ok(())
        }
    })
}

fn is_busy(in_flight: &Mutex<HashMap<AgentId, JobTicket>>, agent: &AgentId) -> bool {
    in_flight
        .lock()
        .map(|map| map.get(agent).is_some_and(|t| !t.is_finished()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn failing_ticks_do_not_stop_the_timer() {
        let metrics = Arc::new(Metrics::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_scheduler("test", Duration::from_millis(10), metrics.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MeshError::Validation("peer unreachable".into()))
            }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        assert!(metrics.scheduler_errors_total.load(Ordering::Relaxed) >= 3);
    }

    #[tokio::test]
    async fn refresh_scheduler_submits_refresh_jobs() {
        let h = crate::job_manager::tests::harness();
        let config = SchedulerConfig { refresh_agents_interval_ms: 10, ..Default::default() };
        let handle = start_refresh_agents(h.manager.clone(), &config, Arc::new(Metrics::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let jobs = h.manager.list(None, 100).await;
        assert!(!jobs.is_empty());
        assert!(jobs.iter().all(|j| j.job_class == "refresh-agents"));
    }
}
