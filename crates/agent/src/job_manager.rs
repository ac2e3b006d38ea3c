use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{now_millis, AgentId, JobClass, JobDetail, JobState};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::jobs::JobFactory;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;

type JobId = String;

const LEDGER_FILE: &str = "jobs.json";
/// Finished and failed jobs kept for querying; older ones are pruned.
const RETAINED_TERMINAL_JOBS: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobLedgerState {
    pub jobs: HashMap<JobId, JobDetail>,
    /// Jobs waiting for another agent to pull them, FIFO per recipient.
    #[serde(default)]
    pub outbox: HashMap<String, VecDeque<JobId>>,
    /// Jobs handed to a recipient whose receipt it has not acknowledged yet.
    #[serde(default)]
    pub in_flight: HashMap<String, Vec<JobId>>,
    #[serde(skip)]
    revision: u64,
}

/// Every JobDetail this agent knows about, persisted to `jobs.json`.
///
/// Mutations copy the state under the lock and write the copy after
/// releasing it; writers queue on `written`, and a copy older than the last
/// one on disk is skipped.
pub struct JobLedger {
    state: Mutex<JobLedgerState>,
    data_dir: Option<PathBuf>,
    written: Mutex<u64>,
}

impl JobLedger {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            state: Mutex::new(JobLedgerState::default()),
            data_dir: Some(data_dir),
            written: Mutex::new(0),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(JobLedgerState::default()),
            data_dir: None,
            written: Mutex::new(0),
        }
    }

    /// Jobs that were mid-flight when the agent stopped are recorded as
    /// failed. Unacknowledged hand-overs go back to the front of their outbox.
    pub async fn load_from_disk(&self) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let state_file = dir.join(LEDGER_FILE);
        if !state_file.exists() {
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&state_file).await?;
        let mut loaded: JobLedgerState = serde_json::from_str(&content)?;

        for (recipient, ids) in std::mem::take(&mut loaded.in_flight) {
            let queue = loaded.outbox.entry(recipient).or_default();
            for id in ids.into_iter().rev() {
                queue.push_front(id);
            }
        }

        let parked: Vec<&JobId> = loaded.outbox.values().flatten().collect();
        let mut interrupted = Vec::new();
        for (id, job) in loaded.jobs.iter() {
            if !job.is_terminal() && !parked.contains(&id) {
                interrupted.push(id.clone());
            }
        }
        for id in &interrupted {
            if let Some(job) = loaded.jobs.get_mut(id) {
                job.mark_failed("interrupted by agent restart");
                job.stamp_finish_time();
            }
        }

        let mut state = self.state.lock().await;
        loaded.revision = state.revision;
        *state = loaded;
        info!(jobs = state.jobs.len(), interrupted = interrupted.len(), "loaded job ledger from disk");
        Ok(())
    }

    /// Copy of the state to persist, or `None` for an in-memory ledger.
    fn snapshot(&self, state: &mut JobLedgerState) -> Option<JobLedgerState> {
        self.data_dir.as_ref()?;
        state.revision += 1;
        Some(state.clone())
    }

    async fn persist(&self, snapshot: Option<JobLedgerState>) {
        let (Some(dir), Some(snapshot)) = (&self.data_dir, snapshot) else {
            return;
        };
        let mut written = self.written.lock().await;
        if snapshot.revision <= *written {
            return;
        }
        match save(dir, &snapshot).await {
            Ok(()) => *written = snapshot.revision,
            Err(e) => warn!(error=%e, "failed to save job ledger"),
        }
    }

    pub async fn record(&self, detail: &JobDetail) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.jobs.insert(detail.id.clone(), detail.clone());
            if detail.is_terminal() {
                prune_terminal(&mut state.jobs);
            }
            self.snapshot(&mut state)
        };
        self.persist(snapshot).await;
    }

    pub async fn get(&self, id: &str) -> Option<JobDetail> {
        self.state.lock().await.jobs.get(id).cloned()
    }

    /// Newest first, optionally restricted to one state.
    pub async fn list(&self, state_filter: Option<JobState>, limit: usize) -> Vec<JobDetail> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobDetail> = state
            .jobs
            .values()
            .filter(|job| state_filter.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.submit_time.cmp(&a.submit_time).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        jobs
    }

    /// Hold a job for its recipient instead of running it here.
    pub async fn park(&self, detail: &JobDetail, recipient: &AgentId) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.jobs.insert(detail.id.clone(), detail.clone());
            state
                .outbox
                .entry(recipient.to_string())
                .or_default()
                .push_back(detail.id.clone());
            self.snapshot(&mut state)
        };
        self.persist(snapshot).await;
    }

    /// Hand over up to `limit` parked jobs for `recipient`, oldest first.
    ///
    /// Jobs from the previous hand-over whose ids appear in `acknowledged`
    /// are closed as finished; the rest of that batch is handed over again
    /// ahead of newer jobs.
    pub async fn drain_outbox(&self, recipient: &AgentId, acknowledged: &[String], limit: usize) -> Vec<JobDetail> {
        let key = recipient.to_string();
        let (handed, snapshot) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let previous = state.in_flight.remove(&key).unwrap_or_default();
            let touched = !previous.is_empty();
            let (confirmed, unconfirmed): (Vec<JobId>, Vec<JobId>) =
                previous.into_iter().partition(|id| acknowledged.contains(id));

            for id in &confirmed {
                if let Some(job) = state.jobs.get_mut(id) {
                    job.mark_running();
                    job.mark_finished();
                    job.message = Some(format!("delivered to {recipient}"));
                    job.stamp_finish_time();
                }
            }
            if !unconfirmed.is_empty() {
                debug!(recipient=%recipient, count = unconfirmed.len(), "redelivering unacknowledged jobs");
            }

            let queue = state.outbox.entry(key.clone()).or_default();
            for id in unconfirmed.into_iter().rev() {
                queue.push_front(id);
            }
            let take = limit.min(queue.len());
            let ids: Vec<JobId> = queue.drain(..take).collect();
            if queue.is_empty() {
                state.outbox.remove(&key);
            }

            let handed: Vec<JobDetail> = ids.iter().filter_map(|id| state.jobs.get(id).cloned()).collect();
            if !ids.is_empty() {
                state.in_flight.insert(key, ids);
            }
            if !confirmed.is_empty() {
                prune_terminal(&mut state.jobs);
            }
            let snapshot = if touched || !handed.is_empty() {
                self.snapshot(state)
            } else {
                None
            };
            (handed, snapshot)
        };
        self.persist(snapshot).await;
        handed
    }

    #[cfg(test)]
    pub async fn outbox_len(&self, recipient: &AgentId) -> usize {
        self.state
            .lock()
            .await
            .outbox
            .get(&recipient.to_string())
            .map_or(0, VecDeque::len)
    }
}

async fn save(dir: &Path, state: &JobLedgerState) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let content = serde_json::to_string_pretty(state)?;
    let partial = dir.join(format!("{LEDGER_FILE}.tmp"));
    tokio::fs::write(&partial, content).await?;
    tokio::fs::rename(&partial, dir.join(LEDGER_FILE)).await?;
    Ok(())
}

fn prune_terminal(jobs: &mut HashMap<JobId, JobDetail>) {
    let mut terminal: Vec<(u64, JobId)> = jobs
        .values()
        .filter(|job| job.is_terminal())
        .map(|job| (job.finish_time.unwrap_or_default(), job.id.clone()))
        .collect();
    if terminal.len() <= RETAINED_TERMINAL_JOBS {
        return;
    }
    terminal.sort();
    let excess = terminal.len() - RETAINED_TERMINAL_JOBS;
    for (_, id) in terminal.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

/// Handle on one submission.
pub struct JobTicket {
    detail: JobDetail,
    handle: Option<JoinHandle<JobDetail>>,
}

impl JobTicket {
    /// The detail as submitted (id assigned, PENDING).
    pub fn detail(&self) -> &JobDetail {
        &self.detail
    }

    pub fn id(&self) -> &str {
        &self.detail.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the terminal detail. `None` for jobs parked for another agent.
    pub async fn wait(self) -> Option<JobDetail> {
        self.handle?.await.ok()
    }
}

struct Pools {
    download: WorkerPool,
    upload: WorkerPool,
    job: WorkerPool,
    ping: WorkerPool,
}

impl Pools {
    fn for_class(&self, class: JobClass) -> &WorkerPool {
        match class {
            JobClass::Download => &self.download,
            JobClass::Upload => &self.upload,
            JobClass::GetNewJobs => &self.job,
            JobClass::RefreshAgents => &self.ping,
        }
    }
}

/// Fail a job whose task panicked, keeping the start time of its RUNNING record.
async fn record_panic(ledger: &JobLedger, submitted: JobDetail) -> JobDetail {
    let mut detail = match ledger.get(&submitted.id).await {
        Some(current) if !current.is_terminal() => current,
        _ => submitted,
    };
    detail.mark_running();
    detail.mark_failed("job panicked");
    detail.stamp_finish_time();
    ledger.record(&detail).await;
    detail
}

/// Accepts job submissions and runs each on the pool of its class.
pub struct JobManager {
    ledger: Arc<JobLedger>,
    factory: JobFactory,
    pools: Pools,
    metrics: Arc<Metrics>,
}

impl JobManager {
    pub fn new(config: &AgentConfig, ledger: Arc<JobLedger>, factory: JobFactory, metrics: Arc<Metrics>) -> Self {
        let pools = Pools {
            download: WorkerPool::new("download", config.pools.download),
            upload: WorkerPool::new("upload", config.pools.upload),
            job: WorkerPool::new("job", config.pools.job),
            ping: WorkerPool::new("ping", config.pools.ping),
        };
        Self { ledger, factory, pools, metrics }
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    /// Record `detail` as a new PENDING job and start it on its pool, or park
    /// it when it is addressed to another agent. Returns without waiting.
    pub async fn submit(&self, detail: JobDetail) -> Result<JobTicket> {
        let class: JobClass = detail.job_class.parse()?;
        let mut fresh = detail.resubmission();
        fresh.recipient = detail.recipient;
        fresh.id = uuid::Uuid::new_v4().to_string();
        fresh.submit_time = now_millis();

        if let Some(recipient) = fresh.recipient.clone() {
            self.ledger.park(&fresh, &recipient).await;
            Metrics::inc(&self.metrics.jobs_submitted_total);
            info!(job=%fresh.id, class=%class, recipient=%recipient, "job parked for recipient");
            return Ok(JobTicket { detail: fresh, handle: None });
        }

        let job = self.factory.create_job(fresh.clone())?;
        self.ledger.record(&fresh).await;
        Metrics::inc(&self.metrics.jobs_submitted_total);

        let pool = self.pools.for_class(class);
        debug!(job=%fresh.id, class=%class, pool=pool.name(), idle=pool.idle(), "job submitted");
        let ledger = self.ledger.clone();
        let metrics = self.metrics.clone();
        let submitted = fresh.clone();
        let handle = pool.spawn(async move {
            let detail = match AssertUnwindSafe(job.run(&ledger)).catch_unwind().await {
                Ok(detail) => detail,
                Err(_) => {
                    warn!(job=%submitted.id, "job panicked");
                    record_panic(&ledger, submitted).await
                }
            };
            match detail.state {
                JobState::Finished => Metrics::inc(&metrics.jobs_finished_total),
                JobState::Failed => Metrics::inc(&metrics.jobs_failed_total),
                _ => {}
            }
            detail
        });
        Ok(JobTicket { detail: fresh, handle: Some(handle) })
    }

    pub async fn query(&self, id: &str) -> Option<JobDetail> {
        self.ledger.get(id).await
    }

    pub async fn list(&self, state_filter: Option<JobState>, limit: usize) -> Vec<JobDetail> {
        self.ledger.list(state_filter, limit).await
    }

    pub async fn take_outbox(&self, recipient: &AgentId, acknowledged: &[String], limit: usize) -> Vec<JobDetail> {
        let jobs = self.ledger.drain_outbox(recipient, acknowledged, limit).await;
        if !jobs.is_empty() {
            info!(recipient=%recipient, count = jobs.len(), "handed over parked jobs");
        }
        jobs
    }

    /// Submit every job that arrives on `intake` (jobs pulled from peers).
    pub fn spawn_intake(self: &Arc<Self>, mut intake: mpsc::Receiver<JobDetail>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(detail) = intake.recv().await {
                let class = detail.job_class.clone();
                if let Err(e) = manager.submit(detail).await {
                    warn!(class=%class, error=%e, "rejected job received from peer");
                }
            }
        })
    }
}
