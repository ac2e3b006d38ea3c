mod download;
mod factory;
mod get_new_jobs;
mod refresh;
pub mod scheduler;
mod upload;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{JobClass, JobDetail};
use tracing::{debug, info, warn};

use crate::agent_manager::AgentManager;
use crate::error::{MeshError, Result};
use crate::job_manager::JobLedger;
use crate::storage::FileStore;

pub use download::DownloadClient;
pub use factory::JobFactory;
pub use get_new_jobs::GetJobsClient;
pub use upload::UploadClient;

pub const PARAM_URL: &str = "url";
pub const PARAM_LOCATION: &str = "location";
pub const PARAM_NOPROXY: &str = "noproxy";
pub const PARAM_AGENT: &str = "agent";
pub const PARAM_LIMIT: &str = "limit";

/// What a job runs, together with the collaborator it runs against.
pub(crate) enum JobTask {
    Download { client: Arc<DownloadClient>, store: FileStore },
    Upload { client: Arc<UploadClient>, store: FileStore },
    GetNewJobs { client: Arc<GetJobsClient>, default_limit: usize },
    RefreshAgents { agents: Arc<AgentManager> },
}

impl JobTask {
    /// Returns an optional completion message for the JobDetail.
    async fn execute(&self, params: &BTreeMap<String, String>) -> Result<Option<String>> {
        match self {
            JobTask::Download { client, store } => download::execute(client, store, params).await,
            JobTask::Upload { client, store } => upload::execute(client, store, params).await,
            JobTask::GetNewJobs { client, default_limit } => {
                get_new_jobs::execute(client, *default_limit, params).await
            }
            JobTask::RefreshAgents { agents } => refresh::execute(agents).await,
        }
    }
}

/// A JobDetail bound to the work it describes. Built by [`JobFactory`] and
/// consumed by a single run.
pub struct Job {
    detail: JobDetail,
    class: JobClass,
    task: JobTask,
}

/// Stamps the finish time however the run ends.
struct FinishGuard<'a>(&'a mut JobDetail);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.stamp_finish_time();
    }
}

impl Job {
    pub(crate) fn new(detail: JobDetail, class: JobClass, task: JobTask) -> Self {
        Self { detail, class, task }
    }

    /// Drive the job through RUNNING to FINISHED or FAILED, publishing each
    /// transition to `ledger`. Errors end up in the returned detail.
    pub async fn run(self, ledger: &JobLedger) -> JobDetail {
        let Job { mut detail, class, task } = self;
        if !detail.mark_running() {
            warn!(job=%detail.id, state=%detail.state, "job is not pending, not running it");
            return detail;
        }
        ledger.record(&detail).await;
        debug!(job=%detail.id, class=%class, "job started");

        {
            let guard = FinishGuard(&mut detail);
            let outcome = task.execute(&guard.0.parameters).await;
            match outcome {
                Ok(message) => {
                    guard.0.mark_finished();
                    guard.0.message = message;
                }
                Err(e) => {
                    guard.0.mark_failed(e.root_message());
                }
            }
        }

        if detail.error {
            warn!(job=%detail.id, class=%class, message=?detail.message, "job failed");
        } else {
            info!(job=%detail.id, class=%class, "job finished");
        }
        ledger.record(&detail).await;
        detail
    }
}

fn required<'a>(params: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MeshError::Validation(format!("{name} is missing")))
}

fn flag(params: &BTreeMap<String, String>, name: &str) -> bool {
    params.get(name).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}
