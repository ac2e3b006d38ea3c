use std::sync::Arc;

use common::{JobClass, JobDetail};

use super::{DownloadClient, GetJobsClient, Job, JobTask, UploadClient};
use crate::agent_manager::AgentManager;
use crate::error::Result;
use crate::storage::FileStore;

/// Turns a JobDetail into a runnable [`Job`] wired to its collaborator.
pub struct JobFactory {
    download: Arc<DownloadClient>,
    upload: Arc<UploadClient>,
    get_jobs: Arc<GetJobsClient>,
    agents: Arc<AgentManager>,
    store: FileStore,
    batch_size: usize,
}

impl JobFactory {
    pub fn new(
        download: Arc<DownloadClient>,
        upload: Arc<UploadClient>,
        get_jobs: Arc<GetJobsClient>,
        agents: Arc<AgentManager>,
        store: FileStore,
        batch_size: usize,
    ) -> Self {
        Self { download, upload, get_jobs, agents, store, batch_size }
    }

    /// Fails with `UnsupportedJobClass` for a tag outside [`JobClass::ALL`].
    pub fn create_job(&self, detail: JobDetail) -> Result<Job> {
        let class: JobClass = detail.job_class.parse()?;
        let task = match class {
            JobClass::Download => JobTask::Download {
                client: self.download.clone(),
                store: self.store.clone(),
            },
            JobClass::Upload => JobTask::Upload {
                client: self.upload.clone(),
                store: self.store.clone(),
            },
            JobClass::GetNewJobs => JobTask::GetNewJobs {
                client: self.get_jobs.clone(),
                default_limit: self.batch_size,
            },
            JobClass::RefreshAgents => JobTask::RefreshAgents { agents: self.agents.clone() },
        };
        Ok(Job::new(detail, class, task))
    }
}
