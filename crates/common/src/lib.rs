use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Offset of the REST service port from an agent's base port.
pub const REST_PORT_OFFSET: u16 = 443;
/// Offset of the plain HTTP file/CDN port from an agent's base port.
pub const CDN_PORT_OFFSET: u16 = 80;

pub const PING_PATH: &str = "/ping";
pub const FILE_INFO_PATH: &str = "/fileinfo";
pub const NEW_JOBS_PATH: &str = "/jobs/new";
pub const WHAT_IS_MY_IP_PATH: &str = "/whatismyip";

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid agent id {0:?}, expected host:port")]
    AgentId(String),
    #[error("{0} is not supported")]
    JobClass(String),
    #[error("unknown job state {0:?}")]
    JobState(String),
}

// ===================== Agent identity =====================

/// Identity of one agent in the mesh. Every other port the agent listens on
/// is derived from `base_port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    host: String,
    base_port: u16,
}

impl AgentId {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self { host: host.into(), base_port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn rest_port(&self) -> u16 {
        self.base_port.saturating_add(REST_PORT_OFFSET)
    }

    pub fn cdn_port(&self) -> u16 {
        self.base_port.saturating_add(CDN_PORT_OFFSET)
    }

    /// Same agent as seen through a different host name (the one actually dialed).
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self { host: host.into(), base_port: self.base_port }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.base_port)
    }
}

impl FromStr for AgentId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseError::AgentId(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseError::AgentId(s.to_string()));
        }
        let base_port = port
            .parse::<u16>()
            .map_err(|_| ParseError::AgentId(s.to_string()))?;
        Ok(Self::new(host, base_port))
    }
}

impl TryFrom<String> for AgentId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.to_string()
    }
}

// ===================== Ping =====================

/// Self-reported liveness snapshot exchanged by the ping protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingInfo {
    pub agent_id: AgentId,
    pub time: u64,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_space: Option<u64>,
}

impl PingInfo {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            time: now_millis(),
            version: String::new(),
            free_space: None,
        }
    }
}

/// Caller-side outcome of one ping attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingStatus {
    pub error: bool,
    pub message: String,
    pub time: u64,
}

impl fmt::Display for PingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error {
            write!(f, "ERROR {}", self.message)
        } else {
            write!(f, "OK")
        }
    }
}

// ===================== Files =====================

/// "This agent holds this resource": answer to a file-info lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub last_modified: u64,
}

// ===================== Jobs =====================

/// The closed set of job classes an agent knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobClass {
    Download,
    Upload,
    GetNewJobs,
    RefreshAgents,
}

impl JobClass {
    pub const ALL: [JobClass; 4] = [
        JobClass::Download,
        JobClass::Upload,
        JobClass::GetNewJobs,
        JobClass::RefreshAgents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::Download => "download",
            JobClass::Upload => "upload",
            JobClass::GetNewJobs => "get-new-jobs",
            JobClass::RefreshAgents => "refresh-agents",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ParseError::JobClass(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for JobState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "FINISHED" => Ok(JobState::Finished),
            "FAILED" => Ok(JobState::Failed),
            _ => Err(ParseError::JobState(s.to_string())),
        }
    }
}

/// Durable record of one job submission and its outcome.
///
/// The job class travels as a plain tag so that a peer running a newer
/// protocol can hand us a class we do not know; the factory rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    #[serde(default)]
    pub id: String,
    pub job_class: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default = "default_state")]
    pub state: JobState,
    #[serde(default)]
    pub submit_time: u64,
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub finish_time: Option<u64>,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// Peer this job is addressed to. Such jobs wait in the outbox until pulled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<AgentId>,
}

fn default_state() -> JobState {
    JobState::Pending
}

impl JobDetail {
    pub fn new(job_class: JobClass, parameters: BTreeMap<String, String>) -> Self {
        Self::with_class_tag(job_class.as_str(), parameters)
    }

    pub fn with_class_tag(tag: impl Into<String>, parameters: BTreeMap<String, String>) -> Self {
        Self {
            id: String::new(),
            job_class: tag.into(),
            parameters,
            state: JobState::Pending,
            submit_time: 0,
            start_time: None,
            finish_time: None,
            error: false,
            message: None,
            recipient: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn addressed_to(mut self, recipient: AgentId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Fresh PENDING copy carrying only the class and parameters.
    pub fn resubmission(&self) -> Self {
        Self::with_class_tag(self.job_class.clone(), self.parameters.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// PENDING -> RUNNING. Returns false when the job already left PENDING.
    pub fn mark_running(&mut self) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        self.state = JobState::Running;
        self.start_time = Some(now_millis());
        true
    }

    pub fn mark_finished(&mut self) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        self.state = JobState::Finished;
        true
    }

    /// Any non-terminal state -> FAILED with the error flag and message set.
    pub fn mark_failed(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Failed;
        self.error = true;
        self.message = Some(message.into());
        true
    }

    pub fn stamp_finish_time(&mut self) {
        let now = now_millis();
        let floor = self.start_time.unwrap_or(now);
        self.finish_time = Some(now.max(floor));
    }
}

impl fmt::Display for JobDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.id, self.job_class, self.state)?;
        if let Some(msg) = &self.message {
            write!(f, " ({msg})")?;
        }
        Ok(())
    }
}

pub fn serialize_message<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

pub fn deserialize_message<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}
