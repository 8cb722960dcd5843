use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// toolchain operation a job performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Compile,
    Ota,
    Logs,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Compile => "compile",
            JobAction::Ota => "ota",
            JobAction::Logs => "logs",
        }
    }

    /// ota and logs talk to a device, compile does not
    pub fn needs_device(&self) -> bool {
        matches!(self, JobAction::Ota | JobAction::Logs)
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action: {:?}", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for JobAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compile" => Ok(JobAction::Compile),
            "ota" => Ok(JobAction::Ota),
            "logs" => Ok(JobAction::Logs),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Canceled
        )
    }
}

/// Lifecycle record of a single job, as persisted in `<id>.json` and
/// returned by every job endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_summary: String,
    pub yaml: String,
    pub action: JobAction,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub clean: bool,
}

impl JobRecord {
    pub fn new(id: &str, yaml: &str, action: JobAction, device: &str, clean: bool) -> Self {
        Self {
            id: id.to_string(),
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            error_summary: String::new(),
            yaml: yaml.to_string(),
            action,
            device: device.to_string(),
            clean,
        }
    }
}

/// body of a submit request
/// fields stay raw strings so validation can report which one is wrong
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub yaml: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub clean: bool,
}

impl JobRequest {
    pub fn new(yaml: &str, action: JobAction, device: &str, clean: bool) -> Self {
        Self {
            yaml: yaml.to_string(),
            action: action.to_string(),
            device: device.to_string(),
            clean,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub job: JobRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub job: JobRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobRecord>,
}

/// Answer to a tail or tail-wait poll. `next_seq` is the value to pass as
/// `since` on the following request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailResponse {
    pub job: JobRecord,
    pub lines: Vec<String>,
    pub next_seq: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub ts: DateTime<Utc>,
}
