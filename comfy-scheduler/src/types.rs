//! Core domain types shared by the monitor, store, executor and API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// One of the media job families ComfyUI can be asked to render.
///
/// Serializes to the same tokens used in job filenames and YAML configs
/// (`T2I`, `T2V`, `SPEECH`, `AUDIO`, `3D`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    T2I,
    T2V,
    #[serde(rename = "SPEECH")]
    Speech,
    #[serde(rename = "AUDIO")]
    Audio,
    #[serde(rename = "3D")]
    ThreeD,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::T2I,
        JobType::T2V,
        JobType::Speech,
        JobType::Audio,
        JobType::ThreeD,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::T2I => "T2I",
            JobType::T2V => "T2V",
            JobType::Speech => "SPEECH",
            JobType::Audio => "AUDIO",
            JobType::ThreeD => "3D",
        }
    }

    /// Lowercase form of the literal type token, e.g. `t2i`.
    pub fn as_lowercase(&self) -> String {
        self.as_str().to_lowercase()
    }

    /// Legacy per-type subdirectory name the executor's fallback search
    /// checks first (`t2i` -> `image`, `t2v` -> `video`, others unchanged),
    /// a single conversion table replacing the source's `lower()`-then-map
    /// heuristic (Design Notes §9, "Dispatch over job_type").
    pub fn mapped_subdir(&self) -> &'static str {
        match self {
            JobType::T2I => "image",
            JobType::T2V => "video",
            JobType::Speech => "speech",
            JobType::Audio => "audio",
            JobType::ThreeD => "3d",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "T2I" => Ok(JobType::T2I),
            "T2V" => Ok(JobType::T2V),
            "SPEECH" => Ok(JobType::Speech),
            "AUDIO" => Ok(JobType::Audio),
            "3D" => Ok(JobType::ThreeD),
            _ => Err(()),
        }
    }
}

/// Lifecycle state of a job row in the store.
///
/// Four terminal/non-terminal states, matching the schema's `status` column
/// exactly — no fifth "cancelled" value (see the cancel-all design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Job priority, lower value runs sooner. Always clamped to `[MIN, MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(i32);

impl Priority {
    pub const MIN: i32 = 1;
    pub const MAX: i32 = 999;
    pub const DEFAULT: i32 = 50;

    pub fn new(value: i32) -> Self {
        Self(value.clamp(Self::MIN, Self::MAX))
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self::new(value)
    }
}

/// A workflow catalog entry: where its ComfyUI template JSON lives and
/// which input keys a job config must supply.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDef {
    pub template_path: String,
    #[serde(default)]
    pub required_inputs: Vec<String>,
}

pub type WorkflowCatalog = HashMap<String, WorkflowDef>;

/// `outputs:` block of a job YAML config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputsConfig {
    pub file_path: String,
}

/// Declarative job description, as authored in a processing-directory YAML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    pub job_type: String,
    pub workflow_id: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub retry_limit: Option<i64>,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub outputs: OutputsConfig,
}

/// Result of parsing a config filename into its four dash-free components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConfigName {
    pub job_type: String,
    pub timestamp: String,
    pub index: i64,
    pub jobname: String,
}

/// A fully materialized job row.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub config_name: String,
    pub job_type: String,
    pub workflow_id: String,
    pub priority: i32,
    pub status: JobStatus,
    pub run_count: i64,
    pub retries_attempted: i64,
    pub retry_limit: i64,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub duration: Option<f64>,
    pub error_trace: Option<String>,
    pub metadata: Option<String>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl JobRecord {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Done | JobStatus::Failed)
    }
}
