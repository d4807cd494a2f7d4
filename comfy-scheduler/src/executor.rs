//! Executes leased jobs: locates the config file, binds its inputs into
//! the workflow template, drives ComfyUI, persists outputs and files the
//! config away under the finished directory.
//!
//! Orchestration mirrors `executor.py`'s `execute_job`: the search order
//! for the config file (processing root, a type subdirectory inside it,
//! the raw-uppercase-type subdirectory, then the finished root as a retry
//! fallback), the output-writing scheme, and the move-to-finished step are
//! all ported as-is.

pub mod binding;
pub mod client;

use crate::config::GlobalConfig;
use crate::executor::binding::{build_payload, BindingError};
use crate::executor::client::{ComfyError, ComfyUiClient};
use crate::fs_util::safe_move;
use crate::store::{JobOutcome, SqliteStore, StoreResult};
use crate::types::{JobConfig, JobRecord, JobType, WorkflowCatalog};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Lease duration granted to a worker for one job. Not exposed in the
/// global config schema (spec.md's Global Configuration section has no
/// such field); hardcoded to match `executor.py`'s own hardcoded value.
const DEFAULT_LEASE_SECONDS: i64 = 300;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("config file for '{0}' not found in any searched location")]
    ConfigNotFound(String),

    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown workflow_id '{0}'")]
    UnknownWorkflow(String),

    #[error("failed to read workflow template {path}: {source}")]
    ReadTemplate {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in workflow template {path}: {source}")]
    ParseTemplate {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("input binding failed: {0}")]
    Binding(#[from] BindingError),

    #[error("ComfyUI request failed: {0}")]
    Comfy(#[from] ComfyError),

    #[error("failed to write output to {path}: {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to move config file to finished directory: {0}")]
    MoveFailed(std::io::Error),

    #[error("unknown job_type '{0}' on leased job")]
    UnknownJobType(String),
}

/// Leases and runs jobs one at a time against a single `SqliteStore` and
/// ComfyUI instance.
pub struct JobExecutor {
    store: SqliteStore,
    workflows: WorkflowCatalog,
    cfg: GlobalConfig,
    client: ComfyUiClient,
    worker_id: String,
}

impl JobExecutor {
    pub fn new(store: SqliteStore, workflows: WorkflowCatalog, cfg: GlobalConfig, worker_id: impl Into<String>) -> Self {
        let client = ComfyUiClient::new(cfg.api_base_url.clone());
        Self {
            store,
            workflows,
            cfg,
            client,
            worker_id: worker_id.into(),
        }
    }

    /// Recovers any orphaned leases, then leases and runs at most one job.
    /// Returns `true` if a job was found and processed (regardless of
    /// whether it succeeded), `false` if the queue was empty.
    pub async fn run_once(&self) -> StoreResult<bool> {
        self.store.recover_orphans(chrono::Utc::now()).await?;

        let Some(job) = self.store.lease_next(&self.worker_id, DEFAULT_LEASE_SECONDS).await? else {
            return Ok(false);
        };

        info!(config_name = %job.config_name, job_id = job.id, "leased job");
        match self.execute(&job).await {
            Ok(metadata) => {
                self.store
                    .complete(job.id, JobOutcome::Success { metadata: Some(metadata) })
                    .await?;
                info!(config_name = %job.config_name, "job completed");
            }
            Err(e) => {
                error!(config_name = %job.config_name, error = %e, "job failed");
                self.store
                    .complete(job.id, JobOutcome::Failure { error_trace: e.to_string() })
                    .await?;
            }
        }

        Ok(true)
    }

    /// Polls for work until `shutdown` fires, sleeping `poll_interval_ms`
    /// between empty leases so an idle executor doesn't spin.
    pub async fn run_loop(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.cfg.poll_interval_ms);
        info!("starting executor loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let found = match self.run_once().await {
                Ok(found) => found,
                Err(e) => {
                    error!(error = %e, "executor tick failed");
                    false
                }
            };

            if found {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("executor loop stopped");
    }

    /// Runs a single leased job end to end and returns its output metadata
    /// JSON on success.
    async fn execute(&self, job: &JobRecord) -> Result<String, ExecutionError> {
        let job_type = JobType::from_str(&job.job_type)
            .map_err(|_| ExecutionError::UnknownJobType(job.job_type.clone()))?;

        let (config_path, from_finished) = self.locate_config_file(&job.config_name, job_type)?;
        let raw = std::fs::read_to_string(&config_path).map_err(|source| ExecutionError::ReadConfig {
            path: config_path.clone(),
            source,
        })?;
        let cfg: JobConfig = serde_yaml::from_str(&raw).map_err(|source| ExecutionError::ParseConfig {
            path: config_path.clone(),
            source,
        })?;

        let workflow = self
            .workflows
            .get(&cfg.workflow_id)
            .ok_or_else(|| ExecutionError::UnknownWorkflow(cfg.workflow_id.clone()))?;

        let template_raw = std::fs::read_to_string(&workflow.template_path).map_err(|source| {
            ExecutionError::ReadTemplate {
                path: workflow.template_path.clone(),
                source,
            }
        })?;
        let template: serde_json::Value =
            serde_json::from_str(&template_raw).map_err(|source| ExecutionError::ParseTemplate {
                path: workflow.template_path.clone(),
                source,
            })?;

        let mut inputs = cfg.inputs.clone();
        inputs.insert(
            "outputs".to_string(),
            serde_json::to_value(&cfg.outputs).unwrap_or(serde_json::Value::Null),
        );

        let prompt = build_payload(&template, &inputs)?;

        let timeout = Duration::from_secs(self.cfg.timeout_seconds);
        let prompt_id = self.client.queue_prompt(&prompt, timeout).await?;
        let result = self.client.wait_for_completion(&prompt_id, timeout).await?;

        let metadata = self.persist_outputs(&cfg.outputs.file_path, &result.outputs)?;

        if !from_finished {
            self.move_to_finished(&config_path, &job.config_name, job_type)?;
        }

        Ok(metadata)
    }

    /// Searches the locations `executor.py` checks, in order: directly
    /// under the processing root, under a mapped type subdirectory of the
    /// processing root, under the raw-uppercase-type subdirectory, and
    /// finally under the finished root's mapped subdirectory (a retry of
    /// an already-completed job). The boolean return indicates whether the
    /// file was found already sitting in the finished tree.
    fn locate_config_file(
        &self,
        config_name: &str,
        job_type: JobType,
    ) -> Result<(PathBuf, bool), ExecutionError> {
        let processing_root = Path::new(&self.cfg.jobs_processing);
        let finished_root = Path::new(&self.cfg.jobs_finished);

        let candidates = [
            processing_root.join(config_name),
            processing_root.join(job_type.mapped_subdir()).join(config_name),
            processing_root.join(job_type.as_str()).join(config_name),
        ];
        for candidate in candidates {
            if candidate.is_file() {
                return Ok((candidate, false));
            }
        }

        let finished_candidate = finished_root.join(job_type.mapped_subdir()).join(config_name);
        if finished_candidate.is_file() {
            return Ok((finished_candidate, true));
        }

        Err(ExecutionError::ConfigNotFound(config_name.to_string()))
    }

    /// Writes each WebSocket-delivered output under `file_path`'s directory:
    /// the first under `file_path`'s own name, subsequent ones suffixed
    /// `_1`, `_2`, ... on the file stem. Returns a JSON summary as the
    /// job's stored metadata.
    fn persist_outputs(&self, file_path: &str, outputs: &[Vec<u8>]) -> Result<String, ExecutionError> {
        let dest = Path::new(file_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ExecutionError::WriteOutput {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let stem = dest.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
        let ext = dest.extension().and_then(|s| s.to_str()).unwrap_or("bin");

        let mut saved = Vec::with_capacity(outputs.len());
        let mut total_bytes = 0usize;
        for (i, bytes) in outputs.iter().enumerate() {
            let path = if i == 0 {
                dest.to_path_buf()
            } else {
                dest.with_file_name(format!("{stem}_{i}.{ext}"))
            };
            std::fs::write(&path, bytes).map_err(|source| ExecutionError::WriteOutput {
                path: path.clone(),
                source,
            })?;
            total_bytes += bytes.len();
            saved.push(path.display().to_string());
        }

        if saved.is_empty() {
            warn!(file_path, "job completed with no binary outputs");
        }

        Ok(serde_json::json!({
            "saved": saved,
            "bytes": total_bytes,
            "count": saved.len(),
        })
        .to_string())
    }

    /// Mirrors `config_path`'s position under the processing root into the
    /// finished root's matching type subdirectory, then moves it there.
    fn move_to_finished(
        &self,
        config_path: &Path,
        config_name: &str,
        job_type: JobType,
    ) -> Result<(), ExecutionError> {
        let dest = Path::new(&self.cfg.jobs_finished)
            .join(job_type.mapped_subdir())
            .join(config_name);
        safe_move(config_path, &dest).map_err(ExecutionError::MoveFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UpsertInput;

    fn test_cfg(processing: &str, finished: &str) -> GlobalConfig {
        GlobalConfig {
            default_priority: 50,
            retry_limit: 2,
            poll_interval_ms: 50,
            jobs_processing: processing.to_string(),
            jobs_finished: finished.to_string(),
            database_path: ":memory:".to_string(),
            api_base_url: "http://127.0.0.1:0".to_string(),
            timeout_seconds: 30,
            full_config: serde_yaml::Value::Null,
        }
    }

    #[tokio::test]
    async fn locate_config_file_finds_file_directly_under_processing_root() {
        let dir = tempfile::tempdir().unwrap();
        let finished = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("T2I_1_1_job.yaml"), "x").unwrap();

        let store = SqliteStore::connect_memory().await.unwrap();
        let executor = JobExecutor::new(
            store,
            WorkflowCatalog::new(),
            test_cfg(dir.path().to_str().unwrap(), finished.path().to_str().unwrap()),
            "worker-1",
        );

        let (path, from_finished) = executor
            .locate_config_file("T2I_1_1_job.yaml", JobType::T2I)
            .unwrap();
        assert_eq!(path, dir.path().join("T2I_1_1_job.yaml"));
        assert!(!from_finished);
    }

    #[tokio::test]
    async fn locate_config_file_falls_back_to_finished_tree() {
        let dir = tempfile::tempdir().unwrap();
        let finished = tempfile::tempdir().unwrap();
        let finished_sub = finished.path().join("image");
        std::fs::create_dir_all(&finished_sub).unwrap();
        std::fs::write(finished_sub.join("T2I_1_1_job.yaml"), "x").unwrap();

        let store = SqliteStore::connect_memory().await.unwrap();
        let executor = JobExecutor::new(
            store,
            WorkflowCatalog::new(),
            test_cfg(dir.path().to_str().unwrap(), finished.path().to_str().unwrap()),
            "worker-1",
        );

        let (path, from_finished) = executor
            .locate_config_file("T2I_1_1_job.yaml", JobType::T2I)
            .unwrap();
        assert_eq!(path, finished_sub.join("T2I_1_1_job.yaml"));
        assert!(from_finished);
    }

    #[tokio::test]
    async fn locate_config_file_errors_when_nowhere_found() {
        let dir = tempfile::tempdir().unwrap();
        let finished = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect_memory().await.unwrap();
        let executor = JobExecutor::new(
            store,
            WorkflowCatalog::new(),
            test_cfg(dir.path().to_str().unwrap(), finished.path().to_str().unwrap()),
            "worker-1",
        );

        let result = executor.locate_config_file("T2I_1_1_missing.yaml", JobType::T2I);
        assert!(matches!(result, Err(ExecutionError::ConfigNotFound(_))));
    }

    #[tokio::test]
    async fn persist_outputs_writes_first_then_suffixes_rest() {
        let dir = tempfile::tempdir().unwrap();
        let finished = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect_memory().await.unwrap();
        let executor = JobExecutor::new(
            store,
            WorkflowCatalog::new(),
            test_cfg(dir.path().to_str().unwrap(), finished.path().to_str().unwrap()),
            "worker-1",
        );

        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let file_path = out_dir.join("cover.png");

        let metadata = executor
            .persist_outputs(file_path.to_str().unwrap(), &[vec![1, 2, 3], vec![4, 5]])
            .unwrap();

        assert!(file_path.exists());
        assert!(out_dir.join("cover_1.png").exists());
        let parsed: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(parsed["count"], 2);
        assert_eq!(parsed["bytes"], 5);
    }

    #[tokio::test]
    async fn run_once_returns_false_when_queue_empty() {
        let dir = tempfile::tempdir().unwrap();
        let finished = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect_memory().await.unwrap();
        let executor = JobExecutor::new(
            store,
            WorkflowCatalog::new(),
            test_cfg(dir.path().to_str().unwrap(), finished.path().to_str().unwrap()),
            "worker-1",
        );
        assert!(!executor.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn run_once_fails_job_when_config_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let finished = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect_memory().await.unwrap();
        store
            .upsert(UpsertInput {
                config_name: "T2I_1_1_missing.yaml".to_string(),
                job_type: "T2I".to_string(),
                workflow_id: "wf_portrait".to_string(),
                priority: 50,
                retry_limit: 2,
            })
            .await
            .unwrap();

        let executor = JobExecutor::new(
            store.clone(),
            WorkflowCatalog::new(),
            test_cfg(dir.path().to_str().unwrap(), finished.path().to_str().unwrap()),
            "worker-1",
        );

        assert!(executor.run_once().await.unwrap());
        let job = store
            .get_by_config_name("T2I_1_1_missing.yaml")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, crate::types::JobStatus::Pending);
        assert_eq!(job.retries_attempted, 1);
    }
}
