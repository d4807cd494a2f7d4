//! Filesystem monitor: polls the processing directory for job configs and
//! ingests them into the store.
//!
//! Polling, not OS file-system events, mirrors the original agent's
//! `monitor.py`, which walks the directory tree on a timer rather than
//! subscribing to inotify. A `HashSet` of already-seen absolute paths
//! prevents re-ingesting a file on every tick; vanished paths are dropped
//! from the set so a file can be re-ingested if it reappears.

use crate::config::GlobalConfig;
use crate::store::{SqliteStore, UpsertInput};
use crate::types::{JobConfig, WorkflowCatalog};
use crate::validation::{normalize_config, parse_config_name, validate_config_schema, NormalizeDefaults};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ScanOutcome {
    Accepted { config_name: String, job_id: i64 },
    Rejected { path: PathBuf, reason: String },
}

/// Recursively collects `.yaml`/`.yml` files under `root`. Returns an empty
/// list if `root` doesn't exist, matching `list_yaml_under`'s behavior.
pub fn list_yaml_under(root: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, out);
            } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if ext == "yaml" || ext == "yml" {
                    if let Ok(abs) = path.canonicalize() {
                        out.push(abs);
                    } else {
                        out.push(path);
                    }
                }
            }
        }
    }

    if !root.exists() {
        return Vec::new();
    }
    let mut out = Vec::new();
    walk(root, &mut out);
    out
}

/// Validates, normalizes and upserts a single YAML job config.
pub async fn process_yaml_file(
    path: &Path,
    workflows: &WorkflowCatalog,
    store: &SqliteStore,
    defaults: NormalizeDefaults,
) -> ScanOutcome {
    let basename = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_string(),
        None => {
            return ScanOutcome::Rejected {
                path: path.to_path_buf(),
                reason: "path has no file name".to_string(),
            }
        }
    };

    let parsed = match parse_config_name(&basename) {
        Ok(p) => p,
        Err(e) => {
            return ScanOutcome::Rejected {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    };

    let raw = match tokio::fs::read_to_string(path).await {
        Ok(r) => r,
        Err(e) => {
            return ScanOutcome::Rejected {
                path: path.to_path_buf(),
                reason: format!("read error: {e}"),
            }
        }
    };

    let cfg: JobConfig = match serde_yaml::from_str(&raw) {
        Ok(c) => c,
        Err(e) => {
            return ScanOutcome::Rejected {
                path: path.to_path_buf(),
                reason: format!("invalid YAML: {e}"),
            }
        }
    };

    if let Err(e) = validate_config_schema(&cfg, workflows) {
        return ScanOutcome::Rejected {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
    }

    let cfg = normalize_config(cfg, defaults);

    let upsert = UpsertInput {
        config_name: basename.clone(),
        job_type: parsed.job_type,
        workflow_id: cfg.workflow_id,
        priority: cfg.priority.unwrap_or(defaults.default_priority),
        retry_limit: cfg.retry_limit.unwrap_or(defaults.retry_limit),
    };

    info!(config_name = %basename, "upserting job");
    match store.upsert(upsert).await {
        Ok(job) => ScanOutcome::Accepted {
            config_name: basename,
            job_id: job.id,
        },
        Err(e) => ScanOutcome::Rejected {
            path: path.to_path_buf(),
            reason: format!("store error: {e}"),
        },
    }
}

/// A single scan of the processing directory, independent of prior state.
pub async fn scan_once(
    store: &SqliteStore,
    workflows: &WorkflowCatalog,
    cfg: &GlobalConfig,
) -> Vec<ScanOutcome> {
    let processing_dir = Path::new(&cfg.jobs_processing);
    if !processing_dir.exists() {
        warn!(path = %cfg.jobs_processing, "processing directory does not exist");
        return Vec::new();
    }

    let defaults = NormalizeDefaults {
        default_priority: cfg.default_priority,
        retry_limit: cfg.retry_limit,
    };

    let mut results = Vec::new();
    for path in list_yaml_under(processing_dir) {
        let outcome = process_yaml_file(&path, workflows, store, defaults).await;
        results.push(outcome);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let accepted = results.iter().filter(|r| matches!(r, ScanOutcome::Accepted { .. })).count();
    let rejected = results.len() - accepted;
    if !results.is_empty() {
        info!(accepted, rejected, "scan complete");
    }
    results
}

/// Continuously polls the processing directory until `shutdown` fires.
pub async fn run_monitor_loop(
    store: SqliteStore,
    workflows: WorkflowCatalog,
    cfg: GlobalConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let poll_interval = Duration::from_millis(cfg.poll_interval_ms);
    info!(path = %cfg.jobs_processing, interval_ms = cfg.poll_interval_ms, "starting monitor loop");

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let defaults = NormalizeDefaults {
        default_priority: cfg.default_priority,
        retry_limit: cfg.retry_limit,
    };

    loop {
        if *shutdown.borrow() {
            break;
        }

        let processing_dir = Path::new(&cfg.jobs_processing);
        if processing_dir.exists() {
            let current: HashSet<PathBuf> = list_yaml_under(processing_dir).into_iter().collect();
            let new_files: Vec<&PathBuf> = current.difference(&seen).collect();

            if !new_files.is_empty() {
                info!(count = new_files.len(), "found new files");
                for path in new_files.clone() {
                    let outcome = process_yaml_file(path, &workflows, &store, defaults).await;
                    match &outcome {
                        ScanOutcome::Accepted { config_name, job_id } => {
                            debug!(config_name, job_id, "accepted");
                        }
                        ScanOutcome::Rejected { path, reason } => {
                            warn!(path = %path.display(), reason, "rejected");
                        }
                    }
                    seen.insert(path.clone());
                }
            }

            seen = seen.intersection(&current).cloned().collect();
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

    info!("monitor loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn workflows() -> WorkflowCatalog {
        let mut m = HashMap::new();
        m.insert(
            "wf_portrait".to_string(),
            crate::types::WorkflowDef {
                template_path: "workflows/wf_portrait.json".to_string(),
                required_inputs: vec!["prompt".to_string()],
            },
        );
        m
    }

    #[tokio::test]
    async fn accepts_well_formed_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("T2I_20260101120000_001_job.yaml");
        std::fs::write(
            &path,
            r#"
job_type: T2I
workflow_id: wf_portrait
inputs:
  6_text: "a cat"
outputs:
  file_path: out/cover.png
"#,
        )
        .unwrap();

        let store = SqliteStore::connect_memory().await.unwrap();
        let defaults = NormalizeDefaults {
            default_priority: 50,
            retry_limit: 2,
        };
        let outcome = process_yaml_file(&path, &workflows(), &store, defaults).await;
        assert!(matches!(outcome, ScanOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn rejects_bad_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-valid-name.yaml");
        std::fs::write(&path, "job_type: T2I").unwrap();

        let store = SqliteStore::connect_memory().await.unwrap();
        let defaults = NormalizeDefaults {
            default_priority: 50,
            retry_limit: 2,
        };
        let outcome = process_yaml_file(&path, &workflows(), &store, defaults).await;
        assert!(matches!(outcome, ScanOutcome::Rejected { .. }));
    }

    #[test]
    fn list_yaml_under_missing_root_is_empty() {
        assert!(list_yaml_under(Path::new("/nonexistent/does-not-exist")).is_empty());
    }
}
