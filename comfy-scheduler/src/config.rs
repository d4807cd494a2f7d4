//! Global configuration loading: `.env` bootstrap, environment selection,
//! `${VAR}` / `${VAR:-default}` interpolation, and the workflow catalog.
//!
//! Ported from the Python agent's `utils/config_loader.py`. The `SCHED_ENV`
//! variable plays the role the original's `E3_ENV` did, since this crate
//! does not carry the audiobook-pipeline's environment naming.

use crate::types::WorkflowCatalog;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set; set {0}=alpha or {0}=prod")]
    MissingEnvSelector(&'static str),

    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("invalid YAML in {path}: {source}")]
    InvalidYaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("missing required section: {0}")]
    MissingSection(&'static str),

    #[error("missing required key '{key}' in section '{section}'")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },

    #[error("workflow '{workflow_id}' is missing required field '{field}'")]
    BadWorkflowEntry {
        workflow_id: String,
        field: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Flattened, backward-compatible view of `config/global_<env>.yaml`.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub default_priority: i32,
    pub retry_limit: i64,
    pub poll_interval_ms: u64,
    pub jobs_processing: String,
    pub jobs_finished: String,
    pub database_path: String,
    pub api_base_url: String,
    pub timeout_seconds: u64,
    /// The raw parsed document, for anything not hoisted above.
    pub full_config: Value,
}

/// Loads `.env` (without overwriting already-set variables), resolves
/// `SCHED_ENV`, loads `config/global_<env>.yaml`, interpolates `${VAR}`
/// references, and validates the required sections.
pub fn load_global_config() -> Result<GlobalConfig, ConfigError> {
    let _ = dotenvy::dotenv();

    let env = std::env::var("SCHED_ENV").map_err(|_| ConfigError::MissingEnvSelector("SCHED_ENV"))?;
    let config_path = format!("config/global_{env}.yaml");
    load_global_config_from(&config_path)
}

pub fn load_global_config_from(config_path: &str) -> Result<GlobalConfig, ConfigError> {
    if !Path::new(config_path).exists() {
        return Err(ConfigError::FileNotFound(config_path.to_string()));
    }

    let raw = std::fs::read_to_string(config_path)?;
    let mut value: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::InvalidYaml {
        path: config_path.to_string(),
        source,
    })?;
    interpolate_env_vars(&mut value);

    validate_and_transform(value)
}

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Recursively replaces `${VAR}` / `${VAR:-default}` in every string value.
/// An unset variable with no default is left as the literal `${VAR}` text,
/// matching the original's "return match.group(0) unchanged" fallback.
fn interpolate_env_vars(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                interpolate_env_vars(v);
            }
        }
        Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                interpolate_env_vars(v);
            }
        }
        Value::String(s) => {
            let replaced = ENV_VAR_PATTERN.replace_all(s, |caps: &regex::Captures| {
                let expr = &caps[1];
                if let Some((var_name, default_value)) = expr.split_once(":-") {
                    std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
                } else {
                    std::env::var(expr).unwrap_or_else(|_| caps[0].to_string())
                }
            });
            *s = replaced.into_owned();
        }
        _ => {}
    }
}

fn validate_and_transform(config: Value) -> Result<GlobalConfig, ConfigError> {
    for section in ["paths", "comfyui"] {
        if config.get(section).is_none() {
            return Err(ConfigError::MissingSection(section));
        }
    }

    let paths = config.get("paths").unwrap();
    let jobs_processing = paths.get("jobs_processing").ok_or(ConfigError::MissingKey {
        section: "paths",
        key: "jobs_processing",
    })?;
    let jobs_finished = paths.get("jobs_finished").ok_or(ConfigError::MissingKey {
        section: "paths",
        key: "jobs_finished",
    })?;
    let database = paths.get("database").ok_or(ConfigError::MissingKey {
        section: "paths",
        key: "database",
    })?;

    let comfyui = config.get("comfyui").unwrap();
    let api_base_url = comfyui.get("api_base_url").ok_or(ConfigError::MissingKey {
        section: "comfyui",
        key: "api_base_url",
    })?;

    Ok(GlobalConfig {
        default_priority: config
            .get("default_priority")
            .and_then(Value::as_i64)
            .unwrap_or(50) as i32,
        retry_limit: config.get("retry_limit").and_then(Value::as_i64).unwrap_or(2),
        poll_interval_ms: config
            .get("poll_interval_ms")
            .and_then(Value::as_u64)
            .unwrap_or(1000),
        jobs_processing: yaml_str(jobs_processing),
        jobs_finished: yaml_str(jobs_finished),
        database_path: yaml_str(database),
        api_base_url: yaml_str(api_base_url),
        timeout_seconds: comfyui
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(300),
        full_config: config,
    })
}

fn yaml_str(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

#[derive(Debug, Deserialize)]
struct RawWorkflowDef {
    template_path: Option<String>,
    required_inputs: Option<Value>,
}

/// Loads and validates the workflow catalog (workflow id -> template path +
/// required inputs). Mirrors `load_workflows` in the Python agent.
pub fn load_workflows(path: &str) -> Result<WorkflowCatalog, ConfigError> {
    if !Path::new(path).exists() {
        return Err(ConfigError::FileNotFound(path.to_string()));
    }
    let raw = std::fs::read_to_string(path)?;
    let parsed: HashMap<String, RawWorkflowDef> =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::InvalidYaml {
            path: path.to_string(),
            source,
        })?;

    let mut catalog = WorkflowCatalog::new();
    for (workflow_id, entry) in parsed {
        let template_path = entry.template_path.ok_or_else(|| ConfigError::BadWorkflowEntry {
            workflow_id: workflow_id.clone(),
            field: "template_path",
        })?;
        let required_inputs = match entry.required_inputs {
            Some(Value::Sequence(seq)) => seq
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(_) => {
                return Err(ConfigError::BadWorkflowEntry {
                    workflow_id,
                    field: "required_inputs",
                })
            }
            None => {
                return Err(ConfigError::BadWorkflowEntry {
                    workflow_id,
                    field: "required_inputs",
                })
            }
        };
        catalog.insert(
            workflow_id,
            crate::types::WorkflowDef {
                template_path,
                required_inputs,
            },
        );
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_default_when_var_unset() {
        std::env::remove_var("SCHED_TEST_UNSET_VAR");
        let mut value = Value::String("${SCHED_TEST_UNSET_VAR:-fallback}".to_string());
        interpolate_env_vars(&mut value);
        assert_eq!(value.as_str(), Some("fallback"));
    }

    #[test]
    fn leaves_unset_var_without_default_untouched() {
        std::env::remove_var("SCHED_TEST_UNSET_VAR_2");
        let mut value = Value::String("${SCHED_TEST_UNSET_VAR_2}".to_string());
        interpolate_env_vars(&mut value);
        assert_eq!(value.as_str(), Some("${SCHED_TEST_UNSET_VAR_2}"));
    }

    #[test]
    fn substitutes_set_variable() {
        std::env::set_var("SCHED_TEST_SET_VAR", "hello");
        let mut value = Value::String("${SCHED_TEST_SET_VAR}".to_string());
        interpolate_env_vars(&mut value);
        assert_eq!(value.as_str(), Some("hello"));
    }
}
