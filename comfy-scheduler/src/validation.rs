//! Filename parsing, job config schema validation and normalization.
//!
//! Behavior is ported from the Python agent's `utils/validation.py`: the
//! same four-part filename grammar, the same required-top-level-field set,
//! and the same `prompt` -> `*_text` special case for required-input checks.

use crate::types::{JobConfig, ParsedConfigName, WorkflowCatalog};
use thiserror::Error;

const VALID_JOB_TYPES: [&str; 5] = ["T2I", "T2V", "SPEECH", "AUDIO", "3D"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("filename must end in .yaml or .yml: {0}")]
    BadExtension(String),

    #[error("filename does not match <TYPE>_<timestamp>_<index>_<jobname> pattern: {0}")]
    BadFilenameShape(String),

    #[error("unknown job type '{0}', expected one of {VALID_JOB_TYPES:?}")]
    UnknownJobType(String),

    #[error("timestamp component '{0}' must be 14 digits or alphanumeric")]
    BadTimestamp(String),

    #[error("index component '{0}' is not an integer")]
    BadIndex(String),

    #[error("jobname component '{0}' must be alphanumeric/underscore")]
    BadJobname(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unknown workflow_id '{0}'")]
    UnknownWorkflow(String),

    #[error("missing required inputs: {0:?}")]
    MissingInputs(Vec<String>),

    #[error("priority {0} out of range [1, 999]")]
    PriorityOutOfRange(i32),
}

/// Parses `<TYPE>_<timestamp>_<index>_<jobname>.{yaml,yml}` into its parts.
pub fn parse_config_name(filename: &str) -> Result<ParsedConfigName, ValidationError> {
    let stem = if let Some(s) = filename.strip_suffix(".yaml") {
        s
    } else if let Some(s) = filename.strip_suffix(".yml") {
        s
    } else {
        return Err(ValidationError::BadExtension(filename.to_string()));
    };

    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 4 {
        return Err(ValidationError::BadFilenameShape(filename.to_string()));
    }

    let job_type = parts[0].to_string();
    if !VALID_JOB_TYPES.contains(&job_type.as_str()) {
        return Err(ValidationError::UnknownJobType(job_type));
    }

    let timestamp = parts[1].to_string();
    let is_14_digits = timestamp.len() == 14 && timestamp.chars().all(|c| c.is_ascii_digit());
    let is_alnum = !timestamp.is_empty() && timestamp.chars().all(|c| c.is_ascii_alphanumeric());
    if !is_14_digits && !is_alnum {
        return Err(ValidationError::BadTimestamp(timestamp));
    }

    let index: i64 = parts[2]
        .parse()
        .map_err(|_| ValidationError::BadIndex(parts[2].to_string()))?;

    let jobname = parts[3..].join("_");
    if jobname.is_empty() || !jobname.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::BadJobname(jobname));
    }

    Ok(ParsedConfigName {
        job_type,
        timestamp,
        index,
        jobname,
    })
}

/// Validates a parsed job config against the workflow catalog: required
/// top-level fields, a known `job_type`/`workflow_id`, the workflow's
/// `required_inputs`, the `outputs.file_path` field, and priority bounds.
pub fn validate_config_schema(
    cfg: &JobConfig,
    workflows: &WorkflowCatalog,
) -> Result<(), ValidationError> {
    if !VALID_JOB_TYPES.contains(&cfg.job_type.as_str()) {
        return Err(ValidationError::UnknownJobType(cfg.job_type.clone()));
    }

    let workflow = workflows
        .get(&cfg.workflow_id)
        .ok_or_else(|| ValidationError::UnknownWorkflow(cfg.workflow_id.clone()))?;

    let mut missing = Vec::new();
    for required in &workflow.required_inputs {
        let satisfied = if cfg.inputs.contains_key(required) {
            true
        } else if required == "prompt" {
            cfg.inputs.keys().any(|k| k.ends_with("_text"))
        } else {
            cfg.inputs.keys().any(|k| k.ends_with(&format!("_{required}")))
        };
        if !satisfied {
            missing.push(required.clone());
        }
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingInputs(missing));
    }

    if cfg.outputs.file_path.trim().is_empty() {
        return Err(ValidationError::MissingField("outputs.file_path"));
    }

    if let Some(priority) = cfg.priority {
        if !(crate::types::Priority::MIN..=crate::types::Priority::MAX).contains(&priority) {
            return Err(ValidationError::PriorityOutOfRange(priority));
        }
    }

    Ok(())
}

/// Defaults sourced from the global config, used to fill omitted fields.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeDefaults {
    pub default_priority: i32,
    pub retry_limit: i64,
}

/// Fills `priority`/`retry_limit` from defaults when absent and clamps
/// priority into `[1, 999]`.
pub fn normalize_config(mut cfg: JobConfig, defaults: NormalizeDefaults) -> JobConfig {
    let priority = cfg.priority.unwrap_or(defaults.default_priority);
    cfg.priority = Some(priority.clamp(crate::types::Priority::MIN, crate::types::Priority::MAX));
    cfg.retry_limit = Some(cfg.retry_limit.unwrap_or(defaults.retry_limit));
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_well_formed_filename() {
        let parsed = parse_config_name("T2I_20260101120000_001_cover_art.yaml").unwrap();
        assert_eq!(parsed.job_type, "T2I");
        assert_eq!(parsed.timestamp, "20260101120000");
        assert_eq!(parsed.index, 1);
        assert_eq!(parsed.jobname, "cover_art");
    }

    #[test]
    fn accepts_yml_extension() {
        assert!(parse_config_name("AUDIO_abc123_2_intro.yml").is_ok());
    }

    #[test]
    fn rejects_bad_extension() {
        assert_eq!(
            parse_config_name("T2I_20260101120000_001_cover.json"),
            Err(ValidationError::BadExtension(
                "T2I_20260101120000_001_cover.json".to_string()
            ))
        );
    }

    #[test]
    fn rejects_unknown_job_type() {
        assert!(matches!(
            parse_config_name("FOO_20260101120000_001_cover.yaml"),
            Err(ValidationError::UnknownJobType(_))
        ));
    }

    #[test]
    fn rejects_too_few_parts() {
        assert!(matches!(
            parse_config_name("T2I_001.yaml"),
            Err(ValidationError::BadFilenameShape(_))
        ));
    }

    #[test]
    fn accepts_13_digit_identifier_as_alphanumeric() {
        assert!(parse_config_name("T2I_2026010112000_001_cover.yaml").is_ok());
    }

    #[test]
    fn rejects_jobname_with_special_characters() {
        assert!(matches!(
            parse_config_name("T2I_20260101120000_001_cover-art!.yaml"),
            Err(ValidationError::BadJobname(_))
        ));
    }

    fn catalog() -> WorkflowCatalog {
        let mut m = HashMap::new();
        m.insert(
            "wf_portrait".to_string(),
            crate::types::WorkflowDef {
                template_path: "workflows/wf_portrait.json".to_string(),
                required_inputs: vec!["prompt".to_string(), "seed".to_string()],
            },
        );
        m
    }

    fn base_cfg() -> JobConfig {
        let mut inputs = serde_json::Map::new();
        inputs.insert("6_text".to_string(), serde_json::json!("a cat"));
        inputs.insert("node1_seed".to_string(), serde_json::json!(42));
        JobConfig {
            job_type: "T2I".to_string(),
            workflow_id: "wf_portrait".to_string(),
            priority: None,
            retry_limit: None,
            inputs,
            outputs: crate::types::OutputsConfig {
                file_path: "out/cover.png".to_string(),
            },
        }
    }

    #[test]
    fn validates_prompt_via_text_suffix() {
        let wf = catalog();
        assert!(validate_config_schema(&base_cfg(), &wf).is_ok());
    }

    #[test]
    fn rejects_missing_required_input() {
        let wf = catalog();
        let mut cfg = base_cfg();
        cfg.inputs.remove("node1_seed");
        let err = validate_config_schema(&cfg, &wf).unwrap_err();
        assert!(matches!(err, ValidationError::MissingInputs(_)));
    }

    #[test]
    fn normalize_fills_and_clamps_priority() {
        let mut cfg = base_cfg();
        cfg.priority = Some(5000);
        let normalized = normalize_config(
            cfg,
            NormalizeDefaults {
                default_priority: 50,
                retry_limit: 2,
            },
        );
        assert_eq!(normalized.priority, Some(999));
        assert_eq!(normalized.retry_limit, Some(2));
    }

    #[test]
    fn normalize_uses_defaults_when_absent() {
        let cfg = base_cfg();
        let normalized = normalize_config(
            cfg,
            NormalizeDefaults {
                default_priority: 77,
                retry_limit: 4,
            },
        );
        assert_eq!(normalized.priority, Some(77));
        assert_eq!(normalized.retry_limit, Some(4));
    }
}
