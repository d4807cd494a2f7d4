//! Input binding: writes a job's declared inputs into the right nodes of a
//! loaded ComfyUI workflow template.
//!
//! Ported from `executor.py`'s `build_payload`, with one deliberate fix:
//! the original's `SaveImage`/`filename_prefix` branch sits inside a dead
//! `if "inputs" not in node: continue` block and is unreachable, a known
//! bug in the source agent. This crate applies that logic for real.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("workflow template is not a JSON object")]
    NotAnObject,
}

/// Binds `inputs` into `template` (a ComfyUI node graph: `{node_id: {class_type, inputs}}`)
/// and returns the resulting prompt payload.
///
/// For each input key other than `outputs` and anything prefixed `job_`:
/// a key containing an underscore is split on the first `_` into
/// `(node_id, param)`; if that node exists and has an `inputs` object, the
/// value is written into `inputs[param]`.
///
/// Separately, any `SaveImage`-class node has its `filename_prefix` set to
/// the file stem of `inputs.outputs.file_path`, when that key is present.
pub fn build_payload(template: &Value, inputs: &Map<String, Value>) -> Result<Value, BindingError> {
    let mut workflow = template.clone();
    let nodes = workflow.as_object_mut().ok_or(BindingError::NotAnObject)?;

    for (key, value) in inputs {
        if key == "outputs" || key.starts_with("job_") {
            continue;
        }
        let Some((node_id, param)) = key.split_once('_') else {
            continue;
        };
        let Some(node) = nodes.get_mut(node_id) else {
            continue;
        };
        let Some(node_inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        if node_inputs.contains_key(param) {
            node_inputs.insert(param.to_string(), value.clone());
            debug!(node_id, param, "bound input");
        } else {
            warn!(node_id, param, "param not found on node, skipping");
        }
    }

    if let Some(file_path) = inputs
        .get("outputs")
        .and_then(Value::as_object)
        .and_then(|o| o.get("file_path"))
        .and_then(Value::as_str)
    {
        let stem = std::path::Path::new(file_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_path)
            .to_string();

        for (_node_id, node) in nodes.iter_mut() {
            let is_save_image = node.get("class_type").and_then(Value::as_str) == Some("SaveImage");
            if !is_save_image {
                continue;
            }
            if let Some(node_inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
                node_inputs.insert("filename_prefix".to_string(), Value::String(stem.clone()));
            }
        }
    }

    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> Value {
        json!({
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
            "7": { "class_type": "KSamplerSeed", "inputs": { "seed": 0 } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "ComfyUI" } }
        })
    }

    #[test]
    fn binds_node_qualified_inputs() {
        let mut inputs = Map::new();
        inputs.insert("6_text".to_string(), json!("a cat"));
        inputs.insert("7_seed".to_string(), json!(42));

        let result = build_payload(&template(), &inputs).unwrap();
        assert_eq!(result["6"]["inputs"]["text"], json!("a cat"));
        assert_eq!(result["7"]["inputs"]["seed"], json!(42));
    }

    #[test]
    fn skips_unknown_param_on_known_node() {
        let mut inputs = Map::new();
        inputs.insert("6_nonexistent".to_string(), json!("x"));
        let result = build_payload(&template(), &inputs).unwrap();
        assert_eq!(result["6"]["inputs"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn ignores_outputs_and_job_prefixed_keys() {
        let mut inputs = Map::new();
        inputs.insert("outputs".to_string(), json!({"file_path": "out/x.png"}));
        inputs.insert("job_id".to_string(), json!(5));
        let result = build_payload(&template(), &inputs).unwrap();
        assert_eq!(result["9"]["inputs"]["filename_prefix"], json!("x"));
    }

    #[test]
    fn sets_save_image_filename_prefix_from_output_path() {
        let mut inputs = Map::new();
        inputs.insert(
            "outputs".to_string(),
            json!({"file_path": "/data/out/cover_art.png"}),
        );
        let result = build_payload(&template(), &inputs).unwrap();
        assert_eq!(result["9"]["inputs"]["filename_prefix"], json!("cover_art"));
    }
}
