//! HTTP submission and WebSocket completion against a ComfyUI instance.
//!
//! Ported from `executor.py`'s `ComfyUIClient`: POST the prompt to
//! `/prompt`, then open a fresh WebSocket per job to `/ws?clientId=...` and
//! watch for an `executing` frame whose `data.node` is null for the same
//! `prompt_id` — that marks completion. Binary frames are accumulated as
//! raw output bytes.

use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum ComfyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("ComfyUI response did not include a prompt_id")]
    MissingPromptId,

    #[error("execution did not complete within {0:?}")]
    Timeout(Duration),
}

pub struct ComfyUiClient {
    http: Client,
    base_url: String,
    client_id: String,
}

#[derive(Debug, Serialize)]
struct QueueRequest<'a> {
    prompt: &'a Value,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: Option<String>,
}

pub struct ExecutionResult {
    pub outputs: Vec<Vec<u8>>,
}

impl ComfyUiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub async fn queue_prompt(&self, prompt: &Value, timeout: Duration) -> Result<String, ComfyError> {
        let response = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .json(&QueueRequest { prompt, client_id: &self.client_id })
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<QueueResponse>()
            .await?;
        response.prompt_id.ok_or(ComfyError::MissingPromptId)
    }

    pub async fn wait_for_completion(
        &self,
        prompt_id: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ComfyError> {
        let ws_url = format!(
            "{}/ws?clientId={}",
            self.base_url.replacen("http", "ws", 1),
            self.client_id
        );
        let (mut socket, _) = tokio_tungstenite::connect_async(ws_url).await?;
        let mut outputs = Vec::new();

        let read_loop = async {
            while let Some(message) = socket.next().await {
                match message? {
                    Message::Text(text) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            if value.get("type").and_then(Value::as_str) == Some("executing") {
                                let data = value.get("data").cloned().unwrap_or(Value::Null);
                                let matches_prompt =
                                    data.get("prompt_id").and_then(Value::as_str) == Some(prompt_id);
                                let node_is_null = data
                                    .get("node")
                                    .map(Value::is_null)
                                    .unwrap_or(false);
                                if matches_prompt && node_is_null {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Binary(bytes) => outputs.push(bytes),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok::<(), tokio_tungstenite::tungstenite::Error>(())
        };

        let result = tokio::time::timeout(timeout, read_loop).await;
        let _ = socket.close(None).await;

        match result {
            Ok(inner) => {
                inner?;
                Ok(ExecutionResult { outputs })
            }
            Err(_) => Err(ComfyError::Timeout(timeout)),
        }
    }
}
