//! OpenAI-compatible request and response types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Temperature sent upstream when the client gives none.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Completion length sent upstream when the client gives none.
pub const DEFAULT_MAX_TOKENS: u32 = 15000;

/// Chat completion request (OpenAI-compatible).
///
/// Only the fields the upstream accepts are kept; anything else the client
/// sends is dropped during deserialization.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A chat message. `content` is either a string or an array of content parts.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: serde_json::Value::String(content.into()),
            name: None,
        }
    }
}

impl ChatCompletionRequest {
    /// The minimal request used to check whether a model answers.
    pub fn trial(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::user("Hello")],
            stream: false,
            temperature: None,
            max_tokens: Some(10),
        }
    }

    /// Reject requests the upstream would refuse anyway.
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("'model' must not be empty".to_string());
        }
        if self.messages.is_empty() {
            return Err("'messages' must contain at least one message".to_string());
        }
        Ok(())
    }

    /// Fill in sampling defaults and repair swapped role/content pairs.
    ///
    /// Absent and zero values both count as unset.
    pub fn apply_defaults(&mut self) {
        if self.temperature.map_or(true, |t| t == 0.0) {
            self.temperature = Some(DEFAULT_TEMPERATURE);
        }
        if self.max_tokens.map_or(true, |m| m == 0) {
            self.max_tokens = Some(DEFAULT_MAX_TOKENS);
        }

        // Some clients send {"role": "content", "content": "user"}.
        for message in &mut self.messages {
            if message.role == "content" && message.content == "user" {
                message.role = "user".to_string();
                message.content = serde_json::Value::String("content".to_string());
            }
        }
    }
}

/// Model list response (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

impl ModelList {
    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model".to_string(),
                    owned_by: Some("deepinfra".to_string()),
                })
                .collect(),
        }
    }

    pub fn ids(self) -> Vec<String> {
        self.data.into_iter().map(|m| m.id).collect()
    }
}

/// A transcription request as received from the client.
///
/// Kept whole so each dispatch attempt can rebuild its own multipart body.
#[derive(Debug, Clone)]
pub struct AudioUpload {
    pub audio: Bytes,
    pub file_name: String,
    pub content_type: Option<String>,
    /// Upstream model override; the configured default when `None`.
    pub model: Option<String>,
    pub task: String,
    pub language: Option<String>,
}
