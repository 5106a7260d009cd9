use std::path::Path;

use serde::{Deserialize, Serialize};

/// Free-form sampling parameters forwarded to the backend untouched.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: usize,
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub path: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub quantization: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub id: String,
    pub path: String,
    pub format: String,
    pub quantization: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub loaded: bool,
}

impl LoadedModel {
    /// Model ids are derived from the artifact's file stem.
    pub fn id_for_path(path: &str) -> String {
        Path::new(path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| path.to_string())
    }
}

/// One step of a streamed generation. `Done` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk { text: String },
    Done { tokens: usize },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

/// Wire form of a [`StreamEvent`] carried in each server-sent event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<StreamEvent> for StreamPayload {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Chunk { text } => StreamPayload {
                text,
                ..Default::default()
            },
            StreamEvent::Done { tokens } => StreamPayload {
                done: true,
                tokens: Some(tokens),
                ..Default::default()
            },
            StreamEvent::Error { message } => StreamPayload {
                error: Some(message),
                ..Default::default()
            },
        }
    }
}

impl From<StreamPayload> for StreamEvent {
    fn from(payload: StreamPayload) -> Self {
        if let Some(message) = payload.error {
            StreamEvent::Error { message }
        } else if payload.done {
            StreamEvent::Done {
                tokens: payload.tokens.unwrap_or(0),
            }
        } else {
            StreamEvent::Chunk { text: payload.text }
        }
    }
}
