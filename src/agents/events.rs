use serde::{Deserialize, Serialize};

/// Progress of one pipeline run, in production order.
///
/// A run emits any number of `Sources` / `ResponseChunk` events followed by
/// exactly one terminal event (`Done` or `Error`), then nothing else. A
/// cancelled run emits no terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Sources { payload: serde_json::Value },

    ResponseChunk { text: String },

    Done,

    Error { message: String },
}

impl PipelineEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn chunk(text: impl Into<String>) -> Self {
        Self::ResponseChunk { text: text.into() }
    }
}
