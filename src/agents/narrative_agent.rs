use std::sync::Arc;

use crate::agents::transform::{TextStream, TextTransform, TransformRequest};
use crate::error::Result;

/// Writes the categorized narrative from the grouped answers, as a stream.
pub struct NarrativeAgent {
    transform: Arc<dyn TextTransform>,
    prompt: String,
}

impl NarrativeAgent {
    pub fn new(transform: Arc<dyn TextTransform>, prompt: String) -> Self {
        Self { transform, prompt }
    }

    /// Starts generation over the grouped payload with an empty history.
    pub async fn execute(&self, grouped: &serde_json::Value) -> Result<TextStream> {
        let request = TransformRequest::new(self.prompt.clone(), grouped.to_string())
            .with_history(Vec::new());
        self.transform.stream(request).await
    }
}
