use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use rig::client::Nothing;
use rig::completion::{Chat, Message};
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, Result};
use crate::framing::LineBuffer;
use crate::init::AiConfig;

// ============================================================================
// Transform Capability
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One call into the language backend.
#[derive(Debug, Clone, Default)]
pub struct TransformRequest {
    pub system_prompt: String,
    pub input: String,
    pub history: Vec<ChatTurn>,
    /// JSON schema the output must follow, for backends with structured output.
    pub schema: Option<serde_json::Value>,
}

impl TransformRequest {
    pub fn new(system_prompt: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// System prompt, history, then the input as the final user turn.
    pub fn messages(&self) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatTurn::new(ChatRole::System, self.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatTurn::new(ChatRole::User, self.input.clone()));
        messages
    }
}

pub type TextStream = BoxStream<'static, Result<String>>;

/// The language-generation capability every model-backed stage calls.
pub trait TextTransform: Send + Sync {
    /// Runs the request to completion and returns the whole text.
    fn complete(&self, request: TransformRequest) -> BoxFuture<'_, Result<String>>;

    /// Starts the request and yields text fragments as the backend produces them.
    fn stream(&self, request: TransformRequest) -> BoxFuture<'_, Result<TextStream>>;
}

// ============================================================================
// Ollama Backend
// ============================================================================

pub struct OllamaTransform {
    client: ollama::Client,
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a serde_json::Value>,
    options: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaTransform {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(&config.url)
            .build()
            .map_err(|e| AppError::internal(format!("Ollama client setup failed: {}", e)))?;

        Ok(Self {
            client,
            http: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.text_model.clone(),
            temperature: config.temperature,
        })
    }

    async fn complete_inner(&self, request: TransformRequest) -> Result<String> {
        let mut builder = self
            .client
            .agent(&self.model)
            .preamble(&request.system_prompt)
            .temperature(self.temperature);
        if let Some(schema) = &request.schema {
            builder = builder.additional_params(json!({ "format": schema }));
        }
        let agent = builder.build();

        let history = request
            .history
            .iter()
            .filter_map(|turn| match turn.role {
                ChatRole::User => Some(Message::user(turn.content.clone())),
                ChatRole::Assistant => Some(Message::assistant(turn.content.clone())),
                ChatRole::System => None,
            })
            .collect::<Vec<_>>();

        agent
            .chat(request.input.as_str(), history)
            .await
            .map_err(|e| AppError::service(format!("Model call failed: {}", e)))
    }

    async fn stream_inner(&self, request: TransformRequest) -> Result<TextStream> {
        let body = OllamaChatRequest {
            model: &self.model,
            messages: request.messages(),
            stream: true,
            format: request.schema.as_ref(),
            options: json!({ "temperature": self.temperature }),
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::service(format!(
                "Model backend returned {}: {}",
                status, detail
            )));
        }

        Ok(ollama_fragments(response.bytes_stream()).boxed())
    }
}

impl TextTransform for OllamaTransform {
    fn complete(&self, request: TransformRequest) -> BoxFuture<'_, Result<String>> {
        self.complete_inner(request).boxed()
    }

    fn stream(&self, request: TransformRequest) -> BoxFuture<'_, Result<TextStream>> {
        self.stream_inner(request).boxed()
    }
}

enum ChunkOutcome {
    Text { text: String, last: bool },
    Skip,
    Done,
    Failed(String),
}

fn decode_ollama_line(line: &str) -> ChunkOutcome {
    let line = line.trim();
    if line.is_empty() {
        return ChunkOutcome::Skip;
    }

    let chunk = match serde_json::from_str::<OllamaChatChunk>(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            log::warn!("Skipping malformed model stream record: {}", e);
            return ChunkOutcome::Skip;
        }
    };

    if let Some(error) = chunk.error {
        return ChunkOutcome::Failed(format!("Model stream error: {}", error));
    }

    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    match (text.is_empty(), chunk.done) {
        (false, last) => ChunkOutcome::Text { text, last },
        (true, true) => ChunkOutcome::Done,
        (true, false) => ChunkOutcome::Skip,
    }
}

/// Turns an Ollama `/api/chat` response body into its text fragments.
///
/// Records may be split across reads; the final record (`done: true`) may
/// still carry text, which is yielded before the stream ends.
pub(crate) fn ollama_fragments<S, E>(source: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    async_stream::stream! {
        let mut source = Box::pin(source);
        let mut lines = LineBuffer::new();

        loop {
            let (batch, finished) = match source.next().await {
                Some(Ok(chunk)) => (lines.push(&chunk), false),
                Some(Err(e)) => {
                    yield Err(e.into());
                    return;
                }
                None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
            };

            for line in batch {
                match decode_ollama_line(&line) {
                    ChunkOutcome::Text { text, last } => {
                        yield Ok(text);
                        if last {
                            return;
                        }
                    }
                    ChunkOutcome::Skip => {}
                    ChunkOutcome::Done => return,
                    ChunkOutcome::Failed(message) => {
                        yield Err(AppError::service(message));
                        return;
                    }
                }
            }

            if finished {
                break;
            }
        }
    }
}
