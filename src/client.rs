use futures::{Stream, StreamExt};
use std::fmt::Display;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::agents::CancellationToken;
use crate::framing::LineBuffer;
use crate::models::SurveyRequest;
use crate::multiplexer::{EVENT_STREAM_CONTENT_TYPE, WireFrame};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("request cancelled")]
    Cancelled,
}

// ============================================================================
// Callbacks
// ============================================================================

/// Receives frames as the parser resolves them.
///
/// Exactly one of `on_done` and `on_error` is called per stream, unless the
/// caller cancels, in which case neither is.
pub trait FrameCallbacks: Send {
    fn on_message(&mut self, text: &str, message_id: &str);

    fn on_sources(&mut self, _data: &serde_json::Value, _message_id: &str) {}

    fn on_done(&mut self);

    fn on_error(&mut self, message: &str);
}

/// Accumulates everything a stream delivered.
#[derive(Debug, Default)]
pub struct TextCollector {
    pub text: String,
    pub message_ids: Vec<String>,
    pub sources: Vec<serde_json::Value>,
    pub done: usize,
    pub errors: Vec<String>,
}

impl TextCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCallbacks for TextCollector {
    fn on_message(&mut self, text: &str, message_id: &str) {
        self.text.push_str(text);
        if !self.message_ids.iter().any(|id| id == message_id) {
            self.message_ids.push(message_id.to_string());
        }
    }

    fn on_sources(&mut self, data: &serde_json::Value, _message_id: &str) {
        self.sources.push(data.clone());
    }

    fn on_done(&mut self) {
        self.done += 1;
    }

    fn on_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

// ============================================================================
// Frame Parser
// ============================================================================

/// Decodes one candidate line. Blank lines and anything that is not a frame
/// are noise and yield `None`.
pub fn decode_frame(line: &str) -> Option<WireFrame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<WireFrame>(line) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::debug!("Skipping undecodable line ({}): {:.80}", e, line);
            None
        }
    }
}

/// Per-stream parser state: the carry buffer of an unterminated line.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: LineBuffer,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames completed by `chunk`, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireFrame> {
        self.buffer
            .push(chunk)
            .iter()
            .filter_map(|line| decode_frame(line))
            .collect()
    }

    /// The final candidate line left in the carry buffer at end of input.
    pub fn finish(&mut self) -> Option<WireFrame> {
        self.buffer.finish().as_deref().and_then(decode_frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `messageEnd` seen, or the input ended cleanly.
    Completed,
    /// A server `error` frame or a transport failure.
    Failed,
    /// The caller cancelled; no callback reported it.
    Cancelled,
}

/// Routes one frame; returns the outcome if the frame is terminal.
fn dispatch<C: FrameCallbacks + ?Sized>(frame: WireFrame, callbacks: &mut C) -> Option<StreamOutcome> {
    match frame {
        WireFrame::Message { data, message_id } => {
            callbacks.on_message(&data, &message_id);
            None
        }
        WireFrame::Sources { data, message_id } => {
            callbacks.on_sources(&data, &message_id);
            None
        }
        WireFrame::MessageEnd => {
            callbacks.on_done();
            Some(StreamOutcome::Completed)
        }
        WireFrame::Error { data } => {
            callbacks.on_error(&data);
            Some(StreamOutcome::Failed)
        }
        WireFrame::Unknown => None,
    }
}

/// Reads a chunked byte stream to its end, a terminal frame, a transport
/// failure or cancellation, whichever comes first.
///
/// The source is dropped on return, so a terminal frame stops reading
/// immediately.
pub async fn consume<S, B, E, C>(
    source: S,
    token: &CancellationToken,
    callbacks: &mut C,
) -> StreamOutcome
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    C: FrameCallbacks + ?Sized,
{
    let mut source = std::pin::pin!(source);
    let mut parser = FrameParser::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamOutcome::Cancelled,
            next = source.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                for frame in parser.push(chunk.as_ref()) {
                    if let Some(outcome) = dispatch(frame, callbacks) {
                        return outcome;
                    }
                }
            }
            Some(Err(e)) => {
                if token.is_cancelled() {
                    return StreamOutcome::Cancelled;
                }
                callbacks.on_error(&e.to_string());
                return StreamOutcome::Failed;
            }
            None => {
                if let Some(outcome) = parser.finish().and_then(|frame| dispatch(frame, callbacks)) {
                    return outcome;
                }
                callbacks.on_done();
                return StreamOutcome::Completed;
            }
        }
    }
}

// ============================================================================
// Survey Client
// ============================================================================

pub const SURVEY_STREAM_PATH: &str = "/api/agent-survey";

/// HTTP client for the survey stream. Starting a request cancels the one
/// this client started before it.
pub struct SurveyClient {
    http: reqwest::Client,
    base_url: String,
    current: Mutex<Option<CancellationToken>>,
}

impl SurveyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            current: Mutex::new(None),
        }
    }

    /// Cancels the in-flight request, if any.
    pub async fn cancel(&self) {
        if let Some(token) = self.current.lock().await.take() {
            token.cancel();
        }
    }

    /// Streams the narrative for survey `sid` into `callbacks`.
    ///
    /// Failures before the stream opens go to `on_error` and are also
    /// returned; failures after it opens only go to `on_error`.
    pub async fn summarize<C>(
        &self,
        sid: &str,
        callbacks: &mut C,
    ) -> std::result::Result<StreamOutcome, ClientError>
    where
        C: FrameCallbacks + ?Sized,
    {
        let token = self.begin().await;
        let result = self.run(sid, &token, callbacks).await;

        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|t| t.same_request(&token)) {
            *current = None;
        }
        result
    }

    async fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.current.lock().await.replace(token.clone());
        if let Some(previous) = previous {
            log::debug!("Superseding previous survey request");
            previous.cancel();
        }
        token
    }

    async fn run<C>(
        &self,
        sid: &str,
        token: &CancellationToken,
        callbacks: &mut C,
    ) -> std::result::Result<StreamOutcome, ClientError>
    where
        C: FrameCallbacks + ?Sized,
    {
        let request = self
            .http
            .post(format!("{}{}", self.base_url, SURVEY_STREAM_PATH))
            .header(reqwest::header::ACCEPT, EVENT_STREAM_CONTENT_TYPE)
            .json(&SurveyRequest::new(sid));

        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ClientError::Cancelled),
            sent = request.send() => sent,
        };

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                let error = ClientError::Transport(e);
                callbacks.on_error(&error.to_string());
                return Err(error);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                format!("Request failed with {}", status.as_u16())
            } else {
                body
            };
            callbacks.on_error(&message);
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(consume(response.bytes_stream(), token, callbacks).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const FRAMES: &str = concat!(
        "{\"type\":\"sources\",\"data\":{\"Q1\":[]},\"messageId\":\"m1\"}\n",
        "{\"type\":\"message\",\"data\":\"課堂\",\"messageId\":\"m1\"}\n",
        "   \n",
        "{\"type\":\"message\",\"data\":\"內容\",\"messageId\":\"m1\"}\n",
        "{\"type\":\"messageEnd\"}\n",
    );

    fn chunked(bytes: &[u8], sizes: &[usize]) -> Vec<Result<Vec<u8>, String>> {
        let mut chunks = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < bytes.len() {
            let size = sizes[i % sizes.len()].max(1);
            let end = (offset + size).min(bytes.len());
            chunks.push(Ok(bytes[offset..end].to_vec()));
            offset = end;
            i += 1;
        }
        chunks
    }

    async fn run(chunks: Vec<Result<Vec<u8>, String>>) -> (StreamOutcome, TextCollector) {
        let mut collector = TextCollector::new();
        let token = CancellationToken::new();
        let outcome = consume(futures::stream::iter(chunks), &token, &mut collector).await;
        (outcome, collector)
    }

    #[tokio::test]
    async fn test_chunking_does_not_change_results() {
        let bytes = FRAMES.as_bytes();
        let deliveries = vec![
            vec![Ok(bytes.to_vec())],
            chunked(bytes, &[1]),
            chunked(bytes, &[3, 7, 1, 64]),
            chunked(bytes, &[2, 5]),
        ];

        for chunks in deliveries {
            let (outcome, collector) = run(chunks).await;
            assert_eq!(outcome, StreamOutcome::Completed);
            assert_eq!(collector.text, "課堂內容");
            assert_eq!(collector.message_ids, vec!["m1"]);
            assert_eq!(collector.sources, vec![serde_json::json!({"Q1": []})]);
            assert_eq!(collector.done, 1);
            assert!(collector.errors.is_empty());
        }
    }

    #[tokio::test]
    async fn test_message_end_stops_reading() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"{\"type\":\"message\",\"data\":\"a\",\"messageId\":\"m\"}\n".to_vec()),
            Ok(b"{\"type\":\"messageEnd\"}\n{\"type\":\"message\",\"data\":\"same chunk\",\"messageId\":\"m\"}\n".to_vec()),
            Ok(b"{\"type\":\"message\",\"data\":\"late\",\"messageId\":\"m\"}\n".to_vec()),
            Err("never read".to_string()),
        ];
        let counter = pulled.clone();
        let source = futures::stream::iter(chunks).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut collector = TextCollector::new();
        let outcome = consume(source, &CancellationToken::new(), &mut collector).await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(collector.text, "a");
        assert_eq!(collector.done, 1);
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_reports_once() {
        let (outcome, collector) = run(vec![
            Ok(b"{\"type\":\"message\",\"data\":\"partial\",\"messageId\":\"m\"}\n{\"type\":".to_vec()),
            Err("connection reset".to_string()),
        ])
        .await;

        assert_eq!(outcome, StreamOutcome::Failed);
        assert_eq!(collector.text, "partial");
        assert_eq!(collector.errors, vec!["connection reset"]);
        assert_eq!(collector.done, 0);
    }

    #[tokio::test]
    async fn test_noise_lines_are_skipped() {
        let (outcome, collector) = run(vec![Ok(concat!(
            "\t  \n",
            "not json at all\n",
            "{\"type\":\"message\",\"data\":\n",
            "{\"type\":\"progress\",\"data\":50}\n",
            "{\"type\":\"message\",\"data\":\"kept\",\"messageId\":\"m\"}\n",
            "{\"type\":\"messageEnd\"}\n",
        )
        .as_bytes()
        .to_vec())])
        .await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(collector.text, "kept");
        assert!(collector.errors.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_line_decoded_at_end_of_input() {
        let (outcome, collector) = run(vec![Ok(
            b"{\"type\":\"message\",\"data\":\"tail\",\"messageId\":\"m\"}".to_vec(),
        )])
        .await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(collector.text, "tail");
        assert_eq!(collector.done, 1);
    }

    #[tokio::test]
    async fn test_trailing_message_end_completes_once() {
        let (outcome, collector) = run(vec![Ok(b"{\"type\":\"messageEnd\"}".to_vec())]).await;
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(collector.done, 1);
    }

    #[tokio::test]
    async fn test_error_frame_is_terminal() {
        let (outcome, collector) = run(vec![Ok(concat!(
            "{\"type\":\"error\",\"data\":\"Preprocess API failed 500: down\"}\n",
            "{\"type\":\"message\",\"data\":\"never\",\"messageId\":\"m\"}\n",
        )
        .as_bytes()
        .to_vec())])
        .await;

        assert_eq!(outcome, StreamOutcome::Failed);
        assert_eq!(collector.errors, vec!["Preprocess API failed 500: down"]);
        assert!(collector.text.is_empty());
        assert_eq!(collector.done, 0);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_an_error() {
        let token = CancellationToken::new();
        let source = futures::stream::iter(vec![Ok::<_, String>(
            b"{\"type\":\"message\",\"data\":\"first\",\"messageId\":\"m\"}\n".to_vec(),
        )])
        .chain(futures::stream::pending());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let mut collector = TextCollector::new();
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            consume(source, &token, &mut collector),
        )
        .await
        .expect("cancel should end consumption");
        canceller.await.unwrap();

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(collector.text, "first");
        assert_eq!(collector.done, 0);
        assert!(collector.errors.is_empty());
    }

    #[test]
    fn test_parser_reassembles_split_characters() {
        let line = "{\"type\":\"message\",\"data\":\"質性回饋\",\"messageId\":\"m\"}\n";
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for byte in line.as_bytes() {
            frames.extend(parser.push(std::slice::from_ref(byte)));
        }
        assert_eq!(
            frames,
            vec![WireFrame::Message {
                data: "質性回饋".into(),
                message_id: "m".into()
            }]
        );
        assert_eq!(parser.finish(), None);
    }

    #[tokio::test]
    async fn test_new_request_cancels_previous_only() {
        let client = SurveyClient::new("http://127.0.0.1:9");
        let first = client.begin().await;
        let second = client.begin().await;

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        client.cancel().await;
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_status_error_message() {
        let error = ClientError::Status {
            status: 400,
            message: "Request failed with 400".into(),
        };
        assert_eq!(error.to_string(), "Request failed with 400");
    }
}
