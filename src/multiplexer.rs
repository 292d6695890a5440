use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::agents::{PipelineEvent, PipelineHandle};

// ============================================================================
// Wire Frames
// ============================================================================

/// One line of the response stream.
///
/// Decoding accepts any `type`; values this version does not know become
/// `Unknown` so newer servers can add frame kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireFrame {
    Message {
        data: String,
        #[serde(rename = "messageId", default)]
        message_id: String,
    },

    Sources {
        #[serde(default)]
        data: serde_json::Value,
        #[serde(rename = "messageId", default)]
        message_id: String,
    },

    MessageEnd,

    Error {
        #[serde(default)]
        data: String,
    },

    #[serde(other)]
    Unknown,
}

impl WireFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageEnd | Self::Error { .. })
    }
}

pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Serializes a frame as one newline-terminated line.
///
/// JSON escapes control characters inside strings, so the trailing newline is
/// the only raw newline in the output.
pub fn encode_frame(frame: &WireFrame) -> Bytes {
    let mut line = serde_json::to_vec(frame).unwrap_or_else(|e| {
        log::error!("Frame serialization failed: {}", e);
        br#"{"type":"error","data":"Frame serialization failed"}"#.to_vec()
    });
    line.push(b'\n');
    Bytes::from(line)
}

/// 14 hex characters, like the ids existing clients already store.
pub fn new_message_id() -> String {
    hex::encode(&Uuid::now_v7().as_bytes()[9..])
}

// ============================================================================
// Event Multiplexer
// ============================================================================

/// Adapts one request's pipeline events into wire frames.
pub struct EventMultiplexer {
    message_id: String,
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMultiplexer {
    pub fn new() -> Self {
        Self::with_message_id(new_message_id())
    }

    pub fn with_message_id(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn frame_for(&self, event: PipelineEvent) -> WireFrame {
        match event {
            PipelineEvent::ResponseChunk { text } => WireFrame::Message {
                data: text,
                message_id: self.message_id.clone(),
            },
            PipelineEvent::Sources { payload } => WireFrame::Sources {
                data: payload,
                message_id: self.message_id.clone(),
            },
            PipelineEvent::Done => WireFrame::MessageEnd,
            PipelineEvent::Error { message } => WireFrame::Error { data: message },
        }
    }

    /// Frames in event order, ending right after the first terminal frame.
    ///
    /// Cancelling the request ends the stream at once, even with events
    /// still buffered. If the pipeline's channel closes without a terminal
    /// event and the request was not cancelled, an `error` frame is added so
    /// readers still see an end.
    pub fn frames(self, handle: PipelineHandle) -> impl Stream<Item = WireFrame> + Send + 'static {
        let PipelineHandle {
            request_id,
            cancellation_token,
            events,
        } = handle;

        async_stream::stream! {
            let mut events = ReceiverStream::new(events);

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancellation_token.cancelled() => None,
                    next = events.next() => next,
                };
                let Some(event) = next else { break };

                let terminal = event.is_terminal();
                yield self.frame_for(event);
                if terminal {
                    log::debug!("[{}] Stream closed after terminal frame", request_id);
                    return;
                }
            }

            if cancellation_token.is_cancelled() {
                log::debug!("[{}] Stream closed after cancellation", request_id);
            } else {
                log::warn!("[{}] Pipeline ended without a terminal event", request_id);
                yield WireFrame::Error {
                    data: "Pipeline ended without a result".to_string(),
                };
            }
        }
    }

    /// Encoded frames for an HTTP body. Dropping the body cancels the request.
    pub fn into_body_stream(
        self,
        handle: PipelineHandle,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let guard = handle.cancellation_token.clone().drop_guard();
        self.frames(handle).map(move |frame| {
            let _guard = &guard;
            Ok(encode_frame(&frame))
        })
    }
}
