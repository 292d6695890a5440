pub mod agents;
pub mod client;
pub mod error;
pub mod framing;
pub mod handlers;
pub mod init;
pub mod models;
pub mod multiplexer;
pub mod splitter;
pub mod storage;

pub use crate::agents::{CancellationToken, PipelineEvent, RequestManager, SurveyPipeline};
pub use crate::client::{FrameCallbacks, StreamOutcome, SurveyClient};
pub use crate::handlers::create_app_router;
pub use crate::multiplexer::{EventMultiplexer, WireFrame};
pub use crate::storage::{AppState, SurveyStore};
