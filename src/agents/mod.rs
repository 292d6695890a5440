// Public module exports
pub mod cancellation;
pub mod events;
pub mod grouping;
pub mod narrative_agent;
pub mod pipeline;
pub mod prompts;
pub mod split_agent;
pub mod transform;

// Re-export main types for convenience
pub use cancellation::{CancellationToken, DropGuard, RequestManager};
pub use events::PipelineEvent;
pub use grouping::{HttpTopicGrouper, TopicGrouper};
pub use narrative_agent::NarrativeAgent;
pub use pipeline::{PipelineHandle, SurveyPipeline};
pub use prompts::Prompts;
pub use split_agent::AnswerSplitAgent;
pub use transform::{ChatRole, ChatTurn, OllamaTransform, TextStream, TextTransform, TransformRequest};

/// The pipeline's stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    AnswerSplit,
    TopicGrouping,
    Narrative,
}
