use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agents::grouping::TopicGrouper;
use crate::agents::narrative_agent::NarrativeAgent;
use crate::agents::split_agent::AnswerSplitAgent;
use crate::agents::transform::TextTransform;
use crate::agents::{CancellationToken, PipelineEvent, RequestManager, Stage};
use crate::error::{AppError, ErrorContext, Result};
use crate::init::PipelineConfig;
use crate::models::FreeTextOnly;

// ============================================================================
// PIPELINE HANDLE
// ============================================================================

/// One running request: its id, its cancellation token and its event feed.
pub struct PipelineHandle {
    pub request_id: String,
    pub cancellation_token: CancellationToken,
    pub events: mpsc::Receiver<PipelineEvent>,
}

// ============================================================================
// SURVEY PIPELINE
// ============================================================================

/// Runs answer splitting, topic grouping and narrative generation in order,
/// one spawned task per request.
pub struct SurveyPipeline {
    split_agent: Arc<AnswerSplitAgent>,
    grouper: Arc<dyn TopicGrouper>,
    narrative_agent: Arc<NarrativeAgent>,
    channel_capacity: usize,
    emit_sources: bool,
    request_manager: Arc<RequestManager>,
}

impl SurveyPipeline {
    pub fn new(
        transform: Arc<dyn TextTransform>,
        grouper: Arc<dyn TopicGrouper>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            split_agent: Arc::new(AnswerSplitAgent::new(
                transform.clone(),
                config.prompts.answer_split,
            )),
            grouper,
            narrative_agent: Arc::new(NarrativeAgent::new(transform, config.prompts.narrative)),
            channel_capacity: config.channel_capacity.max(1),
            emit_sources: config.emit_sources,
            request_manager: Arc::new(RequestManager::new()),
        }
    }

    /// Registers a new request and starts it in the background.
    ///
    /// Events arrive on the returned receiver in production order. Dropping
    /// the receiver cancels the request.
    pub async fn start(&self, answers: FreeTextOnly) -> PipelineHandle {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let request_id = Uuid::now_v7().to_string();
        let cancellation_token = self.request_manager.register(request_id.clone()).await;
        log::info!("[{}] Pipeline registered ({} questions)", request_id, answers.len());

        let runner = StageRunner {
            request_id: request_id.clone(),
            split_agent: self.split_agent.clone(),
            grouper: self.grouper.clone(),
            narrative_agent: self.narrative_agent.clone(),
            emit_sources: self.emit_sources,
            cancellation_token: cancellation_token.clone(),
            tx: tx.clone(),
        };
        let request_manager = self.request_manager.clone();
        let supervised_id = request_id.clone();

        tokio::spawn(async move {
            let worker = tokio::spawn(runner.run(answers));
            if let Err(e) = worker.await {
                log::error!("[{}] Pipeline task failed: {}", supervised_id, e);
                let _ = tx.send(PipelineEvent::error("Internal pipeline failure")).await;
            }
            request_manager.unregister(&supervised_id).await;
        });

        PipelineHandle {
            request_id,
            cancellation_token,
            events: rx,
        }
    }

    pub async fn cancel_request(&self, request_id: &str) -> bool {
        self.request_manager.cancel(request_id).await
    }

    pub fn request_manager(&self) -> &Arc<RequestManager> {
        &self.request_manager
    }
}

// ============================================================================
// STAGE RUNNER
// ============================================================================

struct StageRunner {
    request_id: String,
    split_agent: Arc<AnswerSplitAgent>,
    grouper: Arc<dyn TopicGrouper>,
    narrative_agent: Arc<NarrativeAgent>,
    emit_sources: bool,
    cancellation_token: CancellationToken,
    tx: mpsc::Sender<PipelineEvent>,
}

impl StageRunner {
    async fn run(self, answers: FreeTextOnly) {
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => Err(AppError::cancelled()),
            result = self.run_stages(answers) => result,
        };

        match outcome {
            Ok(()) => {
                log::info!(
                    "[{}] Pipeline completed in {:?}",
                    self.request_id,
                    started.elapsed()
                );
                let _ = self.tx.send(PipelineEvent::Done).await;
            }
            Err(e) if e.is_cancelled() => {
                log::info!("[{}] Pipeline cancelled", self.request_id);
            }
            Err(e) => {
                log::warn!("[{}] Pipeline failed: {}", self.request_id, e);
                let _ = self.tx.send(PipelineEvent::error(e.message)).await;
            }
        }
    }

    async fn run_stages(&self, answers: FreeTextOnly) -> Result<()> {
        self.enter(Stage::AnswerSplit);
        let split = self.split_agent.execute(&answers).await?;
        log::debug!(
            "[{}] {} produced {} answers",
            self.request_id,
            Stage::AnswerSplit,
            split.values().map(Vec::len).sum::<usize>()
        );

        self.enter(Stage::TopicGrouping);
        let grouped = self
            .grouper
            .group_by_topic(&split)
            .await
            .context(Stage::TopicGrouping.to_string())?;

        if self.emit_sources {
            self.send(PipelineEvent::Sources {
                payload: grouped.clone(),
            })
            .await?;
        }

        self.enter(Stage::Narrative);
        let mut fragments = self
            .narrative_agent
            .execute(&grouped)
            .await
            .context(Stage::Narrative.to_string())?;

        let mut count = 0usize;
        while let Some(fragment) = fragments.next().await {
            let text = fragment.context(Stage::Narrative.to_string())?;
            if text.is_empty() {
                continue;
            }
            count += 1;
            self.send(PipelineEvent::ResponseChunk { text }).await?;
        }
        log::debug!("[{}] {} streamed {} chunks", self.request_id, Stage::Narrative, count);

        Ok(())
    }

    fn enter(&self, stage: Stage) {
        log::info!("[{}] Stage {} started", self.request_id, stage);
    }

    /// Nothing is sent once the request is cancelled. A closed receiver
    /// means nobody is listening: the request is cancelled.
    async fn send(&self, event: PipelineEvent) -> Result<()> {
        self.cancellation_token.check()?;
        self.tx.send(event).await.map_err(|_| {
            self.cancellation_token.cancel();
            AppError::cancelled()
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
