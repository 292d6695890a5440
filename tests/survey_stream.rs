use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::json;

use survey_agent::agents::{
    HttpTopicGrouper, Prompts, TextStream, TextTransform, TopicGrouper, TransformRequest,
};
use survey_agent::client::{ClientError, TextCollector};
use survey_agent::error::{AppError, Result};
use survey_agent::init::{GroupingConfig, PipelineConfig};
use survey_agent::models::{FreeTextOnly, SurveyRecord};
use survey_agent::{AppState, StreamOutcome, SurveyClient, SurveyPipeline, SurveyStore, create_app_router};

// ============================================================================
// Fakes
// ============================================================================

struct FakeStore {
    surveys: HashMap<String, SurveyRecord>,
}

impl SurveyStore for FakeStore {
    fn fetch_survey_summary<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<SurveyRecord>> {
        async move {
            self.surveys
                .get(sid)
                .cloned()
                .ok_or_else(|| AppError::data_unavailable(format!("Survey {} has no responses", sid)))
        }
        .boxed()
    }
}

/// Splits on "; " the way a well-behaved model would, then streams fixed text.
struct FakeTransform {
    narrative: Vec<&'static str>,
}

impl TextTransform for FakeTransform {
    fn complete(&self, request: TransformRequest) -> BoxFuture<'_, Result<String>> {
        async move {
            let answers: FreeTextOnly = serde_json::from_str(&request.input)?;
            let split: serde_json::Map<String, serde_json::Value> = answers
                .into_iter()
                .map(|(question, items)| {
                    let parts = items
                        .iter()
                        .flat_map(|item| item.answer.split("; "))
                        .map(|part| json!({"answer": part}))
                        .collect();
                    (question, serde_json::Value::Array(parts))
                })
                .collect();
            Ok(serde_json::Value::Object(split).to_string())
        }
        .boxed()
    }

    fn stream(&self, _request: TransformRequest) -> BoxFuture<'_, Result<TextStream>> {
        let fragments: Vec<Result<String>> =
            self.narrative.iter().map(|f| Ok(f.to_string())).collect();
        async move { Ok(futures::stream::iter(fragments).boxed()) }.boxed()
    }
}

struct EchoGrouper;

impl TopicGrouper for EchoGrouper {
    fn group_by_topic<'a>(
        &'a self,
        answers: &'a FreeTextOnly,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        async move { Ok(serde_json::to_value(answers)?) }.boxed()
    }
}

// ============================================================================
// Harness
// ============================================================================

async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn surveys() -> HashMap<String, SurveyRecord> {
    let record: SurveyRecord = serde_json::from_value(json!({
        "1. 整體滿意度": [{"value": "非常滿意", "count": 12}, {"value": "滿意", "count": 3}],
        "4. 本課程最有價值的部分是：": [{"answer": "good; also cheap"}, {"answer": "實作練習"}]
    }))
    .unwrap();
    HashMap::from([("123456".to_string(), record)])
}

async fn spawn_app(grouper: Arc<dyn TopicGrouper>, emit_sources: bool) -> String {
    let transform = Arc::new(FakeTransform {
        narrative: vec!["一、課程內容\n", "　學員", "肯定實作練習。"],
    });
    let pipeline = SurveyPipeline::new(
        transform,
        grouper,
        PipelineConfig {
            channel_capacity: 8,
            emit_sources,
            prompts: Prompts::default(),
        },
    );
    let state = Arc::new(AppState {
        store: Arc::new(FakeStore { surveys: surveys() }),
        pipeline: Arc::new(pipeline),
    });
    serve(create_app_router(state)).await
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn streams_full_narrative() {
    let base = spawn_app(Arc::new(EchoGrouper), false).await;
    let client = SurveyClient::new(&base);
    let mut collector = TextCollector::new();

    let outcome = client.summarize("123456", &mut collector).await.unwrap();

    assert_eq!(outcome, StreamOutcome::Completed);
    assert_eq!(collector.text, "一、課程內容\n　學員肯定實作練習。");
    assert_eq!(collector.message_ids.len(), 1);
    assert_eq!(collector.message_ids[0].len(), 14);
    assert_eq!(collector.done, 1);
    assert!(collector.errors.is_empty());
    assert!(collector.sources.is_empty());
}

#[tokio::test]
async fn sources_carry_split_free_text_only() {
    let base = spawn_app(Arc::new(EchoGrouper), true).await;
    let client = SurveyClient::new(&base);
    let mut collector = TextCollector::new();

    let outcome = client.summarize("123456", &mut collector).await.unwrap();

    assert_eq!(outcome, StreamOutcome::Completed);
    assert_eq!(
        collector.sources,
        vec![json!({
            "4. 本課程最有價值的部分是：": [
                {"answer": "good"},
                {"answer": "also cheap"},
                {"answer": "實作練習"}
            ]
        })]
    );
}

#[tokio::test]
async fn response_headers_and_wire_lines() {
    let base = spawn_app(Arc::new(EchoGrouper), false).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/agent-survey"))
        .json(&json!({"sid": "123456"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(headers["cache-control"], "no-cache, no-transform");
    assert!(headers.contains_key("x-request-id"));

    let body = response.text().await.unwrap();
    let frames: Vec<serde_json::Value> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(frames.len(), 4);
    assert!(frames[..3].iter().all(|f| f["type"] == "message"));
    assert!(frames[..3].iter().all(|f| f["messageId"] == frames[0]["messageId"]));
    assert_eq!(frames[3], json!({"type": "messageEnd"}));
}

#[tokio::test]
async fn empty_sid_is_rejected_before_streaming() {
    let base = spawn_app(Arc::new(EchoGrouper), false).await;
    let client = SurveyClient::new(&base);
    let mut collector = TextCollector::new();

    let err = client.summarize("", &mut collector).await.unwrap_err();

    let ClientError::Status { status, message } = err else {
        panic!("expected a status error");
    };
    assert_eq!(status, 400);
    let body: serde_json::Value = serde_json::from_str(&message).unwrap();
    assert_eq!(body["error"]["code"], "ValidationError");
    assert_eq!(collector.errors, vec![message]);
    assert_eq!(collector.done, 0);
}

#[tokio::test]
async fn rejection_echoes_caller_request_id() {
    let base = spawn_app(Arc::new(EchoGrouper), false).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/agent-survey"))
        .header("x-request-id", "client-7")
        .json(&json!({"sid": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["request_id"], "client-7");
    assert_eq!(body["error"]["code"], "ValidationError");
}

#[tokio::test]
async fn unknown_survey_is_not_found() {
    let base = spawn_app(Arc::new(EchoGrouper), false).await;
    let client = SurveyClient::new(&base);
    let mut collector = TextCollector::new();

    let err = client.summarize("999", &mut collector).await.unwrap_err();

    assert!(matches!(err, ClientError::Status { status: 404, .. }));
    assert!(collector.text.is_empty());
}

#[tokio::test]
async fn grouping_failure_becomes_error_frame() {
    let grouping = axum::Router::new().route(
        HttpTopicGrouper::GROUPING_PATH,
        axum::routing::post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream down") }),
    );
    let grouping_url = serve(grouping).await;
    let grouper = HttpTopicGrouper::new(&GroupingConfig {
        base_url: grouping_url,
        timeout_secs: 5,
    })
    .unwrap();

    let base = spawn_app(Arc::new(grouper), false).await;
    let client = SurveyClient::new(&base);
    let mut collector = TextCollector::new();

    let outcome = client.summarize("123456", &mut collector).await.unwrap();

    assert_eq!(outcome, StreamOutcome::Failed);
    assert!(collector.text.is_empty());
    assert_eq!(collector.done, 0);
    assert_eq!(collector.errors.len(), 1);
    assert!(collector.errors[0].contains("Preprocess API failed 500: upstream down"));
}

#[tokio::test]
async fn cancel_unknown_request_is_not_found() {
    let base = spawn_app(Arc::new(EchoGrouper), false).await;

    let response = reqwest::Client::new()
        .delete(format!("{base}/api/agent-survey/no-such-request"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let health: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
}
