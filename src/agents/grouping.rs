use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::init::GroupingConfig;
use crate::models::FreeTextOnly;

/// External service that groups free-text answers under topic labels.
pub trait TopicGrouper: Send + Sync {
    fn group_by_topic<'a>(&'a self, answers: &'a FreeTextOnly)
    -> BoxFuture<'a, Result<serde_json::Value>>;
}

pub struct HttpTopicGrouper {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct GroupingRequest<'a> {
    raw_json: &'a FreeTextOnly,
}

impl HttpTopicGrouper {
    pub const GROUPING_PATH: &'static str = "/api/v1/group/bilingual-groups";

    pub fn new(config: &GroupingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Grouping client setup failed: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                Self::GROUPING_PATH
            ),
        })
    }

    async fn post(&self, answers: &FreeTextOnly) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&GroupingRequest { raw_json: answers })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::service(format!(
                "Preprocess API failed {}: {}",
                status.as_u16(),
                detail
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AppError::service(format!("Preprocess API returned invalid JSON: {}", e)))
    }
}

impl TopicGrouper for HttpTopicGrouper {
    fn group_by_topic<'a>(
        &'a self,
        answers: &'a FreeTextOnly,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        self.post(answers).boxed()
    }
}
