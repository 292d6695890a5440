use std::sync::Arc;

use crate::agents::transform::{TextTransform, TransformRequest};
use crate::agents::Stage;
use crate::error::{AppError, Result};
use crate::models::FreeTextOnly;

/// Splits answers holding several key points into one entry per point.
pub struct AnswerSplitAgent {
    transform: Arc<dyn TextTransform>,
    prompt: String,
}

impl AnswerSplitAgent {
    pub fn new(transform: Arc<dyn TextTransform>, prompt: String) -> Self {
        Self { transform, prompt }
    }

    pub async fn execute(&self, answers: &FreeTextOnly) -> Result<FreeTextOnly> {
        let input = serde_json::to_string(answers)
            .map_err(|e| AppError::internal(format!("Serializing answers failed: {}", e)))?;

        let request = TransformRequest::new(self.prompt.clone(), input).with_schema(answer_schema());
        let output = self.transform.complete(request).await?;

        parse_answer_map(&output)
    }
}

/// JSON schema of the question to `[{answer}]` mapping.
pub fn answer_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(FreeTextOnly)).unwrap_or_default()
}

/// Decodes model output as a question to `[{answer}]` mapping.
///
/// Anything else, including extra fields or non-string answers, fails the
/// stage; nothing partial is passed on.
pub fn parse_answer_map(output: &str) -> Result<FreeTextOnly> {
    let cleaned = strip_code_fence(output);
    if cleaned.is_empty() {
        return Err(AppError::stage_validation(Stage::AnswerSplit, "empty output"));
    }

    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|e| AppError::stage_validation(Stage::AnswerSplit, format!("not JSON: {}", e)))?;

    let Some(questions) = value.as_object() else {
        return Err(AppError::stage_validation(Stage::AnswerSplit, "expected a JSON object"));
    };

    for (question, entries) in questions {
        let Some(entries) = entries.as_array() else {
            return Err(AppError::stage_validation(
                Stage::AnswerSplit,
                format!("question {:?} does not map to an array", question),
            ));
        };
        for entry in entries {
            let valid = entry
                .as_object()
                .is_some_and(|fields| fields.len() == 1 && fields.get("answer").is_some_and(|a| a.is_string()));
            if !valid {
                return Err(AppError::stage_validation(
                    Stage::AnswerSplit,
                    format!("question {:?} has an entry that is not {{answer: string}}", question),
                ));
            }
        }
    }

    serde_json::from_value(value)
        .map_err(|e| AppError::stage_validation(Stage::AnswerSplit, e.to_string()))
}

fn strip_code_fence(output: &str) -> &str {
    let trimmed = output.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
