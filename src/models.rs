use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, ValidationError, ValidationErrors};

// ============================================================================
// Survey Record
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatingItem {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct FreeTextItem {
    pub answer: String,
}

impl FreeTextItem {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }
}

/// One element of a stored group, before the group as a whole is classified.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum GroupEntry {
    Rating(RatingItem),
    FreeText(FreeTextItem),
}

/// The answers recorded for one question.
///
/// Storage carries no discriminant, so the shape is read from the entries: a
/// non-empty group whose entries all carry `value`/`count` is a rating group,
/// every other well-formed group (including an empty one) is free text. A
/// group mixing both shapes is rejected at decode time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged, try_from = "Vec<serde_json::Value>")]
pub enum Group {
    Rating(Vec<RatingItem>),
    FreeText(Vec<FreeTextItem>),
}

impl Group {
    pub fn len(&self) -> usize {
        match self {
            Self::Rating(items) => items.len(),
            Self::FreeText(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_rating(&self) -> bool {
        matches!(self, Self::Rating(_))
    }
}

impl TryFrom<Vec<serde_json::Value>> for Group {
    type Error = String;

    fn try_from(raw: Vec<serde_json::Value>) -> std::result::Result<Self, Self::Error> {
        let entries = raw
            .into_iter()
            .map(serde_json::from_value::<GroupEntry>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("unrecognized group entry: {}", e))?;

        if entries.is_empty() {
            return Ok(Self::FreeText(Vec::new()));
        }

        let mut ratings = Vec::new();
        let mut answers = Vec::new();
        for entry in entries {
            match entry {
                GroupEntry::Rating(item) => ratings.push(item),
                GroupEntry::FreeText(item) => answers.push(item),
            }
        }

        match (ratings.is_empty(), answers.is_empty()) {
            (false, true) => Ok(Self::Rating(ratings)),
            (true, false) => Ok(Self::FreeText(answers)),
            _ => Err("group mixes rating and free-text entries".to_string()),
        }
    }
}

/// Question text mapped to its group of answers.
pub type SurveyRecord = BTreeMap<String, Group>;

pub type RatingsOnly = BTreeMap<String, Vec<RatingItem>>;

/// The free-text view handed to the pipeline; also the shape every
/// answer-splitting pass must return.
pub type FreeTextOnly = BTreeMap<String, Vec<FreeTextItem>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SplitResult {
    pub ratings_only: RatingsOnly,
    pub free_text_only: FreeTextOnly,
}

// ============================================================================
// Request Structures
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurveyRequest {
    #[serde(default)]
    pub sid: String,
}

impl SurveyRequest {
    pub fn new(sid: impl Into<String>) -> Self {
        Self { sid: sid.into() }
    }

    /// Checks the body and returns the trimmed survey id.
    ///
    /// Survey ids name a per-survey table, so only ASCII digits are accepted.
    pub fn validate(&self) -> Result<String> {
        let sid = self.sid.trim();
        let mut errors = ValidationErrors::new();

        if sid.is_empty() {
            errors.add(
                ValidationError::new("sid", "Survey ID is required").with_code("REQUIRED"),
            );
        } else if !is_numeric_sid(sid) {
            errors.add(
                ValidationError::new("sid", "Survey ID must contain only digits")
                    .with_code("FORMAT"),
            );
        }

        errors.into_result()?;
        Ok(sid.to_string())
    }
}

pub fn is_numeric_sid(sid: &str) -> bool {
    !sid.is_empty() && sid.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub request_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
