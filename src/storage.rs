use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::agents::SurveyPipeline;
use crate::error::*;
use crate::models::{SurveyRecord, is_numeric_sid};

// ============================================================================
// AppState
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SurveyStore>,
    pub pipeline: Arc<SurveyPipeline>,
}

// ============================================================================
// Survey Store
// ============================================================================

/// Source of per-survey response summaries.
pub trait SurveyStore: Send + Sync {
    /// Question text mapped to that question's aggregated responses.
    ///
    /// Fails with `DataUnavailable` when the survey has no usable data.
    fn fetch_survey_summary<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<SurveyRecord>>;
}

/// Reads LimeSurvey's PostgreSQL schema.
///
/// Array questions (`F`) become `{value, count}` tallies per localized answer
/// label; text questions (`T`, `Q`) become `{answer}` entries in response
/// order. The respondent-profile group is left out.
pub struct PgSurveyStore {
    db: sqlx::PgPool,
}

const RESPONSES_TABLE: &str = "{responses}";

const SUMMARY_QUERY: &str = r#"
WITH qs AS (
    SELECT q.qid, q.sid, q.gid, q.type,
           COALESCE(l10n.question, q.title) AS qtext
    FROM lime_questions q
    LEFT JOIN lime_question_l10ns l10n ON l10n.qid = q.qid
    WHERE q.sid = $1
      AND q.parent_qid = 0
      AND l10n.question NOT LIKE '%填表人資料%'
),
columns AS (
    SELECT qs.qid, qs.qtext, qs.type,
           CASE
             WHEN qs.type IN ('F', 'Q') THEN
               jsonb_agg(format('%sX%sX%s%s', qs.sid, qs.gid, qs.qid, sub.title)
                         ORDER BY sub.question_order)
             WHEN qs.type = 'T' THEN
               jsonb_build_array(format('%sX%sX%s', qs.sid, qs.gid, qs.qid))
             ELSE '[]'::jsonb
           END AS colnames
    FROM qs
    LEFT JOIN lime_questions sub ON sub.parent_qid = qs.qid
    GROUP BY qs.qid, qs.qtext, qs.type, qs.sid, qs.gid
),
flat_cols AS (
    SELECT qid, qtext, type, c AS colname
    FROM columns, LATERAL jsonb_array_elements_text(colnames) AS c
),
rating_counts AS (
    SELECT fc.qtext,
           COALESCE(al.answer, la.code) AS answer_value,
           COUNT(*) AS cnt
    FROM flat_cols fc
    JOIN {responses} r ON TRUE
    CROSS JOIN LATERAL row_to_json(r) AS rj(rowjson)
    CROSS JOIN LATERAL (VALUES (NULLIF(rj.rowjson ->> fc.colname, ''))) AS v(val)
    JOIN lime_answers la ON la.qid = fc.qid AND la.code = v.val
    LEFT JOIN lime_answer_l10ns al ON al.aid = la.aid
    WHERE fc.type = 'F' AND v.val IS NOT NULL
    GROUP BY fc.qtext, COALESCE(al.answer, la.code)
),
rating_json AS (
    SELECT qtext,
           jsonb_agg(jsonb_build_object('value', answer_value, 'count', cnt)
                     ORDER BY answer_value DESC NULLS LAST) AS entries
    FROM rating_counts
    GROUP BY qtext
),
text_json AS (
    SELECT t.qtext,
           jsonb_agg(jsonb_build_object('answer', t.ans) ORDER BY t.seq) AS entries
    FROM (
        SELECT fc.qtext, rj.rowjson ->> fc.colname AS ans, r.id AS seq
        FROM flat_cols fc
        JOIN {responses} r ON TRUE
        CROSS JOIN LATERAL row_to_json(r) AS rj(rowjson)
        WHERE fc.type IN ('T', 'Q')
          AND LENGTH(rj.rowjson ->> fc.colname) > 0
    ) t
    GROUP BY t.qtext
),
merged AS (
    SELECT qtext, entries FROM rating_json
    UNION ALL
    SELECT qtext, entries FROM text_json
)
SELECT jsonb_object_agg(qtext, entries) FROM merged
"#;

/// Postgres `undefined_table`: the survey has no responses table.
const UNDEFINED_TABLE: &str = "42P01";

fn is_undefined_table(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNDEFINED_TABLE),
        _ => false,
    }
}

impl PgSurveyStore {
    pub fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }

    fn summary_sql(sid: &str) -> String {
        SUMMARY_QUERY.replace(RESPONSES_TABLE, &format!("lime_survey_{}", sid))
    }

    async fn fetch(&self, sid: &str) -> Result<SurveyRecord> {
        // The id becomes part of a table name and cannot be bound.
        if !is_numeric_sid(sid) {
            return Err(AppError::validation(format!("Invalid survey id: {}", sid)));
        }
        let survey_id: i64 = sid
            .parse()
            .map_err(|_| AppError::validation(format!("Invalid survey id: {}", sid)))?;

        let summary = sqlx::query_scalar::<_, Option<serde_json::Value>>(&Self::summary_sql(sid))
            .bind(survey_id)
            .fetch_one(&self.db)
            .await
            .map_err(|e| {
                if is_undefined_table(&e) {
                    AppError::data_unavailable(format!("Survey {} does not exist", sid))
                } else {
                    AppError::from(e)
                }
            })?;

        let Some(summary) = summary else {
            return Err(AppError::data_unavailable(format!(
                "Survey {} has no responses",
                sid
            )));
        };

        let record: SurveyRecord = serde_json::from_value(summary).map_err(|e| {
            AppError::internal(format!("Survey {} summary has an unexpected shape: {}", sid, e))
        })?;

        log::debug!("Survey {} summary: {} questions", sid, record.len());
        Ok(record)
    }
}

impl SurveyStore for PgSurveyStore {
    fn fetch_survey_summary<'a>(&'a self, sid: &'a str) -> BoxFuture<'a, Result<SurveyRecord>> {
        self.fetch(sid).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_sql_names_survey_table() {
        let sql = PgSurveyStore::summary_sql("123456");
        assert_eq!(sql.matches("JOIN lime_survey_123456 r").count(), 2);
        assert!(!sql.contains(RESPONSES_TABLE));
        assert!(sql.contains("q.sid = $1"));
    }

    #[tokio::test]
    async fn test_rejects_non_numeric_sid_before_querying() {
        let db = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let store = PgSurveyStore::new(db);

        let err = tokio_test::assert_err!(
            store
                .fetch_survey_summary("1; DROP TABLE lime_questions")
                .await
        );
        assert_eq!(err.code, ErrorCode::ValidationError);
    }
}
