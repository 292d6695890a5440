use crate::models::{Group, SplitResult, SurveyRecord};

/// Partitions a survey record into its rating groups and its free-text groups.
///
/// Every question lands in exactly one side of the result. Empty groups are
/// free text.
pub fn split(record: &SurveyRecord) -> SplitResult {
    split_owned(record.clone())
}

/// Owned variant of [`split`] for callers that no longer need the record.
pub fn split_owned(record: SurveyRecord) -> SplitResult {
    let mut result = SplitResult::default();

    for (question, group) in record {
        match group {
            Group::Rating(items) => {
                result.ratings_only.insert(question, items);
            }
            Group::FreeText(items) => {
                result.free_text_only.insert(question, items);
            }
        }
    }

    result
}
