use std::path::Path;

use crate::error::{ErrorContext, Result};

pub const ANSWER_SPLIT_PROMPT: &str = "Review the following JSON object. It maps each survey question \
to an array of {\"answer\": string} entries. If an answer contains several distinct key points, \
split each key point into its own {\"answer\": ...} entry under the same question, in the order \
they appear. Copy the original wording exactly: do not rewrite, translate, summarize or correct \
anything. Answers with a single key point stay as they are. Return only the complete JSON object, \
matching the schema.";

pub const NARRATIVE_PROMPT: &str = "You will receive a JSON object with survey questions and, for \
each question, topic groups of free-text responses. Each group has a topic label and the answers \
that belong to it.

1. Classify every topic into exactly one of four categories by meaning:
   - Course content: materials, policies, concepts, background introductions.
   - Speaker performance: professionalism, clarity, delivery, engagement.
   - Learning format: teaching methods, activity design, grouping, timing.
   - Other: general comments and anything that fits none of the above.
2. Output one block per question. Start the block with the question text.
3. Always list all four category headers, in the order above, even when a category is empty.
4. Under each category list its topics; indent each level with two full-width spaces (U+3000) and \
use \"- \" as the bullet.
5. A topic with a single answer is shown as the topic line only. A topic with several answers lists \
each answer one level deeper.
6. Write plain text only: no JSON, no Markdown, no explanations. Keep the language of the answers.";

/// System instructions for the model-backed stages, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub answer_split: String,
    pub narrative: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            answer_split: ANSWER_SPLIT_PROMPT.to_string(),
            narrative: NARRATIVE_PROMPT.to_string(),
        }
    }
}

impl Prompts {
    /// Defaults, with each prompt replaced by the file its variable names, if set.
    pub fn from_env() -> Result<Self> {
        let mut prompts = Self::default();
        if let Ok(path) = std::env::var("ANSWER_SPLIT_PROMPT_FILE") {
            prompts.answer_split = read_prompt(&path)?;
        }
        if let Ok(path) = std::env::var("NARRATIVE_PROMPT_FILE") {
            prompts.narrative = read_prompt(&path)?;
        }
        Ok(prompts)
    }
}

fn read_prompt(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .context(format!("reading prompt file {}", path.display()))?;
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_prompt_trims() {
        let path = std::env::temp_dir().join(format!("prompt-{}.txt", uuid::Uuid::now_v7()));
        std::fs::write(&path, "\n  Summarize.  \n").unwrap();
        assert_eq!(read_prompt(&path).unwrap(), "Summarize.");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_prompt_file() {
        let err = read_prompt("/nonexistent/prompt.txt").unwrap_err();
        assert!(err.message.starts_with("reading prompt file"));
    }
}
