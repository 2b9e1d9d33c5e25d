//! Generation service boundary.
//!
//! [`GenerationService`] is the seam between the pipeline and whatever
//! produces candidate problems. Responses are decoded strictly into a
//! [`ProblemBatch`] (or a [`FeedbackSet`] for feedback requests); a malformed
//! payload is a [`GenerationError`], never a partially filled batch.

pub mod openai;
pub mod prompts;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{FeedbackSet, GenerationError, ProblemBatch};

pub use openai::OpenAiClient;

/// User message content: plain text or multimodal parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl UserContent {
    pub fn text(text: impl Into<String>) -> Self {
        UserContent::Text(text.into())
    }

    /// Append an image part. `url` may be an https or a `data:` URL.
    pub fn with_image_url(self, url: impl Into<String>) -> Self {
        let mut parts = self.into_parts();
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        });
        UserContent::Parts(parts)
    }

    pub fn with_text_part(self, text: impl Into<String>) -> Self {
        let mut parts = self.into_parts();
        parts.push(ContentPart::Text { text: text.into() });
        UserContent::Parts(parts)
    }

    fn into_parts(self) -> Vec<ContentPart> {
        match self {
            UserContent::Text(text) if text.is_empty() => Vec::new(),
            UserContent::Text(text) => vec![ContentPart::Text { text }],
            UserContent::Parts(parts) => parts,
        }
    }

    /// Concatenated text of every text part.
    pub fn text_summary(&self) -> String {
        match self {
            UserContent::Text(text) => text.clone(),
            UserContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for UserContent {
    fn from(text: String) -> Self {
        UserContent::Text(text)
    }
}

impl From<&str> for UserContent {
    fn from(text: &str) -> Self {
        UserContent::Text(text.to_string())
    }
}

/// Produces batches of candidate problems.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Cheap check run once before a pipeline run starts, e.g. for a
    /// missing credential.
    fn preflight(&self) -> Result<(), GenerationError> {
        Ok(())
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_content: &UserContent,
        model_hint: Option<&str>,
    ) -> Result<ProblemBatch, GenerationError>;

    /// Explanation, hint and common mistake for problems described in
    /// `user_prompt`.
    async fn generate_feedback(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model_hint: Option<&str>,
    ) -> Result<FeedbackSet, GenerationError>;
}

/// Decode the structured-output payload of a generation response.
pub fn decode_problem_set(content: &str) -> Result<ProblemBatch, GenerationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Decode the structured-output payload of a feedback response.
pub fn decode_feedback_set(content: &str) -> Result<FeedbackSet, GenerationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(serde_json::from_str(trimmed)?)
}
