//! OpenAI-compatible chat-completions client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::schema::{
    feedback_set_schema, problem_set_schema, FEEDBACK_SET_SCHEMA_NAME, PROBLEM_SET_SCHEMA_NAME,
};
use super::{decode_feedback_set, decode_problem_set, GenerationService, UserContent};
use crate::config::PipelineConfig;
use crate::domain::{FeedbackSet, GenerationError, ProblemBatch};

const TEMPERATURE: f64 = 1.0;

/// Calls `{api_base}/chat/completions` with a strict `json_schema`
/// response format.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn request_body(
        &self,
        system_prompt: &str,
        user_content: &UserContent,
        model: &str,
        schema_name: &str,
        schema: Value,
    ) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_content },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": schema_name,
                    "strict": true,
                    "schema": schema,
                }
            },
            "temperature": TEMPERATURE,
        })
    }

    fn resolve_model<'a>(&'a self, model_hint: Option<&'a str>) -> &'a str {
        model_hint
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.model)
    }

    /// POST `body` and return the message content of a 2xx response.
    async fn complete(&self, body: &Value) -> Result<String, GenerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(GenerationError::MissingCredential)?;

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        message_content(&text)
    }
}

/// Pull the message content out of a chat-completions response body.
fn message_content(body: &str) -> Result<String, GenerationError> {
    let completion: ChatCompletion = serde_json::from_str(body)?;
    let message = completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or(GenerationError::EmptyResponse)?;
    if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(GenerationError::Other(format!("model refused: {}", refusal)));
    }
    message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or(GenerationError::EmptyResponse)
}

#[async_trait]
impl GenerationService for OpenAiClient {
    fn preflight(&self) -> Result<(), GenerationError> {
        if self.api_key.is_none() {
            return Err(GenerationError::MissingCredential);
        }
        Ok(())
    }

    #[instrument(skip(self, system_prompt, user_content), fields(model = tracing::field::Empty))]
    async fn generate(
        &self,
        system_prompt: &str,
        user_content: &UserContent,
        model_hint: Option<&str>,
    ) -> Result<ProblemBatch, GenerationError> {
        let model = self.resolve_model(model_hint);
        tracing::Span::current().record("model", model);

        let body = self.request_body(
            system_prompt,
            user_content,
            model,
            PROBLEM_SET_SCHEMA_NAME,
            problem_set_schema(),
        );
        let content = self.complete(&body).await?;
        let batch = decode_problem_set(&content)?;
        debug!(items = batch.items.len(), "problem set decoded");
        Ok(batch)
    }

    #[instrument(skip(self, system_prompt, user_prompt), fields(model = tracing::field::Empty))]
    async fn generate_feedback(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model_hint: Option<&str>,
    ) -> Result<FeedbackSet, GenerationError> {
        let model = self.resolve_model(model_hint);
        tracing::Span::current().record("model", model);

        let body = self.request_body(
            system_prompt,
            &UserContent::text(user_prompt),
            model,
            FEEDBACK_SET_SCHEMA_NAME,
            feedback_set_schema(),
        );
        let content = self.complete(&body).await?;
        let set = decode_feedback_set(&content)?;
        debug!(items = set.items.len(), "feedback set decoded");
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(api_key: Option<&str>) -> OpenAiClient {
        let config = PipelineConfig {
            api_key: api_key.map(str::to_string),
            api_base: "http://localhost:9/v1/".to_string(),
            ..PipelineConfig::default()
        };
        OpenAiClient::new(&config).unwrap()
    }

    #[test]
    fn test_preflight_requires_key() {
        assert!(matches!(
            client(None).preflight(),
            Err(GenerationError::MissingCredential)
        ));
        assert!(matches!(
            client(Some("  ")).preflight(),
            Err(GenerationError::MissingCredential)
        ));
        assert!(client(Some("sk-test")).preflight().is_ok());
    }

    #[test]
    fn test_request_body_shape() {
        let c = client(Some("sk-test"));
        assert_eq!(c.endpoint(), "http://localhost:9/v1/chat/completions");

        let body = c.request_body(
            "system",
            &UserContent::text("Unit: 図形"),
            "gpt-test",
            PROBLEM_SET_SCHEMA_NAME,
            problem_set_schema(),
        );
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Unit: 図形");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "problem_set");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn test_feedback_request_uses_feedback_schema() {
        let c = client(Some("sk-test"));
        assert_eq!(c.resolve_model(Some("  ")), c.model());
        assert_eq!(c.resolve_model(Some("gpt-feedback")), "gpt-feedback");

        let body = c.request_body(
            "tutor",
            &UserContent::text("Problem: $1+1$"),
            "gpt-feedback",
            FEEDBACK_SET_SCHEMA_NAME,
            feedback_set_schema(),
        );
        assert_eq!(body["response_format"]["json_schema"]["name"], "feedback_set");
        assert!(body["response_format"]["json_schema"]["schema"]["properties"]["items"].is_object());
        assert_eq!(body["messages"][1]["content"], "Problem: $1+1$");
    }

    #[tokio::test]
    async fn test_feedback_without_key_fails_before_sending() {
        let result = client(None).generate_feedback("tutor", "Problem: x", None).await;
        assert!(matches!(result, Err(GenerationError::MissingCredential)));
    }

    #[test]
    fn test_message_content_envelope() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"problems\":[]}"}}]}"#;
        assert_eq!(message_content(body).unwrap(), "{\"problems\":[]}");

        assert!(matches!(
            message_content(r#"{"choices":[]}"#),
            Err(GenerationError::EmptyResponse)
        ));
        assert!(matches!(
            message_content(r#"{"choices":[{"message":{"content":null,"refusal":"no"}}]}"#),
            Err(GenerationError::Other(_))
        ));
        assert!(matches!(message_content("<html>"), Err(GenerationError::Schema(_))));
    }
}
