//! Chat-completions client and the validation verdict schema.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LlmSettings;

/// Recorded for items the model did not mention either way.
pub const NO_DECISION_REASON: &str = "no decision";

const MAX_TITLE_CHARS: usize = 100;
const MAX_SNIPPET_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You review classified listings for an auto-parts part number. \
Decide for every listing whether it genuinely offers the NEW original part with that part number. \
Reject counterfeit goods, analogs, used parts and unrelated items. \
Respond with ONLY a JSON object of the form \
{\"passed\": [\"id\", ...], \"rejected\": [{\"id\": \"...\", \"reason\": \"...\"}, ...]} \
and mention every listing id exactly once.";

/// One listing as sent to the model. Title and snippet are truncated so
/// a large articulum stays within one request.
#[derive(Debug, Clone, Serialize)]
pub struct ListingForReview {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl ListingForReview {
    pub fn new(id: &str, title: &str, snippet: Option<&str>, price: Option<f64>) -> Self {
        Self {
            id: id.to_string(),
            title: truncate_chars(title, MAX_TITLE_CHARS),
            snippet: snippet.map(|s| truncate_chars(s, MAX_SNIPPET_CHARS)).filter(|s| !s.is_empty()),
            price,
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Item the model rejected, with its reason.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RejectedItem {
    pub id: String,
    pub reason: String,
}

/// Model verdict for one articulum's listings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AiVerdict {
    #[serde(default)]
    pub passed: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<RejectedItem>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no api key configured")]
    MissingApiKey,
}

/// Validation provider consumed by validation workers. The production
/// implementation talks to a chat-completions endpoint; tests substitute
/// mocks.
#[async_trait]
pub trait ListingValidator: Send + Sync {
    async fn validate(
        &self,
        articulum: &str,
        listings: &[ListingForReview],
    ) -> Result<AiVerdict, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Chat-completions backed validator.
pub struct ChatValidator {
    settings: LlmSettings,
    client: Client,
}

impl ChatValidator {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        if settings.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        Ok(Self { settings, client })
    }

    fn build_user_prompt(articulum: &str, listings: &[ListingForReview]) -> String {
        let payload = serde_json::to_string_pretty(listings).unwrap_or_default();
        format!("Part number: {articulum}\n\nListings:\n{payload}")
    }

    /// Pull the JSON object out of the model's reply, tolerating code
    /// fences and prose around it.
    fn parse_verdict(content: &str) -> Result<AiVerdict, LlmError> {
        let trimmed = content.trim();
        let candidate = if let Some(start) = trimmed.find('{') {
            let end = trimmed
                .rfind('}')
                .ok_or_else(|| LlmError::Parse("unterminated JSON object".to_string()))?;
            &trimmed[start..=end]
        } else {
            trimmed
        };
        serde_json::from_str(candidate).map_err(|e| LlmError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ListingValidator for ChatValidator {
    async fn validate(
        &self,
        articulum: &str,
        listings: &[ListingForReview],
    ) -> Result<AiVerdict, LlmError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::build_user_prompt(articulum, listings),
                },
            ],
            temperature: 0.0,
        };

        let url = format!(
            "{}/chat/completions",
            self.settings.endpoint.trim_end_matches('/')
        );
        debug!(articulum, items = listings.len(), "requesting AI validation");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {status}: {body}")));
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| LlmError::Parse("empty choices".to_string()))?;

        let verdict = Self::parse_verdict(content)?;
        info!(
            articulum,
            passed = verdict.passed.len(),
            rejected = verdict.rejected.len(),
            "AI validation verdict received"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_for_review_truncates_long_text() {
        let title = "x".repeat(300);
        let snippet = "y".repeat(500);
        let review = ListingForReview::new("1", &title, Some(&snippet), Some(100.0));
        assert_eq!(review.title.chars().count(), 100);
        assert_eq!(review.snippet.as_ref().unwrap().chars().count(), 200);
    }

    #[test]
    fn parse_verdict_accepts_plain_json() {
        let verdict = ChatValidator::parse_verdict(
            r#"{"passed": ["1", "2"], "rejected": [{"id": "3", "reason": "used"}]}"#,
        )
        .unwrap();
        assert_eq!(verdict.passed, vec!["1", "2"]);
        assert_eq!(
            verdict.rejected,
            vec![RejectedItem {
                id: "3".to_string(),
                reason: "used".to_string()
            }]
        );
    }

    #[test]
    fn parse_verdict_strips_code_fences_and_prose() {
        let content = "Here is my verdict:\n```json\n{\"passed\": [\"9\"], \"rejected\": []}\n```";
        let verdict = ChatValidator::parse_verdict(content).unwrap();
        assert_eq!(verdict.passed, vec!["9"]);
        assert!(verdict.rejected.is_empty());
    }

    #[test]
    fn parse_verdict_rejects_garbage() {
        assert!(ChatValidator::parse_verdict("no json here").is_err());
        assert!(ChatValidator::parse_verdict("{\"passed\": [").is_err());
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let settings = LlmSettings {
            endpoint: "https://api.example.com/v1".to_string(),
            api_key: String::new(),
            model: "test".to_string(),
            timeout: std::time::Duration::from_secs(5),
        };
        assert!(matches!(
            ChatValidator::new(settings),
            Err(LlmError::MissingApiKey)
        ));
    }
}
