//! Summary generation via an OpenAI-compatible chat completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::services::metadata::VideoMetadata;

/// Errors from summary generation. Retryable from the runner's point of view.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("Summary API request timed out")]
    Timeout,

    #[error("Summary API rate limited the request")]
    RateLimited,

    #[error("Summary API returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Summary API returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e)
        }
    }
}

/// Generates a prose summary from video metadata.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn generate(&self, metadata: &VideoMetadata) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Chat-completions backed summary generator.
pub struct ChatCompletionGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatCompletionGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn error_for_status(status: u16, message: String) -> GenerationError {
        if status == 429 {
            GenerationError::RateLimited
        } else {
            GenerationError::Api { status, message }
        }
    }

    fn extract_summary(body: ChatResponse) -> Result<String, GenerationError> {
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                GenerationError::MalformedResponse("no completion content".to_string())
            })
    }

    fn build_prompt(metadata: &VideoMetadata) -> String {
        let mut prompt = format!(
            "Summarize this short video in two to three sentences.\n\
             Title: {}\nAuthor: {}",
            metadata.title, metadata.author
        );
        if !metadata.hashtags.is_empty() {
            prompt.push_str("\nHashtags: ");
            prompt.push_str(&metadata.hashtags.join(", "));
        }
        prompt
    }
}

#[async_trait]
impl SummaryGenerator for ChatCompletionGenerator {
    async fn generate(&self, metadata: &VideoMetadata) -> Result<String, GenerationError> {
        let prompt = Self::build_prompt(metadata);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You summarize short-form videos from their metadata. \
                              Be concise and factual.",
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: 300,
            temperature: 0.3,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Self::error_for_status(status.as_u16(), message));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

        Self::extract_summary(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt_includes_hashtags() {
        let metadata = VideoMetadata {
            title: "Quick pasta recipe".to_string(),
            author: "chef".to_string(),
            hashtags: vec!["cooking".to_string(), "pasta".to_string()],
            thumbnail_url: None,
        };
        let prompt = ChatCompletionGenerator::build_prompt(&metadata);
        assert!(prompt.contains("Quick pasta recipe"));
        assert!(prompt.contains("cooking, pasta"));
    }

    #[test]
    fn test_build_prompt_without_hashtags() {
        let metadata = VideoMetadata {
            title: "Untagged clip".to_string(),
            author: "someone".to_string(),
            hashtags: vec![],
            thumbnail_url: None,
        };
        let prompt = ChatCompletionGenerator::build_prompt(&metadata);
        assert!(!prompt.contains("Hashtags"));
    }

    #[test]
    fn test_error_for_status_rate_limit() {
        let err = ChatCompletionGenerator::error_for_status(429, "slow down".to_string());
        assert!(matches!(err, GenerationError::RateLimited));
    }

    #[test]
    fn test_error_for_status_other() {
        let err = ChatCompletionGenerator::error_for_status(503, "unavailable".to_string());
        match err {
            GenerationError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    fn response(content: Option<&str>) -> ChatResponse {
        ChatResponse {
            choices: vec![ChatChoice {
                message: ChatResponseMessage {
                    content: content.map(|s| s.to_string()),
                },
            }],
        }
    }

    #[test]
    fn test_extract_summary_trims_content() {
        let summary =
            ChatCompletionGenerator::extract_summary(response(Some("  A summary.\n"))).unwrap();
        assert_eq!(summary, "A summary.");
    }

    #[test]
    fn test_extract_summary_rejects_missing_content() {
        assert!(matches!(
            ChatCompletionGenerator::extract_summary(ChatResponse { choices: vec![] }),
            Err(GenerationError::MalformedResponse(_))
        ));
        assert!(matches!(
            ChatCompletionGenerator::extract_summary(response(None)),
            Err(GenerationError::MalformedResponse(_))
        ));
        assert!(matches!(
            ChatCompletionGenerator::extract_summary(response(Some("   "))),
            Err(GenerationError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout() {
        // A bound listener that never accepts: the request hangs until the
        // client timeout fires.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let err = client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap_err();

        assert!(matches!(
            GenerationError::from(err),
            GenerationError::Timeout
        ));
        drop(listener);
    }
}
