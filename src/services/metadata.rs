//! Video metadata lookup via the platform's public oEmbed endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Metadata describing a short video, as returned by the platform.
#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub title: String,
    pub author: String,
    /// Hashtags extracted from the title, without the leading '#'.
    pub hashtags: Vec<String>,
    pub thumbnail_url: Option<String>,
}

/// Errors from metadata lookup. Retryable from the runner's point of view.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("oEmbed endpoint returned status {status}")]
    Status { status: u16 },

    #[error("Failed to parse oEmbed response: {0}")]
    Parse(String),
}

/// Fetches metadata for a video URL.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, video_url: &str) -> Result<VideoMetadata, FetchError>;
}

#[derive(Debug, Deserialize)]
struct OembedResponse {
    title: Option<String>,
    author_name: Option<String>,
    thumbnail_url: Option<String>,
}

/// oEmbed-backed metadata fetcher.
pub struct OembedMetadataFetcher {
    client: reqwest::Client,
    endpoint: String,
}

impl OembedMetadataFetcher {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, FetchError> {
        // Browser-like headers; the endpoint rejects bare clients.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

/// Tracking query parameters confuse the oEmbed endpoint.
fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Pull `#hashtag` tokens out of a video title.
fn extract_hashtags(title: &str) -> Vec<String> {
    title
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('#'))
        .filter(|tag| !tag.is_empty())
        .map(|tag| tag.to_string())
        .collect()
}

#[async_trait]
impl MetadataFetcher for OembedMetadataFetcher {
    async fn fetch(&self, video_url: &str) -> Result<VideoMetadata, FetchError> {
        let clean_url = strip_query(video_url);

        tracing::debug!(url = %clean_url, "Fetching video metadata");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("url", clean_url)])
            .header("Accept", "application/json")
            .header("Accept-Language", "en-US,en;q=0.9")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let body: OembedResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let title = body
            .title
            .ok_or_else(|| FetchError::Parse("missing title field".to_string()))?;
        let author = body.author_name.unwrap_or_else(|| "unknown".to_string());
        let hashtags = extract_hashtags(&title);

        Ok(VideoMetadata {
            title,
            author,
            hashtags,
            thumbnail_url: body.thumbnail_url,
        })
    }
}
