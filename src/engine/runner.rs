//! Job runner: executes the processing pipeline for a single claimed job.
//!
//! The pipeline is a fixed sequence of weighted steps. A step failure is
//! retryable up to the attempt cap; the attempt counter is persisted before
//! each retry wait so a crash mid-wait does not reset it. When attempts run
//! out, the job moves to the failed partition with the last error as its
//! failure payload.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::database::models::{FailureInfo, JobRecord, ResultMetrics, Sentiment, SummaryResult};
use crate::database::store::JobStore;
use crate::services::metadata::{FetchError, MetadataFetcher, VideoMetadata};
use crate::services::summary::{GenerationError, SummaryGenerator};
use crate::Result;

/// Pipeline steps with their progress weights. Weights sum to 100.
const STEPS: [(&str, u8); 5] = [
    ("initialize", 10),
    ("fetch-metadata", 20),
    ("analyze-content", 40),
    ("generate-summary", 20),
    ("finalize", 10),
];

/// A retryable failure inside the step pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("invalid source url: {0}")]
    SourceUrl(String),
}

impl StepError {
    /// Error class name recorded in the failure payload.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "FetchError",
            Self::Generation(_) => "GenerationError",
            Self::SourceUrl(_) => "InvalidUrlError",
        }
    }
}

/// The last step error after exhausting all attempts. This is what a failed
/// job's durable failure payload is built from.
#[derive(Debug, thiserror::Error)]
#[error("processing failed after {attempts} attempts: {source}")]
pub struct TerminalProcessingError {
    pub attempts: u32,
    #[source]
    pub source: StepError,
}

impl TerminalProcessingError {
    fn failure_info(&self) -> FailureInfo {
        FailureInfo::new(self.source.code(), self.to_string())
    }
}

/// Executes the processing pipeline for one job at a time.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn MetadataFetcher>,
    generator: Arc<dyn SummaryGenerator>,
    config: EngineConfig,
    cancel_token: CancellationToken,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn MetadataFetcher>,
        generator: Arc<dyn SummaryGenerator>,
        config: EngineConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            fetcher,
            generator,
            config,
            cancel_token,
        }
    }

    /// Claim the job and drive it to a terminal state.
    ///
    /// Store errors abort the run and surface to the dispatcher. Step errors
    /// never escape; they either trigger a retry or a durable fail write. On
    /// shutdown mid-retry-wait the job is left in processing for the
    /// recovery sweeper to reclaim.
    pub async fn run(&self, id: &str) -> Result<()> {
        let record = self.store.claim(id).await?;
        let mut attempt = record.attempt_count.max(1) as u32;

        loop {
            debug!(job_id = %id, attempt, "Starting processing attempt");

            match self.run_steps(&record).await {
                Ok(result) => {
                    self.store.complete(id, &result).await?;
                    return Ok(());
                }
                Err(step_err) => {
                    warn!(
                        job_id = %id,
                        attempt,
                        error = %step_err,
                        "Processing attempt failed"
                    );

                    if attempt >= self.config.max_attempts {
                        let terminal = TerminalProcessingError {
                            attempts: attempt,
                            source: step_err,
                        };
                        self.store.fail(id, &terminal.failure_info()).await?;
                        return Ok(());
                    }

                    attempt += 1;
                    self.store.record_attempt(id, attempt).await?;

                    let delay = Duration::from_secs(self.config.retry_delay_secs);
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => {
                            info!(job_id = %id, "Retry wait cancelled, leaving job for recovery");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One pass through the five-step pipeline.
    async fn run_steps(
        &self,
        record: &JobRecord,
    ) -> std::result::Result<SummaryResult, StepError> {
        let started = Instant::now();
        let id = &record.id;
        let mut progress: u8 = 0;

        // initialize
        url::Url::parse(&record.source_url).map_err(|e| StepError::SourceUrl(e.to_string()))?;
        progress = self.finish_step(id, 0, progress).await;

        // fetch-metadata
        let metadata = self.fetcher.fetch(&record.source_url).await?;
        progress = self.finish_step(id, 1, progress).await;

        // analyze-content
        let sentiment = classify_sentiment(&metadata);
        let keywords = extract_keywords(&metadata);
        progress = self.finish_step(id, 2, progress).await;

        // generate-summary
        let summary = self.generator.generate(&metadata).await?;
        progress = self.finish_step(id, 3, progress).await;

        // finalize
        let result = SummaryResult {
            summary,
            sentiment,
            keywords,
            metrics: ResultMetrics {
                processing_time_secs: started.elapsed().as_secs_f64(),
                confidence: confidence_score(&metadata),
            },
        };
        self.finish_step(id, 4, progress).await;

        Ok(result)
    }

    /// Record cumulative progress after a step. Progress writes are
    /// best-effort; losing one (e.g. the sweeper reclaimed the job) must not
    /// fail the pipeline, the terminal store write is the arbiter.
    async fn finish_step(&self, id: &str, index: usize, progress: u8) -> u8 {
        let (name, weight) = STEPS[index];
        let progress = progress.saturating_add(weight).min(100);
        if let Err(e) = self.store.update_progress(id, progress, name).await {
            debug!(job_id = %id, step = name, error = %e, "Progress update skipped");
        }
        progress
    }
}

const POSITIVE_WORDS: [&str; 10] = [
    "amazing", "love", "great", "best", "awesome", "beautiful", "fun", "happy", "perfect", "win",
];

const NEGATIVE_WORDS: [&str; 10] = [
    "bad", "worst", "hate", "sad", "awful", "terrible", "fail", "angry", "broken", "scam",
];

/// Keyword-spotting sentiment over the title and hashtags.
fn classify_sentiment(metadata: &VideoMetadata) -> Sentiment {
    let haystack = format!(
        "{} {}",
        metadata.title.to_lowercase(),
        metadata.hashtags.join(" ").to_lowercase()
    );

    let positive = POSITIVE_WORDS
        .iter()
        .filter(|w| haystack.contains(*w))
        .count();
    let negative = NEGATIVE_WORDS
        .iter()
        .filter(|w| haystack.contains(*w))
        .count();

    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

/// Keywords are the hashtags when present, otherwise the longer title words.
fn extract_keywords(metadata: &VideoMetadata) -> Vec<String> {
    if !metadata.hashtags.is_empty() {
        return metadata
            .hashtags
            .iter()
            .take(5)
            .map(|t| t.to_lowercase())
            .collect();
    }

    metadata
        .title
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .take(5)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Confidence grows with the amount of metadata available.
fn confidence_score(metadata: &VideoMetadata) -> f64 {
    let mut score: f64 = 0.7;
    score += 0.05 * metadata.hashtags.len().min(4) as f64;
    if metadata.thumbnail_url.is_some() {
        score += 0.05;
    }
    score.min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(title: &str, hashtags: &[&str]) -> VideoMetadata {
        VideoMetadata {
            title: title.to_string(),
            author: "someone".to_string(),
            hashtags: hashtags.iter().map(|s| s.to_string()).collect(),
            thumbnail_url: None,
        }
    }

    #[test]
    fn test_step_weights_sum_to_100() {
        let total: u32 = STEPS.iter().map(|(_, w)| *w as u32).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_classify_sentiment() {
        assert_eq!(
            classify_sentiment(&metadata("This is amazing, love it", &[])),
            Sentiment::Positive
        );
        assert_eq!(
            classify_sentiment(&metadata("Worst purchase, total scam", &[])),
            Sentiment::Negative
        );
        assert_eq!(
            classify_sentiment(&metadata("Tuesday vlog", &[])),
            Sentiment::Neutral
        );
        assert_eq!(
            classify_sentiment(&metadata("daily update", &["happyvibes"])),
            Sentiment::Positive
        );
    }

    #[test]
    fn test_extract_keywords_prefers_hashtags() {
        let m = metadata("Quick pasta recipe", &["Cooking", "pasta"]);
        assert_eq!(extract_keywords(&m), vec!["cooking", "pasta"]);
    }

    #[test]
    fn test_extract_keywords_falls_back_to_title() {
        let m = metadata("Quick pasta recipe for two", &[]);
        assert_eq!(extract_keywords(&m), vec!["quick", "pasta", "recipe"]);
    }

    #[test]
    fn test_confidence_score_bounds() {
        let bare = metadata("x", &[]);
        assert!((confidence_score(&bare) - 0.7).abs() < f64::EPSILON);

        let mut rich = metadata("x", &["a", "b", "c", "d", "e", "f"]);
        rich.thumbnail_url = Some("https://example.com/t.jpg".to_string());
        assert!(confidence_score(&rich) <= 0.95);
    }

    #[test]
    fn test_terminal_error_failure_info() {
        let terminal = TerminalProcessingError {
            attempts: 3,
            source: StepError::Fetch(FetchError::Status { status: 502 }),
        };
        let info = terminal.failure_info();
        assert_eq!(info.code, "FetchError");
        assert!(info.message.contains("3 attempts"));
    }
}
