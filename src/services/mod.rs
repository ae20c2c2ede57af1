//! External collaborators: video metadata lookup and summary generation.

pub mod metadata;
pub mod summary;

pub use metadata::{FetchError, MetadataFetcher, OembedMetadataFetcher, VideoMetadata};
pub use summary::{ChatCompletionGenerator, GenerationError, SummaryGenerator};
