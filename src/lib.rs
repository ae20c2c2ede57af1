//! Job queue and state-machine engine for short-video summarization.
//!
//! Jobs move through a fixed status state machine backed by SQLite. A
//! single dispatcher loop claims queued jobs into a bounded pool of
//! runners; a recovery sweeper requeues jobs abandoned mid-processing.

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod logging;
pub mod services;

pub use error::{Error, Result};
