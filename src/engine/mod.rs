//! Job execution engine: dispatcher, runner and recovery sweeper.

pub mod dispatcher;
pub mod recovery;
pub mod runner;

pub use dispatcher::Dispatcher;
pub use recovery::RecoverySweeper;
pub use runner::{JobRunner, StepError, TerminalProcessingError};
