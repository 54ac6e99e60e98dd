//! Runs untrusted source code inside short-lived, locked-down containers.
//!
//! The entry point is [`orchestrator::Executor`], usually built from an
//! [`config::ExecutorConfig`] and a [`runner::DockerEngine`].

pub mod config;
pub mod err;
pub mod model;
pub mod orchestrator;
pub mod prelude;
pub mod reaper;
pub mod registry;
pub mod runner;
pub mod util;
pub mod workspace;

#[cfg(test)]
mod test;

pub use config::ExecutorConfig;
pub use model::{ErrorKind, ExecutionResult, SubmissionRequest};
pub use orchestrator::Executor;
