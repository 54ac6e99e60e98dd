use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};

/// One piece of user code to be run, as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    /// Language id, looked up in the [`crate::registry::LanguageRegistry`].
    pub language: String,
    /// Raw source file content.
    pub source: Bytes,
    /// The file name the user submitted the source under.
    pub filename: String,
    /// Memory limit of the container, in megabytes.
    pub memory_limit_mb: u64,
    /// Wall time limit of the program, in seconds.
    pub time_limit_secs: u64,
}

impl SubmissionRequest {
    pub fn new(
        language: impl Into<String>,
        filename: impl Into<String>,
        source: impl Into<Bytes>,
        memory_limit_mb: u64,
        time_limit_secs: u64,
    ) -> Self {
        SubmissionRequest {
            language: language.into(),
            source: source.into(),
            filename: filename.into(),
            memory_limit_mb,
            time_limit_secs,
        }
    }
}

/// Why an execution did not finish normally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    None,
    /// Killed for running past its time limit.
    TimedOut,
    /// The engine could not create or start the container.
    ContainerCreateFailed,
    /// The engine went away while waiting for the container or reading its logs.
    RuntimeCommunicationFailure,
}

/// The result returned by running a submission.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `None` if no exit status could be observed.
    pub exit_code: Option<i64>,
    /// Combined stdout & stderr, control bytes stripped.
    #[serde(serialize_with = "serialize_lossy")]
    pub output: Bytes,
    /// Whether `output` was cut off at the output ceiling.
    pub truncated: bool,
    pub duration_ms: u64,
    pub error_kind: ErrorKind,
}

impl ExecutionResult {
    /// A run that produced nothing because of an infrastructure failure.
    pub fn failed(error_kind: ErrorKind, duration: Duration) -> Self {
        ExecutionResult {
            exit_code: None,
            output: Bytes::new(),
            truncated: false,
            duration_ms: duration.as_millis() as u64,
            error_kind,
        }
    }

    pub fn output_lossy(&self) -> std::borrow::Cow<str> {
        String::from_utf8_lossy(&self.output)
    }

    /// Finished on its own with exit code 0.
    pub fn is_success(&self) -> bool {
        self.error_kind == ErrorKind::None && self.exit_code == Some(0)
    }
}

fn serialize_lossy<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}
