use thiserror::Error;

/// A submission that can never be executed as given. No container is created
/// for a request failing with one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field `{0}` must be a positive integer")]
    NonPositiveLimit(&'static str),

    #[error("Field `{field}` is {got}, which exceeds the maximum of {max}")]
    LimitTooLarge {
        field: &'static str,
        got: u64,
        max: u64,
    },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid file extension for {language}, expected {expected} (got `{filename}`)")]
    InvalidExtension {
        language: String,
        expected: String,
        filename: String,
    },

    #[error("Unsafe filename: {0:?}")]
    UnsafeFilename(String),

    #[error("`{0}` cannot be used as a class name")]
    InvalidClassName(String),
}

/// A defect in the deployed language table. Reported once at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Language `{language}`: unknown placeholder `{{{placeholder}}}` in command template")]
    UnknownPlaceholder {
        language: String,
        placeholder: String,
    },

    #[error("Language `{language}`: unbalanced `{{` or `}}` in command template")]
    UnbalancedBraces { language: String },

    #[error("Language `{0}` is defined more than once")]
    DuplicateLanguage(String),

    #[error("Language `{language}`: {reason}")]
    InvalidProfile { language: String, reason: String },
}

/// Errors talking to the container engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No such container or image: {0}")]
    NotFound(String),

    #[error("Container engine rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Lost connection to the container engine: {0}")]
    Connection(String),
}

impl From<bollard::errors::Error> for EngineError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Rejected {
                status: status_code,
                message,
            },
            other => EngineError::Connection(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("{0}")]
    Invalid(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The run was cancelled by its caller. Everything it created has been
/// removed by the time this is returned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Execution was cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("Invalid submission: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Failed to prepare workspace: {0}")]
    WorkspaceUnavailable(#[source] std::io::Error),

    #[error("Execution was cancelled")]
    Cancelled,
}

impl From<WorkspaceError> for ExecuteError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::Invalid(e) => ExecuteError::Invalid(e),
            WorkspaceError::Io(e) => ExecuteError::WorkspaceUnavailable(e),
        }
    }
}

impl From<Cancelled> for ExecuteError {
    fn from(_: Cancelled) -> Self {
        ExecuteError::Cancelled
    }
}
