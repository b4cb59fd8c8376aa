use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackfillError>;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Timeout, 5xx or connection reset that survived the retry budget.
    #[error("transient I/O error: {0}")]
    IoTransient(String),

    /// Truncated response, length mismatch or a corrupted object.
    #[error("fatal I/O error: {0}")]
    IoFatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl BackfillError {
    /// Lock contention on an object; the daemon treats it as client preemption.
    pub fn is_busy(&self) -> bool {
        matches!(self, BackfillError::Busy(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            BackfillError::NotFound(_) => true,
            BackfillError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Short lowercase label used in structured log fields.
    pub fn kind_label(&self) -> &'static str {
        match self {
            BackfillError::NotFound(_) => "not_found",
            BackfillError::Busy(_) => "busy",
            BackfillError::AlreadyExists(_) => "exists",
            BackfillError::Forbidden(_) => "forbidden",
            BackfillError::InvalidArgument(_) => "invalid_argument",
            BackfillError::IoTransient(_) => "io_transient",
            BackfillError::IoFatal(_) => "io_fatal",
            BackfillError::Cancelled => "cancelled",
            BackfillError::LogicError(_) => "logic_error",
            BackfillError::Config(_) => "config",
            BackfillError::Io(_) => "io",
            BackfillError::Json(_) => "json",
            BackfillError::Yaml(_) => "yaml",
            BackfillError::Other(_) => "other",
        }
    }
}
