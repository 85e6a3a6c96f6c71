use std::fmt;

/// Outcome category of a failed driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    ResourceExhausted,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
    Unavailable,
    Aborted,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Error returned by every fallible driver-layer operation.
///
/// The message embeds the native driver's error name and description when
/// the failure originated in the driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("aborted: {0}")]
    Aborted(String),
}

impl DriverError {
    pub fn code(&self) -> StatusCode {
        match self {
            DriverError::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            DriverError::InvalidArgument(_) => StatusCode::InvalidArgument,
            DriverError::NotFound(_) => StatusCode::NotFound,
            DriverError::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            DriverError::Internal(_) => StatusCode::Internal,
            DriverError::Unavailable(_) => StatusCode::Unavailable,
            DriverError::Aborted(_) => StatusCode::Aborted,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DriverError::ResourceExhausted(m)
            | DriverError::InvalidArgument(m)
            | DriverError::NotFound(m)
            | DriverError::FailedPrecondition(m)
            | DriverError::Internal(m)
            | DriverError::Unavailable(m)
            | DriverError::Aborted(m) => m,
        }
    }

    pub fn with_code(code: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            StatusCode::ResourceExhausted => DriverError::ResourceExhausted(message),
            StatusCode::InvalidArgument => DriverError::InvalidArgument(message),
            StatusCode::NotFound => DriverError::NotFound(message),
            StatusCode::FailedPrecondition => DriverError::FailedPrecondition(message),
            StatusCode::Internal => DriverError::Internal(message),
            StatusCode::Unavailable => DriverError::Unavailable(message),
            StatusCode::Aborted => DriverError::Aborted(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}
