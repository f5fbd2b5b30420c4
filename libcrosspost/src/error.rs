//! Error types for Crosspost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosspostError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::InvalidInput(_) => 3,
            CrosspostError::Validation(_) => 3,
            CrosspostError::Adapter(AdapterError::Authentication(_)) => 2,
            CrosspostError::Config(_) => 2,
            CrosspostError::Adapter(_) => 1,
            CrosspostError::Transform(_) => 1,
            CrosspostError::Timeout(_) => 1,
            CrosspostError::Io(_) => 1,
        }
    }

    /// Whether the scheduler may retry the failed attempt.
    ///
    /// Network trouble, site-side rejections, rate limiting and timeouts are
    /// retried. Authentication failures, bad options and broken files are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrosspostError::Adapter(adapter_error) => match adapter_error {
                AdapterError::Network(_) | AdapterError::RateLimit(_) | AdapterError::Rejected(_) => {
                    true
                }
                AdapterError::Authentication(_) => false,
            },
            CrosspostError::Timeout(_) => true,
            CrosspostError::Config(_)
            | CrosspostError::Validation(_)
            | CrosspostError::Transform(_)
            | CrosspostError::InvalidInput(_)
            | CrosspostError::Io(_) => false,
        }
    }

    /// Short label for where the error came from, recorded as a pair's `source`.
    pub fn source_label(&self) -> &'static str {
        match self {
            CrosspostError::Config(_) => "config",
            CrosspostError::Validation(_) => "validation",
            CrosspostError::Adapter(_) => "adapter",
            CrosspostError::Transform(_) => "transform",
            CrosspostError::Timeout(_) => "timeout",
            CrosspostError::InvalidInput(_) => "input",
            CrosspostError::Io(_) => "io",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{destination}: missing required field '{field}'")]
    MissingField { destination: String, field: String },

    #[error("{destination}: option kind '{found}' does not match destination kind '{expected}'")]
    KindMismatch {
        destination: String,
        expected: String,
        found: String,
    },

    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    #[error("{destination}: prerequisite '{prerequisite}' failed")]
    PrerequisiteFailed {
        destination: String,
        prerequisite: String,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rejected by site: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Failed to read {location}: {reason}")]
    Read { location: String, reason: String },

    #[error("Failed to decode {location}: {reason}")]
    Decode { location: String, reason: String },

    #[error("Failed to encode {location}: {reason}")]
    Encode { location: String, reason: String },

    #[error("Unsupported image type: {0}")]
    UnsupportedType(String),

    #[error("Transform failed: {0}")]
    Failed(String),

    #[error("Transform worker unavailable: {0}")]
    Worker(String),
}
