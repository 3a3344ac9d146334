use miette::Diagnostic;
use thiserror::Error;

/// How the consumer should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid mask, bad settings. Halts startup or the hive.
    Configuration,
    /// I/O, timeouts, broker or store trouble. Retried up to a bound.
    TransientIo,
    /// Malformed message or undecodable image. Dead-lettered immediately.
    PermanentInput,
}

#[derive(Debug, Diagnostic, Error)]
pub enum HivewatchError {
    #[error("configuration error: {0}")]
    #[diagnostic(code(hivewatch::configuration))]
    Configuration(String),

    #[error("transient I/O error: {0}")]
    #[diagnostic(code(hivewatch::transient_io))]
    TransientIo(String),

    #[error("permanent input error: {0}")]
    #[diagnostic(code(hivewatch::permanent_input))]
    PermanentInput(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error(transparent)]
    KafkaError(#[from] rdkafka::error::KafkaError),

    #[error("Some other error: {0}")]
    Other(String),
}

impl HivewatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HivewatchError::Configuration(_) => ErrorKind::Configuration,
            HivewatchError::TransientIo(_) => ErrorKind::TransientIo,
            HivewatchError::PermanentInput(_) => ErrorKind::PermanentInput,
            HivewatchError::IOError(err) => match err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidData => {
                    ErrorKind::PermanentInput
                }
                _ => ErrorKind::TransientIo,
            },
            HivewatchError::ImageError(err) => match err {
                image::ImageError::IoError(_) => ErrorKind::TransientIo,
                _ => ErrorKind::PermanentInput,
            },
            HivewatchError::JsonError(_) => ErrorKind::PermanentInput,
            HivewatchError::TomlError(_) => ErrorKind::Configuration,
            HivewatchError::SqliteError(_) => ErrorKind::TransientIo,
            HivewatchError::KafkaError(_) => ErrorKind::TransientIo,
            HivewatchError::Other(_) => ErrorKind::TransientIo,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }

    /// Wrap an elapsed timeout for `operation` as a retryable failure.
    pub fn timeout(operation: &str) -> Self {
        HivewatchError::TransientIo(format!("{} timed out", operation))
    }
}
