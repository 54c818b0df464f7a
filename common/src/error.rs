//! Error handling for the barks-common crate.

use thiserror::Error;

/// Error type shared by the shuffle tracker, the block transfer scheduler and
/// the split servers.
///
/// Transient conditions (a busy mapper, an exhausted connection budget, a chat
/// session hitting its limits) are never represented here: they are ordinary
/// scheduling outcomes. Everything in this enum is reported to a caller.
#[derive(Error, Debug)]
pub enum ShuffleError {
    #[error("Invalid state transition for reducer {reducer_id}: {from} -> {to}")]
    InvalidTransition {
        reducer_id: String,
        from: String,
        to: String,
    },

    #[error("Shuffle {shuffle_id} already finished")]
    ShuffleAlreadyFinished { shuffle_id: String },

    #[error("Network operation failed: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Codec failure: {message}")]
    CodecError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("IO operation failed: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Protocol violation: {message}")]
    ProtocolError { message: String },

    #[error("Shuffle stage failed: {message}")]
    StageFailed {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Internal error: {message}")]
    InternalError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for shuffle operations.
pub type Result<T> = std::result::Result<T, ShuffleError>;

/// Error severity levels for categorizing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The caller may retry or pick another peer.
    Recoverable,
    /// The operation must be aborted but the process can continue.
    High,
    /// The shuffle stage cannot make progress.
    Fatal,
}

impl ShuffleError {
    pub fn invalid_transition(
        reducer_id: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            reducer_id: reducer_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn already_finished<S: Into<String>>(shuffle_id: S) -> Self {
        Self::ShuffleAlreadyFinished {
            shuffle_id: shuffle_id.into(),
        }
    }

    /// Create a network error with a custom message.
    pub fn network_error<S: Into<String>>(message: S) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with a custom message and source error.
    pub fn network_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn codec_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::CodecError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn io_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::IoError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a configuration error with a custom message.
    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: None,
        }
    }

    pub fn configuration_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn protocol_error<S: Into<String>>(message: S) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Create a stage failure. This is the only error that ends a shuffle.
    pub fn stage_failed<S: Into<String>>(message: S) -> Self {
        Self::StageFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn stage_failed_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::StageFailed {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
            source: None,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ShuffleError::InvalidTransition { .. } => ErrorSeverity::Recoverable,
            ShuffleError::NetworkError { .. } => ErrorSeverity::Recoverable,
            ShuffleError::IoError { .. } => ErrorSeverity::Recoverable,
            ShuffleError::ShuffleAlreadyFinished { .. } => ErrorSeverity::High,
            ShuffleError::CodecError { .. } => ErrorSeverity::High,
            ShuffleError::ProtocolError { .. } => ErrorSeverity::High,
            ShuffleError::ConfigurationError { .. } => ErrorSeverity::Fatal,
            ShuffleError::StageFailed { .. } => ErrorSeverity::Fatal,
            ShuffleError::InternalError { .. } => ErrorSeverity::Fatal,
        }
    }

    /// Whether a fresh attempt of the same operation may succeed.
    ///
    /// A finished shuffle is terminal: callers must not retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShuffleError::NetworkError { .. } | ShuffleError::IoError { .. }
        )
    }
}

impl From<std::io::Error> for ShuffleError {
    fn from(err: std::io::Error) -> Self {
        ShuffleError::io_error_with_source(err.to_string(), err)
    }
}
