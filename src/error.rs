use thiserror::Error;

/// Errors that make a cache unusable at construction time.
///
/// These are never tolerated at runtime; a misconfigured cache refuses to
/// start instead of silently degrading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("duplicate variant dimension `{name}`")]
    DuplicateDimension { name: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }

    pub fn duplicate_dimension(name: impl Into<String>) -> Self {
        Self::DuplicateDimension { name: name.into() }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

/// Key-value store failures.
///
/// The engine treats every one of these as a cache miss: a broken store
/// must never break the response, only the caching of it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {message}")]
    Backend { message: String },
    #[error("stored value could not be decoded: {message}")]
    Codec { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }
}
