use std::{error::Error as StdError, time::Duration};

/// Crate-wide result type for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a platform session for a single call.
///
/// The variants drive the delivery fallback chain: every variant except
/// `RateLimited` makes the pipeline fall through to its next strategy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    /// The platform asked us to slow down.
    #[error("rate limited, retry after {}ms", wait.as_millis())]
    RateLimited { wait: Duration },

    /// A rate limit signal survived the governor's single retry.
    #[error("rate limit persisted after retry ({}ms)", wait.as_millis())]
    RateLimitPersisted { wait: Duration },

    /// Recoverable fault (network, refusal, server error).
    #[error("transient platform error: {message}")]
    Transient { message: String },

    /// The content cannot be re-uploaded (type, size, encoding).
    #[error("unsupported content: {message}")]
    UnsupportedContent { message: String },

    /// The source message or chat is gone or no longer readable.
    #[error("source unavailable: {message}")]
    PermanentSource { message: String },

    /// The session does not offer this capability.
    #[error("operation not supported by this session: {operation}")]
    Unsupported { operation: &'static str },
}

impl PlatformError {
    #[must_use]
    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::Transient {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unsupported_content(message: impl std::fmt::Display) -> Self {
        Self::UnsupportedContent {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn permanent_source(message: impl std::fmt::Display) -> Self {
        Self::PermanentSource {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }
}

/// Typed relay errors surfaced to the supplying collaborator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed binding or missing credential. No delivery is attempted.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A binding references an account no session can be opened for.
    #[error("unknown account: {account_id}")]
    UnknownAccount { account_id: String },

    /// A platform call failed outside the delivery path.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// A persistence backend failed.
    #[error("store operation failed: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn configuration(message: impl std::fmt::Display) -> Self {
        Self::Configuration {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_account(account_id: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            account_id: account_id.to_string(),
        }
    }

    #[must_use]
    pub fn store(context: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether the failure belongs to the binding rather than the runtime.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::UnknownAccount { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_only_for_rate_limit() {
        let limited = PlatformError::RateLimited {
            wait: Duration::from_secs(3),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(PlatformError::transient("boom").retry_after(), None);
        assert_eq!(
            PlatformError::RateLimitPersisted {
                wait: Duration::from_secs(3)
            }
            .retry_after(),
            None
        );
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(Error::configuration("bad binding").is_configuration());
        assert!(Error::unknown_account("main").is_configuration());
        assert!(!Error::Platform(PlatformError::transient("x")).is_configuration());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::store(
            "insert record",
            std::io::Error::other("disk full"),
        );
        assert_eq!(
            err.to_string(),
            "store operation failed: insert record: disk full"
        );
    }
}
