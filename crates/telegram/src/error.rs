use {
    teloxide::{ApiError, RequestError},
    thiserror::Error,
};

use threadrelay_core::PlatformError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Telegram(#[from] RequestError),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for PlatformError {
    fn from(error: Error) -> Self {
        match error {
            Error::Telegram(e) => platform_error(&e),
            Error::Reqwest(e) => reqwest_error(&e),
            Error::Message { message } => PlatformError::transient(message),
        }
    }
}

/// Map a Bot API failure onto the relay's fallback classes.
pub fn platform_error(error: &RequestError) -> PlatformError {
    match error {
        RequestError::RetryAfter(wait) => PlatformError::RateLimited {
            wait: wait.duration(),
        },
        RequestError::Api(api) => api_error(api),
        RequestError::MigrateToChatId(_) => {
            PlatformError::permanent_source("chat was migrated to a supergroup")
        },
        // Network, I/O and undecodable responses.
        _ => PlatformError::transient(error),
    }
}

fn api_error(error: &ApiError) -> PlatformError {
    match error {
        ApiError::BotBlocked | ApiError::ChatNotFound | ApiError::MessageToForwardNotFound => {
            PlatformError::permanent_source(error)
        },
        _ => classify_description(&error.to_string()),
    }
}

/// Classify a Bot API error description. The API reports most failures as
/// free-form text, so the class is picked from well-known phrases.
pub fn classify_description(description: &str) -> PlatformError {
    let lower = description.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if contains_any(&[
        "too big",
        "too large",
        "wrong file",
        "file_id",
        "invalid file",
        "photo_invalid_dimensions",
        "photo_save_file_invalid",
        "wrong type of the web page content",
        "failed to get http url content",
    ]) {
        PlatformError::unsupported_content(description)
    } else if contains_any(&[
        "not found",
        "forbidden",
        "message can't be copied",
        "message can't be forwarded",
        "have no rights",
        "not enough rights",
        "kicked",
        "chat_admin_required",
    ]) {
        PlatformError::permanent_source(description)
    } else {
        PlatformError::transient(description)
    }
}

pub(crate) fn reqwest_error(error: &reqwest::Error) -> PlatformError {
    match error.status() {
        Some(status) if status == reqwest::StatusCode::NOT_FOUND => {
            PlatformError::permanent_source(error)
        },
        Some(status) if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE => {
            PlatformError::unsupported_content(error)
        },
        _ => PlatformError::transient(error),
    }
}

/// Edits that leave the text unchanged are reported as errors by the API.
pub(crate) fn is_message_not_modified(error: &RequestError) -> bool {
    matches!(error, RequestError::Api(ApiError::MessageNotModified))
}

/// Another process is polling with the same token.
pub(crate) fn is_conflict(error: &RequestError) -> bool {
    matches!(error, RequestError::Api(ApiError::TerminatedByOtherGetUpdates))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, std::time::Duration};

    #[test]
    fn retry_after_becomes_rate_limited() {
        let err = RequestError::RetryAfter(teloxide::types::Seconds::from_seconds(42));
        assert_eq!(
            platform_error(&err).retry_after(),
            Some(Duration::from_secs(42))
        );
    }

    #[test]
    fn io_failures_are_transient() {
        let err = RequestError::Io(std::io::Error::other("connection reset"));
        assert!(matches!(
            platform_error(&err),
            PlatformError::Transient { .. }
        ));
    }

    #[test]
    fn missing_forward_source_is_permanent() {
        let err = RequestError::Api(ApiError::MessageToForwardNotFound);
        assert!(matches!(
            platform_error(&err),
            PlatformError::PermanentSource { .. }
        ));
    }

    #[rstest]
    #[case("Bad Request: file is too big", "unsupported")]
    #[case("Request Entity Too Large", "unsupported")]
    #[case("Bad Request: wrong file identifier/HTTP URL specified", "unsupported")]
    #[case("Bad Request: PHOTO_INVALID_DIMENSIONS", "unsupported")]
    #[case("Bad Request: message to copy not found", "permanent")]
    #[case("Forbidden: bot was kicked from the channel chat", "permanent")]
    #[case("Bad Request: message can't be copied", "permanent")]
    #[case("Bad Gateway", "transient")]
    #[case("Internal Server Error", "transient")]
    fn descriptions_are_classified(#[case] description: &str, #[case] class: &str) {
        let got = match classify_description(description) {
            PlatformError::UnsupportedContent { .. } => "unsupported",
            PlatformError::PermanentSource { .. } => "permanent",
            PlatformError::Transient { .. } => "transient",
            other => panic!("unexpected class: {other:?}"),
        };
        assert_eq!(got, class, "{description}");
    }

    #[test]
    fn not_modified_is_detected() {
        assert!(is_message_not_modified(&RequestError::Api(
            ApiError::MessageNotModified
        )));
        assert!(!is_message_not_modified(&RequestError::Api(
            ApiError::BotBlocked
        )));
    }

    #[test]
    fn conflict_is_detected() {
        assert!(is_conflict(&RequestError::Api(
            ApiError::TerminatedByOtherGetUpdates
        )));
        assert!(!is_conflict(&RequestError::Api(ApiError::BotBlocked)));
    }
}
