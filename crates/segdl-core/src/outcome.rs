//! Result of one attempt at a piece or a download

use segdl_types::StatusCode;
use std::fmt;
use std::time::Duration;

/// The final status of an attempt, with a human-readable message and the
/// underlying cause when there is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    status: StatusCode,
    message: Option<String>,
    cause: Option<String>,
    retry_after: Option<Duration>,
}

impl Outcome {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            cause: None,
            retry_after: None,
        }
    }

    pub fn success() -> Self {
        Self {
            status: StatusCode::Success,
            message: None,
            cause: None,
            retry_after: None,
        }
    }

    pub fn stopped() -> Self {
        Self::new(StatusCode::Stopped, "Download stopped")
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Attach a server-advised delay (from `Retry-After`)
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Message and cause joined for storage on a record
    pub fn describe(&self) -> Option<String> {
        match (&self.message, &self.cause) {
            (Some(msg), Some(cause)) => Some(format!("{}: {}", msg, cause)),
            (Some(msg), None) => Some(msg.clone()),
            (None, Some(cause)) => Some(cause.clone()),
            (None, None) => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(text) => write!(f, "{} ({})", self.status, text),
            None => write!(f, "{}", self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_joins_message_and_cause() {
        let outcome = Outcome::new(StatusCode::FileError, "Write failed").with_cause("disk full");
        assert_eq!(outcome.describe().as_deref(), Some("Write failed: disk full"));
        assert_eq!(outcome.to_string(), "file_error (Write failed: disk full)");
        assert_eq!(Outcome::success().describe(), None);
    }
}
