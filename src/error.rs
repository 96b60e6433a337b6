use std::fmt;

use uuid::Uuid;

/// Recovery policy classification for surfaced errors.
///
/// The kind decides what the caller does next: transient errors go through
/// bounded retry, domain/safety errors surface immediately, resource errors
/// abort the step but keep partial results, fatal errors stop accepting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network timeout, 5xx, KV/SQL connection loss.
    Transient,
    /// Invalid task spec, unknown tool, schema mismatch, expression out of grammar.
    Domain,
    /// Verifier rejection, deny-listed command, quota exceeded.
    Safety,
    /// Step budget exhausted, sandbox CPU/memory ceiling.
    Resource,
    /// Corrupted persistent state, missing required schema.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Domain => "domain",
            ErrorKind::Safety => "safety",
            ErrorKind::Resource => "resource",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{}", name)
    }
}

/// A classified error carrying both a user-facing line and operator detail.
///
/// The operator message lands in the decision log; the user message is what
/// the transport renders (translated by the caller when needed).
#[derive(Debug, thiserror::Error)]
#[error("[{kind}:{correlation_id}] {operator_message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub user_message: String,
    pub operator_message: String,
    pub correlation_id: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, user_message: impl Into<String>, operator_message: impl Into<String>) -> Self {
        Self {
            kind,
            user_message: user_message.into(),
            operator_message: operator_message.into(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn transient(operator_message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Transient,
            "Something went wrong on my side. I'll retry shortly.",
            operator_message,
        )
    }

    pub fn domain(user_message: impl Into<String>, operator_message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Domain, user_message, operator_message)
    }

    pub fn safety(user_message: impl Into<String>, operator_message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Safety, user_message, operator_message)
    }

    pub fn resource(operator_message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Resource,
            "That step ran over its budget, so I stopped it.",
            operator_message,
        )
    }

    pub fn fatal(operator_message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Fatal,
            "I hit an internal storage problem and paused writes. The operator has been notified.",
            operator_message,
        )
    }

    /// Only transient errors are eligible for the bounded-retry policy.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable_others_are_not() {
        assert!(CoreError::transient("socket reset").is_retryable());
        assert!(!CoreError::domain("bad task", "interval < 1s").is_retryable());
        assert!(!CoreError::safety("refused", "denylist:rm -rf").is_retryable());
        assert!(!CoreError::resource("step budget exhausted").is_retryable());
        assert!(!CoreError::fatal("schema missing").is_retryable());
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = CoreError::transient("x");
        let b = CoreError::transient("x");
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn display_includes_kind_and_operator_detail() {
        let e = CoreError::domain("bad cron", "invalid cron expression '61 * * * *'");
        let rendered = e.to_string();
        assert!(rendered.contains("domain"));
        assert!(rendered.contains("invalid cron expression"));
    }
}
