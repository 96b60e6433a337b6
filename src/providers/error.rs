use std::fmt;

/// Classified provider error — tells the caller *why* the LLM call failed so
/// it can pick the right recovery: retry, fail over, or surface.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from 429 Retry-After).
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 429 — back off, optionally honoring retry_after_secs.
    RateLimited,
    /// 5xx — provider-side outage; failover candidate.
    Overloaded,
    /// 4xx other than 429 — bad request, bad key, bad model. Not retryable.
    InvalidRequest,
    /// Deadline expired or the request was cancelled.
    Canceled,
    /// Connection refused, DNS failure, reset.
    Network,
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            429 => ProviderErrorKind::RateLimited,
            500..=599 => ProviderErrorKind::Overloaded,
            400..=499 => ProviderErrorKind::InvalidRequest,
            _ => ProviderErrorKind::Unknown,
        };
        let retry_after_secs = if kind == ProviderErrorKind::RateLimited {
            extract_retry_after(body)
        } else {
            None
        };
        Self { kind, status: Some(status), message: truncate_body(body), retry_after_secs }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Canceled
        } else {
            ProviderErrorKind::Network
        };
        Self { kind, status: None, message: err.to_string(), retry_after_secs: None }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Canceled,
            status: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Overloaded,
            status: Some(503),
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            status: Some(429),
            message: message.into(),
            retry_after_secs,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::InvalidRequest,
            status: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Overloaded
                | ProviderErrorKind::Network
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "Provider error ({}, {:?}): {}", status, self.kind, self.message)
        } else {
            write!(f, "Provider error ({:?}): {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

/// Parse retry_after out of a JSON error body.
/// Handles {"error": {"retry_after": 5}} and {"retry_after": 5}.
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
}

fn truncate_body(body: &str) -> String {
    if body.len() > 300 {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < 300)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}
