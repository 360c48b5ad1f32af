use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("action failed: {0}")]
    Action(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("screenshot failed: {0}")]
    Screenshot(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrowserError {
    /// Rate-limit responses are backpressure events for the runner's
    /// governor, not page failures.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            BrowserError::RateLimited(_) => true,
            BrowserError::Navigation { reason, .. } => looks_rate_limited(reason),
            BrowserError::Unexpected(message) => looks_rate_limited(message),
            _ => false,
        }
    }
}

fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detection_covers_status_and_text() {
        assert!(BrowserError::RateLimited("HTTP 429".into()).is_rate_limit());
        assert!(BrowserError::Navigation {
            url: "https://x.com".into(),
            reason: "server replied: Too Many Requests".into(),
        }
        .is_rate_limit());
        assert!(!BrowserError::Timeout("landmark".into()).is_rate_limit());
    }
}
