use thiserror::Error;

/// Everything the checkout adapter can fail with.
///
/// Nothing that touches money movement is swallowed: every variant reaches
/// the caller.
#[derive(Error, Debug)]
pub enum CheckoutError {
    /// Missing or unusable credentials/settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Caller-supplied order data is malformed. No request was sent.
    #[error("validation error: {0}")]
    Validation(String),

    /// The provider rejected the request or could not be reached.
    /// `status` is `None` for transport-level failures.
    #[error("provider error{}: {message}", status_suffix(.status))]
    Provider { status: Option<u16>, message: String },

    /// No response within the configured timeout. Safe to retry with the
    /// same idempotency key.
    #[error("provider did not respond within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("payment {0} not found")]
    NotFound(String),
}

impl CheckoutError {
    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Rate limiting, 5xx and transport failures. A timeout is not retried
    /// here: the caller's time budget is already spent.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Provider { status: None, .. } => true,
            Self::Provider {
                status: Some(code), ..
            } => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, CheckoutError>;
