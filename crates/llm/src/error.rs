use thiserror::Error;

/// Errors from the chat and embedding ports.
#[derive(Debug, Error)]
pub enum LlmError {
    /// No API key is configured for the provider.
    #[error("No API key configured for the LLM provider")]
    MissingApiKey,

    /// Authentication failed (missing or invalid API key).
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid request parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Model not found at the provider.
    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Insufficient quota or credits.
    #[error("Insufficient quota: {0}")]
    InsufficientQuota(String),

    /// Provider API returned an error.
    #[error("Provider API error ({status}): {message}")]
    ProviderApiError {
        /// HTTP status reported by the provider.
        status: u16,
        /// Provider error body.
        message: String,
    },

    /// Network or connection error.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The provider answered but the payload was not what we asked for,
    /// e.g. the JSON-mode response did not parse.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// Internal error. If Some(message), it came from a provider and can be
    /// shown; if None it must not leak details.
    #[error("Internal LLM error")]
    InternalError(Option<String>),
}

impl LlmError {
    /// Map a non-success provider status and body to the matching variant.
    pub(crate) fn from_status(status: u16, message: String) -> Self {
        match status {
            400 => Self::InvalidRequest(message),
            401 => Self::AuthenticationFailed(message),
            403 => Self::InsufficientQuota(message),
            404 => Self::ModelNotFound(message),
            429 => Self::RateLimitExceeded(message),
            500 => Self::InternalError(Some(message)),
            _ => Self::ProviderApiError { status, message },
        }
    }
}
