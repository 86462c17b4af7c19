use rmcp::model::{CallToolRequestMethod, ErrorCode, ErrorData};
use storage::StorageError;
use thiserror::Error;

/// Error kinds of the gateway core, independent of transport.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Input failed schema or constraint validation. Never retried.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The caller lacks rights on a namespace or server. Never logged at
    /// error level.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// A referenced entity is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Upstream connect failure or transport reset. Bounded retry on attach,
    /// never on a tool call.
    #[error("Upstream connection failed: {0}")]
    UpstreamTransient(String),

    /// The upstream rejected the call; returned to the downstream as-is.
    #[error("Upstream rejected the call: {}", .0.message)]
    UpstreamFatal(ErrorData),

    /// A token or document budget was tripped before any work was done.
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The ask-agent refused a tool. Recorded in the run report; the run
    /// itself continues.
    #[error("Tool not allowed: {0}")]
    PolicyDenied(String),

    /// Anything else. Logged with detail, surfaced as a generic message.
    #[error("Internal error")]
    Internal(String),
}

impl GatewayError {
    /// Map to the MCP error representation at the protocol boundary.
    pub fn into_error_data(self) -> ErrorData {
        match self {
            Self::Validation(message) => ErrorData::invalid_params(message, None),
            Self::Authorization(message) => ErrorData::new(ErrorCode::INVALID_REQUEST, message, None),
            Self::NotFound(_) => ErrorData::method_not_found::<CallToolRequestMethod>(),
            Self::UpstreamTransient(message) => ErrorData::internal_error(message, None),
            Self::UpstreamFatal(data) => data,
            Self::BudgetExceeded(message) => ErrorData::invalid_params(message, None),
            Self::PolicyDenied(message) => ErrorData::invalid_params(message, None),
            Self::Internal(message) => {
                log::error!("Internal gateway error: {message}");
                ErrorData::internal_error("Internal error", None)
            }
        }
    }
}

impl From<StorageError> for GatewayError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound { entity } => Self::NotFound(entity.to_string()),
            StorageError::DocumentBudgetExceeded { total, limit } => {
                Self::BudgetExceeded(format!("document budget exceeded: {total} tokens, limit is {limit}"))
            }
            StorageError::OverrideNameTaken { name } => {
                Self::Validation(format!("override name '{name}' is already in use"))
            }
            StorageError::PublicNamespaceRequiresPublicServer => {
                Self::Validation("public namespaces may only contain public servers".to_string())
            }
            StorageError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<llm::LlmError> for GatewayError {
    fn from(error: llm::LlmError) -> Self {
        use llm::LlmError;

        match error {
            LlmError::MissingApiKey => Self::Validation("No API key configured for the LLM provider".to_string()),
            LlmError::InvalidRequest(message) => Self::Validation(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_invalid_params() {
        let data = GatewayError::Validation("missing query".to_string()).into_error_data();
        assert_eq!(data.code, ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn upstream_fatal_passes_through() {
        let upstream = ErrorData::invalid_params("bad sql", None);
        let data = GatewayError::UpstreamFatal(upstream.clone()).into_error_data();

        assert_eq!(data.code, upstream.code);
        assert_eq!(data.message, upstream.message);
    }

    #[test]
    fn budget_errors_from_storage_keep_their_kind() {
        let error: GatewayError = StorageError::DocumentBudgetExceeded {
            total: 200_100,
            limit: 200_000,
        }
        .into();

        assert!(matches!(error, GatewayError::BudgetExceeded(_)));
    }
}
