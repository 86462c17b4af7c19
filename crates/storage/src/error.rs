use thiserror::Error;

/// Errors surfaced by the persistence port.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A referenced entity does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Human-readable entity kind, e.g. "namespace".
        entity: &'static str,
    },

    /// The override name is already taken by another tool in the namespace.
    #[error("override name '{name}' is already in use in this namespace")]
    OverrideNameTaken {
        /// The conflicting override name.
        name: String,
    },

    /// Inserting the document would push the agent over its token budget.
    #[error("agent document budget exceeded: {total} tokens, limit is {limit}")]
    DocumentBudgetExceeded {
        /// Sum of token counts after the rejected insert.
        total: u64,
        /// The configured budget.
        limit: u64,
    },

    /// Public namespaces may only contain public servers.
    #[error("public namespaces may only contain public servers")]
    PublicNamespaceRequiresPublicServer,

    /// Anything else the backing store reports.
    #[error("storage error: {0}")]
    Internal(String),
}
