//! Entities and the persistence port consumed by the MetaMCP core.
//!
//! The relational store itself lives outside this repository; the core talks
//! to it exclusively through the [`Storage`] trait. [`MemoryStorage`] is the
//! reference implementation used by tests and single-process deployments.

#![deny(missing_docs)]

mod error;
mod memory;
mod model;
mod port;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use model::{
    AgentDocument, McpServer, MembershipStatus, Namespace, NamespaceAgent, NamespaceServerMembership,
    NamespaceToolMembership, PackageInstallRecord, ServerLaunch, Tool, ToolOverrides, ToolUpsert,
};
pub use port::Storage;

/// Maximum sum of document token counts a single agent may hold.
pub const AGENT_DOCUMENT_TOKEN_BUDGET: u64 = 200_000;
