use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    AgentDocument, McpServer, MembershipStatus, Namespace, NamespaceAgent, NamespaceServerMembership,
    NamespaceToolMembership, PackageInstallRecord, StorageError, Tool, ToolOverrides, ToolUpsert,
};

/// The persistence port the core consumes.
///
/// Bulk upserts are transactional: either every row lands or none does.
/// Implementations own the data invariants (override-name uniqueness per
/// namespace, the agent document token budget, public namespaces containing
/// only public servers) and report violations as [`StorageError`] values.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a namespace by id.
    async fn namespace(&self, uuid: Uuid) -> Result<Option<Namespace>, StorageError>;

    /// List all namespaces.
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StorageError>;

    /// Create a namespace.
    async fn create_namespace(&self, namespace: Namespace) -> Result<(), StorageError>;

    /// Replace a namespace row.
    async fn update_namespace(&self, namespace: Namespace) -> Result<(), StorageError>;

    /// Delete a namespace and its memberships.
    async fn delete_namespace(&self, uuid: Uuid) -> Result<(), StorageError>;

    /// Fetch a server by id.
    async fn server(&self, uuid: Uuid) -> Result<Option<McpServer>, StorageError>;

    /// Register a server.
    async fn create_server(&self, server: McpServer) -> Result<(), StorageError>;

    /// Server memberships of a namespace, joined with the server rows.
    async fn namespace_servers(&self, namespace: Uuid)
    -> Result<Vec<(NamespaceServerMembership, McpServer)>, StorageError>;

    /// Add a server to a namespace. Rejects private servers in public
    /// namespaces.
    async fn add_server_to_namespace(
        &self,
        namespace: Uuid,
        server: Uuid,
        status: MembershipStatus,
    ) -> Result<(), StorageError>;

    /// Flip a server membership between active and inactive.
    async fn set_server_status(
        &self,
        namespace: Uuid,
        server: Uuid,
        status: MembershipStatus,
    ) -> Result<(), StorageError>;

    /// Tools persisted for a server.
    async fn tools_for_server(&self, server: Uuid) -> Result<Vec<Tool>, StorageError>;

    /// Bulk upsert tools, keyed by `(server_uuid, name)`. Returns how many
    /// rows were newly created.
    async fn upsert_tools(&self, tools: Vec<ToolUpsert>) -> Result<u64, StorageError>;

    /// Tool memberships of a namespace.
    async fn namespace_tool_memberships(&self, namespace: Uuid)
    -> Result<Vec<NamespaceToolMembership>, StorageError>;

    /// Bulk upsert tool memberships with status ACTIVE. Returns how many
    /// rows were newly created.
    async fn upsert_tool_memberships(
        &self,
        namespace: Uuid,
        memberships: Vec<(Uuid, Uuid)>,
    ) -> Result<u64, StorageError>;

    /// Flip a tool membership between active and inactive.
    async fn set_tool_status(&self, namespace: Uuid, tool: Uuid, status: MembershipStatus)
    -> Result<(), StorageError>;

    /// Replace the overrides of a tool membership. Rejects an override name
    /// already used by another tool in the namespace.
    async fn set_tool_overrides(
        &self,
        namespace: Uuid,
        tool: Uuid,
        overrides: ToolOverrides,
    ) -> Result<(), StorageError>;

    /// Fetch an agent by id.
    async fn agent(&self, uuid: Uuid) -> Result<Option<NamespaceAgent>, StorageError>;

    /// Agents of a namespace.
    async fn namespace_agents(&self, namespace: Uuid) -> Result<Vec<NamespaceAgent>, StorageError>;

    /// Create an agent.
    async fn create_agent(&self, agent: NamespaceAgent) -> Result<(), StorageError>;

    /// Replace an agent row.
    async fn update_agent(&self, agent: NamespaceAgent) -> Result<(), StorageError>;

    /// Delete an agent and its documents.
    async fn delete_agent(&self, uuid: Uuid) -> Result<(), StorageError>;

    /// Documents of an agent.
    async fn agent_documents(&self, agent: Uuid) -> Result<Vec<AgentDocument>, StorageError>;

    /// Insert a document. Fails with `DocumentBudgetExceeded` when the sum of
    /// token counts would pass the budget; the document set is unchanged on
    /// failure.
    async fn insert_agent_document(&self, document: AgentDocument) -> Result<(), StorageError>;

    /// Delete a document by file name.
    async fn delete_agent_document(&self, agent: Uuid, filename: &str) -> Result<(), StorageError>;

    /// Append an install-helper audit row. Write path only; the core never
    /// reads these back.
    async fn append_install_record(&self, record: PackageInstallRecord) -> Result<(), StorageError>;
}
