//! The control-plane operations the core consumes, with their invalidation
//! contracts.
//!
//! The network surface (authentication, RPC encoding) lives outside this
//! repository; this service is the seam it calls into. Every mutation
//! triggers the cache and pool invalidations the runtime components expect,
//! so a change is observed by the next attach or the next listing.

use std::sync::Arc;

use llm::TokenCounter;
use storage::{
    AgentDocument, McpServer, MembershipStatus, Namespace, NamespaceAgent, Storage, ToolOverrides,
};
use uuid::Uuid;

use crate::{
    aggregator::{self, RefreshSummary, ReportedTool},
    discovery::{SmartDiscovery, index::DiscoveryIndex},
    error::GatewayError,
    overrides::OverrideLayer,
    pool::{NamespacePool, UpstreamPool},
};

/// Service struct wiring storage mutations to their invalidations.
pub struct ControlPlane {
    storage: Arc<dyn Storage>,
    overrides: Arc<OverrideLayer>,
    discovery: Option<Arc<SmartDiscovery>>,
    index: Option<Arc<DiscoveryIndex>>,
    pools: Arc<NamespacePool>,
    upstream_pool: Arc<UpstreamPool>,
    tokens: Arc<TokenCounter>,
}

impl ControlPlane {
    /// A service over the given collaborators.
    pub fn new(
        storage: Arc<dyn Storage>,
        overrides: Arc<OverrideLayer>,
        discovery: Option<Arc<SmartDiscovery>>,
        index: Option<Arc<DiscoveryIndex>>,
        pools: Arc<NamespacePool>,
        upstream_pool: Arc<UpstreamPool>,
        tokens: Arc<TokenCounter>,
    ) -> Self {
        Self {
            storage,
            overrides,
            discovery,
            index,
            pools,
            upstream_pool,
            tokens,
        }
    }

    /// Everything a namespace change can stale out.
    fn invalidate_namespace(&self, namespace: Uuid) {
        self.overrides.invalidate(namespace);

        if let Some(discovery) = &self.discovery {
            discovery.invalidate_status(namespace);
        }

        self.pools.invalidate_idle(namespace);
        self.pools.invalidate_derived(&[namespace]);
    }

    /// Create a namespace and start building its idle session in the
    /// background.
    pub async fn create_namespace(&self, namespace: Namespace) -> Result<(), GatewayError> {
        let uuid = namespace.uuid;
        self.storage.create_namespace(namespace).await?;
        self.pools.ensure_idle(uuid);

        Ok(())
    }

    /// Replace a namespace row.
    pub async fn update_namespace(&self, namespace: Namespace) -> Result<(), GatewayError> {
        let uuid = namespace.uuid;
        self.storage.update_namespace(namespace).await?;
        self.invalidate_namespace(uuid);

        Ok(())
    }

    /// Delete a namespace, its pool entries and its discovery index.
    pub async fn delete_namespace(&self, namespace: Uuid) -> Result<(), GatewayError> {
        self.storage.delete_namespace(namespace).await?;

        self.overrides.invalidate(namespace);
        self.pools.cleanup_idle(namespace);

        if let Some(discovery) = &self.discovery {
            discovery.invalidate_status(namespace);
        }

        if let Some(index) = &self.index {
            index.clear_namespace_cache(namespace);
        }

        Ok(())
    }

    /// Register a server.
    pub async fn create_server(&self, server: McpServer) -> Result<(), GatewayError> {
        self.storage.create_server(server).await?;
        Ok(())
    }

    /// Add a server to a namespace.
    pub async fn add_server_to_namespace(
        &self,
        namespace: Uuid,
        server: Uuid,
        status: MembershipStatus,
    ) -> Result<(), GatewayError> {
        self.storage.add_server_to_namespace(namespace, server, status).await?;
        self.invalidate_namespace(namespace);

        Ok(())
    }

    /// Flip a server membership between active and inactive.
    pub async fn set_server_status(
        &self,
        namespace: Uuid,
        server: Uuid,
        status: MembershipStatus,
    ) -> Result<(), GatewayError> {
        self.storage.set_server_status(namespace, server, status).await?;

        if status == MembershipStatus::Inactive {
            self.upstream_pool.invalidate(server);
        }

        self.invalidate_namespace(namespace);

        Ok(())
    }

    /// Flip a tool membership between active and inactive.
    pub async fn set_tool_status(
        &self,
        namespace: Uuid,
        tool: Uuid,
        status: MembershipStatus,
    ) -> Result<(), GatewayError> {
        self.storage.set_tool_status(namespace, tool, status).await?;
        self.invalidate_namespace(namespace);

        Ok(())
    }

    /// Replace the overrides of a tool membership.
    pub async fn set_tool_overrides(
        &self,
        namespace: Uuid,
        tool: Uuid,
        overrides: ToolOverrides,
    ) -> Result<(), GatewayError> {
        self.storage.set_tool_overrides(namespace, tool, overrides).await?;
        self.invalidate_namespace(namespace);

        Ok(())
    }

    /// Agents of a namespace.
    pub async fn list_agents(&self, namespace: Uuid) -> Result<Vec<NamespaceAgent>, GatewayError> {
        Ok(self.storage.namespace_agents(namespace).await?)
    }

    /// Create an agent.
    pub async fn create_agent(&self, agent: NamespaceAgent) -> Result<(), GatewayError> {
        self.storage.create_agent(agent).await?;
        Ok(())
    }

    /// Replace an agent row.
    pub async fn update_agent(&self, agent: NamespaceAgent) -> Result<(), GatewayError> {
        let namespace = agent.namespace_uuid;
        self.storage.update_agent(agent).await?;

        if let Some(discovery) = &self.discovery {
            discovery.invalidate_status(namespace);
        }

        Ok(())
    }

    /// Delete an agent and its documents.
    pub async fn delete_agent(&self, agent: Uuid) -> Result<(), GatewayError> {
        let namespace = self.storage.agent(agent).await?.map(|a| a.namespace_uuid);
        self.storage.delete_agent(agent).await?;

        if let (Some(discovery), Some(namespace)) = (&self.discovery, namespace) {
            discovery.invalidate_status(namespace);
        }

        Ok(())
    }

    /// Point a namespace at its active ask agent (or detach it).
    pub async fn set_active_ask_agent(&self, namespace: Uuid, agent: Option<Uuid>) -> Result<(), GatewayError> {
        let mut ns = self
            .storage
            .namespace(namespace)
            .await?
            .ok_or_else(|| GatewayError::NotFound("namespace".to_string()))?;

        if let Some(agent_uuid) = agent {
            let agent_row = self
                .storage
                .agent(agent_uuid)
                .await?
                .ok_or_else(|| GatewayError::NotFound("agent".to_string()))?;

            if agent_row.namespace_uuid != namespace {
                return Err(GatewayError::Validation(
                    "agent belongs to a different namespace".to_string(),
                ));
            }
        }

        ns.ask_agent_uuid = agent;
        self.storage.update_namespace(ns).await?;

        if let Some(discovery) = &self.discovery {
            discovery.invalidate_status(namespace);
        }

        Ok(())
    }

    /// Documents of an agent.
    pub async fn list_documents(&self, agent: Uuid) -> Result<Vec<AgentDocument>, GatewayError> {
        Ok(self.storage.agent_documents(agent).await?)
    }

    /// Upload a reference document, counting its tokens under the agent's
    /// model. Fails with `BudgetExceeded` past 200 000 combined tokens and
    /// leaves the document set unchanged.
    pub async fn upload_document(
        &self,
        agent: Uuid,
        filename: String,
        mime: String,
        content: String,
    ) -> Result<AgentDocument, GatewayError> {
        let agent_row = self
            .storage
            .agent(agent)
            .await?
            .ok_or_else(|| GatewayError::NotFound("agent".to_string()))?;

        let token_count = self.tokens.count(&agent_row.model, &content) as u64;

        let document = AgentDocument {
            agent_uuid: agent,
            filename,
            mime,
            content,
            token_count,
        };

        self.storage.insert_agent_document(document.clone()).await?;

        Ok(document)
    }

    /// Delete a document by file name.
    pub async fn delete_document(&self, agent: Uuid, filename: &str) -> Result<(), GatewayError> {
        self.storage.delete_agent_document(agent, filename).await?;
        Ok(())
    }

    /// Sync the persisted tools of a namespace with what a downstream
    /// client saw, then stale out everything that cached the old registry.
    pub async fn refresh_tools(
        &self,
        namespace: Uuid,
        reported: Vec<ReportedTool>,
    ) -> Result<RefreshSummary, GatewayError> {
        let overrides = self.overrides.load(namespace).await?;

        let summary = aggregator::refresh_tools(self.storage.as_ref(), &overrides, namespace, reported).await?;

        self.pools.invalidate_idle(namespace);
        self.pools.invalidate_derived(&[namespace]);
        self.overrides.invalidate(namespace);

        log::debug!(
            "Tool refresh for namespace {namespace}: {} tool(s) created, {} mapping(s) created",
            summary.tools_created,
            summary.mappings_created
        );

        Ok(summary)
    }
}
