use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    AGENT_DOCUMENT_TOKEN_BUDGET, AgentDocument, McpServer, MembershipStatus, Namespace, NamespaceAgent,
    NamespaceServerMembership, NamespaceToolMembership, PackageInstallRecord, Storage, StorageError, Tool,
    ToolOverrides, ToolUpsert,
};

/// In-memory implementation of the persistence port.
///
/// Single writer lock over all tables, so multi-table operations are atomic
/// the way a relational transaction would be. Locks are never held across an
/// await point.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    namespaces: HashMap<Uuid, Namespace>,
    servers: HashMap<Uuid, McpServer>,
    server_memberships: HashMap<(Uuid, Uuid), NamespaceServerMembership>,
    tools: HashMap<Uuid, Tool>,
    tools_by_key: HashMap<(Uuid, String), Uuid>,
    tool_memberships: HashMap<(Uuid, Uuid), NamespaceToolMembership>,
    agents: HashMap<Uuid, NamespaceAgent>,
    documents: Vec<AgentDocument>,
    install_history: Vec<PackageInstallRecord>,
}

impl MemoryStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn namespace(&self, uuid: Uuid) -> Result<Option<Namespace>, StorageError> {
        Ok(self.read().namespaces.get(&uuid).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StorageError> {
        let mut namespaces: Vec<_> = self.read().namespaces.values().cloned().collect();
        namespaces.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        Ok(namespaces)
    }

    async fn create_namespace(&self, namespace: Namespace) -> Result<(), StorageError> {
        self.write().namespaces.insert(namespace.uuid, namespace);
        Ok(())
    }

    async fn update_namespace(&self, namespace: Namespace) -> Result<(), StorageError> {
        let mut state = self.write();

        if !state.namespaces.contains_key(&namespace.uuid) {
            return Err(StorageError::NotFound { entity: "namespace" });
        }

        state.namespaces.insert(namespace.uuid, namespace);
        Ok(())
    }

    async fn delete_namespace(&self, uuid: Uuid) -> Result<(), StorageError> {
        let mut state = self.write();

        state.namespaces.remove(&uuid);
        state.server_memberships.retain(|(ns, _), _| *ns != uuid);
        state.tool_memberships.retain(|(ns, _), _| *ns != uuid);

        Ok(())
    }

    async fn server(&self, uuid: Uuid) -> Result<Option<McpServer>, StorageError> {
        Ok(self.read().servers.get(&uuid).cloned())
    }

    async fn create_server(&self, server: McpServer) -> Result<(), StorageError> {
        self.write().servers.insert(server.uuid, server);
        Ok(())
    }

    async fn namespace_servers(
        &self,
        namespace: Uuid,
    ) -> Result<Vec<(NamespaceServerMembership, McpServer)>, StorageError> {
        let state = self.read();

        let mut rows: Vec<_> = state
            .server_memberships
            .values()
            .filter(|m| m.namespace_uuid == namespace)
            .filter_map(|m| state.servers.get(&m.server_uuid).map(|s| (m.clone(), s.clone())))
            .collect();

        rows.sort_unstable_by(|(_, a), (_, b)| a.name.cmp(&b.name));

        Ok(rows)
    }

    async fn add_server_to_namespace(
        &self,
        namespace: Uuid,
        server: Uuid,
        status: MembershipStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.write();

        let ns = state
            .namespaces
            .get(&namespace)
            .ok_or(StorageError::NotFound { entity: "namespace" })?;

        let srv = state
            .servers
            .get(&server)
            .ok_or(StorageError::NotFound { entity: "server" })?;

        if ns.user_id.is_none() && srv.user_id.is_some() {
            return Err(StorageError::PublicNamespaceRequiresPublicServer);
        }

        state.server_memberships.insert(
            (namespace, server),
            NamespaceServerMembership {
                namespace_uuid: namespace,
                server_uuid: server,
                status,
            },
        );

        Ok(())
    }

    async fn set_server_status(
        &self,
        namespace: Uuid,
        server: Uuid,
        status: MembershipStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.write();

        let membership = state
            .server_memberships
            .get_mut(&(namespace, server))
            .ok_or(StorageError::NotFound { entity: "server membership" })?;

        membership.status = status;
        Ok(())
    }

    async fn tools_for_server(&self, server: Uuid) -> Result<Vec<Tool>, StorageError> {
        let mut tools: Vec<_> = self
            .read()
            .tools
            .values()
            .filter(|t| t.server_uuid == server)
            .cloned()
            .collect();

        tools.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        Ok(tools)
    }

    async fn upsert_tools(&self, tools: Vec<ToolUpsert>) -> Result<u64, StorageError> {
        let mut state = self.write();
        let mut created = 0;

        for upsert in tools {
            let key = (upsert.server_uuid, upsert.name.clone());

            match state.tools_by_key.get(&key).copied() {
                Some(uuid) => {
                    let tool = state
                        .tools
                        .get_mut(&uuid)
                        .ok_or_else(|| StorageError::Internal("tool index out of sync".to_string()))?;

                    tool.title = upsert.title;
                    tool.description = upsert.description;
                    tool.input_schema = upsert.input_schema;
                }
                None => {
                    let tool = Tool {
                        uuid: Uuid::new_v4(),
                        server_uuid: upsert.server_uuid,
                        name: upsert.name,
                        title: upsert.title,
                        description: upsert.description,
                        input_schema: upsert.input_schema,
                    };

                    state.tools_by_key.insert(key, tool.uuid);
                    state.tools.insert(tool.uuid, tool);
                    created += 1;
                }
            }
        }

        Ok(created)
    }

    async fn namespace_tool_memberships(&self, namespace: Uuid) -> Result<Vec<NamespaceToolMembership>, StorageError> {
        Ok(self
            .read()
            .tool_memberships
            .values()
            .filter(|m| m.namespace_uuid == namespace)
            .cloned()
            .collect())
    }

    async fn upsert_tool_memberships(
        &self,
        namespace: Uuid,
        memberships: Vec<(Uuid, Uuid)>,
    ) -> Result<u64, StorageError> {
        let mut state = self.write();
        let mut created = 0;

        for (tool, server) in memberships {
            match state.tool_memberships.get_mut(&(namespace, tool)) {
                Some(existing) => existing.status = MembershipStatus::Active,
                None => {
                    state.tool_memberships.insert(
                        (namespace, tool),
                        NamespaceToolMembership {
                            namespace_uuid: namespace,
                            tool_uuid: tool,
                            server_uuid: server,
                            status: MembershipStatus::Active,
                            overrides: ToolOverrides::default(),
                        },
                    );
                    created += 1;
                }
            }
        }

        Ok(created)
    }

    async fn set_tool_status(
        &self,
        namespace: Uuid,
        tool: Uuid,
        status: MembershipStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.write();

        let membership = state
            .tool_memberships
            .get_mut(&(namespace, tool))
            .ok_or(StorageError::NotFound { entity: "tool membership" })?;

        membership.status = status;
        Ok(())
    }

    async fn set_tool_overrides(
        &self,
        namespace: Uuid,
        tool: Uuid,
        overrides: ToolOverrides,
    ) -> Result<(), StorageError> {
        let mut state = self.write();

        if let Some(name) = overrides.name.as_deref() {
            let taken = state.tool_memberships.iter().any(|((ns, t), m)| {
                *ns == namespace && *t != tool && m.overrides.name.as_deref() == Some(name)
            });

            if taken {
                return Err(StorageError::OverrideNameTaken { name: name.to_string() });
            }
        }

        let membership = state
            .tool_memberships
            .get_mut(&(namespace, tool))
            .ok_or(StorageError::NotFound { entity: "tool membership" })?;

        membership.overrides = overrides;
        Ok(())
    }

    async fn agent(&self, uuid: Uuid) -> Result<Option<NamespaceAgent>, StorageError> {
        Ok(self.read().agents.get(&uuid).cloned())
    }

    async fn namespace_agents(&self, namespace: Uuid) -> Result<Vec<NamespaceAgent>, StorageError> {
        let mut agents: Vec<_> = self
            .read()
            .agents
            .values()
            .filter(|a| a.namespace_uuid == namespace)
            .cloned()
            .collect();

        agents.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        Ok(agents)
    }

    async fn create_agent(&self, agent: NamespaceAgent) -> Result<(), StorageError> {
        self.write().agents.insert(agent.uuid, agent);
        Ok(())
    }

    async fn update_agent(&self, agent: NamespaceAgent) -> Result<(), StorageError> {
        let mut state = self.write();

        if !state.agents.contains_key(&agent.uuid) {
            return Err(StorageError::NotFound { entity: "agent" });
        }

        state.agents.insert(agent.uuid, agent);
        Ok(())
    }

    async fn delete_agent(&self, uuid: Uuid) -> Result<(), StorageError> {
        let mut state = self.write();

        state.agents.remove(&uuid);
        state.documents.retain(|d| d.agent_uuid != uuid);

        for namespace in state.namespaces.values_mut() {
            if namespace.ask_agent_uuid == Some(uuid) {
                namespace.ask_agent_uuid = None;
            }
        }

        Ok(())
    }

    async fn agent_documents(&self, agent: Uuid) -> Result<Vec<AgentDocument>, StorageError> {
        Ok(self
            .read()
            .documents
            .iter()
            .filter(|d| d.agent_uuid == agent)
            .cloned()
            .collect())
    }

    async fn insert_agent_document(&self, document: AgentDocument) -> Result<(), StorageError> {
        let mut state = self.write();

        let current: u64 = state
            .documents
            .iter()
            .filter(|d| d.agent_uuid == document.agent_uuid)
            .map(|d| d.token_count)
            .sum();

        let total = current + document.token_count;

        if total > AGENT_DOCUMENT_TOKEN_BUDGET {
            return Err(StorageError::DocumentBudgetExceeded {
                total,
                limit: AGENT_DOCUMENT_TOKEN_BUDGET,
            });
        }

        state
            .documents
            .retain(|d| !(d.agent_uuid == document.agent_uuid && d.filename == document.filename));
        state.documents.push(document);

        Ok(())
    }

    async fn delete_agent_document(&self, agent: Uuid, filename: &str) -> Result<(), StorageError> {
        self.write()
            .documents
            .retain(|d| !(d.agent_uuid == agent && d.filename == filename));

        Ok(())
    }

    async fn append_install_record(&self, record: PackageInstallRecord) -> Result<(), StorageError> {
        self.write().install_history.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn namespace() -> Namespace {
        Namespace {
            uuid: Uuid::new_v4(),
            name: "test".to_string(),
            description: None,
            user_id: Some("user-1".to_string()),
            smart_discovery_enabled: false,
            smart_discovery_description: None,
            pinned_tools: Vec::new(),
            ask_agent_uuid: None,
        }
    }

    fn upsert(server: Uuid, name: &str) -> ToolUpsert {
        ToolUpsert {
            server_uuid: server,
            name: name.to_string(),
            title: None,
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn tool_upsert_is_idempotent() {
        let storage = MemoryStorage::new();
        let server = Uuid::new_v4();

        let created = storage
            .upsert_tools(vec![upsert(server, "read"), upsert(server, "write")])
            .await
            .unwrap();
        assert_eq!(created, 2);

        let created = storage
            .upsert_tools(vec![upsert(server, "read"), upsert(server, "write")])
            .await
            .unwrap();
        assert_eq!(created, 0);

        assert_eq!(storage.tools_for_server(server).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn override_names_are_unique_per_namespace() {
        let storage = MemoryStorage::new();
        let ns = Uuid::new_v4();
        let server = Uuid::new_v4();

        storage.upsert_tools(vec![upsert(server, "a"), upsert(server, "b")]).await.unwrap();
        let tools = storage.tools_for_server(server).await.unwrap();

        storage
            .upsert_tool_memberships(ns, tools.iter().map(|t| (t.uuid, server)).collect())
            .await
            .unwrap();

        let overrides = ToolOverrides {
            name: Some("renamed".to_string()),
            ..Default::default()
        };

        storage.set_tool_overrides(ns, tools[0].uuid, overrides.clone()).await.unwrap();

        let err = storage.set_tool_overrides(ns, tools[1].uuid, overrides).await.unwrap_err();
        assert!(matches!(err, StorageError::OverrideNameTaken { .. }));

        // Re-applying to the same tool is fine.
        let overrides = ToolOverrides {
            name: Some("renamed".to_string()),
            title: Some("Renamed".to_string()),
            ..Default::default()
        };
        storage.set_tool_overrides(ns, tools[0].uuid, overrides).await.unwrap();
    }

    #[tokio::test]
    async fn document_budget_leaves_set_unchanged() {
        let storage = MemoryStorage::new();
        let agent = Uuid::new_v4();

        let doc = |filename: &str, tokens: u64| AgentDocument {
            agent_uuid: agent,
            filename: filename.to_string(),
            mime: "text/plain".to_string(),
            content: "irrelevant".to_string(),
            token_count: tokens,
        };

        storage.insert_agent_document(doc("a.txt", 199_900)).await.unwrap();

        let err = storage.insert_agent_document(doc("b.txt", 200)).await.unwrap_err();
        assert!(matches!(err, StorageError::DocumentBudgetExceeded { total: 200_100, .. }));

        let docs = storage.agent_documents(agent).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].filename, "a.txt");

        // Up to the budget is fine.
        storage.insert_agent_document(doc("c.txt", 100)).await.unwrap();
        assert_eq!(storage.agent_documents(agent).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn public_namespace_rejects_private_server() {
        let storage = MemoryStorage::new();

        let mut ns = namespace();
        ns.user_id = None;
        let ns_uuid = ns.uuid;
        storage.create_namespace(ns).await.unwrap();

        let server = McpServer {
            uuid: Uuid::new_v4(),
            name: "private".to_string(),
            user_id: Some("user-1".to_string()),
            launch: crate::ServerLaunch::Stdio {
                command: "echo".to_string(),
                args: Vec::new(),
                env: Default::default(),
                inherit_env: false,
            },
        };
        let server_uuid = server.uuid;
        storage.create_server(server).await.unwrap();

        let err = storage
            .add_server_to_namespace(ns_uuid, server_uuid, MembershipStatus::Active)
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::PublicNamespaceRequiresPublicServer));
    }

    #[tokio::test]
    async fn delete_agent_detaches_from_namespace() {
        let storage = MemoryStorage::new();

        let mut ns = namespace();
        let agent = NamespaceAgent::new(ns.uuid, "helper", "gpt-4o-mini");
        ns.ask_agent_uuid = Some(agent.uuid);

        let ns_uuid = ns.uuid;
        let agent_uuid = agent.uuid;

        storage.create_namespace(ns).await.unwrap();
        storage.create_agent(agent).await.unwrap();

        storage.delete_agent(agent_uuid).await.unwrap();

        let ns = storage.namespace(ns_uuid).await.unwrap().unwrap();
        assert!(ns.ask_agent_uuid.is_none());
    }
}
