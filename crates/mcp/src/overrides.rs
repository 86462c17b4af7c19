//! Namespace-scoped tool-name overrides.

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use dashmap::DashMap;
use rmcp::model::{Tool, ToolAnnotations};
use storage::{MembershipStatus, Storage};
use uuid::Uuid;

use crate::{
    error::GatewayError,
    middleware::{CallToolHandler, ListToolsHandler, ToolMiddleware},
};

/// Compiled override maps of one namespace.
#[derive(Default)]
pub struct NamespaceOverrides {
    /// override name → canonical full name, for incoming calls.
    to_original: HashMap<String, String>,
    /// canonical full name → overrides, for outgoing listings.
    by_original: HashMap<String, storage::ToolOverrides>,
}

impl NamespaceOverrides {
    /// Resolve an incoming name: override names map back to the canonical
    /// full name, everything else passes through.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.to_original.get(name).map(String::as_str)
    }

    /// Rewrite one listed tool in place when an override exists for it.
    pub fn apply(&self, tool: &mut Tool) {
        let Some(overrides) = self.by_original.get(tool.name.as_ref()) else {
            return;
        };

        if let Some(name) = &overrides.name {
            tool.name = Cow::Owned(name.clone());
        }

        if let Some(description) = &overrides.description {
            tool.description = Some(Cow::Owned(description.clone()));
        }

        if let Some(annotations) = &overrides.annotations {
            match serde_json::from_value::<ToolAnnotations>(annotations.clone()) {
                Ok(parsed) => tool.annotations = Some(parsed),
                Err(e) => log::warn!("Ignoring malformed override annotations: {e}"),
            }
        }

        if let Some(title) = &overrides.title {
            let annotations = tool.annotations.get_or_insert_with(ToolAnnotations::new);
            annotations.title = Some(title.clone());
        }
    }
}

/// Per-namespace override cache over the persistence port.
///
/// Maps are compiled from active tool memberships on first use and dropped
/// whenever the control plane touches overrides, memberships or the
/// namespace itself.
pub struct OverrideLayer {
    storage: Arc<dyn Storage>,
    cache: DashMap<Uuid, Arc<NamespaceOverrides>>,
}

impl OverrideLayer {
    /// A layer with an empty cache.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
        }
    }

    /// Drop the compiled maps of a namespace.
    pub fn invalidate(&self, namespace: Uuid) {
        if self.cache.remove(&namespace).is_some() {
            log::debug!("Invalidated override cache for namespace {namespace}");
        }
    }

    /// Get or compile the override maps of a namespace.
    pub async fn load(&self, namespace: Uuid) -> Result<Arc<NamespaceOverrides>, GatewayError> {
        if let Some(cached) = self.cache.get(&namespace) {
            return Ok(cached.value().clone());
        }

        let compiled = Arc::new(self.compile(namespace).await?);
        self.cache.insert(namespace, compiled.clone());

        Ok(compiled)
    }

    async fn compile(&self, namespace: Uuid) -> Result<NamespaceOverrides, GatewayError> {
        let memberships = self.storage.namespace_tool_memberships(namespace).await?;
        let servers = self.storage.namespace_servers(namespace).await?;

        let server_names: HashMap<Uuid, &str> = servers
            .iter()
            .map(|(membership, server)| (membership.server_uuid, server.name.as_str()))
            .collect();

        let mut tool_names = HashMap::new();

        for (membership, _) in &servers {
            for tool in self.storage.tools_for_server(membership.server_uuid).await? {
                tool_names.insert(tool.uuid, tool.name);
            }
        }

        let mut compiled = NamespaceOverrides::default();

        for membership in memberships {
            if membership.status != MembershipStatus::Active || membership.overrides.is_empty() {
                continue;
            }

            let (Some(server_name), Some(tool_name)) = (
                server_names.get(&membership.server_uuid),
                tool_names.get(&membership.tool_uuid),
            ) else {
                continue;
            };

            let full_name = format!("{server_name}__{tool_name}");

            if let Some(override_name) = &membership.overrides.name {
                compiled.to_original.insert(override_name.clone(), full_name.clone());
            }

            compiled.by_original.insert(full_name, membership.overrides);
        }

        Ok(compiled)
    }
}

impl ToolMiddleware for OverrideLayer {
    fn wrap_list(self: Arc<Self>, next: ListToolsHandler) -> ListToolsHandler {
        Arc::new(move |ctx| {
            let layer = self.clone();
            let next = next.clone();

            Box::pin(async move {
                let namespace = ctx.namespace_uuid;
                let mut tools = next(ctx).await?;
                let overrides = layer.load(namespace).await?;

                for tool in &mut tools {
                    overrides.apply(tool);
                }

                Ok(tools)
            })
        })
    }

    fn wrap_call(self: Arc<Self>, next: CallToolHandler) -> CallToolHandler {
        Arc::new(move |ctx, mut params| {
            let layer = self.clone();
            let next = next.clone();

            Box::pin(async move {
                let overrides = layer.load(ctx.namespace_uuid).await?;

                if let Some(original) = overrides.resolve(&params.name) {
                    log::debug!("Mapping override name '{}' back to '{original}'", params.name);
                    params.name = Cow::Owned(original.to_string());
                }

                next(ctx, params).await
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{McpServer, MemoryStorage, Namespace, ServerLaunch, ToolOverrides, ToolUpsert};

    async fn seeded() -> (Arc<MemoryStorage>, Uuid, Uuid) {
        let storage = Arc::new(MemoryStorage::new());

        let namespace = Namespace {
            uuid: Uuid::new_v4(),
            name: "ns".to_string(),
            description: None,
            user_id: Some("u".to_string()),
            smart_discovery_enabled: false,
            smart_discovery_description: None,
            pinned_tools: Vec::new(),
            ask_agent_uuid: None,
        };
        let ns = namespace.uuid;
        storage.create_namespace(namespace).await.unwrap();

        let server = McpServer {
            uuid: Uuid::new_v4(),
            name: "alpha".to_string(),
            user_id: Some("u".to_string()),
            launch: ServerLaunch::Stdio {
                command: "alpha-server".to_string(),
                args: Vec::new(),
                env: Default::default(),
                inherit_env: false,
            },
        };
        let server_uuid = server.uuid;
        storage.create_server(server).await.unwrap();
        storage
            .add_server_to_namespace(ns, server_uuid, MembershipStatus::Active)
            .await
            .unwrap();

        storage
            .upsert_tools(vec![ToolUpsert {
                server_uuid,
                name: "read".to_string(),
                title: None,
                description: Some("Reads a file".to_string()),
                input_schema: serde_json::json!({"type": "object"}),
            }])
            .await
            .unwrap();

        let tool = storage.tools_for_server(server_uuid).await.unwrap().remove(0);
        storage
            .upsert_tool_memberships(ns, vec![(tool.uuid, server_uuid)])
            .await
            .unwrap();

        storage
            .set_tool_overrides(
                ns,
                tool.uuid,
                ToolOverrides {
                    name: Some("fs_read".to_string()),
                    title: Some("File read".to_string()),
                    description: None,
                    annotations: None,
                },
            )
            .await
            .unwrap();

        (storage, ns, server_uuid)
    }

    #[tokio::test]
    async fn renames_listed_tools() {
        let (storage, ns, _) = seeded().await;
        let layer = OverrideLayer::new(storage);

        let overrides = layer.load(ns).await.unwrap();

        let mut tool = Tool::new("alpha__read".to_string(), "Reads a file".to_string(), serde_json::Map::new());
        overrides.apply(&mut tool);

        assert_eq!(tool.name.as_ref(), "fs_read");
        assert_eq!(tool.annotations.unwrap().title.as_deref(), Some("File read"));
    }

    #[tokio::test]
    async fn resolves_incoming_override_names() {
        let (storage, ns, _) = seeded().await;
        let layer = OverrideLayer::new(storage);

        let overrides = layer.load(ns).await.unwrap();

        assert_eq!(overrides.resolve("fs_read"), Some("alpha__read"));
        assert_eq!(overrides.resolve("alpha__read"), None);
    }

    #[tokio::test]
    async fn invalidation_recompiles() {
        let (storage, ns, server_uuid) = seeded().await;
        let layer = OverrideLayer::new(storage.clone());

        assert!(layer.load(ns).await.unwrap().resolve("fs_read").is_some());

        let tool = storage.tools_for_server(server_uuid).await.unwrap().remove(0);
        storage.set_tool_overrides(ns, tool.uuid, ToolOverrides::default()).await.unwrap();

        // Stale until invalidated.
        assert!(layer.load(ns).await.unwrap().resolve("fs_read").is_some());

        layer.invalidate(ns);
        assert!(layer.load(ns).await.unwrap().resolve("fs_read").is_none());
    }
}
