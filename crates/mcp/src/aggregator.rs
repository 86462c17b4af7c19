//! Merges upstream tool listings into one namespace view and routes calls
//! back out.

use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use rmcp::model::{CallToolResult, JsonObject, Resource, Tool};
use serde::Deserialize;
use storage::{MembershipStatus, Storage, ToolUpsert};
use uuid::Uuid;

use crate::{
    error::GatewayError,
    middleware::{CallToolHandler, ListToolsHandler, ToolExecutor},
    overrides::NamespaceOverrides,
    upstream::UpstreamSession,
};

/// Separator between the server segment and the tool segment of a full name.
pub const NAME_SEPARATOR: &str = "__";

/// The merged view of one namespace: its member sessions and the canonical
/// tool registry built from them.
pub struct Aggregator {
    namespace_uuid: Uuid,
    /// Member servers, sorted by name.
    members: Vec<Member>,
    /// Aggregated tools with full names, sorted by name.
    tools: Vec<Tool>,
}

struct Member {
    server_uuid: Uuid,
    name: String,
    session: Arc<dyn UpstreamSession>,
}

impl Aggregator {
    /// Build the merged registry from connected member sessions.
    ///
    /// Tool listing happens concurrently across members. Every tool name is
    /// prefixed with its server name and the separator; full names are
    /// unique by construction because server names are unique per owner.
    pub async fn compose(
        namespace_uuid: Uuid,
        sessions: Vec<(Uuid, Arc<dyn UpstreamSession>)>,
    ) -> Result<Self, GatewayError> {
        let mut futures = FuturesUnordered::new();

        for (server_uuid, session) in sessions {
            futures.push(async move {
                let tools = session.list_tools().await?;
                Ok::<_, GatewayError>((server_uuid, session, tools))
            });
        }

        let mut members = Vec::new();
        let mut tools = Vec::new();

        while let Some(result) = futures.next().await {
            let (server_uuid, session, member_tools) = result?;

            for mut tool in member_tools {
                log::debug!("Aggregating tool {}{NAME_SEPARATOR}{}", session.server_name(), tool.name);
                tool.name = Cow::Owned(format!("{}{NAME_SEPARATOR}{}", session.server_name(), tool.name));
                tools.push(tool);
            }

            members.push(Member {
                server_uuid,
                name: session.server_name().to_string(),
                session,
            });
        }

        members.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        tools.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            namespace_uuid,
            members,
            tools,
        })
    }

    /// The namespace this view serves.
    pub fn namespace_uuid(&self) -> Uuid {
        self.namespace_uuid
    }

    /// Server uuids of the members, for pool refcount bookkeeping.
    pub fn member_servers(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.server_uuid).collect()
    }

    /// The canonical merged tool registry.
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.clone()
    }

    /// Route a call to the owning upstream, forwarding the original tool
    /// name and the given arguments.
    pub async fn dispatch(&self, full_name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult, GatewayError> {
        let (member, tool_name) = self.resolve(full_name)?;

        log::debug!(
            "Dispatching '{full_name}' to server '{}' as '{tool_name}'",
            member.name
        );

        member.session.call_tool(tool_name, arguments).await
    }

    /// Union of the resources of all members. A member that fails to answer
    /// is logged and skipped.
    pub async fn list_resources(&self) -> Vec<Resource> {
        let mut futures = FuturesUnordered::new();

        for member in &self.members {
            futures.push(async move { (member.name.as_str(), member.session.list_resources().await) });
        }

        let mut resources = Vec::new();

        while let Some((name, result)) = futures.next().await {
            match result {
                Ok(member_resources) => resources.extend(member_resources),
                Err(e) => log::warn!("Skipping resources of server '{name}': {e}"),
            }
        }

        resources
    }

    /// Split a full name into the owning member and the forwarded tool name.
    ///
    /// When the first segment matches no member but the upstream is itself a
    /// gateway, the first two segments joined may match; exactly one extra
    /// level is collapsed, deeper nesting is rejected.
    fn resolve<'a>(&self, full_name: &'a str) -> Result<(&Member, &'a str), GatewayError> {
        let (server_name, tool_name) = split_full_name(full_name, |candidate| self.find_member(candidate).is_some())?;

        let member = self
            .find_member(server_name)
            .ok_or_else(|| GatewayError::NotFound(format!("server for tool '{full_name}'")))?;

        Ok((member, tool_name))
    }

    fn find_member(&self, name: &str) -> Option<&Member> {
        self.members
            .binary_search_by(|member| member.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.members[index])
    }
}

#[async_trait]
impl ToolExecutor for Aggregator {
    async fn execute(&self, full_name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult, GatewayError> {
        self.dispatch(full_name, arguments).await
    }
}

/// The innermost pipeline handlers of a composed session.
pub fn base_handlers(aggregator: Arc<Aggregator>) -> (ListToolsHandler, CallToolHandler) {
    let list_aggregator = aggregator.clone();

    let list: ListToolsHandler = Arc::new(move |_ctx| {
        let aggregator = list_aggregator.clone();
        Box::pin(async move { Ok(aggregator.tools()) })
    });

    let call: CallToolHandler = Arc::new(move |_ctx, params| {
        let aggregator = aggregator.clone();
        Box::pin(async move { aggregator.dispatch(&params.name, params.arguments).await })
    });

    (list, call)
}

/// Split `full_name` on the separator and pick the server segment.
///
/// `is_server` decides whether a candidate segment names a known server;
/// the two-segment candidate is only tried when the single segment fails.
pub fn split_full_name<'a>(
    full_name: &'a str,
    mut is_server: impl FnMut(&str) -> bool,
) -> Result<(&'a str, &'a str), GatewayError> {
    let (first, rest) = full_name
        .split_once(NAME_SEPARATOR)
        .ok_or_else(|| GatewayError::Validation(format!("malformed tool name '{full_name}': missing separator")))?;

    if is_server(first) {
        return Ok((first, rest));
    }

    if let Some((second, _)) = rest.split_once(NAME_SEPARATOR) {
        let end = first.len() + NAME_SEPARATOR.len() + second.len();
        let candidate = &full_name[..end];

        if is_server(candidate) {
            return Ok((candidate, &full_name[end + NAME_SEPARATOR.len()..]));
        }
    }

    Err(GatewayError::NotFound(format!("server for tool '{full_name}'")))
}

/// A tool as seen by a downstream client, input to [`refresh_tools`].
#[derive(Debug, Clone, Deserialize)]
pub struct ReportedTool {
    /// Full name, possibly an override name.
    pub name: String,
    /// Description, when reported.
    pub description: Option<String>,
    /// JSON Schema of the tool input.
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// Counters returned by [`refresh_tools`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RefreshSummary {
    /// Newly created tool rows.
    #[serde(rename = "toolsCreated")]
    pub tools_created: u64,
    /// Newly created membership rows.
    #[serde(rename = "mappingsCreated")]
    pub mappings_created: u64,
}

/// Sync the persisted tool rows of a namespace with what a downstream client
/// actually saw.
///
/// Override names are skipped so they are never persisted as canonical.
/// The remaining names are resolved to member servers (including the
/// one-level nested fallback), grouped and bulk-upserted; memberships are
/// upserted with status ACTIVE. Callers are responsible for the follow-up
/// invalidations.
pub async fn refresh_tools(
    storage: &dyn Storage,
    overrides: &NamespaceOverrides,
    namespace: Uuid,
    reported: Vec<ReportedTool>,
) -> Result<RefreshSummary, GatewayError> {
    let servers = storage.namespace_servers(namespace).await?;

    let server_uuid_by_name: std::collections::HashMap<&str, Uuid> = servers
        .iter()
        .filter(|(membership, _)| membership.status == MembershipStatus::Active)
        .map(|(membership, server)| (server.name.as_str(), membership.server_uuid))
        .collect();

    let mut upserts = Vec::new();
    let mut involved_servers = Vec::new();

    for tool in reported {
        if overrides.resolve(&tool.name).is_some() {
            log::debug!("Skipping override name '{}' during tool refresh", tool.name);
            continue;
        }

        let (server_name, tool_name) = match split_full_name(&tool.name, |c| server_uuid_by_name.contains_key(c)) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Skipping unresolvable tool '{}' during refresh: {e}", tool.name);
                continue;
            }
        };

        let server_uuid = server_uuid_by_name[server_name];

        if !involved_servers.contains(&server_uuid) {
            involved_servers.push(server_uuid);
        }

        upserts.push(ToolUpsert {
            server_uuid,
            name: tool_name.to_string(),
            title: None,
            description: tool.description,
            input_schema: tool.input_schema,
        });
    }

    let tools_created = storage.upsert_tools(upserts.clone()).await?;

    let mut memberships = Vec::new();

    for server_uuid in involved_servers {
        let persisted = storage.tools_for_server(server_uuid).await?;

        for upsert in upserts.iter().filter(|u| u.server_uuid == server_uuid) {
            if let Some(tool) = persisted.iter().find(|t| t.name == upsert.name) {
                memberships.push((tool.uuid, server_uuid));
            }
        }
    }

    let mappings_created = storage.upsert_tool_memberships(namespace, memberships).await?;

    Ok(RefreshSummary {
        tools_created,
        mappings_created,
    })
}
