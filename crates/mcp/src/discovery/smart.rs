//! The smart discovery layer: replaces a namespace's tool list with the
//! synthetic find/ask tools plus a per-session exposed set.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use indoc::indoc;
use mini_moka::sync::Cache;
use rmcp::model::{CallToolResult, Content, Tool};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use storage::Storage;
use uuid::Uuid;

use crate::{
    agent::{AskAgent, AskRequest, ExposureSink},
    discovery::{ASK_TOOL_NAME, FIND_TOOL_NAME, index::{DiscoveryIndex, IndexEntry, MAX_SEARCH_LIMIT}},
    error::GatewayError,
    middleware::{CallToolHandler, ListToolsHandler, ToolContext, ToolMiddleware},
};

/// How long a namespace's discovery status is trusted before re-reading it.
const STATUS_TTL: Duration = Duration::from_secs(5);

/// Exposure-table size above which the coarse GC considers wiping it.
const GC_HIGH_WATER: usize = 1_000;

/// Minimum interval between coarse GC wipes.
const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Snapshot of the discovery-relevant namespace fields, cached briefly.
#[derive(Debug, Clone)]
struct NamespaceStatus {
    enabled: bool,
    description: Option<String>,
    pinned: Vec<String>,
    ask_agent: Option<Uuid>,
}

/// Parameters of the synthetic find tool.
#[derive(Debug, Deserialize, JsonSchema)]
struct FindParameters {
    /// What you are trying to accomplish, in natural language.
    query: String,
    /// Maximum number of tools to return. Defaults to 5, capped at 20.
    #[serde(default)]
    limit: Option<u32>,
}

/// Parameters of the synthetic ask tool.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct AskParameters {
    /// The question or task for the namespace agent.
    query: String,
    /// Override of the agent's tool call limit for this run.
    #[serde(default)]
    max_tool_calls: Option<u32>,
    /// Override of how many tools the agent may expose into the session.
    #[serde(default)]
    expose_limit: Option<u32>,
}

/// The smart discovery middleware.
///
/// Per-session exposure state lives in memory keyed by `(session,
/// namespace)`. It is dropped when the session disconnects, with a coarse
/// GC wipe as a backstop once the table passes the high-water mark.
pub struct SmartDiscovery {
    storage: Arc<dyn Storage>,
    index: Arc<DiscoveryIndex>,
    agent: Arc<AskAgent>,
    status_cache: Cache<Uuid, Arc<NamespaceStatus>>,
    exposed: DashMap<(String, Uuid), Vec<String>>,
    last_gc: Mutex<Instant>,
}

impl SmartDiscovery {
    /// A new layer over the given collaborators.
    pub fn new(storage: Arc<dyn Storage>, index: Arc<DiscoveryIndex>, agent: Arc<AskAgent>) -> Self {
        Self {
            storage,
            index,
            agent,
            status_cache: Cache::builder().time_to_live(STATUS_TTL).build(),
            exposed: DashMap::new(),
            last_gc: Mutex::new(Instant::now()),
        }
    }

    /// Drop the cached status of a namespace after a control-plane change.
    pub fn invalidate_status(&self, namespace: Uuid) {
        self.status_cache.invalidate(&namespace);
    }

    /// The exposed set of one session, canonical names.
    pub fn exposed_for(&self, session_id: &str, namespace: Uuid) -> Vec<String> {
        self.exposed
            .get(&(session_id.to_string(), namespace))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Drop all exposure state of a disconnected session.
    pub fn drop_session(&self, session_id: &str) {
        self.exposed.retain(|(sid, _), _| sid != session_id);
    }

    /// The discovery index, for observability endpoints.
    pub fn index(&self) -> &Arc<DiscoveryIndex> {
        &self.index
    }

    async fn status(&self, namespace: Uuid) -> Result<Arc<NamespaceStatus>, GatewayError> {
        if let Some(status) = self.status_cache.get(&namespace) {
            return Ok(status);
        }

        let status = match self.storage.namespace(namespace).await? {
            Some(ns) => NamespaceStatus {
                enabled: ns.smart_discovery_enabled,
                description: ns.smart_discovery_description,
                pinned: ns.pinned_tools,
                ask_agent: ns.ask_agent_uuid,
            },
            None => NamespaceStatus {
                enabled: false,
                description: None,
                pinned: Vec::new(),
                ask_agent: None,
            },
        };

        let status = Arc::new(status);
        self.status_cache.insert(namespace, status.clone());

        Ok(status)
    }

    /// Wipe the whole exposure table when it has grown past the high-water
    /// mark and the last wipe is long enough ago.
    fn maybe_gc(&self) {
        if self.exposed.len() <= GC_HIGH_WATER {
            return;
        }

        let mut last = self.last_gc.lock().unwrap_or_else(|e| e.into_inner());

        if last.elapsed() >= GC_INTERVAL {
            log::warn!(
                "Dropping exposure state of {} session/namespace pairs (coarse GC)",
                self.exposed.len()
            );
            self.exposed.clear();
            *last = Instant::now();
        }
    }

    fn spawn_indexing(self: &Arc<Self>, namespace: Uuid, tools: &[Tool]) {
        let entries: Vec<IndexEntry> = tools
            .iter()
            .filter_map(|tool| {
                let (server_name, original_name) = tool.name.split_once("__")?;

                Some(IndexEntry {
                    server_name: server_name.to_string(),
                    original_name: original_name.to_string(),
                    title: tool.annotations.as_ref().and_then(|a| a.title.clone()),
                    description: tool.description.as_ref().map(|d| d.to_string()),
                    input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
                })
            })
            .collect();

        let index = self.index.clone();

        tokio::spawn(async move {
            if let Err(e) = index.index_tools(namespace, entries).await {
                log::error!("Background indexing for namespace {namespace} failed: {e}");
            }
        });
    }

    async fn find(&self, ctx: &ToolContext, params: FindParameters) -> Result<CallToolResult, GatewayError> {
        let limit = params.limit.unwrap_or(5).clamp(1, MAX_SEARCH_LIMIT as u32) as usize;

        let hits = self.index.search(ctx.namespace_uuid, &params.query, limit, None).await?;

        let names: Vec<String> = hits.iter().map(|hit| hit.tool.full_name.clone()).collect();

        // Replace, not union: the last find wins for the session.
        self.set_exposed(&ctx.session_id, ctx.namespace_uuid, names);

        let tools: Vec<serde_json::Value> = hits
            .iter()
            .map(|hit| {
                serde_json::json!({
                    "name": hit.tool.full_name,
                    "description": hit.tool.description,
                    "arguments": hit.tool.input_schema,
                    "relevanceScore": round_score(hit.score),
                })
            })
            .collect();

        let payload = serde_json::json!({
            "message": format!(
                "Found {} tool(s) for your query. They are now callable in this session.",
                tools.len()
            ),
            "query": params.query,
            "tools": tools,
            "usage": {
                "returned": tools.len(),
                "limit": limit,
            },
        });

        Ok(json_text_result(&payload))
    }

    async fn ask(
        &self,
        ctx: &ToolContext,
        status: &NamespaceStatus,
        params: AskParameters,
    ) -> Result<CallToolResult, GatewayError> {
        let Some(agent_uuid) = status.ask_agent else {
            return Ok(error_result("No ask agent is configured for this namespace"));
        };

        let Some(agent) = self.storage.agent(agent_uuid).await? else {
            return Ok(error_result("The configured ask agent no longer exists"));
        };

        let request = AskRequest {
            namespace_uuid: ctx.namespace_uuid,
            session_id: &ctx.session_id,
            namespace_description: status.description.as_deref(),
            query: params.query,
            max_tool_calls: params.max_tool_calls,
            expose_limit: params.expose_limit,
        };

        let report = self.agent.run(&agent, request, ctx.executor.clone(), self).await?;

        let payload = serde_json::to_value(&report)
            .map_err(|e| GatewayError::Internal(format!("failed to serialize agent report: {e}")))?;

        Ok(json_text_result(&payload))
    }

    fn find_tool(&self, status: &NamespaceStatus) -> Tool {
        let mut description = indoc! {r#"
            Search this namespace for tools matching a natural-language query.
            Matching tools become callable in this session; the result lists
            their names, descriptions and input schemas. Always search before
            guessing tool names.
        "#}
        .to_string();

        if let Some(extra) = &status.description {
            description.push('\n');
            description.push_str(extra);
        }

        Tool::new(FIND_TOOL_NAME.to_string(), description, schema_object::<FindParameters>())
    }

    fn ask_tool(&self) -> Tool {
        let description = indoc! {r#"
            Ask the namespace agent to accomplish a task. The agent searches
            the available tools, may call a bounded number of them, and
            reports back with an answer plus the tools it found useful.
        "#};

        Tool::new(ASK_TOOL_NAME.to_string(), description.to_string(), schema_object::<AskParameters>())
    }
}

impl ExposureSink for SmartDiscovery {
    fn set_exposed(&self, session_id: &str, namespace: Uuid, tools: Vec<String>) {
        self.maybe_gc();
        self.exposed.insert((session_id.to_string(), namespace), tools);
    }
}

impl ToolMiddleware for SmartDiscovery {
    fn wrap_list(self: Arc<Self>, next: ListToolsHandler) -> ListToolsHandler {
        Arc::new(move |ctx| {
            let layer = self.clone();
            let next = next.clone();

            Box::pin(async move {
                let status = layer.status(ctx.namespace_uuid).await?;

                if !status.enabled {
                    return next(ctx).await;
                }

                let tools = next(ctx.clone()).await?;

                // Indexing runs in the background; failures are logged there
                // and never surface into the listing.
                layer.spawn_indexing(ctx.namespace_uuid, &tools);
                layer.maybe_gc();

                let mut result = vec![layer.ask_tool(), layer.find_tool(&status)];
                let mut seen: HashSet<String> = result.iter().map(|t| t.name.to_string()).collect();

                let discovered = layer.exposed_for(&ctx.session_id, ctx.namespace_uuid);

                for name in status.pinned.iter().chain(discovered.iter()) {
                    if !seen.insert(name.clone()) {
                        continue;
                    }

                    if let Some(tool) = tools.iter().find(|t| t.name.as_ref() == name.as_str()) {
                        result.push(tool.clone());
                    }
                }

                Ok(result)
            })
        })
    }

    fn wrap_call(self: Arc<Self>, next: CallToolHandler) -> CallToolHandler {
        Arc::new(move |ctx, params| {
            let layer = self.clone();
            let next = next.clone();

            Box::pin(async move {
                if params.name != FIND_TOOL_NAME && params.name != ASK_TOOL_NAME {
                    return next(ctx, params).await;
                }

                let status = layer.status(ctx.namespace_uuid).await?;

                if !status.enabled {
                    return Ok(error_result("Smart discovery is not enabled for this namespace"));
                }

                let arguments = serde_json::Value::Object(params.arguments.unwrap_or_default());

                if params.name == FIND_TOOL_NAME {
                    let params: FindParameters = serde_json::from_value(arguments)
                        .map_err(|e| GatewayError::Validation(e.to_string()))?;

                    layer.find(&ctx, params).await
                } else {
                    let params: AskParameters = serde_json::from_value(arguments)
                        .map_err(|e| GatewayError::Validation(e.to_string()))?;

                    layer.ask(&ctx, &status, params).await
                }
            })
        })
    }
}

fn schema_object<T: JsonSchema>() -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(schema_for!(T)) {
        Ok(serde_json::Value::Object(schema)) => schema,
        _ => serde_json::Map::new(),
    }
}

fn json_text_result(payload: &serde_json::Value) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(payload.to_string())],
        structured_content: None,
        is_error: None,
        meta: None,
    }
}

fn error_result(message: &str) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(message.to_string())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

fn round_score(score: f32) -> f64 {
    (f64::from(score) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_schema_requires_query() {
        let schema = schema_object::<FindParameters>();
        let required = schema["required"].as_array().unwrap();

        assert!(required.iter().any(|v| v == "query"));
    }

    #[test]
    fn error_result_sets_the_flag() {
        let result = error_result("nope");
        assert_eq!(result.is_error, Some(true));
    }

    #[test]
    fn scores_round_to_two_decimals() {
        assert_eq!(round_score(0.4567), 0.46);
        assert_eq!(round_score(1.0), 1.0);
    }
}
