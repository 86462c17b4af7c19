//! The per-attach MCP handler serving one downstream session.

use std::sync::Arc;

use indoc::indoc;
use rmcp::{
    RoleServer, ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, ErrorData, Implementation, ListResourcesResult, ListToolsResult,
        PaginatedRequestParam, ServerCapabilities, ServerInfo,
    },
    service::RequestContext,
};
use uuid::Uuid;

use crate::{
    GatewayContext,
    middleware::ToolContext,
    session::{DownstreamTransport, LiveSession},
};

/// Handler bound to one downstream session of one namespace endpoint.
///
/// Cloning shares the session guard; the session is torn down when the last
/// clone drops, i.e. when the transport closes.
#[derive(Clone)]
pub struct GatewayHandler {
    context: Arc<GatewayContext>,
    guard: Arc<SessionGuard>,
    info: ServerInfo,
}

struct SessionGuard {
    context: Arc<GatewayContext>,
    session_id: String,
    namespace_uuid: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        log::debug!("Session '{}' disconnected, releasing its state", self.session_id);

        self.context.sessions().remove(&self.session_id);
        self.context.pools().release(&self.session_id);

        if let Some(discovery) = self.context.discovery() {
            discovery.drop_session(&self.session_id);
        }
    }
}

impl GatewayHandler {
    /// Register a fresh downstream session and build its handler.
    pub fn attach(
        context: Arc<GatewayContext>,
        namespace_uuid: Uuid,
        endpoint_name: String,
        transport: DownstreamTransport,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();

        context.sessions().add(LiveSession {
            session_id: session_id.clone(),
            endpoint_name: endpoint_name.clone(),
            namespace_uuid,
            transport,
        });

        let info = ServerInfo {
            protocol_version: crate::PROTOCOL_VERSION,
            capabilities: ServerCapabilities::builder().enable_tools().enable_resources().build(),
            server_info: Implementation {
                name: format!("MetaMCP ({endpoint_name})"),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(instructions()),
        };

        let guard = Arc::new(SessionGuard {
            context: context.clone(),
            session_id,
            namespace_uuid,
        });

        Self { context, guard, info }
    }

    fn tool_context(&self, executor: Arc<dyn crate::middleware::ToolExecutor>) -> ToolContext {
        ToolContext {
            namespace_uuid: self.guard.namespace_uuid,
            session_id: self.guard.session_id.clone(),
            executor,
        }
    }
}

impl ServerHandler for GatewayHandler {
    fn get_info(&self) -> ServerInfo {
        self.info.clone()
    }

    async fn list_tools(
        &self,
        _: Option<PaginatedRequestParam>,
        _ctx: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let composed = self
            .context
            .pools()
            .acquire(self.guard.namespace_uuid, &self.guard.session_id)
            .await
            .map_err(|e| e.into_error_data())?;

        let ctx = self.tool_context(composed.aggregator.clone());

        let tools = composed
            .pipeline
            .list_tools(ctx)
            .await
            .map_err(|e| e.into_error_data())?;

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParam,
        _ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        log::debug!("Processing tool invocation for '{}'", params.name);

        let composed = self
            .context
            .pools()
            .acquire(self.guard.namespace_uuid, &self.guard.session_id)
            .await
            .map_err(|e| e.into_error_data())?;

        let ctx = self.tool_context(composed.aggregator.clone());

        composed
            .pipeline
            .call_tool(ctx, params)
            .await
            .map_err(|e| e.into_error_data())
    }

    async fn list_resources(
        &self,
        _: Option<PaginatedRequestParam>,
        _ctx: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        let composed = self
            .context
            .pools()
            .acquire(self.guard.namespace_uuid, &self.guard.session_id)
            .await
            .map_err(|e| e.into_error_data())?;

        Ok(ListResourcesResult {
            resources: composed.aggregator.list_resources().await,
            next_cursor: None,
        })
    }
}

fn instructions() -> String {
    indoc! {r#"
        This endpoint aggregates several MCP servers into one namespace.
        Tool names are prefixed with their server name, separated by `__`.

        When the namespace runs in discovery mode you will only see the
        `metamcp__find` and `metamcp__ask` tools at first. Use
        `metamcp__find` with a description of your goal to surface matching
        tools into this session, or `metamcp__ask` to let the namespace
        agent handle the task end to end. Do not guess tool names.
    "#}
    .to_string()
}
