//! Ordered middleware chains around `tools/list` and `tools/call`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject, Tool};
use uuid::Uuid;

use crate::error::GatewayError;

/// Executes canonical tool calls against the upstreams of one namespace.
///
/// This is the innermost dispatch surface; the ask-agent uses it directly so
/// its tool calls bypass the discovery layer but still hit the real servers.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Call a tool by its canonical full name.
    async fn execute(&self, full_name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult, GatewayError>;
}

/// Context shared by every middleware in a chain.
#[derive(Clone)]
pub struct ToolContext {
    /// The namespace being served.
    pub namespace_uuid: Uuid,
    /// The downstream session making the request.
    pub session_id: String,
    /// Canonical-name executor for the namespace.
    pub executor: Arc<dyn ToolExecutor>,
}

/// Handler for `tools/list`.
pub type ListToolsHandler = Arc<dyn Fn(ToolContext) -> BoxFuture<'static, Result<Vec<Tool>, GatewayError>> + Send + Sync>;

/// Handler for `tools/call`.
pub type CallToolHandler =
    Arc<dyn Fn(ToolContext, CallToolRequestParam) -> BoxFuture<'static, Result<CallToolResult, GatewayError>> + Send + Sync>;

/// A middleware wraps the next handler and returns a new one.
pub trait ToolMiddleware: Send + Sync + 'static {
    /// Wrap the `tools/list` handler. Default: pass through.
    fn wrap_list(self: Arc<Self>, next: ListToolsHandler) -> ListToolsHandler {
        next
    }

    /// Wrap the `tools/call` handler. Default: pass through.
    fn wrap_call(self: Arc<Self>, next: CallToolHandler) -> CallToolHandler {
        next
    }
}

/// The two composed chains of one namespace session.
///
/// The chains are ordered independently. On `tools/list` the discovery layer
/// sits directly on the base handler so indexing and session exposure see
/// canonical names, and overrides rewrite whatever it returns. On
/// `tools/call` overrides sit directly on the base handler so an incoming
/// override name is mapped back to the original right before dispatch.
pub struct Pipeline {
    list: ListToolsHandler,
    call: CallToolHandler,
}

impl Pipeline {
    /// Compose the chains. The first element of each layer slice becomes the
    /// outermost wrapper.
    pub fn new(
        base_list: ListToolsHandler,
        base_call: CallToolHandler,
        list_layers: Vec<Arc<dyn ToolMiddleware>>,
        call_layers: Vec<Arc<dyn ToolMiddleware>>,
    ) -> Self {
        let list = list_layers
            .into_iter()
            .rev()
            .fold(base_list, |next, layer| layer.wrap_list(next));

        let call = call_layers
            .into_iter()
            .rev()
            .fold(base_call, |next, layer| layer.wrap_call(next));

        Self { list, call }
    }

    /// Run the `tools/list` chain.
    pub async fn list_tools(&self, ctx: ToolContext) -> Result<Vec<Tool>, GatewayError> {
        (self.list)(ctx).await
    }

    /// Run the `tools/call` chain.
    pub async fn call_tool(&self, ctx: ToolContext, params: CallToolRequestParam) -> Result<CallToolResult, GatewayError> {
        (self.call)(ctx, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::Content;
    use std::borrow::Cow;

    struct NoopExecutor;

    #[async_trait]
    impl ToolExecutor for NoopExecutor {
        async fn execute(&self, _: &str, _: Option<JsonObject>) -> Result<CallToolResult, GatewayError> {
            Ok(CallToolResult {
                content: vec![Content::text("ok")],
                structured_content: None,
                is_error: None,
                meta: None,
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            namespace_uuid: Uuid::new_v4(),
            session_id: "s1".to_string(),
            executor: Arc::new(NoopExecutor),
        }
    }

    /// Prefixes every tool name, to make wrapping order observable.
    struct Tagger(&'static str);

    impl ToolMiddleware for Tagger {
        fn wrap_list(self: Arc<Self>, next: ListToolsHandler) -> ListToolsHandler {
            Arc::new(move |ctx| {
                let layer = self.clone();
                let next = next.clone();

                Box::pin(async move {
                    let mut tools = next(ctx).await?;

                    for tool in &mut tools {
                        tool.name = Cow::Owned(format!("{}{}", layer.0, tool.name));
                    }

                    Ok(tools)
                })
            })
        }
    }

    fn base_list(names: Vec<&'static str>) -> ListToolsHandler {
        Arc::new(move |_| {
            let names = names.clone();
            Box::pin(async move {
                Ok(names
                    .into_iter()
                    .map(|name| Tool::new(name.to_string(), String::new(), serde_json::Map::new()))
                    .collect())
            })
        })
    }

    fn base_call() -> CallToolHandler {
        Arc::new(|ctx: ToolContext, params: CallToolRequestParam| {
            Box::pin(async move { ctx.executor.execute(&params.name, params.arguments).await })
        })
    }

    #[tokio::test]
    async fn outermost_layer_transforms_last() {
        let pipeline = Pipeline::new(
            base_list(vec!["tool"]),
            base_call(),
            vec![Arc::new(Tagger("outer-")), Arc::new(Tagger("inner-"))],
            Vec::new(),
        );

        let tools = pipeline.list_tools(ctx()).await.unwrap();

        // The inner layer runs on the base result first; the outer layer
        // wraps its output.
        assert_eq!(tools[0].name.as_ref(), "outer-inner-tool");
    }

    #[tokio::test]
    async fn empty_chain_is_the_base_handler() {
        let pipeline = Pipeline::new(base_list(vec!["a", "b"]), base_call(), Vec::new(), Vec::new());

        let tools = pipeline.list_tools(ctx()).await.unwrap();
        assert_eq!(tools.len(), 2);

        let params = CallToolRequestParam {
            name: "a".to_string().into(),
            arguments: None,
        };
        let result = pipeline.call_tool(ctx(), params).await.unwrap();
        assert!(result.is_error.is_none());
    }
}
