//! Upstream MCP client sessions, one per connected server.

use std::{process::Stdio, sync::Arc};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use rmcp::{
    RoleClient, ServiceError, ServiceExt,
    model::{CallToolRequestParam, CallToolResult, JsonObject, Resource, Tool},
    service::RunningService,
    transport::{
        SseClientTransport, StreamableHttpClientTransport, TokioChildProcess, common::client_side_sse::FixedInterval,
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use secrecy::{ExposeSecret, SecretString};
use storage::{McpServer, ServerLaunch};
use tokio::process::Command;

use crate::error::GatewayError;

/// A connected upstream MCP session.
///
/// The pool owns these; everything else borrows them through `Arc`. Dropping
/// the last reference terminates the transport (and the child process for
/// STDIO upstreams).
#[async_trait]
pub trait UpstreamSession: Send + Sync + std::fmt::Debug {
    /// Name of the upstream server, the first segment of full tool names.
    fn server_name(&self) -> &str;

    /// List the tools the upstream reports.
    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError>;

    /// Call a tool with its original (unprefixed) name.
    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult, GatewayError>;

    /// List the resources the upstream reports.
    async fn list_resources(&self) -> Result<Vec<Resource>, GatewayError>;
}

/// Opens upstream sessions. The pool consumes this port; tests inject fakes.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect to the given server. A failure here is transient from the
    /// pool's point of view and may be retried with backoff.
    async fn connect(&self, server: &McpServer) -> Result<Arc<dyn UpstreamSession>, GatewayError>;
}

/// Production connector speaking MCP through rmcp client transports.
#[derive(Default)]
pub struct RmcpConnector;

#[async_trait]
impl UpstreamConnector for RmcpConnector {
    async fn connect(&self, server: &McpServer) -> Result<Arc<dyn UpstreamSession>, GatewayError> {
        let client = UpstreamClient::connect(server).await?;
        Ok(Arc::new(client))
    }
}

/// An upstream MCP server the gateway is connected to as a client.
pub struct UpstreamClient {
    name: String,
    service: RunningService<RoleClient, ()>,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient").field("name", &self.name).finish()
    }
}

impl UpstreamClient {
    /// Connect to a server according to its launch parameters.
    pub async fn connect(server: &McpServer) -> Result<Self, GatewayError> {
        let service = match &server.launch {
            ServerLaunch::Stdio {
                command,
                args,
                env,
                inherit_env,
            } => {
                log::debug!("Creating STDIO upstream session for server '{}'", server.name);

                let mut command = Command::new(command);
                command.args(args);

                // The child sees the parent environment only when explicitly
                // configured to.
                if !inherit_env {
                    command.env_clear();
                }

                for (key, value) in env {
                    command.env(key, value);
                }

                let transport = TokioChildProcess::builder(command)
                    .stderr(Stdio::null())
                    .spawn()
                    .map(|(transport, _stderr)| transport)
                    .map_err(|e| GatewayError::UpstreamTransient(format!("failed to spawn '{}': {e}", server.name)))?;

                ().serve(transport)
                    .await
                    .map_err(|e| GatewayError::UpstreamTransient(format!("handshake with '{}' failed: {e}", server.name)))?
            }
            ServerLaunch::Sse {
                url,
                bearer_token,
                headers,
            } => {
                log::debug!("Creating SSE upstream session for server '{}'", server.name);

                let client = http_client(bearer_token.as_ref(), headers)?;

                let config = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    retry_policy: Arc::new(FixedInterval::default()),
                    use_message_endpoint: None,
                };

                let transport = SseClientTransport::start_with_client(client, config)
                    .await
                    .map_err(|e| GatewayError::UpstreamTransient(format!("SSE connect to '{}' failed: {e}", server.name)))?;

                ().serve(transport)
                    .await
                    .map_err(|e| GatewayError::UpstreamTransient(format!("handshake with '{}' failed: {e}", server.name)))?
            }
            ServerLaunch::StreamableHttp {
                url,
                bearer_token,
                headers,
            } => {
                log::debug!("Creating streamable-http upstream session for server '{}'", server.name);

                let client = http_client(bearer_token.as_ref(), headers)?;
                let config = StreamableHttpClientTransportConfig::with_uri(url.clone());
                let transport = StreamableHttpClientTransport::with_client(client, config);

                ().serve(transport)
                    .await
                    .map_err(|e| GatewayError::UpstreamTransient(format!("handshake with '{}' failed: {e}", server.name)))?
            }
        };

        Ok(Self {
            name: server.name.clone(),
            service,
        })
    }

    /// Lists all tools available from the upstream MCP server.
    #[fastrace::trace(name = "upstream:list_tools")]
    async fn list_tools_inner(&self) -> Result<Vec<Tool>, GatewayError> {
        log::debug!("Requesting tool list from upstream server '{}'", self.name);

        self.service
            .list_tools(Default::default())
            .await
            .map(|result| result.tools)
            .map_err(|e| self.map_error(e))
    }

    /// Calls a tool on the upstream MCP server.
    #[fastrace::trace(name = "upstream:call_tool")]
    async fn call_tool_inner(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult, GatewayError> {
        log::debug!("Invoking tool '{name}' on upstream server '{}'", self.name);

        let params = CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
        };

        self.service.call_tool(params).await.map_err(|e| self.map_error(e))
    }

    /// Lists all resources available from the upstream MCP server.
    #[fastrace::trace(name = "upstream:list_resources")]
    async fn list_resources_inner(&self) -> Result<Vec<Resource>, GatewayError> {
        log::debug!("Requesting resource list from upstream server '{}'", self.name);

        self.service
            .list_resources(Default::default())
            .await
            .map(|result| result.resources)
            .map_err(|e| self.map_error(e))
    }

    fn map_error(&self, error: ServiceError) -> GatewayError {
        match error {
            ServiceError::McpError(data) => GatewayError::UpstreamFatal(data),
            other => GatewayError::UpstreamTransient(format!("transport error on '{}': {other}", self.name)),
        }
    }
}

#[async_trait]
impl UpstreamSession for UpstreamClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        self.list_tools_inner().await
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult, GatewayError> {
        self.call_tool_inner(name, arguments).await
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, GatewayError> {
        self.list_resources_inner().await
    }
}

/// Build a reqwest client carrying the bearer token and static headers of an
/// HTTP upstream.
fn http_client(
    bearer_token: Option<&SecretString>,
    extra_headers: &std::collections::BTreeMap<String, String>,
) -> Result<reqwest::Client, GatewayError> {
    let mut headers = HeaderMap::new();

    if let Some(token) = bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| GatewayError::Validation(format!("invalid bearer token: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }

    for (name, value) in extra_headers {
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| GatewayError::Validation(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::Validation(format!("invalid header value for '{name}': {e}")))?;
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder();

    if !headers.is_empty() {
        builder = builder.default_headers(headers);
    }

    builder
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
}
