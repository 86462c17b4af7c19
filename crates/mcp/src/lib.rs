//! MetaMCP core: aggregates upstream MCP servers into namespaces and
//! republishes each namespace as a single MCP endpoint, with smart
//! discovery hiding most tools behind synthetic find/ask tools.

#![deny(missing_docs)]

mod agent;
mod aggregator;
mod control;
mod discovery;
mod error;
mod handler;
mod install;
mod middleware;
mod overrides;
mod pool;
mod session;
mod upstream;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;

use std::{sync::Arc, time::Duration};

use axum::{Router, routing};
use config::{Config, GatewayConfig};
use llm::{ChatClient, ChatClientConfig, ChatJson, Embeddings, HttpEmbeddings, HttpEmbeddingsConfig, TokenCounter};
use rmcp::{
    model::ProtocolVersion,
    transport::{
        sse_server::{SseServer, SseServerConfig},
        streamable_http_server::{
            StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
        },
    },
};
use secrecy::ExposeSecret;
use storage::Storage;
use tokio_util::sync::CancellationToken;

pub use aggregator::{RefreshSummary, ReportedTool};
pub use control::ControlPlane;
pub use error::GatewayError;
pub use install::{INSTALL_ENV_FLAG, PackageInstaller, PackageManager};
pub use pool::{NamespacePool, PoolStatus, UpstreamPool};
pub use session::{DownstreamTransport, LiveSession, SessionRegistry, SessionStats};
pub use upstream::{RmcpConnector, UpstreamConnector};

use crate::{
    agent::AskAgent,
    discovery::{SmartDiscovery, index::DiscoveryIndex},
    handler::GatewayHandler,
    overrides::OverrideLayer,
    pool::Composer,
};

pub(crate) const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V_2025_03_26;

/// Process-wide context holding every shared component, injected instead of
/// globals so tests can build a fresh one per case.
pub struct GatewayContext {
    storage: Arc<dyn Storage>,
    sessions: Arc<SessionRegistry>,
    tokens: Arc<TokenCounter>,
    overrides: Arc<OverrideLayer>,
    discovery: Option<Arc<SmartDiscovery>>,
    index: Option<Arc<DiscoveryIndex>>,
    upstream_pool: Arc<UpstreamPool>,
    pools: Arc<NamespacePool>,
}

impl GatewayContext {
    /// Build the production context from the configuration: rmcp connector,
    /// HTTP embedding provider and chat client.
    pub fn new(config: &Config, storage: Arc<dyn Storage>) -> anyhow::Result<Arc<Self>> {
        let embeddings: Option<Arc<dyn Embeddings>> = match &config.discovery.embeddings {
            Some(embeddings_config) => Some(Arc::new(HttpEmbeddings::new(HttpEmbeddingsConfig {
                base_url: embeddings_config.base_url.to_string(),
                api_key: embeddings_config.api_key.clone(),
                model: embeddings_config.model.clone(),
            })?)),
            None => {
                log::warn!("No embedding provider configured; smart discovery namespaces serve their full tool list");
                None
            }
        };

        let chat: Arc<dyn ChatJson> = Arc::new(ChatClient::new(ChatClientConfig {
            base_url: config
                .agents
                .base_url
                .as_ref()
                .map(|url| url.to_string())
                .unwrap_or_else(|| ChatClientConfig::default().base_url),
            api_key: config
                .agents
                .api_key
                .as_ref()
                .map(|key| key.expose_secret().to_string().into()),
            timeout: config.agents.timeout,
        })?);

        Ok(Self::from_parts(
            storage,
            Arc::new(RmcpConnector),
            embeddings,
            chat,
            &config.gateway,
        ))
    }

    /// Assemble the component graph from explicit ports. Tests inject
    /// doubles here.
    pub fn from_parts(
        storage: Arc<dyn Storage>,
        connector: Arc<dyn UpstreamConnector>,
        embeddings: Option<Arc<dyn Embeddings>>,
        chat: Arc<dyn ChatJson>,
        gateway: &GatewayConfig,
    ) -> Arc<Self> {
        let tokens = Arc::new(TokenCounter::new());
        let overrides = Arc::new(OverrideLayer::new(storage.clone()));

        let (discovery, index) = match embeddings {
            Some(embeddings) => {
                let index = Arc::new(DiscoveryIndex::new(embeddings));
                let agent = Arc::new(AskAgent::new(chat, index.clone(), tokens.clone(), storage.clone()));
                let discovery = Arc::new(SmartDiscovery::new(storage.clone(), index.clone(), agent));

                (Some(discovery), Some(index))
            }
            None => (None, None),
        };

        let upstream_pool = Arc::new(UpstreamPool::new(
            connector,
            gateway.connect_attempts,
            gateway.connect_backoff,
        ));

        let composer = Composer::new(
            storage.clone(),
            upstream_pool.clone(),
            overrides.clone(),
            discovery.clone(),
        );

        let pools = Arc::new(NamespacePool::new(composer, upstream_pool.clone()));

        Arc::new(Self {
            storage,
            sessions: Arc::new(SessionRegistry::new()),
            tokens,
            overrides,
            discovery,
            index,
            upstream_pool,
            pools,
        })
    }

    /// The control-plane service over this context.
    pub fn control_plane(&self) -> ControlPlane {
        ControlPlane::new(
            self.storage.clone(),
            self.overrides.clone(),
            self.discovery.clone(),
            self.index.clone(),
            self.pools.clone(),
            self.upstream_pool.clone(),
            self.tokens.clone(),
        )
    }

    /// Live-session counts.
    pub fn session_stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    /// Namespace pool snapshot.
    pub fn pool_status(&self) -> PoolStatus {
        self.pools.status()
    }

    /// The persistence port.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub(crate) fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub(crate) fn pools(&self) -> &Arc<NamespacePool> {
        &self.pools
    }

    pub(crate) fn discovery(&self) -> Option<&Arc<SmartDiscovery>> {
        self.discovery.as_ref()
    }
}

/// Build the axum router exposing one StreamableHTTP and one SSE endpoint
/// per namespace, and start building idle sessions in the background.
///
/// Endpoints are materialized from the store at startup; namespaces created
/// afterwards are served after the next restart.
pub async fn router(
    context: Arc<GatewayContext>,
    gateway: &GatewayConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<Router> {
    let mut router = Router::new();
    let prefix = gateway.path_prefix.trim_end_matches('/');

    for namespace in context.storage.list_namespaces().await? {
        context.pools.ensure_idle(namespace.uuid);

        router = mount_namespace(router, context.clone(), prefix, &namespace, shutdown.clone());
    }

    Ok(router)
}

fn mount_namespace(
    mut router: Router,
    context: Arc<GatewayContext>,
    prefix: &str,
    namespace: &storage::Namespace,
    shutdown: CancellationToken,
) -> Router {
    let namespace_uuid = namespace.uuid;
    let endpoint_name = namespace.name.clone();

    log::debug!("Mounting namespace '{endpoint_name}' at {prefix}/{namespace_uuid}");

    // StreamableHTTP, stateful so each downstream session maps to one
    // handler whose drop tears the session down.
    let http_context = context.clone();
    let http_endpoint = endpoint_name.clone();

    let http_service = StreamableHttpService::new(
        move || {
            Ok(GatewayHandler::attach(
                http_context.clone(),
                namespace_uuid,
                http_endpoint.clone(),
                DownstreamTransport::StreamableHttp,
            ))
        },
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig {
            sse_keep_alive: Some(Duration::from_secs(5)),
            stateful_mode: true,
        },
    );

    router = router.route(
        &format!("{prefix}/{namespace_uuid}/mcp"),
        routing::any_service(http_service),
    );

    // SSE on its own path; rmcp hands us a sub-router for it.
    let sse_path = format!("{prefix}/{namespace_uuid}/sse");

    let sse_config = SseServerConfig {
        bind: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
        sse_path: sse_path.clone(),
        post_path: sse_path,
        ct: shutdown.child_token(),
        sse_keep_alive: Some(Duration::from_secs(5)),
    };

    let (sse_server, sse_router) = SseServer::new(sse_config);

    let sse_context = context;
    let service_ct = sse_server.with_service(move || {
        GatewayHandler::attach(
            sse_context.clone(),
            namespace_uuid,
            endpoint_name.clone(),
            DownstreamTransport::Sse,
        )
    });

    tokio::spawn(async move {
        shutdown.cancelled().await;
        service_ct.cancel();
    });

    router.merge(sse_router)
}
