//! Idle/active pools of upstream clients and composed namespace sessions.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde::Serialize;
use storage::{McpServer, MembershipStatus, Storage};
use uuid::Uuid;

use crate::{
    aggregator::{Aggregator, base_handlers},
    discovery::SmartDiscovery,
    error::GatewayError,
    middleware::{Pipeline, ToolMiddleware},
    overrides::OverrideLayer,
    upstream::{UpstreamConnector, UpstreamSession},
};

/// One connected upstream client shared across namespaces.
struct UpstreamEntry {
    session: Arc<dyn UpstreamSession>,
    refcount: AtomicUsize,
    stale: AtomicBool,
}

/// Connection status of the upstream pool.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamPoolStatus {
    /// Connected servers.
    #[serde(rename = "idleServerUuids")]
    pub server_uuids: Vec<Uuid>,
}

/// Pool of upstream MCP clients, one per server used by at least one
/// namespace, reference-counted across namespaces.
///
/// Initial connects are retried with bounded exponential backoff on
/// transient failures; tool calls are never retried here.
pub struct UpstreamPool {
    connector: Arc<dyn UpstreamConnector>,
    entries: DashMap<Uuid, Arc<UpstreamEntry>>,
    connect_locks: DashMap<Uuid, Arc<futures_util::lock::Mutex<()>>>,
    connect_attempts: u32,
    connect_backoff: Duration,
}

impl UpstreamPool {
    /// An empty pool over the given connector.
    pub fn new(connector: Arc<dyn UpstreamConnector>, connect_attempts: u32, connect_backoff: Duration) -> Self {
        Self {
            connector,
            entries: DashMap::new(),
            connect_locks: DashMap::new(),
            connect_attempts: connect_attempts.max(1),
            connect_backoff,
        }
    }

    /// Borrow the session of a server, connecting if necessary. Every
    /// successful acquire must be paired with a [`UpstreamPool::release`].
    pub async fn acquire(&self, server: &McpServer) -> Result<Arc<dyn UpstreamSession>, GatewayError> {
        if let Some(session) = self.try_reuse(server.uuid) {
            return Ok(session);
        }

        let lock = self
            .connect_locks
            .entry(server.uuid)
            .or_insert_with(|| Arc::new(futures_util::lock::Mutex::new(())))
            .clone();

        let _guard = lock.lock().await;

        // Somebody else connected while we waited for the lock.
        if let Some(session) = self.try_reuse(server.uuid) {
            return Ok(session);
        }

        let session = self.connect_with_backoff(server).await?;

        let entry = Arc::new(UpstreamEntry {
            session: session.clone(),
            refcount: AtomicUsize::new(1),
            stale: AtomicBool::new(false),
        });

        // A stale predecessor may still be held by running sessions; their
        // releases miss the map on purpose and the client dies with its
        // last Arc.
        self.entries.insert(server.uuid, entry);

        Ok(session)
    }

    fn try_reuse(&self, server: Uuid) -> Option<Arc<dyn UpstreamSession>> {
        let entry = self.entries.get(&server)?;

        if entry.stale.load(Ordering::SeqCst) {
            return None;
        }

        entry.refcount.fetch_add(1, Ordering::SeqCst);
        Some(entry.session.clone())
    }

    /// Return a borrowed session. The `session` handle identifies the
    /// generation: releases of an already-invalidated client are no-ops.
    pub fn release(&self, server: Uuid, session: &Arc<dyn UpstreamSession>) {
        let remove = {
            let Some(entry) = self.entries.get(&server) else {
                return;
            };

            if !Arc::ptr_eq(&entry.session, session) {
                return;
            }

            let remaining = entry.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
            remaining == 0 && entry.stale.load(Ordering::SeqCst)
        };

        if remove {
            self.entries.remove(&server);
            log::debug!("Closed invalidated upstream client for server {server}");
        }
    }

    /// Mark a server's client stale. Teardown happens immediately when
    /// nothing borrows it, otherwise on the last release.
    pub fn invalidate(&self, server: Uuid) {
        let remove = {
            let Some(entry) = self.entries.get(&server) else {
                return;
            };

            entry.stale.store(true, Ordering::SeqCst);
            entry.refcount.load(Ordering::SeqCst) == 0
        };

        if remove {
            self.entries.remove(&server);
        }
    }

    /// Connected servers.
    pub fn status(&self) -> UpstreamPoolStatus {
        let mut server_uuids: Vec<Uuid> = self.entries.iter().map(|entry| *entry.key()).collect();
        server_uuids.sort_unstable();

        UpstreamPoolStatus { server_uuids }
    }

    async fn connect_with_backoff(&self, server: &McpServer) -> Result<Arc<dyn UpstreamSession>, GatewayError> {
        let mut attempt = 0u32;

        loop {
            match self.connector.connect(server).await {
                Ok(session) => return Ok(session),
                Err(GatewayError::UpstreamTransient(message)) if attempt + 1 < self.connect_attempts => {
                    attempt += 1;

                    let backoff = self.connect_backoff * 2u32.saturating_pow(attempt - 1);
                    let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2);
                    let delay = backoff + Duration::from_millis(jitter_ms);

                    log::warn!(
                        "Connect attempt {attempt} to server '{}' failed ({message}), retrying in {delay:?}",
                        server.name
                    );

                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A composed namespace session: the merged registry plus its middleware
/// chains.
pub struct ComposedSession {
    /// The merged view this session serves.
    pub aggregator: Arc<Aggregator>,
    /// The list/call chains of the session.
    pub pipeline: Pipeline,
    member_sessions: Vec<(Uuid, Arc<dyn UpstreamSession>)>,
    stale: AtomicBool,
}

impl ComposedSession {
    /// Flag the session so it is torn down instead of parked on release.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

/// Builds composed sessions from the store and the process-wide layers.
pub struct Composer {
    storage: Arc<dyn Storage>,
    upstream_pool: Arc<UpstreamPool>,
    overrides: Arc<OverrideLayer>,
    discovery: Option<Arc<SmartDiscovery>>,
}

impl Composer {
    /// A composer over the given collaborators.
    pub fn new(
        storage: Arc<dyn Storage>,
        upstream_pool: Arc<UpstreamPool>,
        overrides: Arc<OverrideLayer>,
        discovery: Option<Arc<SmartDiscovery>>,
    ) -> Self {
        Self {
            storage,
            upstream_pool,
            overrides,
            discovery,
        }
    }

    /// Build a composed session for a namespace: acquire every active
    /// member's upstream client, merge their registries and assemble the
    /// middleware chains.
    pub async fn build(&self, namespace: Uuid) -> Result<Arc<ComposedSession>, GatewayError> {
        self.storage
            .namespace(namespace)
            .await?
            .ok_or_else(|| GatewayError::NotFound("namespace".to_string()))?;

        let members = self.storage.namespace_servers(namespace).await?;

        let mut sessions = Vec::new();

        for (membership, server) in members {
            if membership.status != MembershipStatus::Active {
                continue;
            }

            match self.upstream_pool.acquire(&server).await {
                Ok(session) => sessions.push((server.uuid, session)),
                Err(e) => {
                    // Undo the acquires made so far.
                    for (uuid, session) in &sessions {
                        self.upstream_pool.release(*uuid, session);
                    }

                    return Err(e);
                }
            }
        }

        let aggregator = match Aggregator::compose(namespace, sessions.clone()).await {
            Ok(aggregator) => Arc::new(aggregator),
            Err(e) => {
                for (uuid, session) in &sessions {
                    self.upstream_pool.release(*uuid, session);
                }

                return Err(e);
            }
        };

        let (base_list, base_call) = base_handlers(aggregator.clone());

        // List: overrides outermost, so discovery indexes and exposes
        // canonical names and override names only appear at the edge.
        // Call: discovery outermost to intercept the synthetic tools,
        // overrides innermost so incoming override names are mapped back
        // right before dispatch.
        let mut list_layers: Vec<Arc<dyn ToolMiddleware>> = vec![self.overrides.clone()];
        let mut call_layers: Vec<Arc<dyn ToolMiddleware>> = Vec::new();

        if let Some(discovery) = &self.discovery {
            list_layers.push(discovery.clone());
            call_layers.push(discovery.clone());
        }

        call_layers.push(self.overrides.clone());

        let pipeline = Pipeline::new(base_list, base_call, list_layers, call_layers);

        Ok(Arc::new(ComposedSession {
            aggregator,
            pipeline,
            member_sessions: sessions,
            stale: AtomicBool::new(false),
        }))
    }
}

/// Status snapshot of the namespace pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Number of idle composed sessions.
    pub idle: usize,
    /// Number of active composed sessions.
    pub active: usize,
    /// Session ids of the active entries.
    #[serde(rename = "activeSessionIds")]
    pub active_session_ids: Vec<String>,
    /// Namespaces with an idle entry.
    #[serde(rename = "idleNamespaceUuids")]
    pub idle_namespace_uuids: Vec<Uuid>,
}

/// Pool of composed namespace sessions: at most one idle entry per
/// namespace, plus active entries keyed by downstream session id, plus
/// derived protocol-specific sessions keyed by namespace.
pub struct NamespacePool {
    composer: Composer,
    upstream_pool: Arc<UpstreamPool>,
    idle: DashMap<Uuid, Arc<ComposedSession>>,
    active: DashMap<String, Arc<ComposedSession>>,
    derived: DashMap<Uuid, Arc<ComposedSession>>,
}

impl NamespacePool {
    /// An empty pool over the given composer.
    pub fn new(composer: Composer, upstream_pool: Arc<UpstreamPool>) -> Self {
        Self {
            composer,
            upstream_pool,
            idle: DashMap::new(),
            active: DashMap::new(),
            derived: DashMap::new(),
        }
    }

    /// Get the composed session of a downstream session, reusing the idle
    /// slot or building on demand.
    pub async fn acquire(&self, namespace: Uuid, session_id: &str) -> Result<Arc<ComposedSession>, GatewayError> {
        if let Some(existing) = self.active.get(session_id) {
            return Ok(existing.value().clone());
        }

        if let Some((_, composed)) = self.idle.remove(&namespace) {
            if composed.is_stale() {
                self.teardown(&composed);
            } else {
                log::debug!("Reusing idle composed session for namespace {namespace}");
                self.active.insert(session_id.to_string(), composed.clone());
                return Ok(composed);
            }
        }

        let composed = self.composer.build(namespace).await?;
        self.active.insert(session_id.to_string(), composed.clone());

        Ok(composed)
    }

    /// Detach a downstream session. A fresh composed session is parked as
    /// the namespace's idle entry; stale or redundant ones are torn down.
    pub fn release(&self, session_id: &str) {
        let Some((_, composed)) = self.active.remove(session_id) else {
            return;
        };

        let namespace = composed.aggregator.namespace_uuid();

        if composed.is_stale() {
            self.teardown(&composed);
            return;
        }

        match self.idle.entry(namespace) {
            Entry::Vacant(slot) => {
                log::debug!("Parking composed session of namespace {namespace} as idle");
                slot.insert(composed);
            }
            Entry::Occupied(_) => self.teardown(&composed),
        }
    }

    /// Build the idle entry of a (new) namespace in the background. Errors
    /// are logged, never propagated to the triggering operation.
    pub fn ensure_idle(self: &Arc<Self>, namespace: Uuid) {
        if self.idle.contains_key(&namespace) {
            return;
        }

        let pool = self.clone();

        tokio::spawn(async move {
            match pool.composer.build(namespace).await {
                Ok(composed) => match pool.idle.entry(namespace) {
                    Entry::Vacant(slot) => {
                        slot.insert(composed);
                        log::debug!("Built idle composed session for namespace {namespace}");
                    }
                    Entry::Occupied(_) => pool.teardown(&composed),
                },
                Err(e) => {
                    log::error!("Failed to build idle session for namespace {namespace}: {e}");
                }
            }
        });
    }

    /// Tear down the idle slot of a namespace and flag its active sessions
    /// so they are not parked again. In-flight calls keep their snapshot.
    pub fn invalidate_idle(&self, namespace: Uuid) {
        if let Some((_, composed)) = self.idle.remove(&namespace) {
            self.teardown(&composed);
        }

        for entry in self.active.iter() {
            if entry.aggregator.namespace_uuid() == namespace {
                entry.mark_stale();
            }
        }

        log::debug!("Invalidated idle slot of namespace {namespace}");
    }

    /// Drop derived protocol sessions of the given namespaces.
    pub fn invalidate_derived(&self, namespaces: &[Uuid]) {
        for namespace in namespaces {
            if let Some((_, composed)) = self.derived.remove(namespace) {
                self.teardown(&composed);
            }
        }
    }

    /// Full cleanup on namespace deletion.
    pub fn cleanup_idle(&self, namespace: Uuid) {
        self.invalidate_idle(namespace);
        self.invalidate_derived(&[namespace]);
    }

    /// Get or build the derived session of a namespace, shared by
    /// protocol adapters that have no per-client session of their own.
    pub async fn derived_session(&self, namespace: Uuid) -> Result<Arc<ComposedSession>, GatewayError> {
        if let Some(existing) = self.derived.get(&namespace)
            && !existing.is_stale()
        {
            return Ok(existing.value().clone());
        }

        let composed = self.composer.build(namespace).await?;

        if let Some(previous) = self.derived.insert(namespace, composed.clone()) {
            self.teardown(&previous);
        }

        Ok(composed)
    }

    /// Snapshot of the pool.
    pub fn status(&self) -> PoolStatus {
        let mut active_session_ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        active_session_ids.sort_unstable();

        let mut idle_namespace_uuids: Vec<Uuid> = self.idle.iter().map(|entry| *entry.key()).collect();
        idle_namespace_uuids.sort_unstable();

        PoolStatus {
            idle: idle_namespace_uuids.len(),
            active: active_session_ids.len(),
            active_session_ids,
            idle_namespace_uuids,
        }
    }

    fn teardown(&self, composed: &ComposedSession) {
        for (server, session) in &composed.member_sessions {
            self.upstream_pool.release(*server, session);
        }
    }
}
