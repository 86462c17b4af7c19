//! Registry of downstream sessions currently attached to namespace endpoints.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use itertools::Itertools;
use serde::Serialize;
use uuid::Uuid;

/// Which downstream transport a session attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownstreamTransport {
    /// Server-sent events.
    #[serde(rename = "SSE")]
    Sse,
    /// Streamable HTTP.
    #[serde(rename = "StreamableHTTP")]
    StreamableHttp,
}

/// One attached downstream session.
#[derive(Debug, Clone, Serialize)]
pub struct LiveSession {
    /// Opaque session identifier.
    pub session_id: String,
    /// Name of the endpoint the client attached to.
    pub endpoint_name: String,
    /// The namespace served by the endpoint.
    pub namespace_uuid: Uuid,
    /// The transport used.
    pub transport: DownstreamTransport,
}

/// Session counts per transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportCounts {
    /// Sessions attached over SSE.
    #[serde(rename = "SSE")]
    pub sse: usize,
    /// Sessions attached over streamable HTTP.
    #[serde(rename = "StreamableHTTP")]
    pub streamable_http: usize,
}

impl TransportCounts {
    fn add(&mut self, transport: DownstreamTransport) {
        match transport {
            DownstreamTransport::Sse => self.sse += 1,
            DownstreamTransport::StreamableHttp => self.streamable_http += 1,
        }
    }

    fn total(&self) -> usize {
        self.sse + self.streamable_http
    }
}

/// Per-endpoint session counts.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    /// Endpoint name.
    pub endpoint: String,
    /// Total sessions on the endpoint.
    pub count: usize,
    /// Per-transport breakdown.
    #[serde(rename = "byTransport")]
    pub by_transport: TransportCounts,
}

/// Aggregated view over all live sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Total number of attached sessions.
    pub total: usize,
    /// Per-transport breakdown.
    #[serde(rename = "byTransport")]
    pub by_transport: TransportCounts,
    /// Per-endpoint breakdown, sorted by count descending.
    #[serde(rename = "byEndpoint")]
    pub by_endpoint: Vec<EndpointStats>,
}

/// Tracks downstream sessions by id.
///
/// Counts are derived from the session table on demand, so they can never
/// drift negative and empty endpoints simply stop appearing.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, LiveSession>,
}

impl SessionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Repeated adds with the same id are a no-op.
    pub fn add(&self, session: LiveSession) {
        match self.sessions.entry(session.session_id.clone()) {
            Entry::Occupied(_) => {
                log::warn!("Session '{}' is already registered, ignoring", session.session_id);
            }
            Entry::Vacant(entry) => {
                log::debug!(
                    "Registering session '{}' on endpoint '{}'",
                    session.session_id,
                    session.endpoint_name
                );
                entry.insert(session);
            }
        }
    }

    /// Remove a session. Absent ids are ignored. Returns the removed session
    /// so callers can tear down per-session state elsewhere.
    pub fn remove(&self, session_id: &str) -> Option<LiveSession> {
        let removed = self.sessions.remove(session_id).map(|(_, session)| session);

        if removed.is_none() {
            log::debug!("Session '{session_id}' was not registered, nothing to remove");
        }

        removed
    }

    /// Look up a session by id.
    pub fn get(&self, session_id: &str) -> Option<LiveSession> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are attached.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Aggregate counts by transport and endpoint.
    pub fn stats(&self) -> SessionStats {
        let mut by_transport = TransportCounts::default();
        let mut endpoints = std::collections::HashMap::<String, TransportCounts>::new();

        for entry in self.sessions.iter() {
            by_transport.add(entry.transport);
            endpoints.entry(entry.endpoint_name.clone()).or_default().add(entry.transport);
        }

        let by_endpoint = endpoints
            .into_iter()
            .map(|(endpoint, counts)| EndpointStats {
                endpoint,
                count: counts.total(),
                by_transport: counts,
            })
            .sorted_by(|a, b| b.count.cmp(&a.count).then_with(|| a.endpoint.cmp(&b.endpoint)))
            .collect();

        SessionStats {
            total: by_transport.total(),
            by_transport,
            by_endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, endpoint: &str, transport: DownstreamTransport) -> LiveSession {
        LiveSession {
            session_id: id.to_string(),
            endpoint_name: endpoint.to_string(),
            namespace_uuid: Uuid::new_v4(),
            transport,
        }
    }

    #[test]
    fn add_is_idempotent() {
        let registry = SessionRegistry::new();

        registry.add(session("s1", "alpha", DownstreamTransport::Sse));
        registry.add(session("s1", "alpha", DownstreamTransport::StreamableHttp));

        assert_eq!(registry.len(), 1);
        // The first registration wins.
        assert_eq!(registry.get("s1").unwrap().transport, DownstreamTransport::Sse);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();

        registry.add(session("s1", "alpha", DownstreamTransport::Sse));

        assert!(registry.remove("s1").is_some());
        assert!(registry.remove("s1").is_none());
        assert!(registry.remove("never-existed").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn stats_totals_are_consistent() {
        let registry = SessionRegistry::new();

        registry.add(session("s1", "alpha", DownstreamTransport::Sse));
        registry.add(session("s2", "alpha", DownstreamTransport::StreamableHttp));
        registry.add(session("s3", "beta", DownstreamTransport::StreamableHttp));

        let stats = registry.stats();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_transport.sse + stats.by_transport.streamable_http, stats.total);
        assert_eq!(stats.by_endpoint.iter().map(|e| e.count).sum::<usize>(), stats.total);

        // Sorted by count descending.
        assert_eq!(stats.by_endpoint[0].endpoint, "alpha");
        assert_eq!(stats.by_endpoint[0].count, 2);
        assert_eq!(stats.by_endpoint[1].endpoint, "beta");
    }

    #[test]
    fn empty_endpoints_disappear() {
        let registry = SessionRegistry::new();

        registry.add(session("s1", "alpha", DownstreamTransport::Sse));
        registry.remove("s1");

        assert!(registry.stats().by_endpoint.is_empty());
    }
}
