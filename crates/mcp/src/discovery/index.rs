//! Per-namespace embedding index with cosine-similarity search.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{StreamExt, stream};
use llm::Embeddings;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::GatewayError;

/// How many embeddings are computed in parallel per indexing pass.
const EMBED_BATCH: usize = 5;

/// Similarity floor below which a tool is not considered a match.
pub const DEFAULT_THRESHOLD: f32 = 0.3;

/// Default number of results returned by a search.
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

/// Hard cap callers may raise the limit to.
pub const MAX_SEARCH_LIMIT: usize = 20;

/// Input to an indexing pass: one tool in its canonical form.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Name of the owning server.
    pub server_name: String,
    /// Tool name without the server prefix.
    pub original_name: String,
    /// Optional title.
    pub title: Option<String>,
    /// Optional description.
    pub description: Option<String>,
    /// JSON Schema of the tool input.
    pub input_schema: serde_json::Value,
}

impl IndexEntry {
    fn full_name(&self) -> String {
        format!("{}__{}", self.server_name, self.original_name)
    }

    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.original_name.as_bytes());
        hasher.update([0]);
        hasher.update(self.title.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0]);
        hasher.update(self.description.as_deref().unwrap_or_default().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn embedding_text(&self) -> String {
        let mut text = format!("Server: {}. Tool: {}.", self.server_name, self.original_name);

        if let Some(title) = &self.title {
            text.push_str(&format!(" Title: {title}."));
        }

        text.push_str(&format!(
            " Description: {}",
            self.description.as_deref().unwrap_or("No description")
        ));

        text
    }
}

/// One indexed tool with its cached embedding.
#[derive(Debug)]
pub struct IndexedTool {
    /// Canonical full name.
    pub full_name: String,
    /// Name of the owning server.
    pub server_name: String,
    /// Tool name without the server prefix.
    pub original_name: String,
    /// Description, when the upstream reported one.
    pub description: Option<String>,
    /// JSON Schema of the tool input.
    pub input_schema: serde_json::Value,
    /// Hash of the searchable content at embedding time.
    pub content_hash: String,
    embedding: Vec<f32>,
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matching tool.
    pub tool: Arc<IndexedTool>,
    /// Cosine similarity against the query, in `[threshold, 1]`.
    pub score: f32,
}

/// Index sizes, per namespace and overall.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    /// Number of namespaces with an index.
    pub namespaces: usize,
    /// Total indexed tools across namespaces.
    pub tools: usize,
    /// Indexed tools per namespace.
    #[serde(rename = "byNamespace")]
    pub by_namespace: std::collections::HashMap<Uuid, usize>,
}

type NamespaceMap = Arc<DashMap<String, Arc<IndexedTool>>>;

/// In-memory vector index over the embedding port, one map per namespace.
///
/// Indexing is incremental by content hash, so re-indexing an unchanged
/// registry costs no embedding calls. The cache has no hard cap; namespace
/// deletion clears it through [`DiscoveryIndex::clear_namespace_cache`].
pub struct DiscoveryIndex {
    embeddings: Arc<dyn Embeddings>,
    namespaces: DashMap<Uuid, NamespaceMap>,
    index_locks: DashMap<Uuid, Arc<futures_util::lock::Mutex<()>>>,
}

impl DiscoveryIndex {
    /// An empty index over the given embedding provider.
    pub fn new(embeddings: Arc<dyn Embeddings>) -> Self {
        Self {
            embeddings,
            namespaces: DashMap::new(),
            index_locks: DashMap::new(),
        }
    }

    /// Index the given tools for a namespace, embedding only those whose
    /// content hash changed.
    ///
    /// Concurrent calls for the same namespace serialize on a per-namespace
    /// lock; the follow-up caller re-checks hashes under the lock and ends
    /// up embedding nothing, so overlapping calls coalesce into one pass.
    /// A tool whose embedding fails is logged and skipped, never failing
    /// the pass.
    pub async fn index_tools(&self, namespace: Uuid, entries: Vec<IndexEntry>) -> Result<(), GatewayError> {
        let lock = self
            .index_locks
            .entry(namespace)
            .or_insert_with(|| Arc::new(futures_util::lock::Mutex::new(())))
            .clone();

        let _guard = lock.lock().await;

        let map = self
            .namespaces
            .entry(namespace)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();

        let changed: Vec<_> = entries
            .into_iter()
            .filter_map(|entry| {
                let full_name = entry.full_name();
                let hash = entry.content_hash();

                let unchanged = map
                    .get(&full_name)
                    .is_some_and(|existing| existing.content_hash == hash);

                (!unchanged).then_some((entry, full_name, hash))
            })
            .collect();

        if changed.is_empty() {
            return Ok(());
        }

        log::debug!(
            "Embedding {} changed tool(s) for namespace {namespace}",
            changed.len()
        );

        let embeddings = &self.embeddings;

        let mut results = stream::iter(changed.into_iter().map(|(entry, full_name, hash)| {
            let text = entry.embedding_text();

            async move {
                let result = embeddings.embed(&text).await;
                (entry, full_name, hash, result)
            }
        }))
        .buffer_unordered(EMBED_BATCH);

        while let Some((entry, full_name, hash, result)) = results.next().await {
            match result {
                Ok(embedding) => {
                    let indexed = IndexedTool {
                        full_name: full_name.clone(),
                        server_name: entry.server_name,
                        original_name: entry.original_name,
                        description: entry.description,
                        input_schema: entry.input_schema,
                        content_hash: hash,
                        embedding,
                    };

                    map.insert(full_name, Arc::new(indexed));
                }
                Err(e) => log::error!("Failed to embed tool '{full_name}': {e}"),
            }
        }

        Ok(())
    }

    /// Embed the query and return the tools scoring at or above the
    /// threshold, best first, truncated to `limit`.
    pub async fn search(
        &self,
        namespace: Uuid,
        query: &str,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>, GatewayError> {
        let Some(map) = self.namespaces.get(&namespace).map(|entry| entry.value().clone()) else {
            return Ok(Vec::new());
        };

        let threshold = threshold.unwrap_or(DEFAULT_THRESHOLD);
        let query_vector = self.embeddings.embed(query).await?;

        let mut hits: Vec<SearchHit> = map
            .iter()
            .filter_map(|entry| {
                let score = cosine_similarity(&query_vector, &entry.embedding);
                (score >= threshold).then(|| SearchHit {
                    tool: entry.value().clone(),
                    score,
                })
            })
            .collect();

        // Ties break on the name so a frozen provider yields a stable order.
        hits.sort_unstable_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.tool.full_name.cmp(&b.tool.full_name))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    /// Index sizes for observability.
    pub fn stats(&self) -> IndexStats {
        let by_namespace: std::collections::HashMap<Uuid, usize> = self
            .namespaces
            .iter()
            .map(|entry| (*entry.key(), entry.value().len()))
            .collect();

        IndexStats {
            namespaces: by_namespace.len(),
            tools: by_namespace.values().sum(),
            by_namespace,
        }
    }

    /// Drop the index of one namespace.
    pub fn clear_namespace_cache(&self, namespace: Uuid) {
        self.namespaces.remove(&namespace);
        self.index_locks.remove(&namespace);
    }

    /// Drop every namespace index.
    pub fn clear_all_caches(&self) {
        self.namespaces.clear();
        self.index_locks.clear();
    }
}

/// Cosine similarity, computed directly on the stored float arrays.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();

    if denominator <= f32::EPSILON { 0.0 } else { dot / denominator }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FrozenEmbeddings;

    fn entry(server: &str, name: &str, description: &str) -> IndexEntry {
        IndexEntry {
            server_name: server.to_string(),
            original_name: name.to_string(),
            title: None,
            description: Some(description.to_string()),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn entries() -> Vec<IndexEntry> {
        vec![
            entry("alpha", "read", "Read a file from disk"),
            entry("alpha", "write", "Write bytes to a file"),
            entry("beta", "query", "Run a SQL query against the database"),
        ]
    }

    #[tokio::test]
    async fn search_finds_the_relevant_tool() {
        let embeddings = Arc::new(FrozenEmbeddings::new());
        let index = DiscoveryIndex::new(embeddings);
        let namespace = Uuid::new_v4();

        index.index_tools(namespace, entries()).await.unwrap();

        let hits = index.search(namespace, "read a file from disk", 2, None).await.unwrap();

        assert!(!hits.is_empty());
        assert_eq!(hits[0].tool.full_name, "alpha__read");
        assert!(hits.len() <= 2);
    }

    #[tokio::test]
    async fn reindexing_unchanged_tools_embeds_nothing() {
        let embeddings = Arc::new(FrozenEmbeddings::new());
        let index = DiscoveryIndex::new(embeddings.clone());
        let namespace = Uuid::new_v4();

        index.index_tools(namespace, entries()).await.unwrap();
        let after_first = embeddings.embed_count();
        assert_eq!(after_first, 3);

        index.index_tools(namespace, entries()).await.unwrap();
        assert_eq!(embeddings.embed_count(), after_first);
    }

    #[tokio::test]
    async fn changed_content_reembeds_only_that_tool() {
        let embeddings = Arc::new(FrozenEmbeddings::new());
        let index = DiscoveryIndex::new(embeddings.clone());
        let namespace = Uuid::new_v4();

        index.index_tools(namespace, entries()).await.unwrap();
        let after_first = embeddings.embed_count();

        let mut updated = entries();
        updated[2].description = Some("Run any SQL statement".to_string());

        index.index_tools(namespace, updated).await.unwrap();
        assert_eq!(embeddings.embed_count(), after_first + 1);
    }

    #[tokio::test]
    async fn search_order_is_deterministic() {
        let embeddings = Arc::new(FrozenEmbeddings::new());
        let index = DiscoveryIndex::new(embeddings);
        let namespace = Uuid::new_v4();

        index.index_tools(namespace, entries()).await.unwrap();

        let first: Vec<_> = index
            .search(namespace, "file", 20, Some(0.0))
            .await
            .unwrap()
            .into_iter()
            .map(|hit| hit.tool.full_name.clone())
            .collect();

        for _ in 0..3 {
            let again: Vec<_> = index
                .search(namespace, "file", 20, Some(0.0))
                .await
                .unwrap()
                .into_iter()
                .map(|hit| hit.tool.full_name.clone())
                .collect();

            assert_eq!(first, again);
        }
    }

    #[tokio::test]
    async fn unknown_namespace_returns_empty() {
        let index = DiscoveryIndex::new(Arc::new(FrozenEmbeddings::new()));

        let hits = index.search(Uuid::new_v4(), "anything", 5, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn clearing_a_namespace_drops_its_tools() {
        let index = DiscoveryIndex::new(Arc::new(FrozenEmbeddings::new()));
        let namespace = Uuid::new_v4();

        index.index_tools(namespace, entries()).await.unwrap();
        assert_eq!(index.stats().tools, 3);

        index.clear_namespace_cache(namespace);
        assert_eq!(index.stats().tools, 0);
    }

    #[test]
    fn cosine_handles_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
