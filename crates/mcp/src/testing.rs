//! Test doubles shared by the unit tests: scripted upstreams, a frozen
//! embedding provider and a scripted chat port.

use std::{
    collections::{HashMap, VecDeque},
    hash::{Hash, Hasher},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use llm::{ChatJson, ChatJsonRequest, Embeddings, LlmError, normalize};
use rmcp::model::{CallToolResult, Content, JsonObject, Resource, Tool};
use storage::McpServer;

use crate::{
    error::GatewayError,
    upstream::{UpstreamConnector, UpstreamSession},
};

/// Upstream session double with a fixed tool list; records every call.
#[derive(Debug)]
pub struct FakeUpstream {
    name: String,
    tools: Vec<Tool>,
    calls: Mutex<Vec<(String, Option<JsonObject>)>>,
}

impl FakeUpstream {
    pub fn new(name: &str, tool_names: &[&str]) -> Self {
        let tools = tool_names
            .iter()
            .map(|tool| {
                Tool::new(
                    tool.to_string(),
                    format!("The {tool} tool"),
                    serde_json::Map::from_iter([("type".to_string(), serde_json::json!("object"))]),
                )
            })
            .collect();

        Self {
            name: name.to_string(),
            tools,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tools(name: &str, tools: Vec<Tool>) -> Self {
        Self {
            name: name.to_string(),
            tools,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<JsonObject>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamSession for FakeUpstream {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult, GatewayError> {
        self.calls.lock().unwrap().push((name.to_string(), arguments));

        Ok(CallToolResult {
            content: vec![Content::text(format!("{}:{name}", self.name))],
            structured_content: None,
            is_error: None,
            meta: None,
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, GatewayError> {
        Ok(Vec::new())
    }
}

/// Connector double resolving servers by name, with injectable connect
/// failures to exercise the pool's backoff.
#[derive(Default)]
pub struct FakeConnector {
    sessions: Mutex<HashMap<String, Arc<dyn UpstreamSession>>>,
    failures: Mutex<HashMap<String, usize>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, session: Arc<dyn UpstreamSession>) {
        self.sessions.lock().unwrap().insert(name.to_string(), session);
    }

    /// Make the next `count` connects to `name` fail transiently.
    pub fn fail_next(&self, name: &str, count: usize) {
        self.failures.lock().unwrap().insert(name.to_string(), count);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(&self, server: &McpServer) -> Result<Arc<dyn UpstreamSession>, GatewayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock().unwrap();

            if let Some(remaining) = failures.get_mut(&server.name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(GatewayError::UpstreamTransient(format!(
                    "injected connect failure for '{}'",
                    server.name
                )));
            }
        }

        self.sessions
            .lock()
            .unwrap()
            .get(&server.name)
            .cloned()
            .ok_or_else(|| GatewayError::UpstreamTransient(format!("no fake upstream named '{}'", server.name)))
    }
}

const EMBEDDING_DIMENSION: usize = 64;

/// Deterministic bag-of-words embedding: tokens hash into buckets, so texts
/// sharing words land close together and repeated runs are identical.
#[derive(Default)]
pub struct FrozenEmbeddings {
    calls: AtomicUsize,
}

impl FrozenEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embed_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embeddings for FrozenEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut vector = vec![0.0f32; EMBEDDING_DIMENSION];

        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 2 {
                continue;
            }

            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % EMBEDDING_DIMENSION as u64) as usize] += 1.0;
        }

        normalize(&mut vector);

        Ok(vector)
    }
}

/// Chat port double returning queued JSON values and recording every request.
#[derive(Default)]
pub struct ScriptedChat {
    responses: Mutex<VecDeque<serde_json::Value>>,
    requests: Mutex<Vec<ScriptedRequest>>,
}

#[derive(Debug, Clone)]
pub struct ScriptedRequest {
    pub model: String,
    pub system: String,
    pub user: String,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, value: serde_json::Value) {
        self.responses.lock().unwrap().push_back(value);
    }

    pub fn requests(&self) -> Vec<ScriptedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatJson for ScriptedChat {
    async fn chat_json_value(&self, request: ChatJsonRequest<'_>) -> Result<serde_json::Value, LlmError> {
        self.requests.lock().unwrap().push(ScriptedRequest {
            model: request.model.to_string(),
            system: request.system.to_string(),
            user: request.user.to_string(),
        });

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse("no scripted response queued".to_string()))
    }

    fn is_configured(&self) -> bool {
        true
    }
}
