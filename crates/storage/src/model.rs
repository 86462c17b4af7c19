use std::collections::BTreeMap;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A logical grouping of upstream MCP servers exposed as one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Stable identity.
    pub uuid: Uuid,
    /// Display name, also used in endpoint URLs.
    pub name: String,
    /// Optional description, surfaced to the ask-agent as context.
    pub description: Option<String>,
    /// Owner. `None` marks a public namespace.
    pub user_id: Option<String>,
    /// Whether the namespace hides its tools behind smart discovery.
    pub smart_discovery_enabled: bool,
    /// Optional description of what the namespace offers, used in the
    /// synthetic find tool description.
    pub smart_discovery_description: Option<String>,
    /// Full tool names that are always exposed, in order.
    pub pinned_tools: Vec<String>,
    /// The active ask-agent, when one is configured.
    pub ask_agent_uuid: Option<Uuid>,
}

/// How an upstream server is launched or reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ServerLaunch {
    /// Child process speaking MCP over stdin/stdout.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Arguments passed to the executable.
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables set for the child.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Whether the child inherits the parent environment. When false the
        /// child sees only `env`.
        #[serde(default)]
        inherit_env: bool,
    },
    /// Server-sent events endpoint.
    Sse {
        /// SSE endpoint URL.
        url: String,
        /// Bearer token attached to every request.
        #[serde(default, skip_serializing)]
        bearer_token: Option<SecretString>,
        /// Additional static headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Streamable HTTP endpoint.
    StreamableHttp {
        /// Endpoint URL.
        url: String,
        /// Bearer token attached to every request.
        #[serde(default, skip_serializing)]
        bearer_token: Option<SecretString>,
        /// Additional static headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

/// An upstream MCP server the gateway connects to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    /// Stable identity.
    pub uuid: Uuid,
    /// Name, unique per owner. The first segment of every full tool name.
    pub name: String,
    /// Owner. `None` marks a public server.
    pub user_id: Option<String>,
    /// Transport and launch parameters.
    pub launch: ServerLaunch,
}

/// Whether a membership participates in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    /// The member is part of the merged view.
    Active,
    /// The member is configured but hidden.
    Inactive,
}

/// Membership of a server in a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceServerMembership {
    /// The namespace.
    pub namespace_uuid: Uuid,
    /// The member server.
    pub server_uuid: Uuid,
    /// Whether the server participates in the merged view.
    pub status: MembershipStatus,
}

/// A tool as reported by an upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Stable identity.
    pub uuid: Uuid,
    /// The server that reported the tool.
    pub server_uuid: Uuid,
    /// Tool name, unique within its server.
    pub name: String,
    /// Optional human-readable title.
    pub title: Option<String>,
    /// Optional description.
    pub description: Option<String>,
    /// JSON Schema of the tool input.
    pub input_schema: serde_json::Value,
}

impl Tool {
    /// Stable hash of the searchable content. The discovery index skips
    /// re-embedding tools whose hash is unchanged.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.title.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0]);
        hasher.update(self.description.as_deref().unwrap_or_default().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Payload for bulk tool upserts, keyed by `(server_uuid, name)`.
#[derive(Debug, Clone)]
pub struct ToolUpsert {
    /// The server the tool belongs to.
    pub server_uuid: Uuid,
    /// Tool name as reported by the upstream.
    pub name: String,
    /// Optional title.
    pub title: Option<String>,
    /// Optional description.
    pub description: Option<String>,
    /// JSON Schema of the tool input.
    pub input_schema: serde_json::Value,
}

/// Per-namespace presentation overrides for a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOverrides {
    /// Replacement for the full tool name. Unique per namespace.
    pub name: Option<String>,
    /// Replacement title.
    pub title: Option<String>,
    /// Replacement description.
    pub description: Option<String>,
    /// Replacement annotations, kept opaque.
    pub annotations: Option<serde_json::Value>,
}

impl ToolOverrides {
    /// Whether any override is set.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.title.is_none() && self.description.is_none() && self.annotations.is_none()
    }
}

/// Membership of a tool in a namespace, with presentation overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceToolMembership {
    /// The namespace.
    pub namespace_uuid: Uuid,
    /// The tool.
    pub tool_uuid: Uuid,
    /// The server the tool belongs to, denormalized for dispatch.
    pub server_uuid: Uuid,
    /// Whether the tool participates in the merged view.
    pub status: MembershipStatus,
    /// Presentation overrides.
    #[serde(default)]
    pub overrides: ToolOverrides,
}

/// An ask-agent attached to a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceAgent {
    /// Stable identity.
    pub uuid: Uuid,
    /// The namespace the agent serves.
    pub namespace_uuid: Uuid,
    /// Agent kind. Only `ask` exists today.
    pub agent_type: String,
    /// Display name.
    pub name: String,
    /// Whether the agent answers queries.
    pub enabled: bool,
    /// Chat model identifier.
    pub model: String,
    /// Optional system prompt replacing the built-in one.
    pub system_prompt: Option<String>,
    /// Free-form reference material forwarded to the model. Only the
    /// `ragDocuments` key is interpreted by the core.
    pub references: serde_json::Value,
    /// Full tool names the agent may call. Empty means all non-denied tools.
    pub allowed_tools: Vec<String>,
    /// Full tool names the agent must not call.
    pub denied_tools: Vec<String>,
    /// Default number of tool calls per run. Clamped to 20 at call time.
    pub max_tool_calls: u32,
    /// Default number of tools exposed back into the session. Clamped to 50.
    pub expose_limit: u32,
}

impl NamespaceAgent {
    /// Agent with the default limits: 3 tool calls, 5 exposed tools.
    pub fn new(namespace_uuid: Uuid, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            namespace_uuid,
            agent_type: "ask".to_string(),
            name: name.into(),
            enabled: true,
            model: model.into(),
            system_prompt: None,
            references: serde_json::Value::Null,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            max_tool_calls: 3,
            expose_limit: 5,
        }
    }
}

/// A document uploaded as agent reference material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDocument {
    /// The agent that owns the document.
    pub agent_uuid: Uuid,
    /// File name, unique per agent.
    pub filename: String,
    /// MIME type.
    pub mime: String,
    /// Raw content.
    pub content: String,
    /// Token count under the agent's model, computed at insert time.
    pub token_count: u64,
}

/// Append-only audit row for the package-install helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInstallRecord {
    /// Package manager used.
    pub manager: String,
    /// Package that was requested.
    pub package_name: String,
    /// Full command that was executed.
    pub command: String,
    /// Captured process output.
    pub output: String,
    /// `success` or `failure`.
    pub status: String,
    /// The requesting user, when known.
    pub user_id: Option<String>,
    /// Insertion time.
    pub created_at: jiff::Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, title: Option<&str>, description: Option<&str>) -> Tool {
        Tool {
            uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            name: name.to_string(),
            title: title.map(str::to_string),
            description: description.map(str::to_string),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn content_hash_ignores_identity_and_schema() {
        let a = tool("read", Some("Read"), Some("Reads a file"));
        let mut b = tool("read", Some("Read"), Some("Reads a file"));
        b.input_schema = serde_json::json!({"type": "object", "properties": {"path": {"type": "string"}}});

        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_separates_fields() {
        // "ab" + "" must not collide with "a" + "b"
        let a = tool("ab", None, None);
        let b = tool("a", Some("b"), None);

        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_changes_with_description() {
        let a = tool("read", None, Some("Reads a file"));
        let b = tool("read", None, Some("Reads two files"));

        assert_ne!(a.content_hash(), b.content_hash());
    }
}
