//! End-to-end scenarios over the composed pipeline, with in-memory storage,
//! scripted upstreams, a frozen embedding provider and a scripted chat port.

use std::{sync::Arc, time::Duration};

use config::GatewayConfig;
use rmcp::model::CallToolRequestParam;
use serde_json::json;
use storage::{McpServer, MembershipStatus, MemoryStorage, Namespace, NamespaceAgent, ServerLaunch, Storage, ToolOverrides};
use uuid::Uuid;

use crate::{
    GatewayContext,
    aggregator::ReportedTool,
    middleware::ToolContext,
    testing::{FakeConnector, FakeUpstream, FrozenEmbeddings, ScriptedChat},
};

struct Scenario {
    context: Arc<GatewayContext>,
    storage: Arc<MemoryStorage>,
    chat: Arc<ScriptedChat>,
    namespace: Uuid,
}

impl Scenario {
    async fn new(discovery_enabled: bool) -> Self {
        let storage = Arc::new(MemoryStorage::new());

        let namespace = Namespace {
            uuid: Uuid::new_v4(),
            name: "workbench".to_string(),
            description: Some("File and database tools".to_string()),
            user_id: Some("owner".to_string()),
            smart_discovery_enabled: discovery_enabled,
            smart_discovery_description: None,
            pinned_tools: Vec::new(),
            ask_agent_uuid: None,
        };
        let ns = namespace.uuid;
        storage.create_namespace(namespace).await.unwrap();

        let connector = Arc::new(FakeConnector::new());

        for (name, tools) in [("alpha", vec!["read", "write"]), ("beta", vec!["query"])] {
            let server = McpServer {
                uuid: Uuid::new_v4(),
                name: name.to_string(),
                user_id: Some("owner".to_string()),
                launch: ServerLaunch::Stdio {
                    command: name.to_string(),
                    args: Vec::new(),
                    env: Default::default(),
                    inherit_env: false,
                },
            };

            storage.create_server(server.clone()).await.unwrap();
            storage
                .add_server_to_namespace(ns, server.uuid, MembershipStatus::Active)
                .await
                .unwrap();

            let tool_names: Vec<&str> = tools;
            connector.register(name, Arc::new(upstream_with_descriptions(name, &tool_names)));
        }

        let chat = Arc::new(ScriptedChat::new());

        let context = GatewayContext::from_parts(
            storage.clone(),
            connector,
            Some(Arc::new(FrozenEmbeddings::new())),
            chat.clone(),
            &GatewayConfig::default(),
        );

        Self {
            context,
            storage,
            chat,
            namespace: ns,
        }
    }

    async fn list(&self, session_id: &str) -> Vec<String> {
        let composed = self.context.pools().acquire(self.namespace, session_id).await.unwrap();

        let ctx = ToolContext {
            namespace_uuid: self.namespace,
            session_id: session_id.to_string(),
            executor: composed.aggregator.clone(),
        };

        composed
            .pipeline
            .list_tools(ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect()
    }

    async fn call(&self, session_id: &str, name: &str, arguments: serde_json::Value) -> serde_json::Value {
        let composed = self.context.pools().acquire(self.namespace, session_id).await.unwrap();

        let ctx = ToolContext {
            namespace_uuid: self.namespace,
            session_id: session_id.to_string(),
            executor: composed.aggregator.clone(),
        };

        let params = CallToolRequestParam {
            name: name.to_string().into(),
            arguments: match arguments {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            },
        };

        let result = composed.pipeline.call_tool(ctx, params).await.unwrap();

        serde_json::to_value(&result).unwrap()
    }

    /// The JSON payload inside the first text content block.
    fn payload(result: &serde_json::Value) -> serde_json::Value {
        let text = result["content"][0]["text"].as_str().unwrap();
        serde_json::from_str(text).unwrap()
    }

    async fn wait_for_index(&self, tools: usize) {
        let index = self.context.index.as_ref().unwrap();

        for _ in 0..100 {
            if index.stats().tools >= tools {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(index.stats().tools >= tools, "indexing never caught up");
    }
}

fn upstream_with_descriptions(server: &str, tools: &[&str]) -> FakeUpstream {
    let descriptions = [
        ("read", "Read a file from disk"),
        ("write", "Write bytes to a file on disk"),
        ("query", "Run a SQL query against the database"),
    ];

    let tools = tools
        .iter()
        .map(|name| {
            let description = descriptions
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, d)| *d)
                .unwrap_or("No description");

            rmcp::model::Tool::new(
                name.to_string(),
                description.to_string(),
                serde_json::Map::from_iter([("type".to_string(), json!("object"))]),
            )
        })
        .collect();

    FakeUpstream::with_tools(server, tools)
}

#[tokio::test]
async fn plain_namespace_lists_and_dispatches() {
    let scenario = Scenario::new(false).await;

    let names = scenario.list("s1").await;
    assert_eq!(names, vec!["alpha__read", "alpha__write", "beta__query"]);

    let result = scenario.call("s1", "beta__query", json!({"sql": "SELECT 1"})).await;
    assert_eq!(result["content"][0]["text"], "beta:query");
}

#[tokio::test]
async fn overrides_rename_and_still_dispatch() {
    let scenario = Scenario::new(false).await;
    let control = scenario.context.control_plane();

    control
        .refresh_tools(
            scenario.namespace,
            ["alpha__read", "alpha__write", "beta__query"]
                .iter()
                .map(|name| ReportedTool {
                    name: name.to_string(),
                    description: None,
                    input_schema: json!({"type": "object"}),
                })
                .collect(),
        )
        .await
        .unwrap();

    let alpha_uuid = scenario
        .storage
        .namespace_servers(scenario.namespace)
        .await
        .unwrap()
        .into_iter()
        .find(|(_, server)| server.name == "alpha")
        .unwrap()
        .1
        .uuid;

    let read = scenario
        .storage
        .tools_for_server(alpha_uuid)
        .await
        .unwrap()
        .into_iter()
        .find(|tool| tool.name == "read")
        .unwrap();

    control
        .set_tool_overrides(
            scenario.namespace,
            read.uuid,
            ToolOverrides {
                name: Some("fs_read".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let names = scenario.list("s1").await;
    assert_eq!(names, vec!["fs_read", "alpha__write", "beta__query"]);

    // The override name round-trips to the original upstream tool.
    let result = scenario.call("s1", "fs_read", json!({"path": "/etc/hosts"})).await;
    assert_eq!(result["content"][0]["text"], "alpha:read");
}

#[tokio::test]
async fn discovery_hides_tools_behind_synthetics() {
    let scenario = Scenario::new(true).await;

    let names = scenario.list("s1").await;
    assert_eq!(names, vec!["metamcp__ask", "metamcp__find"]);

    // Background indexing picks up all three tools within a bounded delay.
    scenario.wait_for_index(3).await;
}

#[tokio::test]
async fn find_exposes_tools_into_the_session() {
    let scenario = Scenario::new(true).await;

    scenario.list("s1").await;
    scenario.wait_for_index(3).await;

    let result = scenario
        .call("s1", "metamcp__find", json!({"query": "read a file from disk", "limit": 2}))
        .await;

    let payload = Scenario::payload(&result);
    assert_eq!(payload["query"], "read a file from disk");

    let found: Vec<String> = payload["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tool| tool["name"].as_str().unwrap().to_string())
        .collect();

    assert!(found.contains(&"alpha__read".to_string()));
    assert!(found.len() <= 2);

    // The discovered tools are now listed for this session...
    let names = scenario.list("s1").await;
    assert!(names.contains(&"alpha__read".to_string()));

    // ...and replace semantics hold exactly: synthetics plus the findings.
    let expected: Vec<String> = ["metamcp__ask", "metamcp__find"]
        .iter()
        .map(|s| s.to_string())
        .chain(found.iter().cloned())
        .collect();
    assert_eq!(names, expected);

    // A direct call of a discovered tool goes through.
    let result = scenario.call("s1", "alpha__read", json!({"path": "/tmp/a"})).await;
    assert_eq!(result["content"][0]["text"], "alpha:read");

    // Another session has its own exposed set.
    let other = scenario.list("s2").await;
    assert_eq!(other, vec!["metamcp__ask", "metamcp__find"]);
}

#[tokio::test]
async fn find_without_query_is_a_validation_error() {
    let scenario = Scenario::new(true).await;

    let composed = scenario.context.pools().acquire(scenario.namespace, "s1").await.unwrap();

    let ctx = ToolContext {
        namespace_uuid: scenario.namespace,
        session_id: "s1".to_string(),
        executor: composed.aggregator.clone(),
    };

    let params = CallToolRequestParam {
        name: "metamcp__find".to_string().into(),
        arguments: Some(serde_json::Map::new()),
    };

    let err = composed.pipeline.call_tool(ctx, params).await.unwrap_err();
    assert!(matches!(err, crate::GatewayError::Validation(_)));
}

#[tokio::test]
async fn synthetic_call_on_disabled_namespace_errors() {
    let scenario = Scenario::new(false).await;

    let result = scenario.call("s1", "metamcp__find", json!({"query": "anything"})).await;
    assert_eq!(result["isError"], json!(true));
}

#[tokio::test]
async fn ask_respects_policy_and_bounds() {
    let scenario = Scenario::new(true).await;

    let mut agent = NamespaceAgent::new(scenario.namespace, "helper", "gpt-4o-mini");
    agent.max_tool_calls = 1;
    agent.denied_tools = vec!["alpha__write".to_string()];
    let agent_uuid = agent.uuid;

    let control = scenario.context.control_plane();
    control.create_agent(agent).await.unwrap();
    control
        .set_active_ask_agent(scenario.namespace, Some(agent_uuid))
        .await
        .unwrap();

    scenario.list("s1").await;
    scenario.wait_for_index(3).await;

    scenario.chat.push_response(json!({
        "toolCalls": [{"name": "alpha__write", "arguments": {"path": "/tmp/x", "bytes": "aGk="}}],
        "exposeTools": [],
    }));
    scenario.chat.push_response(json!({
        "answer": "Writing files is not permitted for this agent.",
    }));

    let result = scenario
        .call("s1", "metamcp__ask", json!({"query": "write a file", "maxToolCalls": 1}))
        .await;

    let report = Scenario::payload(&result);

    let executed = report["toolCallsExecuted"].as_array().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0]["ok"], json!(false));
    assert!(executed[0]["reason"].as_str().unwrap().starts_with("Tool not allowed"));

    assert_eq!(report["answer"], "Writing files is not permitted for this agent.");
}

#[tokio::test]
async fn namespace_updates_are_seen_after_invalidation() {
    let scenario = Scenario::new(false).await;

    assert_eq!(scenario.list("s1").await.len(), 3);

    // Turn discovery on through the control plane; its invalidations make
    // the very next listing observe the change despite the status cache.
    let mut ns = scenario.storage.namespace(scenario.namespace).await.unwrap().unwrap();
    ns.smart_discovery_enabled = true;

    scenario.context.control_plane().update_namespace(ns).await.unwrap();

    let names = scenario.list("s2").await;
    assert_eq!(names, vec!["metamcp__ask", "metamcp__find"]);
}
