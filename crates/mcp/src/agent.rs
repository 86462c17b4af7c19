//! The ask-agent: a bounded plan → execute → report loop over the chat port.

use std::sync::Arc;

use indoc::indoc;
use llm::{ChatJson, ChatJsonRequest, TokenCounter};
use serde::{Deserialize, Serialize};
use storage::{NamespaceAgent, Storage};
use uuid::Uuid;

use crate::{
    discovery::index::DiscoveryIndex,
    error::GatewayError,
    middleware::ToolExecutor,
};

/// Hard ceiling on the combined prompt material, in tokens. When tripped,
/// the run ends before any chat call is made.
pub const PROMPT_TOKEN_BUDGET: usize = 200_000;

/// How many candidate tools the shortlist step requests.
const SHORTLIST_LIMIT: usize = 12;

/// Per-run ceiling on executed tool calls, whatever the agent row says.
const TOOL_CALLS_CAP: u32 = 20;

/// Per-run ceiling on exposed tools, whatever the agent row says.
const EXPOSE_CAP: u32 = 50;

/// Captured tool outputs are cut at this many characters.
const RESULT_TRUNCATE_CHARS: usize = 6_000;

const DEFAULT_SYSTEM_PROMPT: &str = indoc! {r#"
    You are a tool-routing assistant inside an MCP gateway. You receive a
    user query, a shortlist of candidate tools and optional reference
    material. Respond with a single JSON object and nothing else, shaped as:
    {"directAnswer": string?, "toolCalls": [{"name": string, "arguments":
    object?, "reason": string?}], "exposeTools": [string], "followups":
    [string]}. Only propose tools from the shortlist, respect the stated
    constraints, and prefer a direct answer when no tool is needed.
"#};

const REPORT_SYSTEM_PROMPT: &str = indoc! {r#"
    You are summarizing a tool-assisted run inside an MCP gateway. You
    receive the candidate shortlist, the plan and the executed tool calls
    with their results. Respond with a single JSON object and nothing else,
    shaped as: {"answer": string, "suggestedTools": [string],
    "exposeTools": [string], "followups": [string]}. The answer must be
    grounded in the tool results; mention failures honestly.
"#};

/// One ask invocation, as received from the synthetic ask tool.
#[derive(Debug)]
pub struct AskRequest<'a> {
    /// The namespace the session is attached to.
    pub namespace_uuid: Uuid,
    /// The downstream session asking.
    pub session_id: &'a str,
    /// Namespace description, forwarded as model context.
    pub namespace_description: Option<&'a str>,
    /// The user query.
    pub query: String,
    /// Per-call override of the agent's tool call limit.
    pub max_tool_calls: Option<u32>,
    /// Per-call override of the agent's expose limit.
    pub expose_limit: Option<u32>,
}

/// Receives the curated tool subset at the end of a run. Implemented by the
/// smart discovery layer; the set replaces the session's exposed tools.
pub trait ExposureSink: Send + Sync {
    /// Replace the exposed set of `(session, namespace)`.
    fn set_exposed(&self, session_id: &str, namespace: Uuid, tools: Vec<String>);
}

/// Outcome of one executed (or refused) tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// Full tool name as proposed by the plan.
    pub name: String,
    /// Arguments the plan proposed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    /// Whether the call ran and succeeded.
    pub ok: bool,
    /// Stringified result, truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error message when the upstream call failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Refusal reason when the call never ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Limits that applied to the run.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskUsage {
    /// Executed and refused calls, combined.
    pub tool_calls_used: usize,
    /// Effective tool call limit.
    pub tool_calls_limit: usize,
    /// Effective expose limit.
    pub expose_limit: usize,
}

/// Prompt-material token counts, by part.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// System prompt tokens.
    pub system_prompt: usize,
    /// Candidate shortlist tokens.
    pub tool_candidates: usize,
    /// Reference material tokens.
    pub references: usize,
    /// Query tokens.
    pub query: usize,
    /// Full planning payload tokens.
    pub planning_payload: usize,
    /// Sum of the above.
    pub total: usize,
}

/// The full agent report returned to the downstream session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskReport {
    /// The agent's answer.
    pub answer: String,
    /// Every executed or refused tool call, in plan order.
    pub tool_calls_executed: Vec<ToolCallRecord>,
    /// Tools the agent suggests looking at.
    pub suggested_tools: Vec<String>,
    /// Tools now exposed into the session.
    pub exposed_tools: Vec<String>,
    /// Follow-up questions the agent proposes.
    pub followups: Vec<String>,
    /// Limits that applied.
    pub usage: AskUsage,
    /// Prompt token breakdown.
    pub token_usage: TokenUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolCandidate {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    arguments: serde_json::Value,
    relevance_score: f64,
    allowed: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PlanResponse {
    direct_answer: Option<String>,
    tool_calls: Vec<PlannedCall>,
    expose_tools: Vec<String>,
    followups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PlannedCall {
    name: String,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReportResponse {
    answer: Option<String>,
    suggested_tools: Vec<String>,
    expose_tools: Vec<String>,
    followups: Vec<String>,
}

/// Orchestrates ask runs. Holds only process-wide collaborators; everything
/// per-run arrives through [`AskRequest`].
pub struct AskAgent {
    chat: Arc<dyn ChatJson>,
    index: Arc<DiscoveryIndex>,
    tokens: Arc<TokenCounter>,
    storage: Arc<dyn Storage>,
}

impl AskAgent {
    /// A new orchestrator over the given ports.
    pub fn new(
        chat: Arc<dyn ChatJson>,
        index: Arc<DiscoveryIndex>,
        tokens: Arc<TokenCounter>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            chat,
            index,
            tokens,
            storage,
        }
    }

    /// The agent's `references` value with `ragDocuments` resolved: when the
    /// key lists file names, the matching uploaded documents are inlined.
    /// Every other key passes through opaquely.
    async fn resolve_references(&self, agent: &NamespaceAgent) -> Result<serde_json::Value, GatewayError> {
        let Some(requested) = agent.references.get("ragDocuments").and_then(|v| v.as_array()) else {
            return Ok(agent.references.clone());
        };

        let documents = self.storage.agent_documents(agent.uuid).await?;

        let inlined: Vec<serde_json::Value> = documents
            .iter()
            .filter(|doc| {
                requested
                    .iter()
                    .any(|name| name.as_str() == Some(doc.filename.as_str()))
            })
            .map(|doc| {
                serde_json::json!({
                    "filename": doc.filename,
                    "mime": doc.mime,
                    "content": doc.content,
                })
            })
            .collect();

        let mut references = agent.references.clone();

        if let Some(object) = references.as_object_mut() {
            object.insert("ragDocuments".to_string(), serde_json::Value::Array(inlined));
        }

        Ok(references)
    }

    /// Run the plan → execute → report loop for one query.
    pub async fn run(
        &self,
        agent: &NamespaceAgent,
        request: AskRequest<'_>,
        executor: Arc<dyn ToolExecutor>,
        sink: &dyn ExposureSink,
    ) -> Result<AskReport, GatewayError> {
        let tool_calls_limit = request
            .max_tool_calls
            .unwrap_or(agent.max_tool_calls)
            .min(TOOL_CALLS_CAP) as usize;
        let expose_limit = request.expose_limit.unwrap_or(agent.expose_limit).min(EXPOSE_CAP) as usize;

        if !agent.enabled {
            return Ok(disabled_report(agent, tool_calls_limit, expose_limit));
        }

        if !self.chat.is_configured() {
            return Err(GatewayError::Validation(format!(
                "No API key is configured for the chat provider of agent '{}'",
                agent.name
            )));
        }

        // Shortlist.
        let hits = self
            .index
            .search(request.namespace_uuid, &request.query, SHORTLIST_LIMIT, None)
            .await?;

        let candidates: Vec<ToolCandidate> = hits
            .iter()
            .map(|hit| ToolCandidate {
                name: hit.tool.full_name.clone(),
                description: hit.tool.description.clone(),
                arguments: hit.tool.input_schema.clone(),
                relevance_score: round_score(hit.score),
                allowed: is_allowed(agent, &hit.tool.full_name),
            })
            .collect();

        let system_prompt = agent.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let references = self.resolve_references(agent).await?;

        let candidates_json = serde_json::to_string(&candidates).unwrap_or_default();
        let references_json = serde_json::to_string(&references).unwrap_or_default();

        let planning_payload = serde_json::json!({
            "namespace": {
                "uuid": request.namespace_uuid,
                "description": request.namespace_description,
            },
            "constraints": {
                "maxToolCalls": tool_calls_limit,
                "exposeLimit": expose_limit,
            },
            "tools": &candidates,
            "references": &references,
            "query": &request.query,
        })
        .to_string();

        // Budget check, before any chat call.
        let token_usage = {
            let model = agent.model.as_str();
            let system_prompt = self.tokens.count(model, system_prompt);
            let tool_candidates = self.tokens.count(model, &candidates_json);
            let references = self.tokens.count(model, &references_json);
            let query = self.tokens.count(model, &request.query);
            let planning = self.tokens.count(model, &planning_payload);

            TokenUsage {
                system_prompt,
                tool_candidates,
                references,
                query,
                planning_payload: planning,
                total: system_prompt + tool_candidates + references + query + planning,
            }
        };

        if token_usage.total > PROMPT_TOKEN_BUDGET {
            log::warn!(
                "Ask run for agent '{}' aborted before any chat call: {} tokens over a budget of {PROMPT_TOKEN_BUDGET}",
                agent.name,
                token_usage.total
            );

            return Ok(AskReport {
                answer: format!(
                    "The request was not processed: the combined prompt material is {} tokens, \
                     above the budget of {PROMPT_TOKEN_BUDGET}. Reduce the query or the agent's \
                     reference documents.",
                    token_usage.total
                ),
                tool_calls_executed: Vec::new(),
                suggested_tools: Vec::new(),
                exposed_tools: Vec::new(),
                followups: Vec::new(),
                usage: AskUsage {
                    tool_calls_used: 0,
                    tool_calls_limit,
                    expose_limit,
                },
                token_usage,
            });
        }

        // Plan.
        let plan_value = self
            .chat
            .chat_json_value(ChatJsonRequest {
                model: &agent.model,
                system: system_prompt,
                user: &planning_payload,
                timeout: None,
                base_url: None,
            })
            .await?;

        let plan: PlanResponse = serde_json::from_value(plan_value)
            .map_err(|e| GatewayError::Internal(format!("plan response did not match the expected shape: {e}")))?;

        // Execute.
        let mut records = Vec::new();

        for call in plan.tool_calls.into_iter().take(tool_calls_limit) {
            records.push(self.execute_call(agent, executor.as_ref(), call).await);
        }

        // Report.
        let report_payload = serde_json::json!({
            "shortlist": &candidates,
            "plan": {
                "directAnswer": &plan.direct_answer,
                "exposeTools": &plan.expose_tools,
                "followups": &plan.followups,
            },
            "toolCallsExecuted": &records,
        })
        .to_string();

        let report_value = self
            .chat
            .chat_json_value(ChatJsonRequest {
                model: &agent.model,
                system: REPORT_SYSTEM_PROMPT,
                user: &report_payload,
                timeout: None,
                base_url: None,
            })
            .await?;

        let report: ReportResponse = serde_json::from_value(report_value)
            .map_err(|e| GatewayError::Internal(format!("report response did not match the expected shape: {e}")))?;

        // Expose: report wins over plan, synthetic and disallowed names drop.
        let mut exposed = Vec::new();

        for name in report.expose_tools.iter().chain(plan.expose_tools.iter()) {
            if exposed.len() >= expose_limit {
                break;
            }

            if is_synthetic(name) || !is_allowed(agent, name) || exposed.contains(name) {
                continue;
            }

            exposed.push(name.clone());
        }

        sink.set_exposed(request.session_id, request.namespace_uuid, exposed.clone());

        let answer = report
            .answer
            .or(plan.direct_answer)
            .unwrap_or_else(|| "The agent did not produce an answer.".to_string());

        let mut followups = report.followups;
        let new_followups: Vec<_> = plan.followups.into_iter().filter(|f| !followups.contains(f)).collect();
        followups.extend(new_followups);

        Ok(AskReport {
            answer,
            usage: AskUsage {
                tool_calls_used: records.len(),
                tool_calls_limit,
                expose_limit,
            },
            tool_calls_executed: records,
            suggested_tools: report.suggested_tools,
            exposed_tools: exposed,
            followups,
            token_usage,
        })
    }

    async fn execute_call(&self, agent: &NamespaceAgent, executor: &dyn ToolExecutor, call: PlannedCall) -> ToolCallRecord {
        if is_synthetic(&call.name) {
            return ToolCallRecord {
                name: call.name,
                arguments: call.arguments,
                ok: false,
                result: None,
                error: None,
                reason: Some("Refusing recursive call".to_string()),
            };
        }

        if !is_allowed(agent, &call.name) {
            return ToolCallRecord {
                name: call.name.clone(),
                arguments: call.arguments,
                ok: false,
                result: None,
                error: None,
                reason: Some(format!("Tool not allowed by agent policy: {}", call.name)),
            };
        }

        let arguments = match &call.arguments {
            Some(serde_json::Value::Object(map)) => Some(map.clone()),
            _ => None,
        };

        match executor.execute(&call.name, arguments).await {
            Ok(result) => {
                let text = serde_json::to_string(&result).unwrap_or_default();

                ToolCallRecord {
                    name: call.name,
                    arguments: call.arguments,
                    ok: true,
                    result: Some(truncate_chars(text)),
                    error: None,
                    reason: call.reason,
                }
            }
            Err(e) => ToolCallRecord {
                name: call.name,
                arguments: call.arguments,
                ok: false,
                result: None,
                error: Some(e.to_string()),
                reason: call.reason,
            },
        }
    }
}

fn disabled_report(agent: &NamespaceAgent, tool_calls_limit: usize, expose_limit: usize) -> AskReport {
    AskReport {
        answer: format!("The ask agent '{}' is disabled for this namespace.", agent.name),
        tool_calls_executed: Vec::new(),
        suggested_tools: Vec::new(),
        exposed_tools: Vec::new(),
        followups: Vec::new(),
        usage: AskUsage {
            tool_calls_used: 0,
            tool_calls_limit,
            expose_limit,
        },
        token_usage: TokenUsage {
            system_prompt: 0,
            tool_candidates: 0,
            references: 0,
            query: 0,
            planning_payload: 0,
            total: 0,
        },
    }
}

/// Whether the agent may call or expose a tool: not denied, and on the
/// allowlist when one is set.
fn is_allowed(agent: &NamespaceAgent, full_name: &str) -> bool {
    if agent.denied_tools.iter().any(|denied| denied == full_name) {
        return false;
    }

    agent.allowed_tools.is_empty() || agent.allowed_tools.iter().any(|allowed| allowed == full_name)
}

/// The synthetic discovery tools must never be called recursively.
fn is_synthetic(name: &str) -> bool {
    name == crate::discovery::FIND_TOOL_NAME || name == crate::discovery::ASK_TOOL_NAME
}

fn round_score(score: f32) -> f64 {
    (f64::from(score) * 100.0).round() / 100.0
}

fn truncate_chars(text: String) -> String {
    match text.char_indices().nth(RESULT_TRUNCATE_CHARS) {
        Some((index, _)) => {
            let mut truncated = text[..index].to_string();
            truncated.push_str("…(truncated)");
            truncated
        }
        None => text,
    }
}
