//! JSON-RPC 2.0 envelope and the `execute_web_runner` tool.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use web_runner::config::validate_input;
use web_runner::{RunInput, RunResult};

pub const TOOL_NAME: &str = "execute_web_runner";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const TASK_FAILED: i64 = -32001;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Parses a raw request body into a request, or the error response to send.
pub fn parse_request(body: &[u8]) -> Result<RpcRequest, RpcResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RpcResponse::err(Value::Null, PARSE_ERROR, format!("Parse error: {e}"), None))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = serde_json::from_value(value)
        .map_err(|e| RpcResponse::err(id.clone(), INVALID_REQUEST, format!("Invalid Request: {e}"), None))?;
    if request.jsonrpc != "2.0" {
        return Err(RpcResponse::err(id, INVALID_REQUEST, "Invalid Request: jsonrpc must be \"2.0\"", None));
    }
    Ok(request)
}

/// Routes one request. `run` executes a validated run document.
pub async fn dispatch<F, Fut>(request: RpcRequest, run: F) -> RpcResponse
where
    F: FnOnce(RunInput) -> Fut,
    Fut: Future<Output = RunResult>,
{
    let id = request.id;
    match request.method.as_str() {
        "tools/list" => RpcResponse::ok(id, json!({ "tools": [tool_descriptor()] })),
        "tools/call" => {
            let call: ToolCall = match serde_json::from_value(request.params) {
                Ok(call) => call,
                Err(e) => return RpcResponse::err(id, INVALID_PARAMS, format!("Invalid params: {e}"), None),
            };
            if call.name != TOOL_NAME {
                return RpcResponse::err(id, INVALID_PARAMS, format!("Unknown tool: {}", call.name), None);
            }
            let input: RunInput = match serde_json::from_value(call.arguments) {
                Ok(input) => input,
                Err(e) => return RpcResponse::err(id, INVALID_PARAMS, format!("Invalid arguments: {e}"), None),
            };
            if let Err(e) = validate_input(&input) {
                return RpcResponse::err(id, INVALID_PARAMS, format!("Invalid arguments: {e}"), None);
            }

            info!(target_url = %input.target_url, steps = input.actions.len(), "tool call accepted");
            let result = run(input).await;
            let results_json = result.to_json();
            if result.success {
                RpcResponse::ok(id, json!({ "content": results_json }))
            } else {
                warn!("tool call finished with errors");
                let results = serde_json::to_value(&result.steps).unwrap_or(Value::Null);
                RpcResponse::err(
                    id,
                    TASK_FAILED,
                    "Web runner task failed; see data.results for per-step details",
                    Some(json!({ "results": results })),
                )
            }
        }
        other => RpcResponse::err(id, METHOD_NOT_FOUND, format!("Method not found: {other}"), None),
    }
}

fn tool_descriptor() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Open target_url in a browser and run the actions in order, \
            searching nested iframes for selectors. Returns per-step results as JSON.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "target_url": { "type": "string" },
                "actions": { "type": "array", "items": { "type": "object" } },
                "headless": { "type": "boolean", "default": true },
                "slow_mo": { "type": "integer", "default": 0 },
                "default_timeout_ms": { "type": "integer" }
            },
            "required": ["target_url", "actions"]
        }
    })
}
