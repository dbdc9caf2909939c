//! Thin stdio JSON-RPC shell
//!
//! Line-delimited JSON-RPC 2.0 over stdin/stdout, enough for an MCP client
//! to initialize, list tools, and call them. The wire layer stays
//! deliberately small: the dispatcher is the real contract, and everything
//! it returns (including error envelopes) travels as a text content block.

use crate::dispatch::{ClientIdentity, ToolDispatcher};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-invocation deadline when the client does not supply one
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// MCP protocol revision answered to `initialize`
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Serves the dispatcher over stdio until EOF or shutdown
pub async fn serve_stdio(dispatcher: Arc<ToolDispatcher>, shutdown: CancellationToken) {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(dispatcher, stdin, stdout, shutdown).await;
}

/// Transport-agnostic serve loop, split out for tests
pub async fn serve<R, W>(
    dispatcher: Arc<ToolDispatcher>,
    reader: BufReader<R>,
    mut writer: W,
    shutdown: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    info!("mcp server listening on stdio");
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let response = error_response(Value::Null, -32700, &format!("parse error: {err}"));
                write_line(&mut writer, &response).await;
                continue;
            }
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // notifications carry no id and get no reply
        if id.is_null() && method.starts_with("notifications/") {
            debug!(method, "notification ignored");
            continue;
        }

        let response = handle_request(&dispatcher, id, &method, request.get("params")).await;
        if let Some(response) = response {
            write_line(&mut writer, &response).await;
        }
    }
    info!("mcp server stopped");
}

async fn handle_request(
    dispatcher: &Arc<ToolDispatcher>,
    id: Value,
    method: &str,
    params: Option<&Value>,
) -> Option<Value> {
    let result = match method {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "telebridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
        "ping" => json!({}),
        "tools/list" => {
            let tools: Vec<Value> = dispatcher
                .tool_specs()
                .iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "inputSchema": spec.input_schema(),
                    })
                })
                .collect();
            json!({ "tools": tools })
        }
        "tools/call" => {
            let name = params
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = params
                .and_then(|p| p.get("arguments"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            let identity = ClientIdentity {
                api_key: std::env::var("TELEBRIDGE_CLIENT_API_KEY").ok(),
                source_ip: None,
                deadline: Some(DEFAULT_DEADLINE),
            };
            let outcome = dispatcher.invoke_enveloped(&name, arguments, identity).await;
            let is_error = outcome
                .get("error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            json!({
                "content": [{
                    "type": "text",
                    "text": outcome.to_string(),
                }],
                "isError": is_error,
            })
        }
        _ => {
            return Some(error_response(
                id,
                -32601,
                &format!("method not found: {method}"),
            ));
        }
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    if let Err(err) = writer.write_all(line.as_bytes()).await {
        warn!(%err, "stdout write failed");
    }
    let _ = writer.flush().await;
}
