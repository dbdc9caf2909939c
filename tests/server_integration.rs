//! The stdio shell, driven over an in-memory duplex pipe

mod common;

use common::harness;
use serde_json::{Value, json};
use std::sync::Arc;
use telebridge::server::serve;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

struct McpClient {
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
}

impl McpClient {
    async fn request(&mut self, body: Value) -> Value {
        let mut line = body.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        let mut response = String::new();
        self.reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

async fn connect(
    dispatcher: Arc<telebridge::ToolDispatcher>,
) -> (McpClient, CancellationToken) {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        serve(dispatcher, BufReader::new(server_read), server_write, serve_shutdown).await;
    });
    let (client_read, client_write) = tokio::io::split(client_side);
    (
        McpClient {
            writer: client_write,
            reader: BufReader::new(client_read),
        },
        shutdown,
    )
}

#[tokio::test]
async fn initialize_reports_server_info() {
    let h = harness(true, |_| {}).await;
    let (mut client, shutdown) = connect(Arc::clone(&h.runtime.dispatcher)).await;

    let response = client
        .request(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["serverInfo"]["name"], "telebridge");
    assert!(response["result"]["capabilities"]["tools"].is_object());
    shutdown.cancel();
}

#[tokio::test]
async fn tools_list_exposes_all_sixteen_tools_with_schemas() {
    let h = harness(true, |_| {}).await;
    let (mut client, shutdown) = connect(Arc::clone(&h.runtime.dispatcher)).await;

    let response = client
        .request(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 16);
    let send_event = tools
        .iter()
        .find(|t| t["name"] == "send_event")
        .expect("send_event must be listed");
    assert_eq!(send_event["inputSchema"]["type"], "object");
    assert!(
        send_event["inputSchema"]["required"]
            .as_array()
            .unwrap()
            .contains(&json!("type"))
    );
    shutdown.cancel();
}

#[tokio::test]
async fn tools_call_wraps_the_dispatcher_result_in_a_content_block() {
    let h = harness(true, |_| {}).await;
    let (mut client, shutdown) = connect(Arc::clone(&h.runtime.dispatcher)).await;

    let response = client
        .request(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "list_event_types", "arguments": {}},
        }))
        .await;
    assert_eq!(response["result"]["isError"], false);
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["count"], 16);
    shutdown.cancel();
}

#[tokio::test]
async fn tool_errors_surface_as_error_content() {
    let h = harness(true, |_| {}).await;
    let (mut client, shutdown) = connect(Arc::clone(&h.runtime.dispatcher)).await;

    let response = client
        .request(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {"name": "no_such_tool", "arguments": {}},
        }))
        .await;
    assert_eq!(response["result"]["isError"], true);
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let envelope: Value = serde_json::from_str(text).unwrap();
    assert_eq!(envelope["kind"], "UNKNOWN_TOOL");
    shutdown.cancel();
}

#[tokio::test]
async fn unknown_method_gets_a_json_rpc_error() {
    let h = harness(true, |_| {}).await;
    let (mut client, shutdown) = connect(Arc::clone(&h.runtime.dispatcher)).await;

    let response = client
        .request(json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}))
        .await;
    assert_eq!(response["error"]["code"], -32601);
    shutdown.cancel();
}
