//! MCP Server Integration Tests
//!
//! These tests spawn the server binary and talk JSON-RPC to it over stdio.

#![allow(deprecated)] // Allow deprecated cargo_bin for now

use assert_cmd::cargo::CommandCargoExt;
use assert_cmd::Command as AssertCommand;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tempfile::TempDir;

/// MCP Test Client that communicates with the server via stdio
struct McpTestClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    request_id: i64,
}

impl McpTestClient {
    /// Spawn a new MCP server, optionally sandboxed to `sandbox_dir`.
    fn spawn(sandbox_dir: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let mut command = Command::cargo_bin("mcp-engine")?;
        command.arg("--transport").arg("stdio");
        if let Some(dir) = sandbox_dir {
            command.arg("--sandbox-root").arg(dir);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().expect("Failed to get stdin");
        let stdout = BufReader::new(child.stdout.take().expect("Failed to get stdout"));

        Ok(Self {
            child,
            stdin,
            stdout,
            request_id: 0,
        })
    }

    fn send_line(&mut self, line: &str) -> Result<(), Box<dyn std::error::Error>> {
        writeln!(self.stdin, "{}", line)?;
        self.stdin.flush()?;
        Ok(())
    }

    fn read_response(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        let mut response_line = String::new();
        self.stdout.read_line(&mut response_line)?;
        Ok(serde_json::from_str(&response_line)?)
    }

    /// Send a JSON-RPC request and get the response
    fn request(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<Value, Box<dyn std::error::Error>> {
        self.request_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.request_id,
            "method": method,
            "params": params
        });
        self.send_line(&serde_json::to_string(&request)?)?;
        self.read_response()
    }

    /// Send a notification; no response is expected.
    fn notify(&mut self, method: &str) -> Result<(), Box<dyn std::error::Error>> {
        let notification = json!({ "jsonrpc": "2.0", "method": method });
        self.send_line(&serde_json::to_string(&notification)?)
    }

    fn initialize(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        let response = self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "roots": { "listChanged": true } },
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }),
        )?;
        self.notify("notifications/initialized")?;
        Ok(response)
    }

    fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<Value, Box<dyn std::error::Error>> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
    }
}

impl Drop for McpTestClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

fn create_sandbox() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(dir.path().join("hello.txt"), "Hello from the sandbox")
        .expect("Failed to write hello.txt");
    std::fs::create_dir(dir.path().join("docs")).expect("Failed to create docs");
    dir
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_binary_help() {
    AssertCommand::cargo_bin("mcp-engine")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Model Context Protocol"));
}

#[test]
fn test_binary_version() {
    AssertCommand::cargo_bin("mcp-engine")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mcp-engine"));
}

#[test]
fn test_stdio_eof_exits_cleanly() {
    AssertCommand::cargo_bin("mcp-engine")
        .unwrap()
        .arg("--transport")
        .arg("stdio")
        .write_stdin("{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pong\""));
}

#[test]
fn test_mcp_initialize() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");

    let response = client.initialize().expect("Failed to initialize");
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "mcp-engine");
    assert!(result["capabilities"]["tools"].is_object());
    assert_eq!(response["id"], 1);
}

#[test]
fn test_mcp_ping() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");

    let response = client.request("ping", json!({})).expect("Failed to ping");
    assert_eq!(response["result"]["message"], "pong");
}

#[test]
fn test_mcp_list_tools() {
    let sandbox = create_sandbox();
    let mut client = McpTestClient::spawn(sandbox.path().to_str())
        .expect("Failed to spawn MCP server");

    client.initialize().expect("Failed to initialize");
    let response = client.request("tools/list", json!({})).expect("Failed to list tools");

    let tools = response["result"]["tools"].as_array().expect("tools should be array");
    let tool_names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for expected in ["calculator", "http_request", "read_file", "list_directory"] {
        assert!(tool_names.contains(&expected), "Expected {} tool", expected);
    }
}

#[test]
fn test_mcp_calculator() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client
        .call_tool("calculator", json!({ "operation": "multiply", "a": 6, "b": 7 }))
        .expect("Failed to call calculator");
    let text = response["result"]["content"][0]["text"]
        .as_str()
        .expect("text content");
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["result"], 42.0);
}

#[test]
fn test_mcp_divide_by_zero() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client
        .call_tool("calculator", json!({ "operation": "divide", "a": 10, "b": 0 }))
        .expect("Failed to call calculator");
    assert_eq!(response["error"]["code"], -32603);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("division by zero"));
}

#[test]
fn test_mcp_read_file_in_sandbox() {
    let sandbox = create_sandbox();
    let mut client = McpTestClient::spawn(sandbox.path().to_str())
        .expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client
        .call_tool("read_file", json!({ "path": "hello.txt" }))
        .expect("Failed to call read_file");
    assert_eq!(
        response["result"]["content"][0]["text"],
        "Hello from the sandbox"
    );

    let response = client
        .call_tool("read_file", json!({ "path": "../outside.txt" }))
        .expect("Failed to call read_file");
    assert!(response.get("error").is_some(), "Expected error outside sandbox");
}

#[test]
fn test_mcp_list_resources() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client
        .request("resources/list", json!({}))
        .expect("Failed to list resources");
    let uris: Vec<&str> = response["result"]["resources"]
        .as_array()
        .expect("resources should be array")
        .iter()
        .filter_map(|r| r["uri"].as_str())
        .collect();
    assert!(uris.contains(&"system://runtime/info"));

    let response = client
        .request("resources/read", json!({ "uri": "system://runtime/info" }))
        .expect("Failed to read resource");
    assert_eq!(response["result"]["contents"][0]["uri"], "system://runtime/info");
}

#[test]
fn test_mcp_invalid_tool() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");

    client.initialize().expect("Failed to initialize");
    let response = client
        .call_tool("nonexistent_tool", json!({}))
        .expect("Failed to call tool");
    assert!(
        response.get("error").is_some(),
        "Expected error for invalid tool"
    );
}

#[test]
fn test_mcp_parse_error_keeps_connection() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");

    client.send_line("{not json").unwrap();
    let response = client.read_response().expect("Failed to read parse error");
    assert_eq!(response["error"]["code"], -32700);
    assert!(response["id"].is_null());

    let response = client.request("ping", json!({})).expect("Failed to ping");
    assert_eq!(response["result"]["message"], "pong");
}

#[test]
fn test_mcp_unknown_method() {
    let mut client = McpTestClient::spawn(None).expect("Failed to spawn MCP server");

    let response = client
        .request("does/not/exist", json!({}))
        .expect("Failed to send request");
    assert_eq!(response["error"]["code"], -32601);
}
