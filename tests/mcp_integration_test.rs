//! MCP Server Integration Tests
//!
//! These tests spawn the `doxie-mcp` binary and talk JSON-RPC to it over
//! stdio, the way an MCP client does.

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
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    request_id: i64,
    _dir: TempDir,
}

impl McpTestClient {
    /// Spawn a new MCP server in an empty directory and connect to it
    fn spawn() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut child = Command::cargo_bin("doxie-mcp")?
            .current_dir(dir.path())
            .arg("--transport")
            .arg("stdio")
            .arg("--drain-timeout")
            .arg("2s")
            .env_remove("DOXIE_CONFIG_PATH")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().ok_or("Failed to get stdin")?;
        let stdout = BufReader::new(child.stdout.take().ok_or("Failed to get stdout")?);

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout,
            request_id: 0,
            _dir: dir,
        })
    }

    fn send(&mut self, message: &Value) -> Result<(), Box<dyn std::error::Error>> {
        let stdin = self.stdin.as_mut().ok_or("stdin already closed")?;
        writeln!(stdin, "{}", serde_json::to_string(message)?)?;
        stdin.flush()?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err("server closed stdout".into());
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Send a JSON-RPC request and get the response
    fn request(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<Value, Box<dyn std::error::Error>> {
        self.request_id += 1;
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": self.request_id,
            "method": method,
            "params": params
        }))?;
        self.read_message()
    }

    fn initialize(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        let response = self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }),
        )?;
        self.send(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))?;
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

    /// Close stdin and wait for the server to exit.
    fn finish(mut self) -> std::process::ExitStatus {
        self.stdin.take();
        self.child.wait().expect("Failed to wait for server")
    }
}

impl Drop for McpTestClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

fn tool_text(response: &Value) -> &str {
    response["result"]["content"][0]["text"]
        .as_str()
        .expect("Expected text content")
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_binary_help() {
    AssertCommand::cargo_bin("doxie-mcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MCP server"))
        .stdout(predicate::str::contains("--drain-timeout"));
}

#[test]
fn test_binary_version() {
    AssertCommand::cargo_bin("doxie-mcp")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("doxie-mcp"));
}

#[test]
fn test_invalid_transport_is_rejected() {
    AssertCommand::cargo_bin("doxie-mcp")
        .unwrap()
        .arg("--transport")
        .arg("carrier-pigeon")
        .assert()
        .failure();
}

#[test]
fn test_invalid_config_file_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, "app:\n  path: no-leading-slash\n").unwrap();

    AssertCommand::cargo_bin("doxie-mcp")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("must start with '/'"));
}

#[test]
fn test_mcp_initialize() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");

    let response = client.initialize().expect("Failed to initialize");
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "doxie");
    assert!(result["capabilities"]["tools"].is_object());

    assert!(client.finish().success());
}

#[test]
fn test_mcp_list_tools() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client.request("tools/list", json!({})).expect("Failed to list tools");
    let tools = response["result"]["tools"]
        .as_array()
        .expect("tools should be array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, vec!["health", "search_docs"]);
}

#[test]
fn test_mcp_call_health() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client.call_tool("health", json!({})).expect("Failed to call tool");
    assert_eq!(tool_text(&response), "ok");
}

#[test]
fn test_mcp_call_search_docs() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client
        .call_tool(
            "search_docs",
            json!({
                "query": "rotate credentials",
                "documents": [
                    {"title": "Team lunch", "text": "Pizza on Fridays."},
                    {"title": "Credential rotation", "text": "Rotate credentials every 90 days.", "url": "https://wiki/rotate"}
                ],
                "k": 1
            }),
        )
        .expect("Failed to call tool");

    let hits: Value = serde_json::from_str(tool_text(&response)).unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["url"], "https://wiki/rotate");
}

#[test]
fn test_mcp_invalid_tool() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");

    let response = client
        .call_tool("nonexistent_tool", json!({}))
        .expect("Failed to call tool");
    assert_eq!(response["error"]["code"], -32602);
    assert_eq!(response["error"]["kind"], "InvalidParams");
}

#[test]
fn test_mcp_unknown_method() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");

    let response = client.request("nope", json!({})).expect("Failed to send");
    assert_eq!(response["id"], 1);
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["error"]["kind"], "MethodNotFound");
}

#[test]
fn test_mcp_shutdown_request_exits_cleanly() {
    let mut client = McpTestClient::spawn().expect("Failed to spawn MCP server");
    client.initialize().expect("Failed to initialize");

    let response = client.request("shutdown", Value::Null).expect("Failed to send");
    assert_eq!(response["result"], json!({}));

    let status = client.child.wait().expect("Failed to wait for server");
    assert!(status.success());
}

#[test]
fn test_mcp_garbage_input_fails_process() {
    AssertCommand::cargo_bin("doxie-mcp")
        .unwrap()
        .env_remove("DOXIE_CONFIG_PATH")
        .arg("--transport")
        .arg("stdio")
        .write_stdin("this is not json\n")
        .assert()
        .failure()
        .code(1);
}
