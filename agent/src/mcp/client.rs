//! Protocol client for one tool provider
//!
//! Each provider runs as a subprocess speaking newline-delimited
//! JSON-RPC 2.0 over its stdio. The client is strictly sequential: one
//! request in flight at a time, correlated by integer id, bounded by a
//! per-provider timeout. A timeout or an unparseable line is logged and
//! surfaces as `None`; a provider-sent error object raises with the
//! provider's message.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;

use super::protocol::{self, Request};
use crate::config::McpServerConfig;

/// Protocol revision advertised during the handshake
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Identity reported by the provider in its handshake response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Unpin + Send>>;

/// Client session for one provider
pub struct McpClient {
    name: String,
    config: McpServerConfig,
    timeout: Duration,
    state: SessionState,
    next_id: i64,
    child: Option<Child>,
    writer: Option<BoxedWriter>,
    reader: Option<BoxedReader>,
    /// Capability flags from the handshake; the only thing besides
    /// `server_info` that is ever cached from it
    capabilities: Value,
    server_info: Option<ServerInfo>,
}

impl McpClient {
    pub fn new(name: impl Into<String>, config: McpServerConfig, default_timeout: Duration) -> Self {
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Self {
            name: name.into(),
            config,
            timeout,
            state: SessionState::Disconnected,
            next_id: 0,
            child: None,
            writer: None,
            reader: None,
            capabilities: Value::Null,
            server_info: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Connect to the provider and run the initialize handshake.
    /// Unsupported transports and spawn/handshake failures log and
    /// return false; they never raise.
    pub async fn connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.config.transport != "stdio" {
            tracing::warn!(
                "Provider '{}' uses unsupported transport '{}'",
                self.name,
                self.config.transport
            );
            return false;
        }

        self.state = SessionState::Connecting;

        let mut child = match self.spawn_provider() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to spawn provider '{}': {}", self.name, e);
                self.state = SessionState::Disconnected;
                return false;
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            tracing::warn!("Provider '{}' has no usable stdio", self.name);
            let _ = child.start_kill();
            self.state = SessionState::Disconnected;
            return false;
        };

        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] {}", name, line);
                }
            });
        }

        self.child = Some(child);
        self.attach_transport(Box::new(stdin), Box::new(stdout));

        match self.initialize().await {
            Ok(()) => {
                tracing::info!("Connected to provider '{}'", self.name);
                true
            }
            Err(e) => {
                tracing::warn!("Handshake with provider '{}' failed: {}", self.name, e);
                self.disconnect().await;
                false
            }
        }
    }

    fn spawn_provider(&self) -> Result<Child> {
        let command = expand(&self.config.command)?;
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| expand(a))
            .collect::<Result<_>>()?;

        let mut env: HashMap<String, String> = HashMap::new();
        for (key, value) in &self.config.env {
            env.insert(key.clone(), expand(value)?);
        }

        let child = tokio::process::Command::new(&command)
            .args(&args)
            .envs(&env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    /// Wire up reader/writer halves. Also the seam tests use to drive
    /// the client through an in-memory pipe instead of a subprocess.
    fn attach_transport(
        &mut self,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
        reader: Box<dyn AsyncRead + Unpin + Send>,
    ) {
        self.writer = Some(writer);
        self.reader = Some(BufReader::new(reader));
        self.state = SessionState::Connected;
    }

    /// Initialize handshake. Stores only the capability flags and the
    /// provider identity; any tool/prompt/resource lists a misbehaving
    /// provider tucks into the result are deliberately ignored.
    async fn initialize(&mut self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": "harbor",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });

        match self.send_request("initialize", Some(params)).await? {
            Some(result) => {
                self.capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
                self.server_info = result
                    .get("serverInfo")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                Ok(())
            }
            None => bail!("no handshake response from provider"),
        }
    }

    /// One sequential round-trip. `Ok(Some(result))` on success,
    /// `Ok(None)` on timeout or an unparseable line (logged), `Err` when
    /// not connected, on transport failure, or when the provider answers
    /// with an error object.
    async fn send_request(&mut self, method: &str, params: Option<Value>) -> Result<Option<Value>> {
        if self.state != SessionState::Connected {
            bail!("provider '{}' is not connected", self.name);
        }
        let (Some(writer), Some(reader)) = (self.writer.as_mut(), self.reader.as_mut()) else {
            bail!("provider '{}' has no transport", self.name);
        };

        self.next_id += 1;
        let request = Request::new(self.next_id, method, params);
        let mut line = protocol::serialize_request(&request)?;
        line.push('\n');

        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        // Responses are matched by id: a line answering an earlier
        // request (a late reply to something that already timed out) is
        // discarded and the read continues within the same deadline.
        let expected_id = self.next_id;
        let deadline = tokio::time::Instant::now() + self.timeout;
        let response = loop {
            let mut response_line = String::new();
            let read =
                tokio::time::timeout_at(deadline, reader.read_line(&mut response_line)).await;

            let bytes = match read {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => bail!("read from provider '{}' failed: {}", self.name, e),
                Err(_) => {
                    tracing::warn!(
                        "Request '{}' to provider '{}' timed out after {:?}",
                        method,
                        self.name,
                        self.timeout
                    );
                    return Ok(None);
                }
            };
            if bytes == 0 {
                bail!("provider '{}' closed its output", self.name);
            }

            let response = match protocol::parse_response_line(response_line.trim_end()) {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Unparseable line from provider '{}': {}", self.name, e);
                    return Ok(None);
                }
            };

            if !id_matches(&response.id, expected_id) {
                tracing::warn!(
                    "Discarding stale response from provider '{}' (id {:?}, expected {})",
                    self.name,
                    response.id,
                    expected_id
                );
                continue;
            }
            break response;
        };

        if let Some(error) = response.error {
            bail!(
                "provider '{}' returned error {}: {}",
                self.name,
                error.code,
                error.message
            );
        }
        match response.result {
            Some(result) => Ok(Some(result)),
            None => bail!("provider '{}' sent a response with no result", self.name),
        }
    }

    /// List tools. Always issues a real `tools/list` request; nothing is
    /// served from handshake data.
    pub async fn list_tools(&mut self, cursor: Option<String>) -> Result<Option<Value>> {
        let params = cursor.map(|c| json!({"cursor": c}));
        self.send_request("tools/list", params).await
    }

    pub async fn call_tool(&mut self, name: &str, args: Value) -> Result<Option<Value>> {
        self.send_request("tools/call", Some(json!({"name": name, "arguments": args})))
            .await
    }

    pub async fn list_resources(&mut self, cursor: Option<String>) -> Result<Option<Value>> {
        let params = cursor.map(|c| json!({"cursor": c}));
        self.send_request("resources/list", params).await
    }

    pub async fn read_resource(&mut self, uri: &str) -> Result<Option<Value>> {
        self.send_request("resources/read", Some(json!({"uri": uri})))
            .await
    }

    /// Subscribe to resource updates. When the provider's advertised
    /// capabilities lack subscribe support this is `Ok(false)`, not an
    /// error.
    pub async fn subscribe_resource(&mut self, uri: &str) -> Result<bool> {
        let supported = self
            .capabilities
            .get("resources")
            .and_then(|r| r.get("subscribe"))
            .and_then(|s| s.as_bool())
            .unwrap_or(false);
        if !supported {
            tracing::debug!(
                "Provider '{}' does not support resource subscription",
                self.name
            );
            return Ok(false);
        }
        let result = self
            .send_request("resources/subscribe", Some(json!({"uri": uri})))
            .await?;
        Ok(result.is_some())
    }

    pub async fn unsubscribe_resource(&mut self, uri: &str) -> Result<Option<Value>> {
        self.send_request("resources/unsubscribe", Some(json!({"uri": uri})))
            .await
    }

    pub async fn list_resource_templates(&mut self) -> Result<Option<Value>> {
        self.send_request("resources/templates/list", None).await
    }

    pub async fn list_prompts(&mut self, cursor: Option<String>) -> Result<Option<Value>> {
        let params = cursor.map(|c| json!({"cursor": c}));
        self.send_request("prompts/list", params).await
    }

    pub async fn get_prompt(&mut self, name: &str, args: Option<Value>) -> Result<Option<Value>> {
        let mut params = json!({"name": name});
        if let Some(args) = args {
            params["arguments"] = args;
        }
        self.send_request("prompts/get", Some(params)).await
    }

    /// Best-effort logging configuration: true on success, false on any
    /// failure (logged), never an error.
    pub async fn set_logging_level(&mut self, level: &str) -> bool {
        match self
            .send_request("logging/setLevel", Some(json!({"level": level})))
            .await
        {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("set_logging_level on '{}' failed: {}", self.name, e);
                false
            }
        }
    }

    /// Tear the session down. Idempotent.
    pub async fn disconnect(&mut self) {
        self.writer = None;
        self.reader = None;

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if self.state != SessionState::Disconnected {
            tracing::info!("Disconnected from provider '{}'", self.name);
        }
        self.state = SessionState::Disconnected;
        self.capabilities = Value::Null;
        self.server_info = None;
    }
}

/// Expand `$VAR`/`${VAR}`/`~` references in configured strings
fn expand(value: &str) -> Result<String> {
    Ok(shellexpand::full(value)?.into_owned())
}

/// The client issues numeric ids, but providers may echo them back as
/// strings; both forms count as a match.
fn id_matches(id: &protocol::RequestId, expected: i64) -> bool {
    match id {
        protocol::RequestId::Number(n) => *n == expected,
        protocol::RequestId::String(s) => s.parse::<i64>() == Ok(expected),
        protocol::RequestId::Null => false,
    }
}
