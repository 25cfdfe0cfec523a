//! Connection manager for the configured providers
//!
//! Holds one client session per configured provider and drives their
//! lifecycle as a group: concurrent connect with per-provider failure
//! isolation, registry construction from live sessions, tool dispatch
//! by registry lookup, and teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;

use super::client::McpClient;
use super::registry::ToolRegistry;
use crate::config::McpServerConfig;

pub struct McpManager {
    clients: HashMap<String, Arc<Mutex<McpClient>>>,
}

impl McpManager {
    /// Build a manager from the configured provider table. Nothing is
    /// connected yet.
    pub fn new(servers: &HashMap<String, McpServerConfig>, default_timeout: Duration) -> Self {
        let clients = servers
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Arc::new(Mutex::new(McpClient::new(
                        name.clone(),
                        config.clone(),
                        default_timeout,
                    ))),
                )
            })
            .collect();
        Self { clients }
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Connect every provider concurrently. A provider that fails to
    /// connect is logged and skipped; the rest come up regardless.
    /// Returns the number of live sessions.
    pub async fn connect_all(&self) -> usize {
        let connects = self.clients.iter().map(|(name, client)| {
            let name = name.clone();
            let client = client.clone();
            async move {
                let connected = client.lock().await.connect().await;
                if !connected {
                    tracing::warn!("Provider '{}' did not come up", name);
                }
                connected
            }
        });

        let results = join_all(connects).await;
        let connected = results.iter().filter(|ok| **ok).count();
        tracing::info!("{}/{} providers connected", connected, self.clients.len());
        connected
    }

    /// Build a tool registry by querying every connected provider. A
    /// timeout (None) counts as an empty list; a protocol error is
    /// logged and the provider skipped.
    pub async fn build_registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        for (name, client) in &self.clients {
            let mut client = client.lock().await;
            if !client.is_connected() {
                continue;
            }
            match client.list_tools(None).await {
                Ok(Some(result)) => {
                    let tools = result
                        .get("tools")
                        .and_then(|t| t.as_array())
                        .cloned()
                        .unwrap_or_default();
                    registry.register(name, &tools);
                }
                Ok(None) => {
                    tracing::warn!("Tool listing from '{}' timed out; treating as empty", name);
                }
                Err(e) => {
                    tracing::warn!("Tool listing from '{}' failed: {}", name, e);
                }
            }
        }

        tracing::info!("Registry holds {} tools", registry.len());
        registry
    }

    /// Dispatch a tool call to whichever provider owns the tool
    pub async fn call_tool(
        &self,
        registry: &ToolRegistry,
        tool: &str,
        args: Value,
    ) -> Result<Option<Value>> {
        let Some(provider) = registry.get_server_for_tool(tool) else {
            bail!("no provider offers tool '{}'", tool);
        };
        let Some(client) = self.clients.get(provider) else {
            bail!("provider '{}' is not configured", provider);
        };
        client.lock().await.call_tool(tool, args).await
    }

    pub async fn disconnect_all(&self) {
        for client in self.clients.values() {
            client.lock().await.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(command: &str) -> McpServerConfig {
        McpServerConfig {
            transport: "stdio".to_string(),
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            url: None,
            timeout_secs: Some(1),
        }
    }

    #[tokio::test]
    async fn test_failed_provider_does_not_block_others() {
        let mut servers = HashMap::new();
        servers.insert("broken".to_string(), stdio_config("/no/such/binary"));
        servers.insert(
            "unsupported".to_string(),
            McpServerConfig {
                transport: "websocket".to_string(),
                ..stdio_config("")
            },
        );

        let manager = McpManager::new(&servers, Duration::from_secs(1));
        // Neither comes up, but connect_all completes without error
        assert_eq!(manager.connect_all().await, 0);
        let registry = manager.build_registry().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_call_tool_unknown_tool_fails() {
        let manager = McpManager::new(&HashMap::new(), Duration::from_secs(1));
        let registry = ToolRegistry::new();
        let err = manager
            .call_tool(&registry, "ghost_tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost_tool"));
    }

    #[tokio::test]
    async fn test_disconnect_all_on_empty_manager() {
        let manager = McpManager::new(&HashMap::new(), Duration::from_secs(1));
        manager.disconnect_all().await;
        assert!(manager.provider_names().is_empty());
    }
}
