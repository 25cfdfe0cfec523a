//! Tool registry aggregated across providers
//!
//! Flat name-keyed map of every tool discovered from connected
//! providers. Names collide across providers in practice; policy is
//! last-writer-wins with a logged warning so the operator can see the
//! shadowing.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// One registered tool, stamped with its owning provider
#[derive(Debug, Clone, Serialize)]
pub struct McpTool {
    pub name: String,
    pub server: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, McpTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider's tool list, as returned by `tools/list`.
    /// Entries without a name are skipped with a warning; a name already
    /// owned by a different provider is overwritten with a warning.
    pub fn register(&mut self, provider: &str, tools: &[Value]) {
        for tool in tools {
            let Some(name) = tool.get("name").and_then(|n| n.as_str()) else {
                tracing::warn!("Skipping unnamed tool entry from provider '{}'", provider);
                continue;
            };

            if let Some(existing) = self.tools.get(name) {
                if existing.server != provider {
                    tracing::warn!(
                        "Tool '{}' from '{}' overwrites the one from '{}'",
                        name,
                        provider,
                        existing.server
                    );
                }
            }

            self.tools.insert(
                name.to_string(),
                McpTool {
                    name: name.to_string(),
                    server: provider.to_string(),
                    description: tool
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(String::from),
                    input_schema: tool.get("inputSchema").cloned().unwrap_or(Value::Null),
                },
            );
        }
    }

    /// Drop every tool owned by `provider`
    pub fn unregister_provider(&mut self, provider: &str) {
        self.tools.retain(|_, tool| tool.server != provider);
    }

    pub fn get(&self, name: &str) -> Option<&McpTool> {
        self.tools.get(name)
    }

    pub fn get_server_for_tool(&self, name: &str) -> Option<&str> {
        self.tools.get(name).map(|t| t.server.as_str())
    }

    pub fn tools_for_provider(&self, provider: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|t| t.server == provider)
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
