//! General-purpose fallback agent

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::AgentPlugin;

/// Catch-all kind: low constant affinity so specialized kinds win
/// whenever they recognize the prompt.
pub struct GeneralAgent;

impl GeneralAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GeneralAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentPlugin for GeneralAgent {
    fn name(&self) -> &str {
        "general"
    }

    fn get_capabilities(&self) -> Vec<String> {
        vec!["chat".to_string(), "general".to_string()]
    }

    fn can_handle(&self, _prompt: &str, _context: &Value) -> f32 {
        0.1
    }

    async fn process(&self, prompt: &str, context: &Value) -> Result<String> {
        tracing::debug!("general agent handling prompt ({} chars)", prompt.len());
        let mut response = format!("[general] {}", prompt.trim());
        if let Some(instructions) = context.get("instructions").and_then(|i| i.as_str()) {
            response.push_str(&format!("\n(instructions: {})", instructions));
        }
        Ok(response)
    }
}
