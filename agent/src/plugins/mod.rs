//! In-process agent plugins
//!
//! Agent kinds are compiled into the binary and selected from a
//! name-to-constructor map built at startup. No runtime code loading:
//! adding a kind means implementing [`AgentPlugin`] and listing its
//! constructor in [`PluginRegistry::builtin`].

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

mod general;
mod summarizer;

pub use general::GeneralAgent;
pub use summarizer::SummarizerAgent;

/// Shared interface for every in-process agent kind
#[async_trait]
pub trait AgentPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Capability tags, used for routing and the agents listing
    fn get_capabilities(&self) -> Vec<String>;

    /// Affinity score in [0.0, 1.0] for handling this prompt.
    /// Selection picks the highest scorer.
    fn can_handle(&self, prompt: &str, context: &Value) -> f32;

    async fn process(&self, prompt: &str, context: &Value) -> Result<String>;
}

type Constructor = fn() -> Box<dyn AgentPlugin>;

/// Name-keyed constructor map for the known agent kinds
pub struct PluginRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl PluginRegistry {
    /// Registry of the built-in kinds
    pub fn builtin() -> Self {
        let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
        constructors.insert("general", || Box::new(GeneralAgent::new()));
        constructors.insert("summarizer", || Box::new(SummarizerAgent::new()));
        Self { constructors }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.constructors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Instantiate a kind by name
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn AgentPlugin>> {
        self.constructors.get(name).map(|make| make())
    }

    /// Instantiate the kind scoring highest for this prompt. Ties break
    /// toward the lexicographically-first name so selection is
    /// deterministic.
    pub fn best_match(&self, prompt: &str, context: &Value) -> Option<Box<dyn AgentPlugin>> {
        let mut best: Option<(f32, &'static str)> = None;
        for (name, make) in &self.constructors {
            let score = make().can_handle(prompt, context);
            let better = match best {
                None => true,
                Some((best_score, best_name)) => {
                    score > best_score || (score == best_score && *name < best_name)
                }
            };
            if better {
                best = Some((score, name));
            }
        }
        best.and_then(|(_, name)| self.instantiate(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_kinds_present() {
        let registry = PluginRegistry::builtin();
        assert_eq!(registry.kinds(), vec!["general", "summarizer"]);
        assert!(registry.instantiate("general").is_some());
        assert!(registry.instantiate("nope").is_none());
    }

    #[test]
    fn test_summarizer_wins_summary_prompts() {
        let registry = PluginRegistry::builtin();
        let plugin = registry
            .best_match("Summarize this report for me", &json!({}))
            .unwrap();
        assert_eq!(plugin.name(), "summarizer");
    }

    #[test]
    fn test_general_is_the_fallback() {
        let registry = PluginRegistry::builtin();
        let plugin = registry
            .best_match("What is the weather like?", &json!({}))
            .unwrap();
        assert_eq!(plugin.name(), "general");
    }

    #[tokio::test]
    async fn test_process_produces_output() {
        let registry = PluginRegistry::builtin();
        let plugin = registry.instantiate("general").unwrap();
        let response = plugin.process("hello", &json!({})).await.unwrap();
        assert!(!response.is_empty());
    }
}
