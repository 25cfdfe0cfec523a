//! Extractive summarizer agent

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::AgentPlugin;

/// How many leading sentences the summary keeps
const SUMMARY_SENTENCES: usize = 3;

pub struct SummarizerAgent;

impl SummarizerAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SummarizerAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentPlugin for SummarizerAgent {
    fn name(&self) -> &str {
        "summarizer"
    }

    fn get_capabilities(&self) -> Vec<String> {
        vec!["summarize".to_string(), "condense".to_string()]
    }

    fn can_handle(&self, prompt: &str, context: &Value) -> f32 {
        let prompt_lower = prompt.to_lowercase();
        let asks_for_summary = ["summarize", "summary", "tl;dr", "condense"]
            .iter()
            .any(|kw| prompt_lower.contains(kw));
        let has_document = context.get("document").is_some();

        match (asks_for_summary, has_document) {
            (true, true) => 0.95,
            (true, false) => 0.8,
            (false, true) => 0.4,
            (false, false) => 0.0,
        }
    }

    async fn process(&self, prompt: &str, context: &Value) -> Result<String> {
        let text = context
            .get("document")
            .and_then(|d| d.as_str())
            .unwrap_or(prompt);

        let summary = leading_sentences(text, SUMMARY_SENTENCES);
        Ok(summary)
    }
}

fn leading_sentences(text: &str, count: usize) -> String {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
            if sentences.len() == count {
                break;
            }
        }
    }
    if sentences.len() < count {
        let tail = current.trim();
        if !tail.is_empty() {
            sentences.push(tail.to_string());
        }
    }
    sentences.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_affinity_peaks_with_prompt_and_document() {
        let agent = SummarizerAgent::new();
        let with_both = agent.can_handle("summarize this", &json!({"document": "text"}));
        let prompt_only = agent.can_handle("give me a tl;dr", &json!({}));
        let neither = agent.can_handle("what time is it", &json!({}));
        assert!(with_both > prompt_only);
        assert!(prompt_only > neither);
        assert_eq!(neither, 0.0);
    }

    #[tokio::test]
    async fn test_summary_truncates_to_leading_sentences() {
        let agent = SummarizerAgent::new();
        let doc = "First. Second. Third. Fourth. Fifth.";
        let summary = agent
            .process("summarize", &json!({"document": doc}))
            .await
            .unwrap();
        assert_eq!(summary, "First. Second. Third.");
    }

    #[tokio::test]
    async fn test_falls_back_to_prompt_text() {
        let agent = SummarizerAgent::new();
        let summary = agent
            .process("One sentence without terminator", &json!({}))
            .await
            .unwrap();
        assert_eq!(summary, "One sentence without terminator");
    }
}
