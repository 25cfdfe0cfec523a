//! Configuration loading
//!
//! Two kinds of files are parsed here: the supervisor's own
//! `harbor.toml` (deployment server settings) and per-agent definition
//! files (`agent.toml`, with `agent.json` accepted as a legacy format).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/harbor/
///
/// Returns the path if found, None otherwise.
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("harbor").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

// ============================================================================
// Deployment Server Configuration (harbor.toml)
// ============================================================================

/// Deployment server configuration. Immutable after load except for
/// `api_port`, which auto-port-discovery may substitute at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentServerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Seconds between health-check ticks
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_restart_on_failure")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_agents_directory")]
    pub agents_directory: PathBuf,
    /// Federation metadata only; no control authority implied
    #[serde(default)]
    pub remote_servers: Vec<RemoteDeploymentServer>,
    #[serde(default = "default_auto_discover_port")]
    pub auto_discover_port: bool,
    /// Milliseconds to wait after spawn before declaring an agent alive
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,
    /// Default per-provider protocol timeout, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// A peer deployment server this node knows about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDeploymentServer {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    8765
}
fn default_base_port() -> u16 {
    8100
}
fn default_max_agents() -> usize {
    50
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_restart_on_failure() -> bool {
    true
}
fn default_max_restarts() -> u32 {
    3
}
fn default_agents_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("harbor")
        .join("agents")
}
fn default_auto_discover_port() -> bool {
    true
}
fn default_start_grace_ms() -> u64 {
    3000
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DeploymentServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            api_port: default_api_port(),
            base_port: default_base_port(),
            max_agents: default_max_agents(),
            health_check_interval: default_health_check_interval(),
            restart_on_failure: default_restart_on_failure(),
            max_restarts: default_max_restarts(),
            agents_directory: default_agents_directory(),
            remote_servers: Vec::new(),
            auto_discover_port: default_auto_discover_port(),
            start_grace_ms: default_start_grace_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DeploymentServerConfig {
    /// Load config from harbor.toml, falling back to defaults.
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for harbor.toml
    /// 2. Check ~/.config/harbor/harbor.toml (global fallback)
    /// 3. Fall back to defaults
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = find_config_file("harbor.toml") {
            tracing::debug!("Loading config from: {}", config_path.display());
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!("No harbor.toml found, using defaults");
            Self::default()
        };

        config.resolve_api_port();
        Ok(config)
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: DeploymentServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// If the configured API port is busy and auto-discovery is enabled,
    /// scan forward for a free one. This is the only post-load mutation.
    fn resolve_api_port(&mut self) {
        if !self.auto_discover_port {
            return;
        }
        if port_is_free(&self.host, self.api_port) {
            return;
        }

        for candidate in (self.api_port + 1)..(self.api_port + 100) {
            if port_is_free(&self.host, candidate) {
                tracing::warn!(
                    "API port {} busy, using {} instead",
                    self.api_port,
                    candidate
                );
                self.api_port = candidate;
                return;
            }
        }
        tracing::error!("No free API port found near {}", self.api_port);
    }
}

fn port_is_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

// ============================================================================
// Agent Definition (agent.toml / agent.json)
// ============================================================================

/// Top-level agent definition file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDefinition {
    pub agent: AgentSection,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub entry: Option<EntryConfig>,
    #[serde(default)]
    pub dependencies: Option<DependenciesConfig>,
    #[serde(default)]
    pub resources: Option<ResourcesConfig>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    #[serde(default)]
    pub sub_agents: HashMap<String, SubAgentConfig>,
}

/// The required `[agent]` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// LLM settings, mergeable with a parent config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl LlmConfig {
    /// Merge with a parent config: agent-specified fields win, unspecified
    /// fields inherit from the parent. The network address always comes
    /// from the parent.
    pub fn merged_with(&self, parent: &LlmConfig) -> LlmConfig {
        LlmConfig {
            url: parent.url.clone(),
            model: self.model.clone().or_else(|| parent.model.clone()),
            temperature: self.temperature.or(parent.temperature),
            max_tokens: self.max_tokens.or(parent.max_tokens),
        }
    }
}

/// Override for how the agent process is launched. When absent, the
/// supervisor uses the default Python entry point.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Declared runtime dependencies
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependenciesConfig {
    /// Runtime version constraint, e.g. ">=3.10,<3.13"
    #[serde(default)]
    pub python: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Advisory resource hints; not enforced by the supervisor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub cpu: Option<f32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// MCP provider connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// For non-stdio transports (unsupported, kept for forward compat)
    #[serde(default)]
    pub url: Option<String>,
    /// Per-provider request timeout override, in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_transport() -> String {
    "stdio".to_string()
}

/// Federation pointer to an already-running agent; never spawned here
#[derive(Debug, Clone, Deserialize)]
pub struct SubAgentConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

/// Definition file names, in preference order
pub const DEFINITION_TOML: &str = "agent.toml";
pub const DEFINITION_JSON: &str = "agent.json";

impl AgentDefinition {
    /// Locate the definition file inside an agent directory.
    /// TOML is preferred; JSON is the legacy fallback.
    pub fn find_in_dir(dir: &Path) -> Option<PathBuf> {
        let toml_path = dir.join(DEFINITION_TOML);
        if toml_path.exists() {
            return Some(toml_path);
        }
        let json_path = dir.join(DEFINITION_JSON);
        if json_path.exists() {
            return Some(json_path);
        }
        None
    }

    /// Load a definition from a TOML or JSON file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read definition: {}", path.display()))?;

        let definition: AgentDefinition =
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse definition: {}", path.display()))?
            } else {
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse definition: {}", path.display()))?
            };

        if definition.agent.name.trim().is_empty() {
            anyhow::bail!("Definition {} has an empty agent.name", path.display());
        }

        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config: DeploymentServerConfig = toml::from_str("").unwrap();
        assert!(config.enabled);
        assert_eq!(config.base_port, 8100);
        assert_eq!(config.max_restarts, 3);
        assert!(config.remote_servers.is_empty());
    }

    #[test]
    fn test_definition_toml() {
        let toml_src = r#"
            [agent]
            name = "research"
            version = "0.2.0"
            capabilities = ["search"]

            [llm]
            model = "llama3.1:8b"
            temperature = 0.2

            [dependencies]
            python = ">=3.10,<3.13"
            packages = ["langchain", "httpx"]

            [mcp_servers.files]
            command = "mcp-files"
            args = ["--root", "/tmp"]

            [sub_agents.planner]
            url = "http://127.0.0.1:8200"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFINITION_TOML);
        std::fs::write(&path, toml_src).unwrap();

        let def = AgentDefinition::load_from_path(&path).unwrap();
        assert_eq!(def.agent.name, "research");
        assert_eq!(def.dependencies.unwrap().packages.len(), 2);
        assert!(def.mcp_servers.contains_key("files"));
        assert_eq!(def.sub_agents["planner"].health_check_interval, 30);
    }

    #[test]
    fn test_definition_json_fallback() {
        let json_src = r#"{"agent": {"name": "legacy"}}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFINITION_JSON);
        std::fs::write(&path, json_src).unwrap();

        assert_eq!(AgentDefinition::find_in_dir(dir.path()).unwrap(), path);
        let def = AgentDefinition::load_from_path(&path).unwrap();
        assert_eq!(def.agent.name, "legacy");
    }

    #[test]
    fn test_definition_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFINITION_TOML);
        std::fs::write(&path, "[agent]\nname = \"\"\n").unwrap();
        assert!(AgentDefinition::load_from_path(&path).is_err());
    }

    #[test]
    fn test_llm_merge_inherits_address_from_parent() {
        let parent = LlmConfig {
            url: Some("http://localhost:11434".into()),
            model: Some("llama3.1:8b".into()),
            temperature: Some(0.7),
            max_tokens: Some(4096),
        };
        let child = LlmConfig {
            url: Some("http://evil:9999".into()),
            model: Some("qwen3-coder:30b".into()),
            temperature: None,
            max_tokens: None,
        };

        let merged = child.merged_with(&parent);
        // Network address always comes from the parent
        assert_eq!(merged.url.as_deref(), Some("http://localhost:11434"));
        assert_eq!(merged.model.as_deref(), Some("qwen3-coder:30b"));
        assert_eq!(merged.temperature, Some(0.7));
    }
}
