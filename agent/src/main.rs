use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harbor_agent::config::{AgentDefinition, DeploymentServerConfig};
use harbor_agent::deploy::api::{self, AppState};
use harbor_agent::deploy::{Installer, MetadataStore, Supervisor};
use harbor_agent::mcp::McpManager;

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Agent deployment server with MCP tool support")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to harbor.toml (default: walk up from cwd, then global config)
    #[arg(long, env = "HARBOR_CONFIG")]
    config: Option<PathBuf>,

    /// Control-plane address for client commands
    #[arg(long, env = "HARBOR_SERVER")]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deployment server
    Serve,
    /// List deployed agents
    Agents,
    /// Show one agent's full status
    Status {
        /// Agent name
        name: String,
    },
    /// Start a deployed agent
    Start { name: String },
    /// Stop a running agent
    Stop { name: String },
    /// Restart an agent
    Restart { name: String },
    /// Deploy an agent package (ZIP or gzipped tarball)
    Deploy {
        /// Path to the package file
        package: PathBuf,
        /// Replace an existing agent with the same name
        #[arg(long)]
        force: bool,
    },
    /// Show an agent's deployment history
    History {
        name: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show store-wide statistics
    Stats,
    /// List tools from the providers declared in an agent definition
    Tools {
        /// Definition file (default: ./agent.toml)
        #[arg(long, short)]
        definition: Option<PathBuf>,
    },
    /// Call a tool on whichever provider offers it
    Call {
        /// Tool name
        tool: String,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
        /// Definition file (default: ./agent.toml)
        #[arg(long, short)]
        definition: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DeploymentServerConfig::load_from_path(path)?,
        None => DeploymentServerConfig::load()?,
    };

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Agents => {
            let response = client(&cli.server, &config).get_json("/agents").await?;
            print_json(&response)
        }
        Commands::Status { name } => {
            let response = client(&cli.server, &config)
                .get_json(&format!("/status/{}", name))
                .await?;
            print_json(&response)
        }
        Commands::Start { name } => agent_action(&cli.server, &config, "/start", &name).await,
        Commands::Stop { name } => agent_action(&cli.server, &config, "/stop", &name).await,
        Commands::Restart { name } => agent_action(&cli.server, &config, "/restart", &name).await,
        Commands::Deploy { package, force } => {
            let response = client(&cli.server, &config).deploy(&package, force).await?;
            print_json(&response)
        }
        Commands::History { name, limit } => {
            let response = client(&cli.server, &config)
                .get_json(&format!("/history/{}?limit={}", name, limit))
                .await?;
            print_json(&response)
        }
        Commands::Stats => {
            let response = client(&cli.server, &config).get_json("/stats").await?;
            print_json(&response)
        }
        Commands::Tools { definition } => run_tools(&config, definition).await,
        Commands::Call {
            tool,
            args,
            definition,
        } => run_call(&config, &tool, args, definition).await,
    }
}

/// Run the deployment server until ctrl-c
async fn serve(config: DeploymentServerConfig) -> Result<()> {
    if !config.enabled {
        bail!("deployment server is disabled in harbor.toml");
    }
    std::fs::create_dir_all(&config.agents_directory).with_context(|| {
        format!(
            "cannot create agents directory {}",
            config.agents_directory.display()
        )
    })?;

    let store = MetadataStore::open()?;
    let supervisor = Supervisor::new(config.clone(), store.clone());

    let found = supervisor.discover().await;
    tracing::info!("Discovered {} agents", found);

    let (health_handle, shutdown) = supervisor.spawn_health_loop();

    let state = AppState {
        supervisor: supervisor.clone(),
        installer: Arc::new(Installer::new(config.agents_directory.clone())),
        store,
    };

    tokio::select! {
        result = api::serve(&config, state) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    let _ = shutdown.send(true);
    let _ = health_handle.await;

    // Managed processes die with this one (kill_on_drop); stop them
    // cleanly so ports and records are released first.
    for instance in supervisor.list().await {
        supervisor.stop(&instance.name).await;
    }
    Ok(())
}

async fn agent_action(
    server: &Option<String>,
    config: &DeploymentServerConfig,
    endpoint: &str,
    name: &str,
) -> Result<()> {
    let response = client(server, config)
        .post_json(endpoint, serde_json::json!({"agent_name": name}))
        .await?;
    print_json(&response)
}

async fn run_tools(config: &DeploymentServerConfig, definition: Option<PathBuf>) -> Result<()> {
    let manager = manager_from_definition(config, definition)?;
    manager.connect_all().await;
    let registry = manager.build_registry().await;

    for name in registry.tool_names() {
        if let Some(tool) = registry.get(&name) {
            match &tool.description {
                Some(description) => println!("{} [{}] - {}", name, tool.server, description),
                None => println!("{} [{}]", name, tool.server),
            }
        }
    }
    manager.disconnect_all().await;
    Ok(())
}

async fn run_call(
    config: &DeploymentServerConfig,
    tool: &str,
    args: Option<String>,
    definition: Option<PathBuf>,
) -> Result<()> {
    let args: serde_json::Value = match args {
        Some(text) => serde_json::from_str(&text).context("arguments must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let manager = manager_from_definition(config, definition)?;
    manager.connect_all().await;
    let registry = manager.build_registry().await;

    let result = manager.call_tool(&registry, tool, args).await;
    manager.disconnect_all().await;

    match result? {
        Some(value) => print_json(&value),
        None => bail!("tool call produced no response (timeout)"),
    }
}

fn manager_from_definition(
    config: &DeploymentServerConfig,
    definition: Option<PathBuf>,
) -> Result<McpManager> {
    let path = definition.unwrap_or_else(|| PathBuf::from("agent.toml"));
    let definition = AgentDefinition::load_from_path(&path)?;
    if definition.mcp_servers.is_empty() {
        bail!("{} declares no mcp_servers", path.display());
    }
    Ok(McpManager::new(
        &definition.mcp_servers,
        Duration::from_secs(config.request_timeout_secs),
    ))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Control-plane HTTP client
// ============================================================================

struct ControlClient {
    base_url: String,
    http: reqwest::Client,
}

fn client(server: &Option<String>, config: &DeploymentServerConfig) -> ControlClient {
    let base_url = server
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", config.host, config.api_port));
    ControlClient {
        base_url,
        http: reqwest::Client::new(),
    }
}

impl ControlClient {
    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("cannot reach deployment server at {}", self.base_url))?;
        Self::into_json(response).await
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("cannot reach deployment server at {}", self.base_url))?;
        Self::into_json(response).await
    }

    async fn deploy(&self, package: &PathBuf, force: bool) -> Result<serde_json::Value> {
        let bytes = std::fs::read(package)
            .with_context(|| format!("cannot read package {}", package.display()))?;

        let form = reqwest::multipart::Form::new()
            .part(
                "package",
                reqwest::multipart::Part::bytes(bytes).file_name(
                    package
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "package.zip".to_string()),
                ),
            )
            .text("force", force.to_string());

        let response = self
            .http
            .post(format!("{}/deploy", self.base_url))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("cannot reach deployment server at {}", self.base_url))?;
        Self::into_json(response).await
    }

    async fn into_json(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .context("server returned a non-JSON response")?;
        if !status.is_success() {
            let detail = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("request failed");
            bail!("{} ({})", detail, status);
        }
        Ok(body)
    }
}
