//! Agent process supervisor
//!
//! Owns the lifecycle state machine for every managed agent process:
//! discovery, spawn, health checking, stop, restart, and diagnostics.
//! All mutations go through one internal lock, so state transitions for
//! a given agent are strictly sequential; the managed agents themselves
//! run as independent OS processes.
//!
//! Status flow: discovered -> starting -> running -> {failed | stopped},
//! with failed/stopped re-entering starting via an explicit restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::diagnostics::{self, FailureContext};
use super::ports::{PortError, PortManager};
use super::store::{AgentRecord, MetadataStore};
use crate::config::{AgentDefinition, DeploymentServerConfig};

/// Cap on captured bytes per stream at process-exit time
const LOG_CAPTURE_CAP: usize = 64 * 1024;

/// Grace period for SIGTERM before escalating to SIGKILL
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between stop and start during a restart
const RESTART_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Discovered,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Discovered => "discovered",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// One supervised agent. The OS process handle lives separately in the
/// supervisor so this snapshot stays cloneable and serializable.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInstance {
    pub name: String,
    pub config_path: PathBuf,
    pub status: AgentStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub checksum: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    /// Monotonic; reset only on a fresh deployment
    pub restart_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub error_message: Option<String>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
    pub exit_code: Option<i32>,
}

impl AgentInstance {
    fn new(name: String, config_path: PathBuf) -> Self {
        Self {
            name,
            config_path,
            status: AgentStatus::Discovered,
            port: None,
            pid: None,
            checksum: None,
            start_time: None,
            restart_count: 0,
            last_health_check: None,
            health_status: HealthStatus::Unknown,
            error_message: None,
            stdout_log: None,
            stderr_log: None,
            exit_code: None,
        }
    }

    fn to_record(&self) -> AgentRecord {
        AgentRecord {
            name: self.name.clone(),
            status: self.status.as_str().to_string(),
            checksum: self.checksum.clone(),
            port: self.port,
            pid: self.pid,
            config_path: self.config_path.display().to_string(),
            start_time: self.start_time.map(|t| t.to_rfc3339()),
            restart_count: self.restart_count,
            last_health_check: self.last_health_check.map(|t| t.to_rfc3339()),
            health_status: self.health_status.as_str().to_string(),
            error_message: self.error_message.clone(),
            stdout_log: self.stdout_log.clone(),
            stderr_log: self.stderr_log.clone(),
            exit_code: self.exit_code,
            metadata: None,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    fn from_record(record: &AgentRecord) -> Self {
        // A record persisted as running/starting belongs to a previous
        // supervisor process; liveness cannot be assumed, so it comes
        // back as stopped and needs an explicit start.
        let status = match record.status.as_str() {
            "running" | "starting" => AgentStatus::Stopped,
            "failed" => AgentStatus::Failed,
            "stopped" => AgentStatus::Stopped,
            _ => AgentStatus::Discovered,
        };
        Self {
            name: record.name.clone(),
            config_path: PathBuf::from(&record.config_path),
            status,
            port: None,
            pid: None,
            checksum: record.checksum.clone(),
            start_time: None,
            restart_count: record.restart_count,
            last_health_check: None,
            health_status: HealthStatus::Unknown,
            error_message: record.error_message.clone(),
            stdout_log: record.stdout_log.clone(),
            stderr_log: record.stderr_log.clone(),
            exit_code: record.exit_code,
        }
    }
}

/// Process handle plus its live capture buffers
struct RunningChild {
    child: Child,
    stdout: Arc<StdMutex<Vec<u8>>>,
    stderr: Arc<StdMutex<Vec<u8>>>,
}

struct SupervisorInner {
    config: DeploymentServerConfig,
    agents: HashMap<String, AgentInstance>,
    children: HashMap<String, RunningChild>,
    ports: PortManager,
    store: MetadataStore,
}

/// The supervisor handle. Cloneable; all clones share one state map.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<SupervisorInner>>,
}

impl Supervisor {
    /// Build a supervisor, reconciling in-memory state from the store.
    pub fn new(config: DeploymentServerConfig, store: MetadataStore) -> Self {
        let registry_path = config.agents_directory.join(".ports.json");
        let max_ports = config.max_agents.min(u16::MAX as usize) as u16;
        let ports = PortManager::with_registry(config.base_port, max_ports, registry_path);

        let mut agents = HashMap::new();
        for record in store.list_agents(None) {
            let instance = AgentInstance::from_record(&record);
            if record.status == "running" || record.status == "starting" {
                tracing::info!(
                    "Agent '{}' was {} before restart; marking stopped",
                    record.name,
                    record.status
                );
                store.upsert_agent(&instance.to_record());
            }
            agents.insert(record.name.clone(), instance);
        }

        Self {
            inner: Arc::new(Mutex::new(SupervisorInner {
                config,
                agents,
                children: HashMap::new(),
                ports,
                store,
            })),
        }
    }

    /// Scan the agents directory for definition files and register each
    /// as `discovered`. Never spawns anything. A broken definition is
    /// logged and skipped; the scan continues.
    pub async fn discover(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let dir = inner.config.agents_directory.clone();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read agents directory {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut found = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(def_path) = AgentDefinition::find_in_dir(&path) else {
                continue;
            };

            let definition = match AgentDefinition::load_from_path(&def_path) {
                Ok(def) => def,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", def_path.display(), e);
                    continue;
                }
            };

            let name = definition.agent.name;
            found += 1;

            match inner.agents.get_mut(&name) {
                Some(existing) => {
                    existing.config_path = def_path;
                    // There is no running -> discovered edge; a live
                    // agent keeps its status across re-discovery.
                    if !matches!(
                        existing.status,
                        AgentStatus::Running | AgentStatus::Starting
                    ) {
                        existing.status = AgentStatus::Discovered;
                    }
                    let record = existing.to_record();
                    inner.store.upsert_agent(&record);
                }
                None => {
                    if inner.agents.len() >= inner.config.max_agents {
                        tracing::warn!(
                            "max_agents ({}) reached, not registering '{}'",
                            inner.config.max_agents,
                            name
                        );
                        continue;
                    }
                    tracing::info!("Discovered agent '{}' at {}", name, def_path.display());
                    let instance = AgentInstance::new(name.clone(), def_path);
                    inner.store.upsert_agent(&instance.to_record());
                    inner.agents.insert(name, instance);
                }
            }
        }

        found
    }

    /// Register an agent installed by the control plane. Resets
    /// `restart_count`; a fresh deployment starts with a clean slate.
    ///
    /// A redeploy can replace an agent that is still running; the old
    /// process is stopped and its port released before the instance is
    /// swapped, so nothing is left orphaned.
    pub async fn register(&self, name: &str, config_path: PathBuf, checksum: Option<String>) {
        self.stop(name).await;
        let mut inner = self.inner.lock().await;
        let mut instance = AgentInstance::new(name.to_string(), config_path);
        instance.checksum = checksum;
        inner.store.upsert_agent(&instance.to_record());
        inner.agents.insert(name.to_string(), instance);
    }

    /// Explicit un-deploy: stop if running, drop from the active map and
    /// the store. Returns None for an unknown name.
    pub async fn remove(&self, name: &str) -> Option<bool> {
        {
            let inner = self.inner.lock().await;
            if !inner.agents.contains_key(name) {
                return None;
            }
        }
        self.stop(name).await;
        let mut inner = self.inner.lock().await;
        inner.agents.remove(name);
        inner.store.delete_agent(name);
        Some(true)
    }

    /// Snapshot of one agent
    pub async fn get(&self, name: &str) -> Option<AgentInstance> {
        let inner = self.inner.lock().await;
        inner.agents.get(name).cloned()
    }

    /// Snapshot of all agents
    pub async fn list(&self) -> Vec<AgentInstance> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<_> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Start an agent.
    ///
    /// Returns None for an unknown name, Some(true) on success (or when
    /// already running), Some(false) on failure — spawn failures never
    /// propagate as errors; they land in the instance's diagnostics.
    pub async fn start(&self, name: &str) -> Option<bool> {
        let started_at = std::time::Instant::now();
        let mut inner = self.inner.lock().await;

        if !inner.agents.contains_key(name) {
            return None;
        }
        if inner.agents[name].status == AgentStatus::Running {
            return Some(true);
        }

        let config_path = inner.agents[name].config_path.clone();
        let grace = Duration::from_millis(inner.config.start_grace_ms);

        let port = match inner.ports.allocate(name, None) {
            Ok(port) => port,
            Err(e @ PortError::Exhausted { .. }) => {
                tracing::error!("Cannot start '{}': {}", name, e);
                let message = e.to_string();
                Self::mark_failed(&mut inner, name, message, None, started_at);
                return Some(false);
            }
            Err(e) => {
                tracing::error!("Port allocation for '{}' failed: {}", name, e);
                Self::mark_failed(&mut inner, name, e.to_string(), None, started_at);
                return Some(false);
            }
        };

        let command = match build_command(&config_path, port) {
            Ok(command) => command,
            Err(e) => {
                inner.ports.release(name);
                let working_dir = config_path.parent().unwrap_or(&config_path).to_path_buf();
                let report = diagnostics::synthesize(&FailureContext {
                    agent_name: name,
                    definition_path: &config_path,
                    working_dir: &working_dir,
                    port: Some(port),
                    stderr: "",
                    exit_code: None,
                    spawn_error: Some(&e.to_string()),
                });
                Self::mark_failed(&mut inner, name, report, None, started_at);
                return Some(false);
            }
        };

        if let Some(instance) = inner.agents.get_mut(name) {
            instance.status = AgentStatus::Starting;
            instance.port = Some(port);
            instance.error_message = None;
            instance.exit_code = None;
        }

        tracing::info!("Starting agent '{}' on port {}", name, port);

        let mut command = command;
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.ports.release(name);
                let working_dir = config_path.parent().unwrap_or(&config_path).to_path_buf();
                let report = diagnostics::synthesize(&FailureContext {
                    agent_name: name,
                    definition_path: &config_path,
                    working_dir: &working_dir,
                    port: Some(port),
                    stderr: "",
                    exit_code: None,
                    spawn_error: Some(&e.to_string()),
                });
                Self::mark_failed(&mut inner, name, report, None, started_at);
                return Some(false);
            }
        };

        let stdout_buf = Arc::new(StdMutex::new(Vec::new()));
        let stderr_buf = Arc::new(StdMutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            spawn_capture(stdout, stdout_buf.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture(stderr, stderr_buf.clone());
        }

        // Grace period: the process must survive a short window before
        // it counts as running.
        tokio::time::sleep(grace).await;

        match child.try_wait() {
            Ok(None) => {
                let pid = child.id();
                if let Some(instance) = inner.agents.get_mut(name) {
                    instance.status = AgentStatus::Running;
                    instance.pid = pid;
                    instance.start_time = Some(Utc::now());
                    instance.health_status = HealthStatus::Unknown;
                }
                inner.children.insert(
                    name.to_string(),
                    RunningChild {
                        child,
                        stdout: stdout_buf,
                        stderr: stderr_buf,
                    },
                );
                Self::persist(&mut inner, name);
                let checksum = inner.agents.get(name).and_then(|a| a.checksum.clone());
                inner.store.record_deployment(
                    name,
                    checksum.as_deref(),
                    "start",
                    "success",
                    started_at.elapsed().as_millis() as i64,
                    None,
                );
                tracing::info!("Agent '{}' running (pid {:?})", name, pid);
                Some(true)
            }
            Ok(Some(exit)) => {
                // Give the capture tasks a beat to drain the pipes
                tokio::time::sleep(Duration::from_millis(50)).await;
                let stdout_text = drain_capture(&stdout_buf);
                let stderr_text = drain_capture(&stderr_buf);
                let exit_code = exit.code();

                let working_dir = config_path.parent().unwrap_or(&config_path).to_path_buf();
                let report = diagnostics::synthesize(&FailureContext {
                    agent_name: name,
                    definition_path: &config_path,
                    working_dir: &working_dir,
                    port: Some(port),
                    stderr: &stderr_text,
                    exit_code,
                    spawn_error: None,
                });

                inner.ports.release(name);
                if let Some(instance) = inner.agents.get_mut(name) {
                    instance.stdout_log = Some(stdout_text);
                    instance.stderr_log = Some(stderr_text);
                    instance.port = None;
                }
                Self::mark_failed(&mut inner, name, report, exit_code, started_at);
                tracing::warn!("Agent '{}' exited during startup", name);
                Some(false)
            }
            Err(e) => {
                inner.ports.release(name);
                Self::mark_failed(
                    &mut inner,
                    name,
                    format!("Failed to poll agent process: {}", e),
                    None,
                    started_at,
                );
                Some(false)
            }
        }
    }

    /// Stop an agent: SIGTERM, bounded wait, then SIGKILL; always reaped.
    /// None for unknown names; Some(true) when already not running.
    pub async fn stop(&self, name: &str) -> Option<bool> {
        let started_at = std::time::Instant::now();
        let mut inner = self.inner.lock().await;

        if !inner.agents.contains_key(name) {
            return None;
        }
        if inner.agents[name].status != AgentStatus::Running {
            return Some(true);
        }

        tracing::info!("Stopping agent '{}'", name);

        if let Some(mut running) = inner.children.remove(name) {
            if let Some(pid) = running.child.id() {
                // Graceful terminate first
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }

            match tokio::time::timeout(STOP_TIMEOUT, running.child.wait()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Error reaping agent '{}': {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Agent '{}' ignored SIGTERM, killing", name);
                    let _ = running.child.start_kill();
                    let _ = running.child.wait().await;
                }
            }
        }

        inner.ports.release(name);
        if let Some(instance) = inner.agents.get_mut(name) {
            instance.status = AgentStatus::Stopped;
            instance.pid = None;
            instance.port = None;
            instance.health_status = HealthStatus::Unknown;
        }
        Self::persist(&mut inner, name);
        let checksum = inner.agents.get(name).and_then(|a| a.checksum.clone());
        inner.store.record_deployment(
            name,
            checksum.as_deref(),
            "stop",
            "success",
            started_at.elapsed().as_millis() as i64,
            None,
        );
        Some(true)
    }

    /// Restart: bump the restart counter, stop, pause briefly, start.
    pub async fn restart(&self, name: &str) -> Option<bool> {
        {
            let mut inner = self.inner.lock().await;
            let instance = inner.agents.get_mut(name)?;
            instance.restart_count += 1;
        }

        self.stop(name).await?;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(name).await
    }

    /// One health-check pass over every running agent. A process that
    /// exited behind our back is marked failed/unhealthy and, policy
    /// permitting, queued for automatic restart. Trouble with one agent
    /// never affects the others.
    pub async fn health_check_once(&self) {
        let mut to_restart = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            let running: Vec<String> = inner
                .agents
                .iter()
                .filter(|(_, a)| a.status == AgentStatus::Running)
                .map(|(n, _)| n.clone())
                .collect();

            for name in running {
                // Outer None: still alive. Outer Some: exited, with the
                // exit code when the OS reported one.
                let exit: Option<Option<i32>> = match inner.children.get_mut(&name) {
                    Some(running_child) => match running_child.child.try_wait() {
                        Ok(None) => None,
                        Ok(Some(status)) => Some(status.code()),
                        Err(e) => {
                            tracing::warn!("Health check for '{}' failed: {}", name, e);
                            continue;
                        }
                    },
                    // Running without a handle means the handle was lost;
                    // treat as dead.
                    None => Some(None),
                };

                match exit {
                    None => {
                        if let Some(instance) = inner.agents.get_mut(&name) {
                            instance.health_status = HealthStatus::Healthy;
                            instance.last_health_check = Some(Utc::now());
                        }
                    }
                    Some(code) => {
                        tracing::warn!("Agent '{}' exited unexpectedly ({:?})", name, code);
                        let (stdout_text, stderr_text) = match inner.children.remove(&name) {
                            Some(running_child) => (
                                drain_capture(&running_child.stdout),
                                drain_capture(&running_child.stderr),
                            ),
                            None => (String::new(), String::new()),
                        };

                        inner.ports.release(&name);
                        if let Some(instance) = inner.agents.get_mut(&name) {
                            instance.status = AgentStatus::Failed;
                            instance.health_status = HealthStatus::Unhealthy;
                            instance.last_health_check = Some(Utc::now());
                            instance.exit_code = code;
                            instance.pid = None;
                            instance.port = None;
                            instance.stdout_log = Some(stdout_text);
                            instance.stderr_log = Some(stderr_text);
                            instance.error_message =
                                Some("Process exited unexpectedly".to_string());
                        }
                        Self::persist(&mut inner, &name);

                        let restart_count =
                            inner.agents.get(&name).map(|a| a.restart_count).unwrap_or(0);
                        if inner.config.restart_on_failure
                            && restart_count < inner.config.max_restarts
                        {
                            to_restart.push(name.clone());
                        } else if inner.config.restart_on_failure {
                            tracing::error!(
                                "Agent '{}' exhausted its {} restarts",
                                name,
                                inner.config.max_restarts
                            );
                        }
                    }
                }
            }
        }

        for name in to_restart {
            tracing::info!("Auto-restarting agent '{}'", name);
            if let Some(false) = self.restart(&name).await {
                tracing::warn!("Auto-restart of '{}' failed", name);
            }
        }
    }

    /// Spawn the periodic health-check loop. Send `true` on the returned
    /// channel (or drop it) to stop the loop; cancellation during a
    /// sleep or a check unwinds without corrupting instance state.
    pub fn spawn_health_loop(&self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let supervisor = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let interval_secs = {
                let inner = supervisor.inner.lock().await;
                inner.config.health_check_interval.max(1)
            };
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh
            // supervisor does not probe before anything started.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        supervisor.health_check_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Health-check loop stopped");
        });

        (handle, shutdown_tx)
    }

    fn mark_failed(
        inner: &mut SupervisorInner,
        name: &str,
        message: String,
        exit_code: Option<i32>,
        started_at: std::time::Instant,
    ) {
        if let Some(instance) = inner.agents.get_mut(name) {
            instance.status = AgentStatus::Failed;
            instance.health_status = HealthStatus::Unhealthy;
            instance.error_message = Some(message.clone());
            instance.exit_code = exit_code;
            instance.pid = None;
        }
        let checksum = inner.agents.get(name).and_then(|a| a.checksum.clone());
        Self::persist(inner, name);
        inner.store.record_deployment(
            name,
            checksum.as_deref(),
            "start",
            "failure",
            started_at.elapsed().as_millis() as i64,
            Some(&message),
        );
    }

    fn persist(inner: &mut SupervisorInner, name: &str) {
        if let Some(instance) = inner.agents.get(name) {
            inner.store.upsert_agent(&instance.to_record());
        }
    }
}

/// Build the subprocess invocation for an agent: its entry point, bound
/// to the allocated port, with the definition file as argument and the
/// definition's directory as working directory.
fn build_command(config_path: &std::path::Path, port: u16) -> Result<Command> {
    let definition = AgentDefinition::load_from_path(config_path)?;
    let working_dir = config_path
        .parent()
        .context("Definition file has no parent directory")?;

    // An explicit entry override runs verbatim; the default Python
    // entry point additionally receives the definition and port as
    // arguments. Either way the port is exported in the environment.
    let (program, args) = match definition.entry {
        Some(entry) => (entry.command, entry.args),
        None => {
            let venv_python = working_dir.join(".venv").join("bin").join("python3");
            let python = if venv_python.exists() {
                venv_python.display().to_string()
            } else {
                "python3".to_string()
            };
            (
                python,
                vec![
                    "main.py".to_string(),
                    "--config".to_string(),
                    config_path.display().to_string(),
                    "--port".to_string(),
                    port.to_string(),
                ],
            )
        }
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .env("HARBOR_AGENT_PORT", port.to_string())
        .current_dir(working_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    Ok(command)
}

/// Drain a stream into a bounded buffer so the child never blocks on a
/// full pipe and exit-time capture has the head of the output.
fn spawn_capture(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    buf: Arc<StdMutex<Vec<u8>>>,
) {
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut guard = buf.lock().unwrap();
                    let remaining = LOG_CAPTURE_CAP.saturating_sub(guard.len());
                    let take = n.min(remaining);
                    guard.extend_from_slice(&chunk[..take]);
                }
            }
        }
    });
}

/// Decode captured bytes permissively, replacing anything undecodable
fn drain_capture(buf: &Arc<StdMutex<Vec<u8>>>) -> String {
    let guard = buf.lock().unwrap();
    String::from_utf8_lossy(&guard).into_owned()
}
