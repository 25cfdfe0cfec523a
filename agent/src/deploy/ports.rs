//! Port allocation for supervised agent processes
//!
//! Tracks a contiguous range of TCP ports and hands them out per named
//! owner. Every candidate is bind-tested against the OS before being
//! claimed: after a supervisor restart the persisted registry is only a
//! hint, and some unrelated process may already be listening on a port
//! we believe is ours.

use std::collections::{BTreeSet, HashMap};
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in range {base}..{end}")]
    Exhausted { base: u16, end: u16 },
    #[error("port registry error: {0}")]
    Registry(String),
}

/// Persisted registry shape: `{base_port, assignments}`
#[derive(Debug, Serialize, Deserialize)]
struct PortRegistryFile {
    base_port: u16,
    assignments: HashMap<String, u16>,
}

/// Allocates ports in `[base_port, base_port + max_ports)`, first-fit
/// ascending. Released ports are not actively recycled; the next scan
/// simply finds the first free candidate again.
pub struct PortManager {
    base_port: u16,
    max_ports: u16,
    /// owner name -> held port
    assignments: HashMap<String, u16>,
    /// every port currently held by some owner
    held: BTreeSet<u16>,
    /// when set, the registry is serialized here on every mutation
    registry_path: Option<PathBuf>,
}

impl PortManager {
    pub fn new(base_port: u16, max_ports: u16) -> Self {
        Self {
            base_port,
            max_ports,
            assignments: HashMap::new(),
            held: BTreeSet::new(),
            registry_path: None,
        }
    }

    /// Create a manager with a durable registry file. Existing
    /// assignments are reloaded; entries outside the configured range
    /// are discarded.
    pub fn with_registry(base_port: u16, max_ports: u16, path: PathBuf) -> Self {
        let mut manager = Self::new(base_port, max_ports);
        manager.registry_path = Some(path);
        manager.load_registry();
        manager
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Port currently held by `owner`, if any
    pub fn port_for(&self, owner: &str) -> Option<u16> {
        self.assignments.get(owner).copied()
    }

    /// Allocate a port for `owner`.
    ///
    /// Idempotent: if the owner already holds a port it is returned
    /// unchanged. A `preferred` port is claimed when it is inside the
    /// range, unheld, and OS-bindable. Otherwise the range is scanned
    /// ascending and the first bindable unheld port wins.
    pub fn allocate(&mut self, owner: &str, preferred: Option<u16>) -> Result<u16, PortError> {
        if let Some(port) = self.assignments.get(owner) {
            return Ok(*port);
        }

        if let Some(port) = preferred {
            if self.in_range(port) && !self.held.contains(&port) && bind_probe(port) {
                self.claim(owner, port);
                return Ok(port);
            }
        }

        let end = self.base_port.saturating_add(self.max_ports);
        for port in self.base_port..end {
            if self.held.contains(&port) {
                continue;
            }
            if bind_probe(port) {
                self.claim(owner, port);
                return Ok(port);
            }
        }

        Err(PortError::Exhausted {
            base: self.base_port,
            end,
        })
    }

    /// Release whatever `owner` holds. Idempotent; warns when the owner
    /// holds nothing.
    pub fn release(&mut self, owner: &str) {
        match self.assignments.remove(owner) {
            Some(port) => {
                self.held.remove(&port);
                tracing::debug!("Released port {} from '{}'", port, owner);
                self.persist_registry();
            }
            None => {
                tracing::warn!("Release for '{}' which holds no port", owner);
            }
        }
    }

    fn in_range(&self, port: u16) -> bool {
        port >= self.base_port && port < self.base_port.saturating_add(self.max_ports)
    }

    fn claim(&mut self, owner: &str, port: u16) {
        self.assignments.insert(owner.to_string(), port);
        self.held.insert(port);
        tracing::debug!("Allocated port {} to '{}'", port, owner);
        self.persist_registry();
    }

    fn load_registry(&mut self) {
        let Some(path) = self.registry_path.clone() else {
            return;
        };
        if !path.exists() {
            return;
        }

        match read_registry(&path) {
            Ok(file) => {
                for (owner, port) in file.assignments {
                    if self.in_range(port) {
                        self.assignments.insert(owner, port);
                        self.held.insert(port);
                    } else {
                        tracing::warn!(
                            "Discarding persisted port {} for '{}': outside configured range",
                            port,
                            owner
                        );
                    }
                }
                tracing::info!(
                    "Reloaded {} port assignments from {}",
                    self.assignments.len(),
                    path.display()
                );
            }
            Err(e) => {
                tracing::warn!("Failed to load port registry {}: {}", path.display(), e);
            }
        }
    }

    fn persist_registry(&self) {
        let Some(path) = &self.registry_path else {
            return;
        };
        let file = PortRegistryFile {
            base_port: self.base_port,
            assignments: self.assignments.clone(),
        };
        if let Err(e) = write_registry(path, &file) {
            // Degrade rather than fail the allocation; the bind test is
            // authoritative on the next startup anyway.
            tracing::error!("Failed to persist port registry {}: {}", path.display(), e);
        }
    }
}

fn read_registry(path: &Path) -> Result<PortRegistryFile, PortError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| PortError::Registry(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| PortError::Registry(e.to_string()))
}

fn write_registry(path: &Path, file: &PortRegistryFile) -> Result<(), PortError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PortError::Registry(e.to_string()))?;
    }
    let json =
        serde_json::to_string_pretty(file).map_err(|e| PortError::Registry(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| PortError::Registry(e.to_string()))
}

/// Bind to loopback and immediately release. Catches ports held by
/// processes outside our bookkeeping.
fn bind_probe(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
