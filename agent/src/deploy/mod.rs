//! Deployment server: package install, port allocation, process
//! supervision, and the REST control plane over all of it.

pub mod api;
pub mod diagnostics;
pub mod package;
pub mod ports;
pub mod store;
pub mod supervisor;

pub use package::{InstallOutcome, Installer};
pub use ports::PortManager;
pub use store::MetadataStore;
pub use supervisor::{AgentInstance, AgentStatus, HealthStatus, Supervisor};
