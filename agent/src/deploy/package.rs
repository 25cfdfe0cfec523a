//! Agent package installation
//!
//! An agent package is a ZIP archive (gzipped tarballs are accepted
//! too; the format is sniffed from the magic bytes) containing a
//! definition file (`agent.toml` or `agent.json`), the agent's entry
//! point, and whatever else it needs at runtime. Install is
//! content-addressed: the sha256 of
//! the archive bytes identifies a deployment, so re-deploying the same
//! bytes is a cheap no-op and deploying different bytes under an
//! existing name requires `force`.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::store::MetadataStore;
use crate::config::AgentDefinition;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    #[error("invalid agent definition: {0}")]
    InvalidDefinition(String),
    #[error("agent '{name}' already exists with different content; redeploy with force")]
    Conflict { name: String },
    #[error("dependency installation failed: {0}")]
    DependencyInstall(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What an install call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { name: String, checksum: String },
    /// Identical bytes were already deployed; nothing changed
    AlreadyInstalled { name: String, checksum: String },
}

impl InstallOutcome {
    pub fn name(&self) -> &str {
        match self {
            InstallOutcome::Installed { name, .. } => name,
            InstallOutcome::AlreadyInstalled { name, .. } => name,
        }
    }

    pub fn checksum(&self) -> &str {
        match self {
            InstallOutcome::Installed { checksum, .. } => checksum,
            InstallOutcome::AlreadyInstalled { checksum, .. } => checksum,
        }
    }
}

/// Lowercase hex sha256 of the raw archive bytes
pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub struct Installer {
    agents_dir: PathBuf,
}

impl Installer {
    pub fn new(agents_dir: PathBuf) -> Self {
        Self { agents_dir }
    }

    /// Install an agent package from archive bytes.
    ///
    /// Steps: checksum, extract to a staging directory next to the
    /// final location, locate and parse the definition, check for name
    /// conflicts, move into place, then set up the Python environment
    /// when the definition declares packages. Any failure after
    /// extraction cleans up the staging area; a failure after the move
    /// removes the half-installed directory.
    pub async fn install(
        &self,
        archive: &[u8],
        force: bool,
        store: &MetadataStore,
    ) -> Result<InstallOutcome, InstallError> {
        let checksum = compute_checksum(archive);

        if let Some(existing) = store.get_agent_by_checksum(&checksum) {
            tracing::info!(
                "Archive {} already deployed as '{}'",
                &checksum[..12],
                existing.name
            );
            return Ok(InstallOutcome::AlreadyInstalled {
                name: existing.name,
                checksum,
            });
        }

        std::fs::create_dir_all(&self.agents_dir)?;

        // Stage inside the agents directory so the final move is a
        // same-filesystem rename.
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.agents_dir)?;

        extract_archive(archive, staging.path())?;
        let content_root = locate_content_root(staging.path())?;

        let def_path = AgentDefinition::find_in_dir(&content_root).ok_or_else(|| {
            InstallError::InvalidDefinition(
                "archive contains no agent.toml or agent.json".to_string(),
            )
        })?;
        let definition = AgentDefinition::load_from_path(&def_path)
            .map_err(|e| InstallError::InvalidDefinition(e.to_string()))?;
        let name = definition.agent.name.clone();

        if let Some(existing) = store.get_agent(&name) {
            let same = existing.checksum.as_deref() == Some(checksum.as_str());
            if !same && !force {
                return Err(InstallError::Conflict { name });
            }
        }

        let target = self.agents_dir.join(&name);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&content_root, &target)?;

        if let Err(e) = setup_python_env(&target, &definition).await {
            // Do not leave a directory that cannot run
            if let Err(cleanup) = std::fs::remove_dir_all(&target) {
                tracing::warn!(
                    "Cleanup of failed install {} failed: {}",
                    target.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        tracing::info!("Installed agent '{}' ({})", name, &checksum[..12]);
        Ok(InstallOutcome::Installed { name, checksum })
    }

    /// Final on-disk location of an installed agent's definition file
    pub fn definition_path(&self, name: &str) -> Option<PathBuf> {
        AgentDefinition::find_in_dir(&self.agents_dir.join(name))
    }
}

/// Dispatch on the upload's magic bytes: `PK` for ZIP, the gzip marker
/// for tarballs, anything else rejected.
fn extract_archive(archive: &[u8], dest: &Path) -> Result<(), InstallError> {
    match archive {
        [0x50, 0x4b, ..] => {
            let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive))
                .map_err(|e| InstallError::InvalidArchive(e.to_string()))?;
            zip.extract(dest)
                .map_err(|e| InstallError::InvalidArchive(e.to_string()))
        }
        [0x1f, 0x8b, ..] => {
            let decoder = GzDecoder::new(archive);
            let mut tar = tar::Archive::new(decoder);
            tar.unpack(dest)
                .map_err(|e| InstallError::InvalidArchive(e.to_string()))
        }
        _ => Err(InstallError::InvalidArchive(
            "not a ZIP or gzipped tar archive".to_string(),
        )),
    }
}

/// Archives either contain the agent files at the top level or wrap
/// them in a single directory. Unwrap the single-directory case.
fn locate_content_root(staging: &Path) -> Result<PathBuf, InstallError> {
    if AgentDefinition::find_in_dir(staging).is_some() {
        return Ok(staging.to_path_buf());
    }

    let entries: Vec<PathBuf> = std::fs::read_dir(staging)?
        .flatten()
        .map(|e| e.path())
        .collect();

    match entries.as_slice() {
        [single] if single.is_dir() => Ok(single.clone()),
        [] => Err(InstallError::InvalidArchive("archive is empty".to_string())),
        _ => Ok(staging.to_path_buf()),
    }
}

/// Create `.venv` and install declared packages. Skipped entirely when
/// the definition declares none, which keeps pure-binary agents (and
/// tests) free of any Python requirement.
async fn setup_python_env(
    target: &Path,
    definition: &AgentDefinition,
) -> Result<(), InstallError> {
    let packages = match &definition.dependencies {
        Some(deps) if !deps.packages.is_empty() => deps.packages.clone(),
        _ => return Ok(()),
    };

    tracing::info!(
        "Creating isolated environment in {} ({} packages)",
        target.display(),
        packages.len()
    );

    let venv = tokio::process::Command::new("python3")
        .args(["-m", "venv", ".venv"])
        .current_dir(target)
        .output()
        .await
        .map_err(|e| InstallError::DependencyInstall(format!("venv creation failed: {}", e)))?;
    if !venv.status.success() {
        return Err(InstallError::DependencyInstall(format!(
            "venv creation failed: {}",
            String::from_utf8_lossy(&venv.stderr)
        )));
    }

    let pip = target.join(".venv").join("bin").join("pip");
    let requirements = target.join("requirements.txt");
    let mut command = tokio::process::Command::new(&pip);
    if requirements.exists() {
        command.args(["install", "-r", "requirements.txt"]);
    } else {
        command.arg("install").args(&packages);
    }

    let output = command
        .current_dir(target)
        .output()
        .await
        .map_err(|e| InstallError::DependencyInstall(format!("pip failed to run: {}", e)))?;
    if !output.status.success() {
        return Err(InstallError::DependencyInstall(format!(
            "pip install failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// Build a tar.gz in memory from (path, contents) pairs
    fn make_archive(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Build a ZIP in memory from (path, contents) pairs
    fn make_zip(files: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (path, contents) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn simple_agent(name: &str, marker: &str) -> Vec<u8> {
        make_archive(&[
            (
                "agent.toml",
                &format!("[agent]\nname = \"{}\"\n", name),
            ),
            ("main.py", marker),
        ])
    }

    #[tokio::test]
    async fn test_install_places_agent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let archive = simple_agent("research", "print('v1')");
        let outcome = installer.install(&archive, false, &store).await.unwrap();

        assert!(matches!(outcome, InstallOutcome::Installed { .. }));
        assert_eq!(outcome.name(), "research");
        assert!(dir.path().join("research").join("agent.toml").exists());
        assert!(dir.path().join("research").join("main.py").exists());
        // No packages declared, so no environment was created
        assert!(!dir.path().join("research").join(".venv").exists());
    }

    #[tokio::test]
    async fn test_redeploy_same_bytes_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let archive = simple_agent("research", "print('v1')");
        let first = installer.install(&archive, false, &store).await.unwrap();

        // Record the deployment the way the control plane would
        let mut record = crate::deploy::store::AgentRecord::named(first.name());
        record.checksum = Some(first.checksum().to_string());
        record.config_path = dir
            .path()
            .join("research")
            .join("agent.toml")
            .display()
            .to_string();
        store.upsert_agent(&record);

        let second = installer.install(&archive, false, &store).await.unwrap();
        assert!(matches!(second, InstallOutcome::AlreadyInstalled { .. }));
        assert_eq!(second.checksum(), first.checksum());
    }

    #[tokio::test]
    async fn test_name_conflict_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let v1 = simple_agent("research", "print('v1')");
        let outcome = installer.install(&v1, false, &store).await.unwrap();
        let mut record = crate::deploy::store::AgentRecord::named("research");
        record.checksum = Some(outcome.checksum().to_string());
        store.upsert_agent(&record);

        let v2 = simple_agent("research", "print('v2')");
        let err = installer.install(&v2, false, &store).await.unwrap_err();
        assert!(matches!(err, InstallError::Conflict { .. }));

        // Force replaces the installed content
        let outcome = installer.install(&v2, true, &store).await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Installed { .. }));
        let main = std::fs::read_to_string(dir.path().join("research/main.py")).unwrap();
        assert_eq!(main, "print('v2')");
    }

    #[tokio::test]
    async fn test_single_directory_wrapper_is_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let archive = make_archive(&[
            ("research/agent.toml", "[agent]\nname = \"research\"\n"),
            ("research/main.py", "print('hi')"),
        ]);
        let outcome = installer.install(&archive, false, &store).await.unwrap();
        assert_eq!(outcome.name(), "research");
        assert!(dir.path().join("research").join("main.py").exists());
    }

    #[tokio::test]
    async fn test_zip_package_installs() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let archive = make_zip(&[
            ("agent.toml", "[agent]\nname = \"research\"\n"),
            ("main.py", "print('zipped')"),
        ]);
        let outcome = installer.install(&archive, false, &store).await.unwrap();
        assert_eq!(outcome.name(), "research");
        let main = std::fs::read_to_string(dir.path().join("research/main.py")).unwrap();
        assert_eq!(main, "print('zipped')");
    }

    #[tokio::test]
    async fn test_zip_single_directory_wrapper_is_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let archive = make_zip(&[
            ("research/agent.toml", "[agent]\nname = \"research\"\n"),
            ("research/main.py", "print('hi')"),
        ]);
        let outcome = installer.install(&archive, false, &store).await.unwrap();
        assert_eq!(outcome.name(), "research");
        assert!(dir.path().join("research").join("main.py").exists());
    }

    #[tokio::test]
    async fn test_archive_without_definition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let archive = make_archive(&[("main.py", "print('hi')")]);
        let err = installer.install(&archive, false, &store).await.unwrap_err();
        assert!(matches!(err, InstallError::InvalidDefinition(_)));
        // Nothing half-installed left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_bytes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let installer = Installer::new(dir.path().to_path_buf());

        let err = installer
            .install(b"definitely not a tarball", false, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidArchive(_)));
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = compute_checksum(b"same bytes");
        let b = compute_checksum(b"same bytes");
        let c = compute_checksum(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
