//! End-to-end deployment flow: package bytes in, running process out.

use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use harbor_agent::config::DeploymentServerConfig;
use harbor_agent::deploy::api::{create_router, AppState};
use harbor_agent::deploy::store::AgentRecord;
use harbor_agent::deploy::{AgentStatus, InstallOutcome, Installer, MetadataStore, Supervisor};

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

fn sleeper_package(name: &str) -> Vec<u8> {
    make_archive(&[(
        "agent.toml",
        &format!(
            "[agent]\nname = \"{}\"\n\n[entry]\ncommand = \"/bin/sleep\"\nargs = [\"30\"]\n",
            name
        ),
    )])
}

fn test_config(agents_dir: &std::path::Path, base_port: u16) -> DeploymentServerConfig {
    DeploymentServerConfig {
        agents_directory: agents_dir.to_path_buf(),
        base_port,
        start_grace_ms: 200,
        health_check_interval: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_deploy_start_stop_flow() {
    let agents_dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open_in_memory().unwrap();
    let installer = Installer::new(agents_dir.path().to_path_buf());
    let supervisor = Supervisor::new(test_config(agents_dir.path(), 19800), store.clone());

    // Install the package
    let archive = sleeper_package("worker");
    let outcome = installer.install(&archive, false, &store).await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed { .. }));

    // Register it the way the deploy endpoint does
    let config_path = installer.definition_path("worker").unwrap();
    supervisor
        .register("worker", config_path, Some(outcome.checksum().to_string()))
        .await;

    let instance = supervisor.get("worker").await.unwrap();
    assert_eq!(instance.status, AgentStatus::Discovered);
    assert_eq!(instance.checksum.as_deref(), Some(outcome.checksum()));

    // Start: the sleeper survives the grace window
    assert_eq!(supervisor.start("worker").await, Some(true));
    let instance = supervisor.get("worker").await.unwrap();
    assert_eq!(instance.status, AgentStatus::Running);
    assert!(instance.port.is_some());
    assert!(instance.pid.is_some());

    // Status is visible durably, not just in memory
    let record = store.get_agent("worker").unwrap();
    assert_eq!(record.status, "running");

    assert_eq!(supervisor.stop("worker").await, Some(true));
    let record = store.get_agent("worker").unwrap();
    assert_eq!(record.status, "stopped");
}

#[tokio::test]
async fn test_redeploy_same_bytes_short_circuits() {
    let agents_dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open_in_memory().unwrap();
    let installer = Installer::new(agents_dir.path().to_path_buf());

    let archive = sleeper_package("worker");
    let first = installer.install(&archive, false, &store).await.unwrap();

    let mut record = AgentRecord::named("worker");
    record.checksum = Some(first.checksum().to_string());
    store.upsert_agent(&record);

    let second = installer.install(&archive, false, &store).await.unwrap();
    assert!(matches!(second, InstallOutcome::AlreadyInstalled { .. }));
    assert_eq!(second.name(), "worker");

    // Still exactly one record
    assert_eq!(store.list_agents(None).len(), 1);
}

#[tokio::test]
async fn test_api_exposes_deployed_agent() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let agents_dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open_in_memory().unwrap();
    let installer = Arc::new(Installer::new(agents_dir.path().to_path_buf()));
    let supervisor = Supervisor::new(test_config(agents_dir.path(), 19820), store.clone());

    let archive = sleeper_package("worker");
    let outcome = installer.install(&archive, false, &store).await.unwrap();
    let config_path = installer.definition_path("worker").unwrap();
    supervisor
        .register("worker", config_path, Some(outcome.checksum().to_string()))
        .await;

    let app = create_router(AppState {
        supervisor,
        installer,
        store,
    });

    let response = app
        .clone()
        .oneshot(Request::get("/status/worker").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["name"], "worker");
    assert_eq!(json["status"], "discovered");

    // The checksum probe sees it too
    let response = app
        .oneshot(
            Request::post(format!("/check?checksum={}", outcome.checksum()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["deployed"], true);
    assert_eq!(json["agent_name"], "worker");
}

#[tokio::test]
async fn test_force_redeploy_stops_previous_version() {
    let agents_dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open_in_memory().unwrap();
    let installer = Installer::new(agents_dir.path().to_path_buf());
    let supervisor = Supervisor::new(test_config(agents_dir.path(), 19860), store.clone());

    // v1 up and running
    let v1 = sleeper_package("worker");
    let outcome = installer.install(&v1, false, &store).await.unwrap();
    let config_path = installer.definition_path("worker").unwrap();
    supervisor
        .register("worker", config_path, Some(outcome.checksum().to_string()))
        .await;
    assert_eq!(supervisor.start("worker").await, Some(true));
    let old_pid = supervisor.get("worker").await.unwrap().pid.unwrap();

    // v2: same name, different bytes, force
    let v2 = make_archive(&[
        (
            "agent.toml",
            "[agent]\nname = \"worker\"\n\n[entry]\ncommand = \"/bin/sleep\"\nargs = [\"30\"]\n",
        ),
        ("VERSION", "2"),
    ]);
    let outcome = installer.install(&v2, true, &store).await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed { .. }));
    let config_path = installer.definition_path("worker").unwrap();
    supervisor
        .register("worker", config_path, Some(outcome.checksum().to_string()))
        .await;

    // The v1 process is gone, not orphaned
    let alive = unsafe { libc::kill(old_pid as i32, 0) } == 0;
    assert!(!alive);
    let instance = supervisor.get("worker").await.unwrap();
    assert_eq!(instance.status, AgentStatus::Discovered);
    assert!(instance.pid.is_none());

    // And v2 starts cleanly on the freed port
    assert_eq!(supervisor.start("worker").await, Some(true));
    supervisor.stop("worker").await;
}

#[tokio::test]
async fn test_crashed_agent_is_restarted_by_health_tick() {
    let agents_dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open_in_memory().unwrap();
    let installer = Installer::new(agents_dir.path().to_path_buf());
    let supervisor = Supervisor::new(test_config(agents_dir.path(), 19840), store.clone());

    let archive = sleeper_package("worker");
    let outcome = installer.install(&archive, false, &store).await.unwrap();
    let config_path = installer.definition_path("worker").unwrap();
    supervisor
        .register("worker", config_path, Some(outcome.checksum().to_string()))
        .await;

    assert_eq!(supervisor.start("worker").await, Some(true));
    let pid = supervisor.get("worker").await.unwrap().pid.unwrap();

    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    supervisor.health_check_once().await;

    let instance = supervisor.get("worker").await.unwrap();
    assert_eq!(instance.status, AgentStatus::Running);
    assert_eq!(instance.restart_count, 1);

    supervisor.stop("worker").await;
}
