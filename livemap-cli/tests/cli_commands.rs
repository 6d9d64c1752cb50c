use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use chrono::Utc;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use livemap_core::source::MarkerRepository;
use livemap_core::types::{Marker, MarkerCreator, MarkerData, MarkerId, UserId};
use livemap_db::Database;

fn livemap_cmd(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("livemap").expect("livemap binary");
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

fn seed_marker(home: &Path, job: &str, name: &str) -> Marker {
    let root = home.join(".livemap");
    std::fs::create_dir_all(&root).expect("mkdir");
    let db = Database::open(root.join("livemap.db")).expect("open db");
    let now = Utc::now();
    db.create_marker(&Marker {
        id: MarkerId(0),
        job: job.to_string(),
        x: 12.0,
        y: -3.5,
        name: name.to_string(),
        description: None,
        color: "#ff0000".to_string(),
        data: MarkerData::Icon {
            icon: "flag".to_string(),
        },
        creator: Some(MarkerCreator {
            user_id: UserId(4),
            job: job.to_string(),
            job_grade: 1,
        }),
        created_at: now,
        updated_at: now,
        expires_at: None,
        deleted_at: None,
    })
    .expect("create marker")
}

#[test]
fn config_show_prints_defaults_without_a_file() {
    let home = TempDir::new().expect("home");
    livemap_cmd(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("user_chunk_size: 20"))
        .stdout(contains("marker_chunk_size: 75"))
        .stdout(contains("config.yaml"));
}

#[test]
fn config_show_rejects_malformed_yaml() {
    let home = TempDir::new().expect("home");
    let root = home.path().join(".livemap");
    std::fs::create_dir_all(&root).expect("mkdir");
    std::fs::write(root.join("config.yaml"), "user_chunk_size: [oops").expect("write");

    livemap_cmd(home.path())
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(contains("failed to load config"));
}

#[test]
fn daemon_status_reports_not_running() {
    let home = TempDir::new().expect("home");
    let output = livemap_cmd(home.path())
        .args(["daemon", "status"])
        .output()
        .expect("run status");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status json");
    assert_eq!(value["running"], serde_json::json!(false));
}

#[test]
fn daemon_stop_without_daemon_is_harmless() {
    let home = TempDir::new().expect("home");
    livemap_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("not running"));
}

#[test]
fn marker_list_on_fresh_home_is_empty() {
    let home = TempDir::new().expect("home");
    livemap_cmd(home.path())
        .args(["marker", "list"])
        .assert()
        .success()
        .stdout(contains("No markers."));
}

#[test]
fn marker_list_renders_table_filtered_by_job() {
    let home = TempDir::new().expect("home");
    seed_marker(home.path(), "police", "roadblock");
    seed_marker(home.path(), "ambulance", "triage");

    livemap_cmd(home.path())
        .args(["marker", "list", "--job", "police"])
        .assert()
        .success()
        .stdout(contains("roadblock"))
        .stdout(contains("icon"))
        .stdout(contains("triage").not());
}

#[test]
fn marker_put_needs_a_running_daemon() {
    let home = TempDir::new().expect("home");
    livemap_cmd(home.path())
        .args([
            "marker", "put", "--user-id", "1", "--job", "police", "--grade", "2", "--name",
            "roadblock", "--x", "1", "--y", "2", "--radius", "10",
        ])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));
}

#[test]
fn marker_put_requires_a_shape() {
    let home = TempDir::new().expect("home");
    livemap_cmd(home.path())
        .args([
            "marker", "put", "--user-id", "1", "--job", "police", "--name", "roadblock", "--x",
            "1", "--y", "2",
        ])
        .assert()
        .failure()
        .stderr(contains("--radius"));
}
