use std::process::Command;

fn osfsync_exe() -> &'static str {
    env!("CARGO_BIN_EXE_osfsync")
}

#[test]
fn token_show_reports_missing_token() {
    let tmp = tempfile::tempdir().unwrap();
    let out = Command::new(osfsync_exe())
        .arg("--datadir")
        .arg(tmp.path())
        .arg("--config")
        .arg(tmp.path().join("config.json"))
        .arg("token")
        .arg("show")
        .arg("--account")
        .arg("acct-1")
        .output()
        .expect("run token show");

    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("no token stored"));
}

#[test]
fn token_show_reports_stored_token_without_printing_it() {
    let tmp = tempfile::tempdir().unwrap();
    let store_path = tmp.path().join("token_store.json");
    std::fs::write(&store_path, r#"{"acct-1":"super-secret-token"}"#).unwrap();

    let out = Command::new(osfsync_exe())
        .arg("--datadir")
        .arg(tmp.path())
        .arg("--config")
        .arg(tmp.path().join("config.json"))
        .arg("token")
        .arg("show")
        .arg("--account")
        .arg("acct-1")
        .output()
        .expect("run token show");

    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("token stored"));
    assert!(!stdout.contains("super-secret-token"));
}

#[test]
fn status_reports_entry_count_for_an_existing_project_file() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("projects");
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(
        project_dir.join("abcd1.json"),
        serde_json::json!({
            "root_path": "/tmp/somewhere",
            "project_id": "abcd1",
            "account_id": "acct-1",
            "name": "Demo",
            "index": { "entries": {} }
        })
        .to_string(),
    )
    .unwrap();

    let out = Command::new(osfsync_exe())
        .arg("--datadir")
        .arg(tmp.path())
        .arg("--config")
        .arg(tmp.path().join("config.json"))
        .arg("status")
        .arg("--project")
        .arg("abcd1")
        .arg("--account")
        .arg("acct-1")
        .output()
        .expect("run status");

    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("project: abcd1"));
    assert!(stdout.contains("name: Demo"));
    assert!(stdout.contains("last synced entries: 0"));
}

#[test]
fn sync_without_stored_token_fails_fast_without_network() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir_all(&root).unwrap();

    let out = Command::new(osfsync_exe())
        .arg("--datadir")
        .arg(tmp.path())
        .arg("--config")
        .arg(tmp.path().join("config.json"))
        .arg("sync")
        .arg(&root)
        .arg("--project")
        .arg("abcd1")
        .arg("--account")
        .arg("acct-1")
        .output()
        .expect("run sync");

    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no stored token"));
}
