use chrono::{TimeZone, Utc};
use osfsync::asset::{Asset, Kind, Links};
use osfsync::project::Project;

fn folder(path: &str) -> Asset {
    Asset {
        path: path.to_string(),
        kind: Kind::Folder,
        full_path: None,
        size: None,
        digest: None,
        date_modified: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        id: Some("folder-1".to_string()),
        links: Links::default(),
    }
}

fn file(path: &str) -> Asset {
    Asset {
        path: path.to_string(),
        kind: Kind::File,
        full_path: None,
        size: Some(42),
        digest: Some("deadbeef".to_string()),
        date_modified: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
        id: Some("file-1".to_string()),
        links: Links {
            download: Some("https://example/download".to_string()),
            ..Links::default()
        },
    }
}

#[test]
fn missing_project_file_loads_empty_and_first_save_creates_it() {
    let tmp = tempfile::tempdir().unwrap();
    let project_path = tmp.path().join("projects").join("abcd1.json");
    let root = tmp.path().join("root");

    let mut project = Project::load(&project_path, &root, "abcd1", "acct-1").unwrap();
    assert!(project.last_index().is_empty());
    assert_eq!(project.project_id(), "abcd1");
    assert_eq!(project.account_id(), "acct-1");
    assert_eq!(project.root_path(), root);

    project.save().unwrap();
    assert!(project_path.exists());
}

#[test]
fn save_then_reload_preserves_folders_and_files() {
    let tmp = tempfile::tempdir().unwrap();
    let project_path = tmp.path().join("project.json");
    let root = tmp.path().join("root");

    // Populating last_index normally happens through the network-backed
    // sync() path; a hand-built project file isolates the persistence
    // round trip from that.
    let raw = serde_json::json!({
        "root_path": root,
        "project_id": "abcd1",
        "account_id": "acct-1",
        "name": "My Project",
        "index": {
            "entries": {
                "docs": folder("docs"),
                "docs/readme.md": file("docs/readme.md"),
            }
        }
    });
    std::fs::write(&project_path, serde_json::to_vec_pretty(&raw).unwrap()).unwrap();

    let reloaded = Project::load(&project_path, &root, "abcd1", "acct-1").unwrap();
    assert_eq!(reloaded.name(), Some("My Project"));
    assert!(reloaded.last_index().contains("docs"));
    assert!(reloaded.last_index().contains("docs/readme.md"));
    assert_eq!(
        reloaded.last_index().get("docs/readme.md").unwrap().digest.as_deref(),
        Some("deadbeef")
    );
}
