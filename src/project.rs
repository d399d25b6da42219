use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};

use crate::asset::Index;
use crate::changes::{self, ChangeSet};
use crate::digest::Algorithm;
use crate::local_index::LocalIndexer;
use crate::remote_project::RemoteProject;
use crate::session::Session;
use crate::transfer::TransferScheduler;

/// Document written to `config_path`: `{root_path, project_id, account_id,
/// name, index}`. Mirrors `pyosf/project.py`'s `Project.load`/`save` shape,
/// upgraded to an atomic temp-then-rename write (SPEC_FULL.md §4.6) since a
/// partial write here would lose the whole last-synced index, not just one
/// field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedProject {
    root_path: PathBuf,
    project_id: String,
    account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    index: Index,
}

/// Outcome of one `Project::sync` pass: the computed change set and, for a
/// real (non-dry-run) apply, the paths whose transfers were actually
/// enqueued and completed.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub changes: ChangeSet,
    pub dry_run_lines: Vec<String>,
    pub applied_paths: Vec<String>,
}

/// Owns the persisted `last_index` plus identifiers, and orchestrates one
/// sync pass: rebuild local -> rebuild remote -> analyze -> apply -> rebuild
/// local -> save. Grounded on `pyosf/project.py`'s `Project` class and the
/// teacher's `client.rs` (`Client::start`'s health-check-then-loop shape,
/// narrowed here to a single synchronous pass per `sync()` call).
pub struct Project {
    path: PathBuf,
    root_path: PathBuf,
    project_id: String,
    account_id: String,
    name: Option<String>,
    last_index: Index,
    autosave: bool,
    dirty: bool,
}

impl Project {
    /// Loads a persisted project file, or returns an empty project (blank
    /// `last_index`, no identifiers) if `path` does not exist — mirroring
    /// `pyosf/project.py`'s `load()` returning all-`None` for a missing file.
    pub fn load(path: &Path, root_path: &Path, project_id: &str, account_id: &str) -> AnyResult<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                root_path: root_path.to_path_buf(),
                project_id: project_id.to_string(),
                account_id: account_id.to_string(),
                name: None,
                last_index: Index::new(),
                autosave: true,
                dirty: false,
            });
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read project file {}", path.display()))?;
        let persisted: PersistedProject = serde_json::from_str(&raw)
            .with_context(|| format!("parse project file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            root_path: persisted.root_path,
            project_id: persisted.project_id,
            account_id: persisted.account_id,
            name: persisted.name,
            last_index: persisted.index,
            autosave: true,
            dirty: false,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
        self.dirty = true;
    }

    pub fn last_index(&self) -> &Index {
        &self.last_index
    }

    pub fn set_autosave(&mut self, autosave: bool) {
        self.autosave = autosave;
    }

    /// Writes the project document atomically (temp file + rename), same
    /// pattern as `token_store.rs` and the teacher's `config.rs::save`.
    pub fn save(&mut self) -> AnyResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let persisted = PersistedProject {
            root_path: self.root_path.clone(),
            project_id: self.project_id.clone(),
            account_id: self.account_id.clone(),
            name: self.name.clone(),
            index: self.last_index.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes)
            .with_context(|| format!("write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }

    /// One full sync pass. With `dry_run` true, only `analyze` runs and the
    /// rendered `dry_run_lines` are returned with no filesystem or remote
    /// mutation and no index update.
    pub async fn sync(
        &mut self,
        session: &Session,
        remote: &mut RemoteProject,
        algorithm: Algorithm,
        chunk_size: u64,
        dry_run: bool,
    ) -> AnyResult<SyncReport> {
        let mut local_indexer = LocalIndexer::new(&self.root_path, algorithm);
        let local_index = local_indexer
            .rebuild()
            .context("rebuild local index")?;
        let remote_index = remote
            .rebuild_index(session)
            .await
            .context("rebuild remote index")?;

        let change_set = changes::analyze(&local_index, &remote_index, &self.last_index);

        if dry_run {
            let lines = change_set.dry_run();
            return Ok(SyncReport {
                changes: change_set,
                dry_run_lines: lines,
                applied_paths: Vec::new(),
            });
        }

        let scheduler = TransferScheduler::new(chunk_size as usize);
        let apply_outcome = changes::apply(
            &change_set,
            &mut local_indexer,
            remote,
            session,
            &scheduler,
            &remote_index,
        )
        .await;

        // Whether apply succeeded or partially failed, rebuild the local
        // index and persist whatever is actually confirmed to agree between
        // the two sides — SPEC_FULL.md §7's propagation policy: no retries,
        // but completed work is never lost, and an unconfirmed remote-side
        // change never gets treated as if it had happened.
        let rebuilt_local = local_indexer.rebuild().context("rebuild local index post-apply")?;
        self.last_index = merge_last_index(
            &change_set,
            &apply_outcome.confirmed_remote,
            &rebuilt_local,
            &remote_index,
        );
        self.dirty = true;

        if let Some(e) = apply_outcome.error {
            if self.autosave {
                let _ = self.save();
            }
            return Err(anyhow::Error::new(e).context("apply change set"));
        }

        if self.autosave {
            self.save()?;
        }

        Ok(SyncReport {
            changes: change_set,
            dry_run_lines: Vec::new(),
            applied_paths: apply_outcome.applied,
        })
    }
}

/// Folds a completed (or partially completed) apply pass back into
/// `last_index`. `rebuilt_local` is the ground truth for the local side
/// (rebuilt after `apply` awaited every enqueued transfer and rename), but
/// `remote_index` is the *pre*-apply snapshot — rebuilding the remote tree
/// again would cost another full walk, so the path set the remote side is
/// now expected to hold is derived from `remote_index` plus the remote-side
/// deltas from the change set, gated by `confirmed_remote` (the paths
/// `changes::apply` actually confirmed took effect remotely, not merely
/// attempted). A delta whose path isn't in `confirmed_remote` is left out —
/// the pre-apply snapshot's view of that path stands, so an unconfirmed
/// upload or rename doesn't get folded into `last_index` as if it had
/// completed. A path only survives into `last_index` when both the
/// rebuilt-local and the derived-expected-remote sets agree it's there —
/// which also drops both-deleted entries (Open Question #3 in DESIGN.md)
/// automatically, since neither set contains them.
fn merge_last_index(
    changes: &ChangeSet,
    confirmed_remote: &std::collections::HashSet<String>,
    local: &Index,
    remote: &Index,
) -> Index {
    let mut expected_remote: std::collections::BTreeSet<String> =
        remote.paths().cloned().collect();
    for path in changes.del_remote.keys() {
        if confirmed_remote.contains(path) {
            expected_remote.remove(path);
        }
    }
    for (new_path, old_path) in &changes.mv_remote {
        if confirmed_remote.contains(new_path) {
            expected_remote.remove(old_path);
            expected_remote.insert(new_path.clone());
        }
    }
    for path in changes.add_remote.keys() {
        if confirmed_remote.contains(path) {
            expected_remote.insert(path.clone());
        }
    }

    let mut merged = Index::new();
    for path in expected_remote {
        if let Some(asset) = local.get(&path) {
            merged.insert(asset.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Kind, Links};
    use chrono::{TimeZone, Utc};

    fn file(path: &str, digest: &str) -> crate::asset::Asset {
        crate::asset::Asset {
            path: path.to_string(),
            kind: Kind::File,
            full_path: None,
            size: Some(1),
            digest: Some(digest.to_string()),
            date_modified: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            id: None,
            links: Links::default(),
        }
    }

    #[test]
    fn load_missing_file_returns_empty_project() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("project.json");
        let project = Project::load(&path, tmp.path(), "abcd1", "acct-1").unwrap();
        assert!(project.last_index().is_empty());
        assert_eq!(project.project_id(), "abcd1");
    }

    #[test]
    fn save_then_load_roundtrips_last_index() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("project.json");
        let mut project = Project::load(&path, tmp.path(), "abcd1", "acct-1").unwrap();
        project.last_index.insert(file("a.txt", "d1"));
        project.save().unwrap();

        let reloaded = Project::load(&path, tmp.path(), "abcd1", "acct-1").unwrap();
        assert!(reloaded.last_index().contains("a.txt"));
    }

    #[test]
    fn merge_last_index_keeps_paths_present_on_both_sides() {
        let mut local = Index::new();
        local.insert(file("a.txt", "d1"));
        let mut remote = Index::new();
        remote.insert(file("a.txt", "d1"));
        remote.insert(file("b.txt", "d2"));

        let merged = merge_last_index(
            &ChangeSet::default(),
            &std::collections::HashSet::new(),
            &local,
            &remote,
        );
        assert!(merged.contains("a.txt"));
        assert!(!merged.contains("b.txt"));
    }

    /// S2 from spec.md §8: a brand-new local-only file that just got pushed
    /// has no entry in the pre-apply `remote_index` snapshot, but the
    /// `add_remote` delta must still bring it into `last_index` rather than
    /// silently dropping it because the stale remote snapshot lacks it —
    /// provided the upload is confirmed.
    #[test]
    fn merge_last_index_includes_freshly_added_remote_path() {
        let mut local = Index::new();
        local.insert(file("x.bin", "d9"));
        let remote = Index::new();

        let mut changes = ChangeSet::default();
        changes.add_remote.insert("x.bin".to_string(), file("x.bin", "d9"));
        let confirmed: std::collections::HashSet<String> = ["x.bin".to_string()].into_iter().collect();

        let merged = merge_last_index(&changes, &confirmed, &local, &remote);
        assert!(merged.contains("x.bin"));
    }

    /// A path renamed away remotely (resurrection/conflict) must drop out of
    /// `last_index` under its old name even though the stale `remote_index`
    /// snapshot still lists it there, once the rename is confirmed.
    #[test]
    fn merge_last_index_drops_old_path_after_remote_rename() {
        let mut local = Index::new();
        local.insert(file("r_DELETED.dat", "d5"));
        let mut remote = Index::new();
        remote.insert(file("r.dat", "d5"));

        let mut changes = ChangeSet::default();
        changes
            .mv_remote
            .insert("r_DELETED.dat".to_string(), "r.dat".to_string());
        let confirmed: std::collections::HashSet<String> =
            ["r_DELETED.dat".to_string()].into_iter().collect();

        let merged = merge_last_index(&changes, &confirmed, &local, &remote);
        assert!(!merged.contains("r.dat"));
        assert!(merged.contains("r_DELETED.dat"));
    }

    /// The data-loss scenario this gating fixes: an `add_remote` upload that
    /// was attempted but never confirmed must NOT be folded into
    /// `last_index`, even though local still has the file and the pre-apply
    /// `ChangeSet` names the path. Without `confirmed_remote` gating, the
    /// next sync would see `last_index` and `local` agreeing on "b.txt" but
    /// `remote` still missing it, and delete the local file as if it had
    /// been intentionally removed remotely.
    #[test]
    fn merge_last_index_excludes_unconfirmed_add_remote_path() {
        let mut local = Index::new();
        local.insert(file("a.txt", "d1"));
        local.insert(file("b.txt", "d2"));
        let remote = Index::new();

        let mut changes = ChangeSet::default();
        changes.add_remote.insert("a.txt".to_string(), file("a.txt", "d1"));
        changes.add_remote.insert("b.txt".to_string(), file("b.txt", "d2"));
        // Only a.txt's upload was confirmed; b.txt's failed partway through.
        let confirmed: std::collections::HashSet<String> = ["a.txt".to_string()].into_iter().collect();

        let merged = merge_last_index(&changes, &confirmed, &local, &remote);
        assert!(merged.contains("a.txt"));
        assert!(!merged.contains("b.txt"));
    }
}
