use std::collections::{BTreeMap, HashSet};

use crate::asset::{Asset, Index, Kind};
use crate::error::Error;
use crate::local_index::LocalIndexer;
use crate::pathutil;
use crate::remote_project::RemoteProject;
use crate::session::Session;
use crate::transfer::TransferScheduler;

/// The full set of reconciling operations between one local/remote/last
/// triple, grouped the way `pyosf.sync.Changes` groups them: one map per
/// category, keyed by the path the operation targets.
///
/// `refresh` is not one of the eight ordered apply categories — it holds
/// bookkeeping-only entries (both sides already agree, but `last_index` is
/// stale) that get folded into the next persisted index without any
/// transfer or rename.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub add_local: BTreeMap<String, Asset>,
    pub add_remote: BTreeMap<String, Asset>,
    pub mv_local: BTreeMap<String, String>,
    pub mv_remote: BTreeMap<String, String>,
    pub update_local: BTreeMap<String, Asset>,
    pub update_remote: BTreeMap<String, Asset>,
    pub del_local: BTreeMap<String, Asset>,
    pub del_remote: BTreeMap<String, Asset>,
    pub refresh: BTreeMap<String, Asset>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.add_local.is_empty()
            && self.add_remote.is_empty()
            && self.mv_local.is_empty()
            && self.mv_remote.is_empty()
            && self.update_local.is_empty()
            && self.update_remote.is_empty()
            && self.del_local.is_empty()
            && self.del_remote.is_empty()
    }

    /// Renders every pending operation as `"<action>: <path>"`, in the same
    /// fixed category/path order `apply` would use, without side effects.
    pub fn dry_run(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (path, asset) in &self.add_local {
            lines.push(format!("add_local: {path} ({})", describe(asset)));
        }
        for (path, asset) in &self.add_remote {
            lines.push(format!("add_remote: {path} ({})", describe(asset)));
        }
        for (new_path, old_path) in self.mv_local.iter().rev() {
            lines.push(format!("mv_local: {old_path} -> {new_path}"));
        }
        for (new_path, old_path) in self.mv_remote.iter().rev() {
            lines.push(format!("mv_remote: {old_path} -> {new_path}"));
        }
        for (path, asset) in &self.update_local {
            lines.push(format!("update_local: {path} ({})", describe(asset)));
        }
        for (path, asset) in &self.update_remote {
            lines.push(format!("update_remote: {path} ({})", describe(asset)));
        }
        for (path, asset) in self.del_local.iter().rev() {
            lines.push(format!("del_local: {path} ({})", describe(asset)));
        }
        for (path, asset) in self.del_remote.iter().rev() {
            lines.push(format!("del_remote: {path} ({})", describe(asset)));
        }
        lines
    }
}

fn describe(asset: &Asset) -> &'static str {
    if asset.is_folder() {
        "folder"
    } else {
        "file"
    }
}

/// Computes the reconciling `ChangeSet` from the three indices. Pure and
/// synchronous — no I/O, so this is unit-testable without a fake remote.
pub fn analyze(local: &Index, remote: &Index, last: &Index) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let union = Index::union_paths([local, remote, last]);

    for path in union {
        let in_last = last.contains(&path);
        let in_local = local.contains(&path);
        let in_remote = remote.contains(&path);

        match (in_last, in_local, in_remote) {
            (true, true, true) => {
                analyze_present_everywhere(&path, local, remote, last, &mut changes);
            }
            (true, false, true) => {
                // deleted locally; still present in last_index and remote
                let last_asset = last.get(&path).unwrap();
                let remote_asset = remote.get(&path).unwrap();
                if remote_asset.date_modified > last_asset.date_modified {
                    resurrect_from_remote(&path, remote_asset, &mut changes);
                } else {
                    changes.del_remote.insert(path, remote_asset.clone());
                }
            }
            (true, true, false) => {
                // deleted remotely; still present in last_index and local
                let last_asset = last.get(&path).unwrap();
                let local_asset = local.get(&path).unwrap();
                if local_asset.date_modified > last_asset.date_modified {
                    resurrect_from_local(&path, local_asset, &mut changes);
                } else {
                    changes.del_local.insert(path, local_asset.clone());
                }
            }
            (true, false, false) => {
                // deleted on both sides: nothing to apply, but the stale
                // last_index entry must be dropped (Open Question #3).
                changes.refresh.insert(path, last.get(&path).unwrap().clone());
                // presence in `refresh` with no corresponding appearance in
                // the rebuilt index signals removal — see `project::merge_last_index`.
            }
            (false, true, true) => {
                let local_asset = local.get(&path).unwrap();
                let remote_asset = remote.get(&path).unwrap();
                if local_asset.is_folder() || remote_asset.is_folder() {
                    // folders carry no content signal of their own
                    continue;
                }
                if local_asset.same_content(remote_asset) {
                    changes.refresh.insert(path, remote_asset.clone());
                }
                // else: added independently on both sides with no common
                // ancestor and different content. Neither side's edit is a
                // conflict against a known shared history, so both copies
                // are left in place untouched (DESIGN.md's Open Question
                // decisions).
            }
            (false, true, false) => {
                changes.add_remote.insert(path.clone(), local.get(&path).unwrap().clone());
            }
            (false, false, true) => {
                changes.add_local.insert(path.clone(), remote.get(&path).unwrap().clone());
            }
            (false, false, false) => unreachable!("path not present in any index"),
        }
    }

    changes
}

fn analyze_present_everywhere(
    path: &str,
    local: &Index,
    remote: &Index,
    last: &Index,
    changes: &mut ChangeSet,
) {
    let local_asset = local.get(path).unwrap();
    let remote_asset = remote.get(path).unwrap();
    let last_asset = last.get(path).unwrap();

    if local_asset.is_folder() || remote_asset.is_folder() {
        return;
    }

    let local_unchanged = local_asset.same_content(last_asset);
    let remote_unchanged = remote_asset.same_content(last_asset);

    match (local_unchanged, remote_unchanged) {
        (true, true) => {
            // nothing changed anywhere since the last sync
        }
        (true, false) => {
            let mut updated = remote_asset.clone();
            updated.path = path.to_string();
            changes.update_local.insert(path.to_string(), updated);
        }
        (false, true) => {
            let mut updated = local_asset.clone();
            updated.path = path.to_string();
            changes.update_remote.insert(path.to_string(), updated);
        }
        (false, false) => {
            if local_asset.same_content(remote_asset) {
                changes.refresh.insert(path.to_string(), remote_asset.clone());
            } else {
                conflict(path, local_asset, remote_asset, changes);
            }
        }
    }
}

/// Both sides edited `path` since the last sync (or created it
/// independently with no common ancestor) with different content. Renames
/// each side's existing copy away under a conflict suffix, then mirrors
/// each renamed copy to the other side, so neither edit is lost and nothing
/// is left at the original path.
fn conflict(path: &str, local_asset: &Asset, remote_asset: &Asset, changes: &mut ChangeSet) {
    let (local_new, remote_new) =
        pathutil::conflict_paths(path, local_asset.date_modified, remote_asset.date_modified);

    changes.mv_local.insert(local_new.clone(), path.to_string());
    changes.mv_remote.insert(remote_new.clone(), path.to_string());

    let mut mirrored_remote = remote_asset.clone();
    mirrored_remote.path = remote_new.clone();
    changes.add_local.insert(remote_new, mirrored_remote);

    let mut mirrored_local = local_asset.clone();
    mirrored_local.path = local_new.clone();
    changes.add_remote.insert(local_new, mirrored_local);
}

/// Remote still has an edit made after the last sync, but local deleted the
/// path — preserve the remote edit under a `_DELETED`-suffixed name on both
/// sides rather than silently resurrecting the original path.
fn resurrect_from_remote(path: &str, remote_asset: &Asset, changes: &mut ChangeSet) {
    let recreated = pathutil::resurrected_path(path);
    let mut asset = remote_asset.clone();
    asset.path = recreated.clone();
    changes.add_local.insert(recreated.clone(), asset);
    changes.mv_remote.insert(recreated, path.to_string());
}

/// Symmetric case: local still has an edit made after the last sync, but
/// remote deleted the path.
fn resurrect_from_local(path: &str, local_asset: &Asset, changes: &mut ChangeSet) {
    let recreated = pathutil::resurrected_path(path);
    let mut asset = local_asset.clone();
    asset.path = recreated.clone();
    changes.add_remote.insert(recreated.clone(), asset);
    changes.mv_local.insert(recreated, path.to_string());
}

/// Outcome of one `apply` pass. `confirmed_remote` holds exactly the paths
/// whose remote-side effect (folder created, upload verified, rename or
/// delete acknowledged) is known to have taken place — this is what
/// `project::merge_last_index` gates on, instead of trusting every key the
/// pre-apply `ChangeSet` names. `applied` is the full set of paths with a
/// confirmed effect on either side, for user-facing reporting. `error` is
/// the first failure hit, if any; everything accumulated before it is still
/// trustworthy.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub confirmed_remote: HashSet<String>,
    pub applied: Vec<String>,
    pub error: Option<Error>,
}

/// Applies a `ChangeSet`: renames and deletes happen inline and
/// synchronously (in the fixed category order, reverse path order for
/// moves/deletes); add/update content transfers are resolved (container
/// creation, URL building) inline but the actual bytes are handed to
/// `scheduler` and moved once, after every category has been processed —
/// matching the "containers created inline before enqueueing transfers
/// beneath them" rule. Every synchronous step that runs to completion before
/// a failure is recorded in the returned `ApplyOutcome` rather than
/// discarded, so a caller can tell exactly what happened even on partial
/// failure (SPEC_FULL.md §7's "completed work is never lost" policy).
pub async fn apply(
    changes: &ChangeSet,
    local: &mut LocalIndexer,
    remote: &mut RemoteProject,
    session: &Session,
    scheduler: &TransferScheduler,
    remote_index: &Index,
) -> ApplyOutcome {
    let root = local.root().to_path_buf();
    let mut outcome = ApplyOutcome::default();

    macro_rules! step {
        ($expr:expr) => {
            match $expr {
                Ok(v) => v,
                Err(e) => {
                    outcome.error = Some(e);
                    return outcome;
                }
            }
        };
    }

    // add_local: folders created immediately; files enqueued for download.
    for (path, asset) in &changes.add_local {
        let full_path = root.join(path);
        if asset.is_folder() {
            step!(std::fs::create_dir_all(&full_path).map_err(|e| Error::local_io(&full_path, e)));
            outcome.applied.push(path.clone());
        } else {
            if let Some(parent) = full_path.parent() {
                step!(std::fs::create_dir_all(parent).map_err(|e| Error::local_io(parent, e)));
            }
            let url = step!(asset
                .links
                .download
                .clone()
                .ok_or_else(|| Error::Consistency(format!("no download link for {path}"))));
            scheduler.enqueue_download(path.clone(), url, full_path);
        }
    }

    // add_remote: folders created immediately; files enqueued for upload.
    for (path, asset) in &changes.add_remote {
        if asset.is_folder() {
            step!(remote.add_container(session, path).await);
            outcome.applied.push(path.clone());
            outcome.confirmed_remote.insert(path.clone());
        } else {
            let full_path = asset.full_path.clone().unwrap_or_else(|| root.join(path));
            let url = step!(remote.resolve_upload_url(session, path, false, None).await);
            let size = asset.size.unwrap_or(0);
            scheduler.enqueue_upload(
                path.clone(),
                url,
                full_path,
                size,
                asset.digest.clone(),
                remote.hash_algorithm(),
            );
        }
    }

    // mv_local: rename on disk, deepest path first.
    for (new_path, old_path) in changes.mv_local.iter().rev() {
        let old_full = root.join(old_path);
        let new_full = root.join(new_path);
        if let Some(parent) = new_full.parent() {
            step!(std::fs::create_dir_all(parent).map_err(|e| Error::local_io(parent, e)));
        }
        step!(std::fs::rename(&old_full, &new_full).map_err(|e| Error::local_io(&old_full, e)));
        outcome.applied.push(new_path.clone());
    }

    // mv_remote: rename via the `move` link, deepest path first.
    for (new_path, old_path) in changes.mv_remote.iter().rev() {
        let asset = step!(remote_index
            .get(old_path)
            .ok_or_else(|| Error::Consistency(format!("{old_path} missing from remote index"))));
        let leaf = pathutil::leaf_of(new_path);
        step!(remote.rename_file(session, asset, leaf).await);
        outcome.applied.push(new_path.clone());
        outcome.confirmed_remote.insert(new_path.clone());
    }

    // update_local: overwrite local content from remote.
    for (path, asset) in &changes.update_local {
        let full_path = root.join(path);
        let url = step!(asset
            .links
            .download
            .clone()
            .ok_or_else(|| Error::Consistency(format!("no download link for {path}"))));
        scheduler.enqueue_download(path.clone(), url, full_path);
    }

    // update_remote: overwrite remote content from local.
    for (path, asset) in &changes.update_remote {
        let full_path = asset.full_path.clone().unwrap_or_else(|| root.join(path));
        let existing = remote_index.get(path);
        let upload_link = existing.and_then(|a| a.links.upload.clone());
        let url = step!(
            remote
                .resolve_upload_url(session, path, true, upload_link.as_deref())
                .await
        );
        let size = asset.size.unwrap_or(0);
        scheduler.enqueue_upload(
            path.clone(),
            url,
            full_path,
            size,
            asset.digest.clone(),
            remote.hash_algorithm(),
        );
    }

    // del_local: delete on disk, deepest path first.
    for (path, asset) in changes.del_local.iter().rev() {
        let full_path = root.join(path);
        if asset.is_folder() {
            let _ = std::fs::remove_dir(&full_path);
        } else {
            step!(std::fs::remove_file(&full_path).map_err(|e| Error::local_io(&full_path, e)));
        }
        outcome.applied.push(path.clone());
    }

    // del_remote: delete via the `delete` link, deepest path first.
    for (path, _) in changes.del_remote.iter().rev() {
        let asset = step!(remote_index
            .get(path)
            .ok_or_else(|| Error::Consistency(format!("{path} missing from remote index"))));
        step!(remote.delete(session, asset).await);
        outcome.applied.push(path.clone());
        outcome.confirmed_remote.insert(path.clone());
    }

    let run_result = scheduler.run(session).await;
    for transfer in run_result.download_outcomes {
        outcome.applied.push(transfer.path);
    }
    for transfer in run_result.upload_outcomes {
        outcome.confirmed_remote.insert(transfer.path.clone());
        outcome.applied.push(transfer.path);
    }
    outcome.error = run_result.error;

    outcome
}
