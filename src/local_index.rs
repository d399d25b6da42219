use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::asset::{Asset, Index, Kind, Links};
use crate::digest::{self, Algorithm};
use crate::error::{Error, Result};
use crate::pathutil;

#[derive(Clone)]
struct CacheEntry {
    size: u64,
    mtime: SystemTime,
    digest: String,
}

/// Per-entry outcome for a directory entry the walk couldn't read: distinct
/// from the entry being genuinely absent, so a caller can tell "we don't
/// know its state" apart from "it doesn't exist" (SPEC_FULL.md §4.1).
#[derive(Debug)]
pub enum IndexError {
    Unreadable(PathBuf, std::io::Error),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::Unreadable(path, cause) => {
                write!(f, "unreadable entry at {}: {cause}", path.display())
            }
        }
    }
}

impl std::error::Error for IndexError {}

/// Recursively indexes a local directory tree, matching files/folders into
/// `Asset` records. Caches `(size, mtime) -> digest` across calls within one
/// process so unchanged files aren't rehashed on every sync pass; the cache
/// is not persisted and is rebuilt fresh each run.
pub struct LocalIndexer {
    root: PathBuf,
    algorithm: Algorithm,
    cache: HashMap<PathBuf, CacheEntry>,
    unreadable: Vec<IndexError>,
}

impl LocalIndexer {
    pub fn new(root: impl Into<PathBuf>, algorithm: Algorithm) -> Self {
        Self {
            root: root.into(),
            algorithm,
            cache: HashMap::new(),
            unreadable: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entries the most recent `rebuild` couldn't read, each distinguishable
    /// from a path that's genuinely absent. Cleared and repopulated at the
    /// start of every `rebuild` call.
    pub fn unreadable_entries(&self) -> &[IndexError] {
        &self.unreadable
    }

    /// Walks `self.root`, returning an `Index` of every file and folder
    /// beneath it (the root itself is not emitted). Unreadable entries are
    /// treated as absent from the index, logged, and recorded in
    /// `unreadable_entries` rather than failing the whole walk.
    pub fn rebuild(&mut self) -> Result<Index> {
        let mut index = Index::new();
        self.unreadable.clear();
        if !self.root.exists() {
            return Ok(index);
        }

        for entry in WalkDir::new(&self.root).follow_links(true).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    if let Some(ancestor) = e.loop_ancestor() {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                        let cause = std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("symlink cycle: loops back to {}", ancestor.display()),
                        );
                        return Err(Error::local_io(path, cause));
                    }
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    let cause = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("unreadable directory entry"));
                    self.record_unreadable(path, cause);
                    continue;
                }
            };
            if entry.path() == self.root {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| Error::Consistency(format!("{:?} not under root", entry.path())))?;
            let rel_str = pathutil::normalize(&rel.to_string_lossy());

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    let cause = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                    self.record_unreadable(entry.path().to_path_buf(), cause);
                    continue;
                }
            };
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            if metadata.is_dir() {
                index.insert(Asset {
                    path: rel_str,
                    kind: Kind::Folder,
                    full_path: Some(entry.path().to_path_buf()),
                    size: None,
                    digest: None,
                    date_modified: modified,
                    id: None,
                    links: Links::default(),
                });
                continue;
            }

            let digest = match self.digest_with_cache(entry.path(), &metadata) {
                Ok(d) => d,
                Err(e) => {
                    let cause = match e {
                        Error::LocalIo { source, .. } => source,
                        other => std::io::Error::other(other.to_string()),
                    };
                    self.record_unreadable(entry.path().to_path_buf(), cause);
                    continue;
                }
            };

            index.insert(Asset {
                path: rel_str,
                kind: Kind::File,
                full_path: Some(entry.path().to_path_buf()),
                size: Some(metadata.len()),
                digest: Some(digest),
                date_modified: modified,
                id: None,
                links: Links::default(),
            });
        }

        self.propagate_folder_timestamps(&mut index);
        Ok(index)
    }

    fn record_unreadable(&mut self, path: PathBuf, cause: std::io::Error) {
        let err = IndexError::Unreadable(path, cause);
        crate::logging::warn(&format!("skipping unreadable entry: {err}"));
        self.unreadable.push(err);
    }

    fn digest_with_cache(&mut self, path: &Path, metadata: &std::fs::Metadata) -> Result<String> {
        let size = metadata.len();
        let mtime = metadata.modified().map_err(|e| Error::local_io(path, e))?;

        if let Some(cached) = self.cache.get(path) {
            if cached.size == size && cached.mtime == mtime {
                return Ok(cached.digest.clone());
            }
        }

        let computed = digest::digest_file(path, self.algorithm)?;
        self.cache.insert(
            path.to_path_buf(),
            CacheEntry {
                size,
                mtime,
                digest: computed.clone(),
            },
        );
        Ok(computed)
    }

    fn propagate_folder_timestamps(&self, index: &mut Index) {
        let mut max_by_folder: HashMap<String, DateTime<Utc>> = HashMap::new();
        for (path, asset) in index.iter() {
            if asset.is_folder() {
                continue;
            }
            let mut cursor = pathutil::parent_of(path);
            while let Some(folder) = cursor {
                let entry = max_by_folder
                    .entry(folder.clone())
                    .or_insert(asset.date_modified);
                if asset.date_modified > *entry {
                    *entry = asset.date_modified;
                }
                cursor = pathutil::parent_of(&folder);
            }
        }
        for (folder, max_ts) in max_by_folder {
            if let Some(existing) = index.get(&folder).cloned() {
                let mut updated = existing;
                if max_ts > updated.date_modified {
                    updated.date_modified = max_ts;
                }
                index.insert(updated);
            }
        }
    }
}
