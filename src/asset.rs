use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether an asset is a regular file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    File,
    Folder,
}

/// Links OSF hands back for a remote node, used to drive subsequent
/// requests without re-deriving URLs by hand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#move: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_folder: Option<String>,
}

/// A single file or folder record, as carried in a local, remote, or
/// last-synced `Index`. `path` is the primary key: forward-slash, relative
/// to the project/sync root, normalized via `pathutil::normalize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub path: String,
    pub kind: Kind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    pub date_modified: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "is_default_links")]
    pub links: Links,
}

fn is_default_links(links: &Links) -> bool {
    *links == Links::default()
}

impl Asset {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, Kind::Folder)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, Kind::File)
    }

    /// Files are considered identical in content when their digests match;
    /// folders carry no digest of their own and are never compared this way
    /// (SPEC_FULL.md §4.5 — folder timestamps are advisory only).
    pub fn same_content(&self, other: &Asset) -> bool {
        match (self.kind, other.kind) {
            (Kind::File, Kind::File) => self.digest.is_some() && self.digest == other.digest,
            (Kind::Folder, Kind::Folder) => true,
            _ => false,
        }
    }
}

/// An ordered collection of assets, keyed by `path`. Path uniqueness within
/// one `Index` is an invariant upheld by every mutator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    entries: BTreeMap<String, Asset>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, asset: Asset) {
        self.entries.insert(asset.path.clone(), asset);
    }

    pub fn remove(&mut self, path: &str) -> Option<Asset> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&Asset> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Asset)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// All paths across `self`, `other_a`, and `other_b` combined, i.e. the
    /// union needed to iterate the three-way presence vector in `changes.rs`.
    pub fn union_paths<'a>(
        indices: impl IntoIterator<Item = &'a Index>,
    ) -> std::collections::BTreeSet<String> {
        let mut set = std::collections::BTreeSet::new();
        for index in indices {
            set.extend(index.entries.keys().cloned());
        }
        set
    }
}

impl FromIterator<Asset> for Index {
    fn from_iter<T: IntoIterator<Item = Asset>>(iter: T) -> Self {
        let mut index = Index::new();
        for asset in iter {
            index.insert(asset);
        }
        index
    }
}
