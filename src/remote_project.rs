use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::asset::{Asset, Index, Kind, Links};
use crate::error::{Error, Result};
use crate::pathutil;
use crate::session::Session;

/// Links needed to mutate a remote folder, cached per path after a tree
/// walk so later operations don't need to re-fetch the node.
#[derive(Debug, Clone)]
struct ContainerLinks {
    new_folder: Option<String>,
    upload: Option<String>,
    files_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilesEnvelope {
    data: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
    attributes: FileAttributes,
    links: FileLinks,
    relationships: Option<FileRelationships>,
}

#[derive(Debug, Deserialize)]
struct FileAttributes {
    name: String,
    kind: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    extra: Option<FileExtra>,
    #[serde(default)]
    date_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FileExtra {
    hashes: Option<FileHashes>,
}

#[derive(Debug, Deserialize)]
struct FileHashes {
    md5: Option<String>,
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileLinks {
    download: Option<String>,
    upload: Option<String>,
    delete: Option<String>,
    #[serde(rename = "move")]
    move_: Option<String>,
    #[serde(rename = "new_folder")]
    new_folder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileRelationships {
    files: Option<RelatedLink>,
}

#[derive(Debug, Deserialize)]
struct RelatedLink {
    links: RelatedLinksInner,
}

#[derive(Debug, Deserialize)]
struct RelatedLinksInner {
    related: RelatedHref,
}

#[derive(Debug, Deserialize)]
struct RelatedHref {
    href: String,
}

/// Remote-side navigation and mutation for one OSF project's `osfstorage`
/// tree. Owns a cache of per-folder links so repeat mutations (uploads
/// beneath a just-created folder) don't require a fresh tree walk.
pub struct RemoteProject {
    root_files_url: String,
    root_new_folder: Option<String>,
    root_upload: Option<String>,
    hash_algorithm: crate::digest::Algorithm,
    containers: HashMap<String, ContainerLinks>,
}

#[derive(Debug, Deserialize)]
struct ProvidersEnvelope {
    data: Vec<ProviderEntry>,
}

#[derive(Debug, Deserialize)]
struct ProviderEntry {
    attributes: ProviderAttributes,
    links: Option<FileLinks>,
    relationships: Option<FileRelationships>,
}

#[derive(Debug, Deserialize)]
struct ProviderAttributes {
    name: String,
}

/// The `osfstorage` provider row's own links, distinct from its
/// `relationships.files` listing href: these are the endpoints for
/// creating a folder or uploading a file directly under the project root,
/// the same way a subfolder's own `links.new_folder`/`links.upload` work
/// one level down (spec.md §6).
pub struct RootLinks {
    pub files_url: String,
    pub new_folder: Option<String>,
    pub upload: Option<String>,
}

/// Resolves the `osfstorage` storage provider's root-level links for a
/// project: the file-listing URL `RemoteProject::rebuild_index` walks from,
/// plus the provider's own `new_folder`/`upload` links for root-level
/// mutations. Grounded on spec.md §6's `GET /nodes/{id}/files` entry, which
/// returns one row per storage provider (`osfstorage`, and optionally others
/// this crate ignores — SPEC_FULL.md scopes sync to `osfstorage` only).
pub async fn resolve_root_files_url(
    session: &Session,
    api_base: &str,
    project_id: &str,
) -> Result<RootLinks> {
    let path = format!("/nodes/{project_id}/files");
    let envelope: ProvidersEnvelope = session.get_json(&path).await?;
    let provider = envelope
        .data
        .into_iter()
        .find(|p| p.attributes.name == "osfstorage")
        .ok_or_else(|| {
            Error::Consistency(format!(
                "no osfstorage provider for project {project_id} at {api_base}"
            ))
        })?;
    let files_url = provider
        .relationships
        .and_then(|r| r.files)
        .map(|f| f.links.related.href)
        .ok_or_else(|| {
            Error::Consistency(format!(
                "osfstorage provider for project {project_id} has no file listing at {api_base}"
            ))
        })?;
    let (new_folder, upload) = provider
        .links
        .map(|l| (l.new_folder, l.upload))
        .unwrap_or((None, None));
    Ok(RootLinks {
        files_url,
        new_folder,
        upload,
    })
}

impl RemoteProject {
    pub fn new(root_links: RootLinks, hash_algorithm: crate::digest::Algorithm) -> Self {
        Self {
            root_files_url: root_links.files_url,
            root_new_folder: root_links.new_folder,
            root_upload: root_links.upload,
            hash_algorithm,
            containers: HashMap::new(),
        }
    }

    pub fn hash_algorithm(&self) -> crate::digest::Algorithm {
        self.hash_algorithm
    }

    /// Walks the project's `osfstorage` tree and returns a flat `Index`.
    /// Folder `date_modified` is set to the max of its descendants'
    /// timestamps after the walk, since OSF folders carry no modified time
    /// of their own.
    pub async fn rebuild_index(&mut self, session: &Session) -> Result<Index> {
        self.containers.clear();
        let mut index = Index::new();
        let mut queue = vec![(String::new(), self.root_files_url.clone())];

        while let Some((prefix, url)) = queue.pop() {
            let envelope: FilesEnvelope = session.get_json(&url).await?;
            for entry in envelope.data {
                let path = if prefix.is_empty() {
                    entry.attributes.name.clone()
                } else {
                    format!("{prefix}/{}", entry.attributes.name)
                };
                let path = pathutil::normalize(&path);

                let links = Links {
                    download: entry.links.download.clone(),
                    upload: entry.links.upload.clone(),
                    delete: entry.links.delete.clone(),
                    r#move: entry.links.move_.clone(),
                    new_folder: entry.links.new_folder.clone(),
                };

                if entry.attributes.kind == "folder" {
                    let files_url = entry
                        .relationships
                        .as_ref()
                        .and_then(|r| r.files.as_ref())
                        .map(|f| f.links.related.href.clone());
                    self.containers.insert(
                        path.clone(),
                        ContainerLinks {
                            new_folder: entry.links.new_folder.clone(),
                            upload: entry.links.upload.clone(),
                            files_url,
                        },
                    );
                    index.insert(Asset {
                        path: path.clone(),
                        kind: Kind::Folder,
                        full_path: None,
                        size: None,
                        digest: None,
                        date_modified: entry.attributes.date_modified.unwrap_or_else(Utc::now),
                        id: Some(entry.id),
                        links,
                    });
                    if let Some(rel) = entry.relationships.as_ref().and_then(|r| r.files.as_ref()) {
                        queue.push((path, rel.links.related.href.clone()));
                    }
                } else {
                    let digest = entry
                        .attributes
                        .extra
                        .as_ref()
                        .and_then(|e| e.hashes.as_ref())
                        .and_then(|h| match self.hash_algorithm {
                            crate::digest::Algorithm::Md5 => h.md5.clone(),
                            crate::digest::Algorithm::Sha256 => h.sha256.clone(),
                        });
                    index.insert(Asset {
                        path,
                        kind: Kind::File,
                        full_path: None,
                        size: entry.attributes.size,
                        digest,
                        date_modified: entry.attributes.date_modified.unwrap_or_else(Utc::now),
                        id: Some(entry.id),
                        links,
                    });
                }
            }
        }

        self.propagate_folder_timestamps(&mut index);
        Ok(index)
    }

    fn propagate_folder_timestamps(&self, index: &mut Index) {
        let mut max_by_folder: HashMap<String, DateTime<Utc>> = HashMap::new();
        for (path, asset) in index.iter() {
            if asset.is_folder() {
                continue;
            }
            let mut cursor = pathutil::parent_of(path);
            while let Some(folder) = cursor {
                let entry = max_by_folder.entry(folder.clone()).or_insert(asset.date_modified);
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

    /// Ensures every folder in `path`'s ancestry exists remotely, creating
    /// whatever prefixes are missing. A 409 from an in-flight concurrent
    /// creation is treated as success once a lookup in the parent's listing
    /// confirms the folder now exists.
    pub async fn add_container(&mut self, session: &Session, path: &str) -> Result<()> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut built = String::new();
        for segment in segments {
            let next = if built.is_empty() {
                segment.to_string()
            } else {
                format!("{built}/{segment}")
            };
            if !self.containers.contains_key(&next) {
                let new_folder_url = if built.is_empty() {
                    self.root_new_folder.clone().ok_or_else(|| {
                        Error::Consistency("no root new_folder link for osfstorage provider".to_string())
                    })?
                } else {
                    self.containers
                        .get(&built)
                        .and_then(|c| c.new_folder.clone())
                        .ok_or_else(|| Error::Consistency(format!("no new_folder link for {built}")))?
                };
                let url = format!(
                    "{}{}name={}",
                    new_folder_url,
                    if new_folder_url.contains('?') { "&" } else { "?" },
                    urlencode(segment)
                );
                match session
                    .put_json::<serde_json::Value>(&url, &serde_json::json!({}))
                    .await
                {
                    Ok(value) => {
                        let links = parse_links(&value);
                        let files_url = extract_files_url(&value);
                        self.containers.insert(
                            next.clone(),
                            ContainerLinks {
                                new_folder: links.new_folder,
                                upload: links.upload,
                                files_url,
                            },
                        );
                    }
                    Err(Error::AlreadyExists(_)) => {
                        self.adopt_existing_container(session, &built, segment, &next).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            built = next;
        }
        Ok(())
    }

    /// Recovers from a 409 on folder creation: a concurrent creator won the
    /// race, so the folder's links are fetched from the parent's listing
    /// instead of treating the conflict as fatal.
    async fn adopt_existing_container(
        &mut self,
        session: &Session,
        parent: &str,
        segment: &str,
        next: &str,
    ) -> Result<()> {
        let listing_url = if parent.is_empty() {
            self.root_files_url.clone()
        } else {
            self.containers
                .get(parent)
                .and_then(|c| c.files_url.clone())
                .ok_or_else(|| Error::Consistency(format!("no listing url for {parent}")))?
        };
        let envelope: FilesEnvelope = session.get_json(&listing_url).await?;
        let found = envelope
            .data
            .into_iter()
            .find(|e| e.attributes.kind == "folder" && e.attributes.name == segment);
        match found {
            Some(entry) => {
                let files_url = entry
                    .relationships
                    .as_ref()
                    .and_then(|r| r.files.as_ref())
                    .map(|f| f.links.related.href.clone());
                self.containers.insert(
                    next.to_string(),
                    ContainerLinks {
                        new_folder: entry.links.new_folder.clone(),
                        upload: entry.links.upload.clone(),
                        files_url,
                    },
                );
                Ok(())
            }
            None => Err(Error::AlreadyExists(next.to_string())),
        }
    }

    /// Resolves the PUT URL a file's bytes should be sent to, creating any
    /// missing ancestor folders first. For an update of an existing asset,
    /// `existing_upload_link` is reused rather than recomputed.
    pub async fn resolve_upload_url(
        &mut self,
        session: &Session,
        path: &str,
        update: bool,
        existing_upload_link: Option<&str>,
    ) -> Result<String> {
        if update {
            return existing_upload_link
                .map(str::to_string)
                .ok_or_else(|| Error::Consistency(format!("no upload link for {path}")));
        }
        if let Some(parent) = pathutil::parent_of(path) {
            self.add_container(session, &parent).await?;
        }
        let leaf = pathutil::leaf_of(path);
        let folder_upload = if let Some(parent) = pathutil::parent_of(path) {
            self.containers
                .get(&parent)
                .and_then(|c| c.upload.clone())
                .ok_or_else(|| Error::Consistency(format!("no container for {parent}")))?
        } else {
            self.root_upload.clone().ok_or_else(|| {
                Error::Consistency("no root upload link for osfstorage provider".to_string())
            })?
        };
        Ok(format!(
            "{}{}kind=file&name={}",
            folder_upload,
            if folder_upload.contains('?') { "&" } else { "?" },
            urlencode(leaf)
        ))
    }

    /// Uploads a file's bytes directly (used by callers that don't need the
    /// transfer scheduled, e.g. tests). `changes::apply` instead resolves a
    /// URL via `resolve_upload_url` and hands it to the `TransferScheduler`.
    pub async fn add_file(
        &mut self,
        session: &Session,
        asset: &Asset,
        path: &std::path::Path,
        chunk_size: usize,
        cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
        update: bool,
        existing_upload_link: Option<&str>,
    ) -> Result<Asset> {
        let url = self
            .resolve_upload_url(session, &asset.path, update, existing_upload_link)
            .await?;

        let size = asset.size.unwrap_or(0);
        let response = session
            .upload_stream(&url, path, size, chunk_size, cancel, |_| {})
            .await?;

        let returned_digest = extract_digest(&response, self.hash_algorithm);
        if let (Some(expected), Some(actual)) = (asset.digest.as_ref(), returned_digest.as_ref()) {
            if expected != actual {
                return Err(Error::Integrity {
                    path: asset.path.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }

        let mut result = asset.clone();
        result.id = extract_id(&response).or(result.id);
        result.digest = returned_digest.or(result.digest);
        result.links = parse_links(&response);
        Ok(result)
    }

    /// Renames a file or folder in place. Cross-folder moves are out of
    /// scope — every caller in `changes.rs` only renames within the same
    /// parent (conflict and resurrection renames never relocate a path).
    pub async fn rename_file(&self, session: &Session, asset: &Asset, new_leaf: &str) -> Result<()> {
        let url = asset
            .links
            .r#move
            .as_deref()
            .ok_or_else(|| Error::Consistency(format!("no move link for {}", asset.path)))?;
        let _: serde_json::Value = session
            .post_json(
                url,
                &serde_json::json!({ "action": "rename", "rename": new_leaf }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, session: &Session, asset: &Asset) -> Result<()> {
        let url = asset
            .links
            .delete
            .as_deref()
            .ok_or_else(|| Error::Consistency(format!("no delete link for {}", asset.path)))?;
        session.delete(url).await
    }

    pub async fn download(
        &self,
        session: &Session,
        asset: &Asset,
        sink: &mut impl std::io::Write,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> Result<()> {
        let url = asset
            .links
            .download
            .as_deref()
            .ok_or_else(|| Error::Consistency(format!("no download link for {}", asset.path)))?;
        session.download_stream(url, sink, cancel, |_| {}).await
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn parse_links(value: &serde_json::Value) -> Links {
    let links = value.pointer("/data/links").unwrap_or(&serde_json::Value::Null);
    Links {
        download: links.get("download").and_then(|v| v.as_str()).map(String::from),
        upload: links.get("upload").and_then(|v| v.as_str()).map(String::from),
        delete: links.get("delete").and_then(|v| v.as_str()).map(String::from),
        r#move: links.get("move").and_then(|v| v.as_str()).map(String::from),
        new_folder: links.get("new_folder").and_then(|v| v.as_str()).map(String::from),
    }
}

fn extract_files_url(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/data/relationships/files/links/related/href")
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn extract_id(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/data/id")
        .and_then(|v| v.as_str())
        .map(String::from)
}

pub(crate) fn extract_digest(value: &serde_json::Value, algorithm: crate::digest::Algorithm) -> Option<String> {
    let key = match algorithm {
        crate::digest::Algorithm::Md5 => "md5",
        crate::digest::Algorithm::Sha256 => "sha256",
    };
    value
        .pointer(&format!("/data/attributes/extra/hashes/{key}"))
        .and_then(|v| v.as_str())
        .map(String::from)
}
