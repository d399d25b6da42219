use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Account-id -> bearer token map, persisted as a single JSON document.
/// Writes are atomic (temp file + rename) and, on unix, the file is
/// restricted to owner-only read/write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenStore {
    tokens: HashMap<String, String>,

    #[serde(skip)]
    path: PathBuf,
}

impl TokenStore {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                tokens: HashMap::new(),
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read token store {}", path.display()))?;
        let tokens: HashMap<String, String> = serde_json::from_str(&raw)
            .with_context(|| format!("parse token store {}", path.display()))?;
        Ok(Self {
            tokens,
            path: path.to_path_buf(),
        })
    }

    pub fn get(&self, account_id: &str) -> Option<&str> {
        self.tokens.get(account_id).map(String::as_str)
    }

    pub fn set(&mut self, account_id: &str, token: &str) -> Result<()> {
        self.tokens.insert(account_id.to_string(), token.to_string());
        self.save()
    }

    pub fn remove(&mut self, account_id: &str) -> Result<()> {
        self.tokens.remove(account_id);
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&self.tokens)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes)
            .with_context(|| format!("write {}", tmp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp_path, perms)
                .with_context(|| format!("chmod {}", tmp_path.display()))?;
        }

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}
