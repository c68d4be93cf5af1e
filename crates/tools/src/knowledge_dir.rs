//! Knowledge store backed by a directory of `<domain>.toml` files.
//!
//! Collections are read on first use and cached for the life of the store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use steward_core::{Error, KnowledgeCollection, KnowledgeStore, Result};

#[derive(Debug)]
pub struct DirectoryKnowledgeStore {
    dir: PathBuf,
    loaded: RwLock<HashMap<String, KnowledgeCollection>>,
}

impl DirectoryKnowledgeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, domain: &str) -> Result<PathBuf> {
        let valid = !domain.is_empty()
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Knowledge(format!("invalid domain tag '{domain}'")));
        }
        Ok(self.dir.join(format!("{domain}.toml")))
    }
}

#[async_trait]
impl KnowledgeStore for DirectoryKnowledgeStore {
    async fn load(&self, domain: &str) -> Result<KnowledgeCollection> {
        if let Some(hit) = self.loaded.read().await.get(domain) {
            return Ok(hit.clone());
        }

        let path = self.path_for(domain)?;
        let collection = match tokio::fs::read_to_string(&path).await {
            Ok(source) => KnowledgeCollection::from_toml(domain, &source)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(domain, path = %path.display(), "No knowledge collection for domain");
                KnowledgeCollection::new(domain)
            }
            Err(e) => {
                return Err(Error::Knowledge(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        self.loaded
            .write()
            .await
            .insert(domain.to_string(), collection.clone());
        Ok(collection)
    }

    async fn domains(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Knowledge(format!(
                    "failed to list {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut domains = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Knowledge(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    domains.push(stem.to_string());
                }
            }
        }
        domains.sort();
        Ok(domains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROCUREMENT: &str = r#"
[[documents]]
name = "spend-limits"
kind = "policy"
level = "must"
text = "Purchases above the spend limit need a second signature."
"#;

    #[tokio::test]
    async fn loads_and_lists_domains() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("procurement.toml"), PROCUREMENT).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = DirectoryKnowledgeStore::new(dir.path());
        assert_eq!(store.domains().await.unwrap(), vec!["procurement".to_string()]);

        let c = store.load("procurement").await.unwrap();
        assert_eq!(c.domain, "procurement");
        assert_eq!(c.documents.len(), 1);
        assert!(c.documents[0].is_mandatory());
    }

    #[tokio::test]
    async fn loads_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procurement.toml");
        std::fs::write(&path, PROCUREMENT).unwrap();

        let store = DirectoryKnowledgeStore::new(dir.path());
        store.load("procurement").await.unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(store.load("procurement").await.unwrap().documents.len(), 1);
    }

    #[tokio::test]
    async fn missing_domain_and_dir_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryKnowledgeStore::new(dir.path().join("absent"));
        assert!(store.load("hr").await.unwrap().is_empty());
        assert!(store.domains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_traversal_rejected() {
        let store = DirectoryKnowledgeStore::new("/tmp");
        assert!(store.load("../etc/passwd").await.is_err());
    }
}
