//! Knowledge documents — policies, guidelines and procedures per domain.
//!
//! The planner treats document text as opaque guidance. Only the kind and
//! requirement level drive selection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceKind {
    /// Always applies within its domain.
    Policy,
    Guideline,
    Procedure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementLevel {
    Must,
    #[default]
    Should,
    May,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceDocument {
    pub name: String,
    pub kind: GuidanceKind,
    #[serde(default)]
    pub level: RequirementLevel,
    pub text: String,
}

impl GuidanceDocument {
    pub fn new(name: impl Into<String>, kind: GuidanceKind, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            level: RequirementLevel::Should,
            text: text.into(),
        }
    }

    pub fn with_level(mut self, level: RequirementLevel) -> Self {
        self.level = level;
        self
    }

    pub fn is_mandatory(&self) -> bool {
        self.level == RequirementLevel::Must
    }
}

/// All guidance for one domain tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeCollection {
    /// Filled from the file name when a TOML source omits it.
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub documents: Vec<GuidanceDocument>,
}

impl KnowledgeCollection {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            documents: Vec::new(),
        }
    }

    pub fn with_document(mut self, document: GuidanceDocument) -> Self {
        self.documents.push(document);
        self
    }

    /// Parse a collection from TOML (`[[documents]]` tables).
    pub fn from_toml(domain: &str, source: &str) -> Result<Self> {
        let mut collection: KnowledgeCollection = toml::from_str(source)
            .map_err(|e| Error::Knowledge(format!("invalid collection '{domain}': {e}")))?;
        if collection.domain.is_empty() {
            collection.domain = domain.to_string();
        }
        Ok(collection)
    }

    pub fn policies(&self) -> impl Iterator<Item = &GuidanceDocument> {
        self.documents
            .iter()
            .filter(|d| d.kind == GuidanceKind::Policy)
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Loads knowledge collections by domain tag.
///
/// An unknown domain yields an empty collection, not an error.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn load(&self, domain: &str) -> Result<KnowledgeCollection>;

    /// Domains this store knows about.
    async fn domains(&self) -> Result<Vec<String>>;
}

/// A store backed by a fixed map; useful for tests and embedded defaults.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKnowledgeStore {
    collections: HashMap<String, KnowledgeCollection>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, collection: KnowledgeCollection) -> Self {
        self.collections
            .insert(collection.domain.clone(), collection);
        self
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn load(&self, domain: &str) -> Result<KnowledgeCollection> {
        Ok(self
            .collections
            .get(domain)
            .cloned()
            .unwrap_or_else(|| KnowledgeCollection::new(domain)))
    }

    async fn domains(&self) -> Result<Vec<String>> {
        let mut domains: Vec<String> = self.collections.keys().cloned().collect();
        domains.sort();
        Ok(domains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_collection_from_toml() {
        let source = r#"
[[documents]]
name = "data-handling"
kind = "policy"
level = "must"
text = "Never export restricted records."

[[documents]]
name = "vendor-review"
kind = "procedure"
text = "Compare at least two vendors."
"#;
        let c = KnowledgeCollection::from_toml("procurement", source).unwrap();
        assert_eq!(c.domain, "procurement");
        assert_eq!(c.documents.len(), 2);
        assert!(c.documents[0].is_mandatory());
        assert_eq!(c.documents[1].level, RequirementLevel::Should);
        assert_eq!(c.policies().count(), 1);
    }

    #[test]
    fn invalid_toml_is_knowledge_error() {
        let err = KnowledgeCollection::from_toml("x", "documents = 5").unwrap_err();
        assert!(matches!(err, Error::Knowledge(_)));
    }

    #[tokio::test]
    async fn in_memory_store_unknown_domain_is_empty() {
        let store = InMemoryKnowledgeStore::new().with_collection(
            KnowledgeCollection::new("hr").with_document(GuidanceDocument::new(
                "pii",
                GuidanceKind::Policy,
                "Mask personal data.",
            )),
        );
        assert_eq!(store.load("hr").await.unwrap().documents.len(), 1);
        assert!(store.load("finance").await.unwrap().is_empty());
        assert_eq!(store.domains().await.unwrap(), vec!["hr".to_string()]);
    }
}
