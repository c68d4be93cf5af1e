//! Knowledge search tool: looks up policy and guidance documents.
//!
//! Scores every document in the requested domain (or all known domains) by
//! term overlap with the query and returns the best matches.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use steward_core::text::{overlap, terms};
use steward_core::{
    ExecutionContext, GuidanceKind, HitlTier, KnowledgeStore, Tool, ToolDescriptor, ToolError,
};

const DEFAULT_LIMIT: usize = 3;
const MAX_LIMIT: usize = 10;

pub struct KnowledgeSearchTool {
    descriptor: ToolDescriptor,
    store: Arc<dyn KnowledgeStore>,
}

impl KnowledgeSearchTool {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        let descriptor = ToolDescriptor::new(
            "knowledge_search",
            "Search policy, guideline and procedure documents for relevant guidance",
        )
        .with_capabilities(&["search", "knowledge", "policy", "guidance", "lookup", "research"])
        .with_parameter_schema(json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for"
                },
                "domain": {
                    "type": "string",
                    "description": "Restrict the search to one domain"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of matches (default 3)"
                }
            },
            "required": ["query"]
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {
                "matches": { "type": "array" },
                "count": { "type": "integer" }
            },
            "required": ["matches", "count"]
        }))
        .with_risk_tier(HitlTier::Tier1)
        .with_timeout_ms(5_000)
        .with_cache_ttl_ms(300_000)
        .read_only();
        Self { descriptor, store }
    }
}

#[derive(Debug, Serialize)]
struct Match {
    domain: String,
    name: String,
    kind: GuidanceKind,
    text: String,
    score: f32,
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        parameters: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ToolError> {
        let query = parameters["query"].as_str().unwrap_or_default();
        let limit = parameters["limit"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LIMIT)
            .min(MAX_LIMIT);

        let failed = |e: steward_core::Error| ToolError::ExecutionFailed {
            tool_id: self.descriptor.id.clone(),
            reason: e.to_string(),
        };

        let domains = match parameters["domain"].as_str() {
            Some(domain) => vec![domain.to_string()],
            None => self.store.domains().await.map_err(failed)?,
        };

        let wanted = terms(query);
        let mut matches = Vec::new();
        for domain in domains {
            let collection = self.store.load(&domain).await.map_err(failed)?;
            for doc in collection.documents {
                let haystack = terms(&format!("{} {}", doc.name.replace(['_', '-'], " "), doc.text));
                let score = overlap(&wanted, &haystack);
                if score > 0.0 {
                    matches.push(Match {
                        domain: domain.clone(),
                        name: doc.name,
                        kind: doc.kind,
                        text: doc.text,
                        score,
                    });
                }
            }
        }

        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        matches.truncate(limit);

        Ok(json!({
            "count": matches.len(),
            "matches": matches,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::{GuidanceDocument, InMemoryKnowledgeStore, KnowledgeCollection};

    fn tool() -> KnowledgeSearchTool {
        let store = InMemoryKnowledgeStore::new()
            .with_collection(
                KnowledgeCollection::new("procurement")
                    .with_document(GuidanceDocument::new(
                        "vendor-review",
                        GuidanceKind::Procedure,
                        "Compare at least two vendor quotes before purchase.",
                    ))
                    .with_document(GuidanceDocument::new(
                        "spend-limits",
                        GuidanceKind::Policy,
                        "Purchases above the spend limit need a second signature.",
                    )),
            )
            .with_collection(KnowledgeCollection::new("hr").with_document(
                GuidanceDocument::new("pii", GuidanceKind::Policy, "Mask personal data."),
            ));
        KnowledgeSearchTool::new(Arc::new(store))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("s", "T", "steward")
    }

    #[tokio::test]
    async fn finds_matching_documents_across_domains() {
        let out = tool()
            .execute(json!({"query": "vendor quotes"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["matches"][0]["name"], "vendor-review");
        assert_eq!(out["matches"][0]["domain"], "procurement");
    }

    #[tokio::test]
    async fn domain_filter_limits_search() {
        let out = tool()
            .execute(json!({"query": "personal data", "domain": "procurement"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["count"], 0);
    }

    #[tokio::test]
    async fn respects_limit() {
        let out = tool()
            .execute(json!({"query": "vendor spend purchase", "limit": 1}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["count"], 1);
    }

    #[tokio::test]
    async fn output_passes_own_schema() {
        let t = tool();
        let out = t.execute(json!({"query": "vendor"}), &ctx()).await.unwrap();
        assert!(t.verify_result(&out).is_ok());
        assert!(t.descriptor().read_only);
    }
}
