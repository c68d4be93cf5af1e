//! Tool-result cache with per-entry time-to-live.
//!
//! Keys are deterministic: SHA-256 over the tool id and the canonical
//! (sorted-key) JSON rendering of the parameters. The cache lives inside the
//! session's working memory; tool execution only ever reads it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Render JSON with object keys sorted at every level.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let ordered: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in ordered.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Deterministic cache key for a tool call.
pub fn cache_key(tool_id: &str, parameters: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(parameters).as_bytes());
    hex::encode(hasher.finalize())
}

/// A cached successful tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tool_id: String,
    pub output: serde_json::Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.stored_at + Duration::milliseconds(self.ttl_ms.min(i64::MAX as u64) as i64)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// Session-scoped cache of tool results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCache {
    entries: BTreeMap<String, CacheEntry>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fresh entry. Expired entries are treated as misses.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|e| e.is_fresh(now))
    }

    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Drop expired entries; returns how many were removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_fresh(now));
        before - self.entries.len()
    }

    /// Keys ordered oldest first.
    pub fn keys_by_age(&self) -> Vec<String> {
        let mut keyed: Vec<(&String, &CacheEntry)> = self.entries.iter().collect();
        keyed.sort_by_key(|(_, e)| e.stored_at);
        keyed.into_iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
