//! Task — the unit of work submitted to the loop.
//!
//! A task is immutable once an iteration begins. Feedback from a failed
//! iteration produces a *derived* task with the same id and a revised
//! description instead of mutating the original.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marks requirements that record verifier feedback rather than new work.
pub const FEEDBACK_PREFIX: &str = "[feedback] ";

/// Whether a requirement is verifier feedback.
pub fn is_feedback(requirement: &str) -> bool {
    requirement.starts_with(FEEDBACK_PREFIX)
}

/// Requirements phrased with MUST are mandatory.
pub fn is_mandatory(requirement: &str) -> bool {
    let trimmed = requirement.trim_start();
    trimmed
        .get(..4)
        .is_some_and(|head| head.eq_ignore_ascii_case("must"))
        && trimmed[4..].starts_with(|c: char| c.is_whitespace() || c == ':')
}

/// Submission priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A task as received from the request-handling collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    pub description: String,

    /// Selects which knowledge collection applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub requirements: Vec<String>,

    /// Arbitrary auxiliary context (ticket fields, record ids, ...).
    #[serde(default)]
    pub aux_context: serde_json::Map<String, serde_json::Value>,

    /// Number of derivations from the submitted task (0 = as submitted).
    #[serde(default)]
    pub revision: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            domain: None,
            priority: Priority::Normal,
            deadline: None,
            requirements: Vec::new(),
            aux_context: serde_json::Map::new(),
            revision: 0,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.aux_context.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Produce the task for the next iteration.
    ///
    /// Keeps the id, appends `extra` requirements (skipping ones already
    /// present) and revises the description to record the revision.
    pub fn derive(&self, extra: impl IntoIterator<Item = String>) -> Task {
        let mut next = self.clone();
        next.revision = self.revision + 1;
        for requirement in extra {
            if !next.requirements.contains(&requirement) {
                next.requirements.push(requirement);
            }
        }
        next.description = format!("{} [revision {}]", self.base_description(), next.revision);
        next
    }

    /// The description as submitted, without any revision marker.
    pub fn base_description(&self) -> &str {
        self.description
            .split(" [revision ")
            .next()
            .unwrap_or(&self.description)
    }

    /// Whether the deadline has already passed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Requirements the planner maps to steps: everything except verifier feedback.
    pub fn actionable_requirements(&self) -> impl Iterator<Item = &str> {
        self.requirements
            .iter()
            .map(String::as_str)
            .filter(|r| !is_feedback(r))
    }

    /// Verifier feedback carried over from earlier iterations, without the prefix.
    pub fn feedback(&self) -> impl Iterator<Item = &str> {
        self.requirements
            .iter()
            .filter_map(|r| r.strip_prefix(FEEDBACK_PREFIX))
    }

    /// Render the task definition for the always-loaded base context.
    pub fn render(&self) -> String {
        let mut out = format!("## Task {}\n{}\n", self.id, self.description);
        if let Some(domain) = &self.domain {
            out.push_str(&format!("Domain: {domain}\n"));
        }
        if !self.requirements.is_empty() {
            out.push_str("Requirements:\n");
            for requirement in &self.requirements {
                out.push_str(&format!("- {requirement}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_keeps_id_and_appends_requirements() {
        let task = Task::new("T-1", "Draft discovery form").with_requirement("MUST cite sources");
        let next = task.derive(vec!["address: completeness".into()]);

        assert_eq!(next.id, "T-1");
        assert_eq!(next.revision, 1);
        assert_eq!(next.requirements.len(), 2);
        assert_eq!(next.description, "Draft discovery form [revision 1]");
        // Original untouched
        assert_eq!(task.requirements.len(), 1);
        assert_eq!(task.revision, 0);
    }

    #[test]
    fn derive_skips_duplicate_requirements() {
        let task = Task::new("T-1", "x").with_requirement("a");
        let next = task.derive(vec!["a".into(), "b".into()]).derive(vec!["b".into()]);
        assert_eq!(next.requirements, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(next.description, "x [revision 2]");
    }

    #[test]
    fn deserializes_minimal_submission() {
        let task: Task = serde_json::from_str(r#"{"id":"T-9","description":"Look up vendor"}"#)
            .unwrap();
        assert_eq!(task.priority, Priority::Normal);
        assert!(task.requirements.is_empty());
        assert!(task.deadline.is_none());
    }

    #[test]
    fn feedback_is_not_actionable() {
        let task = Task::new("T", "Compare vendors")
            .with_requirement("MUST cite two quotes")
            .derive(vec![format!("{FEEDBACK_PREFIX}completeness: step 1 failed")]);

        let actionable: Vec<&str> = task.actionable_requirements().collect();
        assert_eq!(actionable, vec!["MUST cite two quotes"]);
        let feedback: Vec<&str> = task.feedback().collect();
        assert_eq!(feedback, vec!["completeness: step 1 failed"]);
        assert_eq!(task.base_description(), "Compare vendors");
    }

    #[test]
    fn mandatory_detection() {
        assert!(is_mandatory("MUST cite sources"));
        assert!(is_mandatory("  must: include owner"));
        assert!(!is_mandatory("Mustard supplier lookup"));
        assert!(!is_mandatory("should cite sources"));
        assert!(!is_mandatory("MUST"));
    }

    #[test]
    fn overdue_check() {
        let mut task = Task::new("T", "d");
        let now = Utc::now();
        assert!(!task.is_overdue(now));
        task.deadline = Some(now - chrono::Duration::minutes(1));
        assert!(task.is_overdue(now));
    }
}
