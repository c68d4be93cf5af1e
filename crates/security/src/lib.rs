//! Security module for Steward — tool authorization, consent, and audit logging.
//!
//! Provides:
//! - **Access policy**: Deny-by-default allowlist deciding which tools a principal may run
//! - **Consent**: Per-tool consent grants checked before tools that require them
//! - **Audit logging**: Structured records of tool calls, denials, approvals and outcomes

pub mod access;
pub mod audit;
pub mod consent;

pub use access::{AccessDecision, AccessPolicy};
pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use consent::{ConsentProvider, ConsentRegistry};
