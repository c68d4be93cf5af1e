//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Every budget
//! figure in the loop comes from these functions, so the numbers stay
//! consistent between the budget manager and compaction.

use serde::Serialize;

/// Overhead charged per conversation turn for role and delimiters.
pub const TURN_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Estimate tokens for one turn including its overhead.
pub fn estimate_turn_tokens(content: &str) -> usize {
    TURN_OVERHEAD + estimate_tokens(content)
}

/// Estimate tokens for any serializable value rendered as JSON.
pub fn estimate_json_tokens<T: Serialize + ?Sized>(value: &T) -> usize {
    let json = serde_json::to_string(value).unwrap_or_default();
    estimate_tokens(&json)
}
