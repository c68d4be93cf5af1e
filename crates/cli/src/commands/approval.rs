//! Interactive approval on the terminal.
//!
//! The request is printed to stderr; the reviewer answers on stdin:
//! `y` approves, `n [reason]` denies, `m change one; change two` modifies.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use steward_core::{ApprovalDecision, ApprovalError, ApprovalGateway, ApprovalRequest};

pub struct StdinApproval {
    lines: Mutex<tokio::io::Lines<BufReader<tokio::io::Stdin>>>,
}

impl StdinApproval {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl ApprovalGateway for StdinApproval {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        eprintln!();
        eprintln!("  Approval needed for task {} ({})", request.task_id, request.tier);
        eprintln!("  Action:      {}", request.action.description);
        eprintln!("  Tools:       {}", request.action.tool_ids.join(", "));
        eprintln!(
            "  Risk:        impact {:?}, reversibility {:?}, sensitivity {:?}",
            request.action.impact, request.action.reversibility, request.action.sensitivity
        );
        eprintln!("  Confidence:  {:.2}", request.confidence);
        eprintln!("  Rationale:   {}", request.rationale);

        let mut lines = self.lines.lock().await;
        loop {
            eprint!("  Approve? [y / n <reason> / m <change>; <change>] > ");
            let line = lines
                .next_line()
                .await
                .map_err(|e| ApprovalError::Unavailable(format!("stdin: {e}")))?
                .ok_or_else(|| ApprovalError::Unavailable("stdin closed".into()))?;
            match parse_answer(&line) {
                Some(decision) => return Ok(decision),
                None => eprintln!("  Unrecognized answer: {line}"),
            }
        }
    }
}

/// Parse one reviewer answer; `None` means ask again.
pub fn parse_answer(line: &str) -> Option<ApprovalDecision> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    match head.to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalDecision::Approved),
        "n" | "no" => Some(ApprovalDecision::Denied {
            reason: if rest.is_empty() {
                "denied by reviewer".into()
            } else {
                rest.to_string()
            },
        }),
        "m" | "modify" => {
            let changes: Vec<String> = rest
                .split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
            if changes.is_empty() {
                None
            } else {
                Some(ApprovalDecision::Modified { changes })
            }
        }
        _ => None,
    }
}
