//! Sentinel scanning
//!
//! Sentinels are reserved lines in an assistant reply that instruct the
//! engine. Matching is line-anchored and case-sensitive; the first match,
//! scanning top to bottom, wins, and a line is consumed by its first match.
//! Scanning is a pure function: the same text always yields the same result.

use serde_json::Value;
use tracing::warn;

/// A recognized sentinel
#[derive(Debug, Clone, PartialEq)]
pub enum Sentinel {
    /// `TASK_COMPLETE` - the whole task is done
    TaskComplete,
    /// `HAT_COMPLETE` - this hat's work is done
    HatComplete,
    /// `HAT_TRANSITION:<hat_name>` - hand off to another hat
    HatTransition(String),
    /// `APPROVAL_REQUIRED:<json-object>` - block on human sign-off
    ApprovalRequired(Value),
}

const TASK_COMPLETE: &str = "TASK_COMPLETE";
const HAT_COMPLETE: &str = "HAT_COMPLETE";
const HAT_TRANSITION: &str = "HAT_TRANSITION:";
const APPROVAL_REQUIRED: &str = "APPROVAL_REQUIRED:";

/// Scan an assistant reply for the first sentinel
pub fn scan(reply: &str) -> Option<Sentinel> {
    for line in reply.lines() {
        let line = line.trim_end();
        if line == TASK_COMPLETE {
            return Some(Sentinel::TaskComplete);
        }
        if line == HAT_COMPLETE {
            return Some(Sentinel::HatComplete);
        }
        if let Some(hat) = line.strip_prefix(HAT_TRANSITION) {
            let hat = hat.trim();
            if !hat.is_empty() {
                return Some(Sentinel::HatTransition(hat.to_string()));
            }
            continue;
        }
        if let Some(payload) = line.strip_prefix(APPROVAL_REQUIRED) {
            match serde_json::from_str::<Value>(payload) {
                Ok(value) if value.is_object() => return Some(Sentinel::ApprovalRequired(value)),
                Ok(_) | Err(_) => {
                    warn!(line, "Ignoring malformed APPROVAL_REQUIRED payload");
                    continue;
                }
            }
        }
    }
    None
}
