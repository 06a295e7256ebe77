//! Case-ID Allocator Primitives
//! Mission: Monotonic per-user counters with safe release semantics

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{CASE_ID_MAX_DIGITS, CASE_ID_START};
use crate::fsio;
use crate::storage::models::LedgerEntry;

/// Why a release request did not decrement the counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingCounter,
    CounterMismatch,
    CaseInUse,
}

/// Outcome of `release_case_id`. Skips carry a reason and never mutate state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { case_id: String },
    Skipped { reason: SkipReason, last_case_id: Option<String> },
}

/// Read `{last_case_id: N}`; a missing or malformed file reads as `None`
/// (the caller recovers from a ledger scan).
pub fn read_counter(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    match value.get("last_case_id") {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|n| n as u32),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

pub fn write_counter(path: &Path, last_id: u32) -> Result<()> {
    let doc = serde_json::to_string(&json!({ "last_case_id": last_id }))
        .context("serialize case counter")?;
    fsio::atomic_write(path, doc.as_bytes())
}

/// Largest allocator-range case id referenced by the ledger. Legacy ids
/// (longer than six digits, or below the allocator floor) are ignored.
pub fn max_ledger_case_id(entries: &[LedgerEntry]) -> Option<u32> {
    entries
        .iter()
        .filter_map(|entry| entry.case_id.as_deref())
        .filter(|id| id.len() <= CASE_ID_MAX_DIGITS && id.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|id| id.parse::<u32>().ok())
        .filter(|&id| id >= CASE_ID_START)
        .max()
}
