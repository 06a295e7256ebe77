//! Case Storage Module
//! Mission: Per-user case ledgers, id allocation, and summary reconciliation

pub mod counter;
pub mod ledger;
pub mod models;

pub use counter::{ReleaseOutcome, SkipReason};
pub use ledger::{AnnotationResult, CaseStore};
pub use models::{CaseFilter, CasePayload, CaseUpdate, EntryKind, LedgerEntry};
