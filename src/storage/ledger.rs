//! Case Store
//! Mission: Per-user append-only case ledgers with invariant-preserving upserts

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::{Settings, CASE_ID_START};
use crate::crypto::Crypto;
use crate::fsio;
use crate::storage::counter::{self, ReleaseOutcome, SkipReason};
use crate::storage::models::{CaseFilter, CaseUpdate, EntryKind, LedgerEntry};

/// Result of an annotation write, which may need cross-user resolution.
#[derive(Debug)]
pub enum AnnotationResult {
    Updated(LedgerEntry),
    NotFound,
    /// Several users hold a rejected entry for this case id; the caller must
    /// disambiguate with an explicit case owner.
    Ambiguous,
}

/// Per-user JSON-lines ledgers plus the case-id allocator. One lock per user
/// covers both the ledger file and the counter file; cross-user operations
/// iterate users without ever holding a global lock.
pub struct CaseStore {
    settings: Arc<Settings>,
    crypto: Arc<Crypto>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CaseStore {
    pub fn new(settings: Arc<Settings>, crypto: Arc<Crypto>) -> Self {
        Self {
            settings,
            crypto,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock();
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    // ---- raw ledger IO -------------------------------------------------

    fn read_entries_at(&self, path: &Path) -> Vec<LedgerEntry> {
        let lines = match fsio::read_lines(path) {
            Ok(lines) => lines,
            Err(err) => {
                warn!("failed to read ledger {}: {err:#}", path.display());
                return Vec::new();
            }
        };

        let mut entries = Vec::with_capacity(lines.len());
        for line in lines {
            let Some(value) = self.crypto.decode_entry(&line) else {
                if !line.trim().is_empty() {
                    warn!("skipping undecodable ledger line in {}", path.display());
                }
                continue;
            };
            match serde_json::from_value::<LedgerEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!("skipping malformed ledger entry in {}: {err}", path.display()),
            }
        }
        entries
    }

    fn write_entries_at(&self, path: &Path, entries: &[LedgerEntry]) -> Result<()> {
        let mut contents = String::new();
        for entry in entries {
            let value = serde_json::to_value(entry).context("serialize ledger entry")?;
            contents.push_str(&self.crypto.encode_entry(&value)?);
            contents.push('\n');
        }
        fsio::atomic_write(path, contents.as_bytes())
    }

    fn append_entry_at(&self, path: &Path, entry: &LedgerEntry) -> Result<()> {
        let value = serde_json::to_value(entry).context("serialize ledger entry")?;
        fsio::append_line(path, &self.crypto.encode_entry(&value)?)
    }

    /// All user ids with a storage directory.
    pub fn list_user_ids(&self) -> Vec<String> {
        let Ok(read) = std::fs::read_dir(&self.settings.storage_root) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = read
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        ids
    }

    pub fn read_user_entries(&self, user_id: &str) -> Vec<LedgerEntry> {
        self.read_entries_at(&self.settings.user_metadata_path(user_id))
    }

    /// Every entry across all user ledgers, plus the legacy single-file
    /// ledger if one is still present.
    pub fn read_all_entries(&self) -> Vec<LedgerEntry> {
        let mut entries = Vec::new();
        for user_id in self.list_user_ids() {
            entries.extend(self.read_user_entries(&user_id));
        }
        if self.settings.legacy_metadata_file.exists() {
            entries.extend(self.read_entries_at(&self.settings.legacy_metadata_file));
        }
        entries
    }

    // ---- case-id allocation --------------------------------------------

    /// Next case id for this user. The persisted counter is a cache; when it
    /// is missing, recover from the ledger-derived maximum.
    pub fn allocate_case_id(&self, user_id: &str) -> Result<String> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let counter_path = self.settings.user_counter_path(user_id);
        let last_id = counter::read_counter(&counter_path).unwrap_or_else(|| {
            let entries = self.read_user_entries(user_id);
            counter::max_ledger_case_id(&entries).unwrap_or(CASE_ID_START - 1)
        });

        let next_id = (last_id + 1).max(CASE_ID_START);
        counter::write_counter(&counter_path, next_id)?;
        Ok(next_id.to_string())
    }

    /// Return an unused id to the allocator. Only the most recently issued id
    /// can be released, and only while nothing in the ledger references it.
    pub fn release_case_id(&self, user_id: &str, case_id: &str) -> Result<ReleaseOutcome> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let counter_path = self.settings.user_counter_path(user_id);
        let Some(last_id) = counter::read_counter(&counter_path) else {
            return Ok(ReleaseOutcome::Skipped {
                reason: SkipReason::MissingCounter,
                last_case_id: None,
            });
        };

        if last_id.to_string() != case_id {
            return Ok(ReleaseOutcome::Skipped {
                reason: SkipReason::CounterMismatch,
                last_case_id: Some(last_id.to_string()),
            });
        }

        let entries = self.read_user_entries(user_id);
        let in_use = entries
            .iter()
            .any(|e| e.case_id.as_deref() == Some(case_id));
        if in_use {
            return Ok(ReleaseOutcome::Skipped {
                reason: SkipReason::CaseInUse,
                last_case_id: Some(last_id.to_string()),
            });
        }

        counter::write_counter(&counter_path, last_id.saturating_sub(1).max(CASE_ID_START - 1))?;
        Ok(ReleaseOutcome::Released {
            case_id: case_id.to_string(),
        })
    }

    // ---- writes --------------------------------------------------------

    /// Append an image entry produced by the upload quality gate.
    pub fn record_image(&self, user_id: &str, entry: &LedgerEntry) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();
        self.append_entry_at(&self.settings.user_metadata_path(user_id), entry)
    }

    /// Create or replace the single summary entry for a case.
    ///
    /// Any previous summary for the case is elided; image entries for the
    /// case are rewritten with the summary's context; `image_ids` and the
    /// derived `image_paths` are recomputed from what remains in the ledger.
    pub fn upsert_case_summary(
        &self,
        user_id: &str,
        user_role: &str,
        mut entry: LedgerEntry,
        kind: EntryKind,
        default_status: &str,
    ) -> Result<LedgerEntry> {
        let case_id = match entry.case_id.take() {
            Some(id) if !id.trim().is_empty() => id,
            _ => self.allocate_case_id(user_id)?,
        };
        entry.case_id = Some(case_id.clone());
        entry.entry_type = Some(kind);
        if entry.status.is_none() {
            entry.status = Some(default_status.to_string());
        }
        entry.user_id = Some(user_id.to_string());
        if !user_role.is_empty() {
            entry.user_role = Some(user_role.to_string());
        }
        if entry.created_at.is_none() {
            entry.created_at = Some(Self::now());
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let path = self.settings.user_metadata_path(user_id);
        let existing = self.read_entries_at(&path);

        let mut rebuilt: Vec<LedgerEntry> = Vec::with_capacity(existing.len() + 1);
        for mut old in existing {
            if old.case_id.as_deref() == Some(case_id.as_str()) {
                if old.is_summary() {
                    // Replaced by the incoming summary.
                    continue;
                }
                if old.is_image() {
                    old.apply_summary_context(&entry);
                }
            }
            rebuilt.push(old);
        }

        let image_ids: BTreeSet<String> = rebuilt
            .iter()
            .filter(|e| e.case_id.as_deref() == Some(case_id.as_str()))
            .filter_map(|e| e.image_id.clone())
            .collect();
        if !image_ids.is_empty() {
            entry.image_ids = image_ids.iter().cloned().collect();
            entry.image_paths = image_ids
                .iter()
                .map(|id| format!("{user_id}/{id}.jpg"))
                .collect();
        }

        rebuilt.push(entry.clone());
        self.write_entries_at(&path, &rebuilt)?;
        Ok(entry)
    }

    fn update_entries_in_place(
        entries: &mut [LedgerEntry],
        case_id: &str,
        patch: &CaseUpdate,
    ) -> Option<LedgerEntry> {
        // Newest matching summary wins; reject entries are never patched here.
        for entry in entries.iter_mut().rev() {
            if entry.case_id.as_deref() != Some(case_id) {
                continue;
            }
            match entry.entry_type {
                Some(EntryKind::Case) | Some(EntryKind::Uncertain) => {}
                _ => continue,
            }
            patch.apply_to(entry);
            entry.updated_at = Some(Self::now());
            return Some(entry.clone());
        }
        None
    }

    /// Patch the newest open summary (`case` or `uncertain`) in one user's
    /// ledger. Returns the updated entry, or `None` when no match exists.
    pub fn update_case(
        &self,
        user_id: &str,
        case_id: &str,
        patch: &CaseUpdate,
    ) -> Result<Option<LedgerEntry>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let path = self.settings.user_metadata_path(user_id);
        let mut entries = self.read_entries_at(&path);
        if entries.is_empty() {
            return Ok(None);
        }
        let Some(updated) = Self::update_entries_in_place(&mut entries, case_id, patch) else {
            return Ok(None);
        };
        self.write_entries_at(&path, &entries)?;
        Ok(Some(updated))
    }

    /// Admin patch across all users (and the legacy ledger) when no owner is
    /// given. Each user's file is visited under its own lock.
    pub fn update_case_global(
        &self,
        case_id: &str,
        patch: &CaseUpdate,
    ) -> Result<Option<LedgerEntry>> {
        for user_id in self.list_user_ids() {
            if let Some(updated) = self.update_case(&user_id, case_id, patch)? {
                return Ok(Some(updated));
            }
        }

        let legacy = &self.settings.legacy_metadata_file;
        if legacy.exists() {
            let mut entries = self.read_entries_at(legacy);
            if let Some(updated) = Self::update_entries_in_place(&mut entries, case_id, patch) {
                self.write_entries_at(legacy, &entries)?;
                return Ok(Some(updated));
            }
        }
        Ok(None)
    }

    /// Record a reviewer's corrected label on a case. Prefers the newest
    /// reject entry, falling back to the newest open summary.
    pub fn submit_label(
        &self,
        user_id: &str,
        case_id: &str,
        correct_label: &str,
        notes: Option<&str>,
        labeled_by: &str,
    ) -> Result<Option<LedgerEntry>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let path = self.settings.user_metadata_path(user_id);
        let mut entries = self.read_entries_at(&path);

        let mut reject_idx = None;
        let mut fallback_idx = None;
        for (i, entry) in entries.iter().enumerate().rev() {
            if entry.case_id.as_deref() != Some(case_id) {
                continue;
            }
            match entry.entry_type {
                Some(EntryKind::Reject) => {
                    reject_idx = Some(i);
                    break;
                }
                Some(EntryKind::Case) | Some(EntryKind::Uncertain) => {
                    if fallback_idx.is_none() {
                        fallback_idx = Some(i);
                    }
                }
                None => {}
            }
        }

        let Some(idx) = reject_idx.or(fallback_idx) else {
            return Ok(None);
        };

        let now = Self::now();
        let entry = &mut entries[idx];
        entry.correct_label = Some(correct_label.to_string());
        entry.labeled_by = Some(labeled_by.to_string());
        entry.labeled_at = Some(now.clone());
        entry.label_notes = notes.map(str::to_string);
        entry.updated_at = Some(now);
        let updated = entry.clone();

        self.write_entries_at(&path, &entries)?;
        Ok(Some(updated))
    }

    fn find_reject_index(entries: &[LedgerEntry], case_id: &str) -> Option<usize> {
        entries.iter().enumerate().rev().find_map(|(i, e)| {
            (e.case_id.as_deref() == Some(case_id)
                && e.entry_type == Some(EntryKind::Reject))
            .then_some(i)
        })
    }

    /// Attach reviewer annotations (strokes/boxes plus the corrected label)
    /// to a rejected case. When no owner is given and the caller may search
    /// globally, every user's ledger is considered; two matches are a
    /// conflict the caller must resolve with an explicit owner.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_annotations(
        &self,
        target_user: Option<&str>,
        case_id: &str,
        correct_label: &str,
        annotations: Option<serde_json::Value>,
        image_index: i64,
        notes: Option<&str>,
        annotated_at: Option<&str>,
        annotated_by: &str,
    ) -> Result<AnnotationResult> {
        let owner = match target_user {
            Some(owner) => Some(owner.to_string()),
            None => {
                let mut matched: Option<String> = None;
                for user_id in self.list_user_ids() {
                    let entries = self.read_user_entries(&user_id);
                    if Self::find_reject_index(&entries, case_id).is_some() {
                        if matched.is_some() {
                            return Ok(AnnotationResult::Ambiguous);
                        }
                        matched = Some(user_id);
                    }
                }
                matched
            }
        };

        let Some(owner) = owner else {
            return Ok(AnnotationResult::NotFound);
        };

        let lock = self.user_lock(&owner);
        let _guard = lock.lock();

        let path = self.settings.user_metadata_path(&owner);
        let mut entries = self.read_entries_at(&path);
        let Some(idx) = Self::find_reject_index(&entries, case_id) else {
            return Ok(AnnotationResult::NotFound);
        };

        let now = Self::now();
        let entry = &mut entries[idx];
        entry.correct_label = Some(correct_label.to_string());
        entry.annotations = annotations;
        entry.annotated_by = Some(annotated_by.to_string());
        entry.annotated_at = Some(annotated_at.map(str::to_string).unwrap_or_else(|| now.clone()));
        entry.annotation_image_index = Some(image_index);
        entry.annotation_notes = notes.map(str::to_string);
        entry.updated_at = Some(now);
        let updated = entry.clone();

        self.write_entries_at(&path, &entries)?;
        Ok(AnnotationResult::Updated(updated))
    }

    // ---- reads ---------------------------------------------------------

    fn filter_and_window(entries: Vec<LedgerEntry>, filter: &CaseFilter) -> Vec<LedgerEntry> {
        let matched: Vec<LedgerEntry> =
            entries.into_iter().filter(|e| filter.matches(e)).collect();
        // Last N in file order, newest first in the response.
        let start = matched.len().saturating_sub(filter.limit);
        matched[start..].iter().rev().cloned().collect()
    }

    /// One user's case summaries, newest first.
    pub fn read_cases(&self, user_id: &str, filter: &CaseFilter) -> Vec<LedgerEntry> {
        Self::filter_and_window(self.read_user_entries(user_id), filter)
    }

    /// Every user's case summaries (admin view), newest first.
    pub fn read_cases_global(&self, filter: &CaseFilter) -> Vec<LedgerEntry> {
        Self::filter_and_window(self.read_all_entries(), filter)
    }

    /// How many rejected images already carry a corrected label. Drives the
    /// legacy retrain threshold check when the label pool is empty.
    pub fn count_rejected_labeled_images(&self) -> usize {
        self.read_all_entries()
            .iter()
            .filter(|e| e.entry_type == Some(EntryKind::Reject))
            .filter(|e| e.correct_label.as_deref().is_some_and(|l| !l.is_empty()))
            .map(|e| e.image_paths.len())
            .sum()
    }

    /// Legacy training-sample scan: rejected entries with a corrected label,
    /// one sample per image path, resolved against the storage root.
    pub fn collect_rejected_labeled_samples(&self) -> Vec<(PathBuf, String)> {
        let mut samples = Vec::new();
        for entry in self.read_all_entries() {
            if entry.entry_type != Some(EntryKind::Reject) {
                continue;
            }
            let Some(label) = entry.correct_label.as_deref().filter(|l| !l.is_empty()) else {
                continue;
            };
            for rel in &entry.image_paths {
                samples.push((self.settings.storage_root.join(rel), label.to_string()));
            }
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::CasePayload;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (CaseStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let settings = Settings::defaults_at(dir.path().join("storage"), dir.path().join("AL"));
        let store = CaseStore::new(Arc::new(settings), Arc::new(Crypto::disabled()));
        (store, dir)
    }

    fn payload(case_id: &str) -> LedgerEntry {
        CasePayload {
            case_id: Some(case_id.to_string()),
            predictions: vec![crate::model::Prediction {
                label: "nv".to_string(),
                confidence: 0.9,
            }],
            ..Default::default()
        }
        .into_entry()
    }

    fn image_entry(case_id: &str, image_id: &str) -> LedgerEntry {
        serde_json::from_value(json!({
            "case_id": case_id,
            "image_id": image_id,
            "blur_score": 120.0,
            "status": "success",
            "created_at": "2026-01-01T00:00:00Z",
            "user_id": "alice",
        }))
        .unwrap()
    }

    #[test]
    fn test_fresh_user_allocates_case_id_start() {
        let (store, _dir) = test_store();
        assert_eq!(store.allocate_case_id("alice").unwrap(), "10000");
        assert_eq!(store.allocate_case_id("alice").unwrap(), "10001");
        // Counters are per user.
        assert_eq!(store.allocate_case_id("bob").unwrap(), "10000");
    }

    #[test]
    fn test_release_then_reallocate_same_id() {
        let (store, _dir) = test_store();
        let id = store.allocate_case_id("alice").unwrap();
        assert_eq!(id, "10000");

        let outcome = store.release_case_id("alice", &id).unwrap();
        assert_eq!(
            outcome,
            ReleaseOutcome::Released {
                case_id: "10000".to_string()
            }
        );
        assert_eq!(store.allocate_case_id("alice").unwrap(), "10000");
    }

    #[test]
    fn test_release_mismatch_does_not_mutate() {
        let (store, _dir) = test_store();
        store.allocate_case_id("alice").unwrap();

        let outcome = store.release_case_id("alice", "10005").unwrap();
        match outcome {
            ReleaseOutcome::Skipped {
                reason: SkipReason::CounterMismatch,
                last_case_id,
            } => assert_eq!(last_case_id.as_deref(), Some("10000")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.allocate_case_id("alice").unwrap(), "10001");
    }

    #[test]
    fn test_release_refuses_when_case_in_use() {
        let (store, _dir) = test_store();
        let id = store.allocate_case_id("alice").unwrap();
        store
            .upsert_case_summary("alice", "gp", payload(&id), EntryKind::Case, "pending")
            .unwrap();

        let outcome = store.release_case_id("alice", &id).unwrap();
        assert!(matches!(
            outcome,
            ReleaseOutcome::Skipped {
                reason: SkipReason::CaseInUse,
                ..
            }
        ));
    }

    #[test]
    fn test_release_without_counter() {
        let (store, _dir) = test_store();
        let outcome = store.release_case_id("alice", "10000").unwrap();
        assert!(matches!(
            outcome,
            ReleaseOutcome::Skipped {
                reason: SkipReason::MissingCounter,
                ..
            }
        ));
    }

    #[test]
    fn test_allocator_recovers_from_ledger_scan() {
        let (store, dir) = test_store();
        store
            .upsert_case_summary("alice", "gp", payload("10007"), EntryKind::Case, "pending")
            .unwrap();
        // The counter file was never written (the id came from the payload),
        // so the allocator must recover from the ledger scan.
        assert!(!dir.path().join("storage/alice/case_counter.json").exists());

        assert_eq!(store.allocate_case_id("alice").unwrap(), "10008");
    }

    #[test]
    fn test_summary_dedup_on_reject() {
        let (store, _dir) = test_store();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Case, "pending")
            .unwrap();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Reject, "rejected")
            .unwrap();

        let entries = store.read_user_entries("alice");
        let summaries: Vec<_> = entries.iter().filter(|e| e.is_summary()).collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].entry_type, Some(EntryKind::Reject));
        assert_eq!(summaries[0].status.as_deref(), Some("rejected"));
    }

    #[test]
    fn test_upsert_denormalizes_images_and_collects_ids() {
        let (store, _dir) = test_store();
        store.record_image("alice", &image_entry("10000", "img-b")).unwrap();
        store.record_image("alice", &image_entry("10000", "img-a")).unwrap();
        store.record_image("alice", &image_entry("10001", "img-z")).unwrap();

        let mut entry = payload("10000");
        entry.gender = Some("f".to_string());
        let summary = store
            .upsert_case_summary("alice", "gp", entry, EntryKind::Case, "pending")
            .unwrap();

        // image_ids is the sorted set of this case's images only.
        assert_eq!(summary.image_ids, vec!["img-a", "img-b"]);
        assert_eq!(
            summary.image_paths,
            vec!["alice/img-a.jpg", "alice/img-b.jpg"]
        );

        let entries = store.read_user_entries("alice");
        let img = entries
            .iter()
            .find(|e| e.image_id.as_deref() == Some("img-a"))
            .unwrap();
        assert_eq!(img.case_status.as_deref(), Some("pending"));
        assert_eq!(img.case_entry_type, Some(EntryKind::Case));
        assert_eq!(img.gender.as_deref(), Some("f"));
        // Unrelated case's image is untouched.
        let other = entries
            .iter()
            .find(|e| e.image_id.as_deref() == Some("img-z"))
            .unwrap();
        assert!(other.case_status.is_none());
    }

    #[test]
    fn test_update_case_refuses_reject_entries() {
        let (store, _dir) = test_store();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Reject, "rejected")
            .unwrap();

        let patch = CaseUpdate {
            status: Some("reviewed".to_string()),
            ..Default::default()
        };
        assert!(store.update_case("alice", "10000", &patch).unwrap().is_none());
    }

    #[test]
    fn test_update_case_patches_open_summary() {
        let (store, _dir) = test_store();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Case, "pending")
            .unwrap();

        let patch = CaseUpdate {
            status: Some("closed".to_string()),
            notes: Some("follow-up in 3 months".to_string()),
            ..Default::default()
        };
        let updated = store.update_case("alice", "10000", &patch).unwrap().unwrap();
        assert_eq!(updated.status.as_deref(), Some("closed"));
        assert!(updated.updated_at.is_some());
    }

    #[test]
    fn test_read_cases_filter_and_order() {
        let (store, _dir) = test_store();
        for (id, kind, status) in [
            ("10000", EntryKind::Case, "pending"),
            ("10001", EntryKind::Uncertain, "pending"),
            ("10002", EntryKind::Reject, "rejected"),
        ] {
            store
                .upsert_case_summary("alice", "gp", payload(id), kind, status)
                .unwrap();
        }

        let all = store.read_cases("alice", &CaseFilter::default());
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].case_id.as_deref(), Some("10002"));

        let no_rejects = store.read_cases(
            "alice",
            &CaseFilter {
                include_rejected: false,
                ..Default::default()
            },
        );
        assert_eq!(no_rejects.len(), 2);

        let rejected_only = store.read_cases(
            "alice",
            &CaseFilter {
                status: Some("rejected".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(rejected_only.len(), 1);
    }

    #[test]
    fn test_global_read_includes_legacy_ledger(){
        let (store, dir) = test_store();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Case, "pending")
            .unwrap();

        // Legacy single-file ledger at the storage root.
        let legacy = dir.path().join("storage/metadata.jsonl");
        std::fs::write(
            &legacy,
            r#"{"case_id":"20001","entry_type":"case","status":"pending"}"#,
        )
        .unwrap();

        let cases = store.read_cases_global(&CaseFilter::default());
        let ids: Vec<_> = cases.iter().filter_map(|c| c.case_id.as_deref()).collect();
        assert!(ids.contains(&"10000"));
        assert!(ids.contains(&"20001"));
    }

    #[test]
    fn test_submit_label_prefers_reject_entry() {
        let (store, _dir) = test_store();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Case, "pending")
            .unwrap();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Reject, "rejected")
            .unwrap();

        let updated = store
            .submit_label("alice", "10000", "mel", Some("dermoscopy review"), "doc1")
            .unwrap()
            .unwrap();
        assert_eq!(updated.entry_type, Some(EntryKind::Reject));
        assert_eq!(updated.correct_label.as_deref(), Some("mel"));
        assert_eq!(updated.labeled_by.as_deref(), Some("doc1"));
    }

    #[test]
    fn test_annotations_ambiguous_across_users() {
        let (store, _dir) = test_store();
        for user in ["alice", "bob"] {
            store
                .upsert_case_summary(user, "gp", payload("10000"), EntryKind::Reject, "rejected")
                .unwrap();
        }

        let result = store
            .apply_annotations(
                None,
                "10000",
                "mel",
                Some(json!({"strokes": []})),
                0,
                None,
                None,
                "doc1",
            )
            .unwrap();
        assert!(matches!(result, AnnotationResult::Ambiguous));

        // Explicit owner resolves the conflict.
        let result = store
            .apply_annotations(
                Some("bob"),
                "10000",
                "mel",
                Some(json!({"strokes": []})),
                0,
                None,
                None,
                "doc1",
            )
            .unwrap();
        match result {
            AnnotationResult::Updated(entry) => {
                assert_eq!(entry.user_id.as_deref(), Some("bob"));
                assert_eq!(entry.correct_label.as_deref(), Some("mel"));
                assert_eq!(entry.annotation_image_index, Some(0));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_count_rejected_labeled_images() {
        let (store, _dir) = test_store();
        store.record_image("alice", &image_entry("10000", "img-a")).unwrap();
        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Reject, "rejected")
            .unwrap();
        assert_eq!(store.count_rejected_labeled_images(), 0);

        store
            .submit_label("alice", "10000", "mel", None, "doc1")
            .unwrap();
        assert_eq!(store.count_rejected_labeled_images(), 1);
    }

    #[test]
    fn test_encrypted_ledger_round_trip() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::defaults_at(dir.path().join("storage"), dir.path().join("AL"));
        let key = {
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            use base64::Engine;
            URL_SAFE_NO_PAD.encode([9u8; 32])
        };
        let crypto = Arc::new(Crypto::new(true, &key).unwrap());
        let store = CaseStore::new(Arc::new(settings), crypto);

        store
            .upsert_case_summary("alice", "gp", payload("10000"), EntryKind::Case, "pending")
            .unwrap();

        // On disk: only the enc sentinel.
        let raw = std::fs::read_to_string(dir.path().join("storage/alice/metadata.jsonl")).unwrap();
        assert!(raw.contains("\"enc\""));
        assert!(!raw.contains("case_id"));

        let entries = store.read_user_entries("alice");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].case_id.as_deref(), Some("10000"));
    }
}
