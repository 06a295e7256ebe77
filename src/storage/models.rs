//! Case Ledger Models
//! Mission: Typed ledger entries shared by the case store and the API

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::Prediction;

/// Kind of a case summary entry. Image entries carry no kind of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Case,
    Uncertain,
    Reject,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Case => "case",
            EntryKind::Uncertain => "uncertain",
            EntryKind::Reject => "reject",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "case" => Some(EntryKind::Case),
            "uncertain" => Some(EntryKind::Uncertain),
            "reject" => Some(EntryKind::Reject),
            _ => None,
        }
    }
}

/// One line of a user's ledger. Two kinds co-exist in the same file:
/// image entries (`image_id` set, `entry_type` unset) and case summaries
/// (`entry_type` set). Unknown fields ride along in `extra` so rewrites
/// never drop data written by older builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<EntryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blur_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predictions: Vec<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,

    // Patient context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symptoms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    // Summary-only fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeled_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeled_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_image_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_notes: Option<String>,

    // Denormalized summary context written onto image entries at upsert time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_entry_type: Option<EntryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_updated_at: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LedgerEntry {
    pub fn is_summary(&self) -> bool {
        self.entry_type.is_some()
    }

    pub fn is_image(&self) -> bool {
        self.entry_type.is_none() && self.image_id.is_some()
    }

    /// Copy summary context onto an image entry (the `case_*` denormalization
    /// plus patient fields). Immutable image attributes are left untouched.
    pub fn apply_summary_context(&mut self, summary: &LedgerEntry) {
        self.case_status = summary.status.clone();
        self.case_entry_type = summary.entry_type;
        self.case_updated_at = summary.created_at.clone();
        if summary.user_id.is_some() {
            self.user_id = summary.user_id.clone();
        }
        if summary.user_role.is_some() {
            self.user_role = summary.user_role.clone();
        }
        if summary.gender.is_some() {
            self.gender = summary.gender.clone();
        }
        if summary.age.is_some() {
            self.age = summary.age.clone();
        }
        if summary.location.is_some() {
            self.location = summary.location.clone();
        }
        if !summary.symptoms.is_empty() {
            self.symptoms = summary.symptoms.clone();
        }
        if summary.notes.is_some() {
            self.notes = summary.notes.clone();
        }
    }
}

/// Case payload posted to `/cases`, `/cases/uncertain`, `/cases/reject`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CasePayload {
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub image_paths: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl CasePayload {
    /// Build the summary skeleton; the store fills ids, kind, and timestamps.
    pub fn into_entry(self) -> LedgerEntry {
        let mut entry = LedgerEntry {
            case_id: self.case_id.filter(|c| !c.trim().is_empty()),
            status: self.status.filter(|s| !s.trim().is_empty()),
            predictions: self.predictions,
            gender: self.gender,
            age: self.age,
            location: self.location,
            symptoms: self.symptoms,
            image_paths: self.image_paths,
            notes: self.notes,
            created_at: self.created_at,
            ..Default::default()
        };
        if let Some(reason) = self.reason {
            entry
                .extra
                .insert("reason".to_string(), Value::String(reason));
        }
        entry
    }
}

/// Partial patch for `PUT /cases/{id}`. Only provided fields are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseUpdate {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub predictions: Option<Vec<Prediction>>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub symptoms: Option<Vec<String>>,
    #[serde(default)]
    pub image_paths: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CaseUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.predictions.is_none()
            && self.gender.is_none()
            && self.age.is_none()
            && self.location.is_none()
            && self.symptoms.is_none()
            && self.image_paths.is_none()
            && self.notes.is_none()
    }

    pub fn apply_to(&self, entry: &mut LedgerEntry) {
        if let Some(status) = &self.status {
            entry.status = Some(status.clone());
        }
        if let Some(predictions) = &self.predictions {
            entry.predictions = predictions.clone();
        }
        if let Some(gender) = &self.gender {
            entry.gender = Some(gender.clone());
        }
        if let Some(age) = &self.age {
            entry.age = Some(age.clone());
        }
        if let Some(location) = &self.location {
            entry.location = Some(location.clone());
        }
        if let Some(symptoms) = &self.symptoms {
            entry.symptoms = symptoms.clone();
        }
        if let Some(image_paths) = &self.image_paths {
            entry.image_paths = image_paths.clone();
        }
        if let Some(notes) = &self.notes {
            entry.notes = Some(notes.clone());
        }
    }
}

/// Filter for ledger reads.
#[derive(Debug, Clone)]
pub struct CaseFilter {
    pub status: Option<String>,
    pub limit: usize,
    pub include_uncertain: bool,
    pub include_rejected: bool,
}

impl Default for CaseFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
            include_uncertain: true,
            include_rejected: true,
        }
    }
}

impl CaseFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        let allowed = match entry.entry_type {
            Some(EntryKind::Case) => true,
            Some(EntryKind::Uncertain) => self.include_uncertain,
            Some(EntryKind::Reject) => self.include_rejected,
            None => false,
        };
        if !allowed {
            return false;
        }

        match &self.status {
            None => true,
            Some(wanted) => entry
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(wanted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_kind_serde() {
        assert_eq!(serde_json::to_string(&EntryKind::Reject).unwrap(), r#""reject""#);
        let kind: EntryKind = serde_json::from_str(r#""uncertain""#).unwrap();
        assert_eq!(kind, EntryKind::Uncertain);
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let raw = json!({
            "case_id": "10000",
            "entry_type": "case",
            "status": "pending",
            "device": "pixel-7",
            "selected_prediction_index": 2
        });
        let entry: LedgerEntry = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(entry.extra["device"], "pixel-7");

        let back = serde_json::to_value(&entry).unwrap();
        assert_eq!(back["device"], raw["device"]);
        assert_eq!(back["selected_prediction_index"], raw["selected_prediction_index"]);
    }

    #[test]
    fn test_kind_detection() {
        let image: LedgerEntry =
            serde_json::from_value(json!({"case_id": "1", "image_id": "abc"})).unwrap();
        assert!(image.is_image());
        assert!(!image.is_summary());

        let summary: LedgerEntry =
            serde_json::from_value(json!({"case_id": "1", "entry_type": "reject"})).unwrap();
        assert!(summary.is_summary());
        assert!(!summary.is_image());
    }

    #[test]
    fn test_filter_status_is_case_insensitive() {
        let entry: LedgerEntry = serde_json::from_value(
            json!({"case_id": "1", "entry_type": "case", "status": "Pending"}),
        )
        .unwrap();
        let filter = CaseFilter {
            status: Some("pending".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&entry));
    }

    #[test]
    fn test_filter_excludes_kinds() {
        let reject: LedgerEntry =
            serde_json::from_value(json!({"case_id": "1", "entry_type": "reject"})).unwrap();
        let filter = CaseFilter {
            include_rejected: false,
            ..Default::default()
        };
        assert!(!filter.matches(&reject));
    }
}
