//! Label Pool
//! Mission: Latest-wins corrected labels with per-image retrain history

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::fsio;

/// One corrected-label record, keyed by case id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRecord {
    pub case_id: String,
    pub image_paths: Vec<String>,
    pub correct_label: String,
    pub user_id: String,
    pub created_at: String,
    pub updated_at: String,
    /// Model versions that have trained on this record. Deduplicated,
    /// append-only.
    #[serde(default)]
    pub used_in_models: Vec<String>,
    /// Per-image retrain rounds: image path to the versions it fed.
    #[serde(default)]
    pub image_retrain_history: BTreeMap<String, Vec<String>>,
}

impl LabelRecord {
    /// Every image path must have a history slot, even before first use.
    fn normalize_history(&mut self) {
        for path in &self.image_paths {
            self.image_retrain_history.entry(path.clone()).or_default();
        }
    }
}

/// One flattened training sample derived from a label record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingLabel {
    pub image_path: String,
    pub label: String,
    pub case_id: String,
}

/// JSONL-backed pool of corrected labels. New records append; updates and
/// used-marking rewrite the whole file atomically.
pub struct LabelPool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LabelPool {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load_all(&self) -> Vec<LabelRecord> {
        let Ok(lines) = fsio::read_lines(&self.path) else {
            return Vec::new();
        };
        lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    fn save_all(&self, records: &[LabelRecord]) -> Result<()> {
        let mut contents = String::new();
        for record in records {
            contents.push_str(&serde_json::to_string(record).context("serialize label record")?);
            contents.push('\n');
        }
        fsio::atomic_write(&self.path, contents.as_bytes())
    }

    /// Add or update a label, latest-wins per case id.
    ///
    /// A re-submit overwrites everything except `created_at` and the used
    /// tracking, which are carried over from the previous record.
    pub fn add_label(
        &self,
        case_id: &str,
        image_paths: Vec<String>,
        correct_label: &str,
        user_id: &str,
    ) -> Result<LabelRecord> {
        let _guard = self.lock.lock();
        let now = Utc::now().to_rfc3339();
        let mut records = self.load_all();

        let existing_idx = records.iter().position(|r| r.case_id == case_id);

        let mut record = LabelRecord {
            case_id: case_id.to_string(),
            image_paths,
            correct_label: correct_label.to_string(),
            user_id: user_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
            used_in_models: Vec::new(),
            image_retrain_history: BTreeMap::new(),
        };

        match existing_idx {
            Some(idx) => {
                record.created_at = records[idx].created_at.clone();
                record.used_in_models = records[idx].used_in_models.clone();
                record.image_retrain_history = records[idx].image_retrain_history.clone();
                record.normalize_history();
                records[idx] = record.clone();
                self.save_all(&records)?;
            }
            None => {
                record.normalize_history();
                fsio::append_line(
                    &self.path,
                    &serde_json::to_string(&record).context("serialize label record")?,
                )?;
            }
        }

        Ok(record)
    }

    pub fn get_all(&self) -> Vec<LabelRecord> {
        self.load_all()
    }

    /// Records not yet consumed by any training run.
    pub fn get_unused(&self) -> Vec<LabelRecord> {
        self.load_all()
            .into_iter()
            .filter(|r| r.used_in_models.is_empty())
            .collect()
    }

    pub fn get_by_case(&self, case_id: &str) -> Option<LabelRecord> {
        self.load_all().into_iter().find(|r| r.case_id == case_id)
    }

    /// Records created or updated strictly after the timestamp.
    pub fn get_labels_since(&self, timestamp: &str) -> Vec<LabelRecord> {
        self.load_all()
            .into_iter()
            .filter(|r| r.updated_at.as_str() > timestamp)
            .collect()
    }

    pub fn label_count(&self) -> usize {
        self.load_all().len()
    }

    pub fn unused_label_count(&self) -> usize {
        self.get_unused().len()
    }

    /// Mark records as consumed by a training run: append `version_id` to the
    /// record's `used_in_models` and to every image's history, deduplicated.
    /// `case_ids = None` marks every record. Returns how many records gained
    /// the version.
    pub fn mark_used(&self, version_id: &str, case_ids: Option<&[String]>) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut records = self.load_all();
        let mut marked = 0;

        for record in &mut records {
            let selected = match case_ids {
                Some(ids) => ids.iter().any(|id| id == &record.case_id),
                None => true,
            };
            if !selected {
                continue;
            }

            if !record.used_in_models.iter().any(|v| v == version_id) {
                record.used_in_models.push(version_id.to_string());
                marked += 1;
            }

            record.normalize_history();
            for path in record.image_paths.clone() {
                let history = record.image_retrain_history.entry(path).or_default();
                if !history.iter().any(|v| v == version_id) {
                    history.push(version_id.to_string());
                }
            }
        }

        self.save_all(&records)?;
        Ok(marked)
    }

    pub fn delete(&self, case_id: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let records = self.load_all();
        let original = records.len();
        let kept: Vec<LabelRecord> = records
            .into_iter()
            .filter(|r| r.case_id != case_id)
            .collect();

        if kept.len() < original {
            self.save_all(&kept)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flat training view: one sample per image per record, in record
    /// insertion order.
    pub fn get_labels_for_training(&self) -> Vec<TrainingLabel> {
        let mut samples = Vec::new();
        for record in self.load_all() {
            for path in &record.image_paths {
                samples.push(TrainingLabel {
                    image_path: path.clone(),
                    label: record.correct_label.clone(),
                    case_id: record.case_id.clone(),
                });
            }
        }
        samples
    }
}
