//! Event Log
//! Mission: Append-only audit stream for every AL lifecycle transition

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::fsio;

/// Closed set of auditable event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RetrainTriggered,
    TrainingStarted,
    TrainingCompleted,
    TrainingFailed,
    ModelPromoted,
    ModelRollback,
    ConfigUpdated,
    LabelAdded,
    ThresholdReached,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RetrainTriggered => "retrain_triggered",
            EventType::TrainingStarted => "training_started",
            EventType::TrainingCompleted => "training_completed",
            EventType::TrainingFailed => "training_failed",
            EventType::ModelPromoted => "model_promoted",
            EventType::ModelRollback => "model_rollback",
            EventType::ConfigUpdated => "config_updated",
            EventType::LabelAdded => "label_added",
            EventType::ThresholdReached => "threshold_reached",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "retrain_triggered" => Some(EventType::RetrainTriggered),
            "training_started" => Some(EventType::TrainingStarted),
            "training_completed" => Some(EventType::TrainingCompleted),
            "training_failed" => Some(EventType::TrainingFailed),
            "model_promoted" => Some(EventType::ModelPromoted),
            "model_rollback" => Some(EventType::ModelRollback),
            "config_updated" => Some(EventType::ConfigUpdated),
            "label_added" => Some(EventType::LabelAdded),
            "threshold_reached" => Some(EventType::ThresholdReached),
            _ => None,
        }
    }
}

/// One audit record. Metadata is a free-form map fixed by the typed helpers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Append-only event log. Writes are append-and-flush; reads reverse in
/// memory so the newest event comes first.
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn log(
        &self,
        event_type: EventType,
        message: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<Event> {
        let event = Event {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            message: message.into(),
            metadata,
        };
        let line = serde_json::to_string(&event).context("serialize event")?;

        let _guard = self.write_lock.lock();
        fsio::append_line(&self.path, &line)?;
        Ok(event)
    }

    fn read_all(&self) -> Vec<Event> {
        let Ok(lines) = fsio::read_lines(&self.path) else {
            return Vec::new();
        };
        lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let mut events = self.read_all();
        events.reverse();
        events.truncate(limit);
        events
    }

    /// Events of one type, newest first.
    pub fn by_type(&self, event_type: EventType, limit: usize) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .read_all()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect();
        events.reverse();
        events.truncate(limit);
        events
    }

    /// Events strictly newer than a timestamp, newest first.
    pub fn since(&self, timestamp: &str, limit: usize) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .read_all()
            .into_iter()
            .filter(|e| e.timestamp.as_str() > timestamp)
            .collect();
        events.reverse();
        events.truncate(limit);
        events
    }

    // Typed helpers fix the type and pre-format the operator-facing message.

    pub fn log_retrain_triggered(&self, samples_count: usize, threshold: usize) -> Result<Event> {
        self.log(
            EventType::RetrainTriggered,
            format!("Retrain triggered: {samples_count} samples (threshold: {threshold})"),
            obj(json!({ "samples_count": samples_count, "threshold": threshold })),
        )
    }

    pub fn log_training_started(&self, version_id: &str, config: &Value) -> Result<Event> {
        self.log(
            EventType::TrainingStarted,
            format!("Training started for model {version_id}"),
            obj(json!({ "version_id": version_id, "config": config })),
        )
    }

    pub fn log_training_completed(
        &self,
        version_id: &str,
        accuracy: f64,
        samples_used: usize,
    ) -> Result<Event> {
        self.log(
            EventType::TrainingCompleted,
            format!(
                "Training completed: {version_id} (accuracy: {:.1}%, samples: {samples_used})",
                accuracy * 100.0
            ),
            obj(json!({
                "version_id": version_id,
                "accuracy": accuracy,
                "samples_used": samples_used
            })),
        )
    }

    pub fn log_training_failed(&self, version_id: &str, error: &str) -> Result<Event> {
        self.log(
            EventType::TrainingFailed,
            format!("Training failed for {version_id}: {error}"),
            obj(json!({ "version_id": version_id, "error": error })),
        )
    }

    pub fn log_model_promoted(&self, version_id: &str, accuracy: f64) -> Result<Event> {
        self.log(
            EventType::ModelPromoted,
            format!(
                "Model {version_id} promoted to production (accuracy: {:.1}%)",
                accuracy * 100.0
            ),
            obj(json!({ "version_id": version_id, "accuracy": accuracy })),
        )
    }

    pub fn log_model_rollback(
        &self,
        from_version: &str,
        to_version: &str,
        reason: &str,
    ) -> Result<Event> {
        self.log(
            EventType::ModelRollback,
            format!("Rollback from {from_version} to {to_version}: {reason}"),
            obj(json!({
                "from_version": from_version,
                "to_version": to_version,
                "reason": reason
            })),
        )
    }

    pub fn log_config_updated(&self, changes: &Value) -> Result<Event> {
        self.log(
            EventType::ConfigUpdated,
            "Training configuration updated",
            obj(json!({ "changes": changes })),
        )
    }

    pub fn log_label_added(&self, case_id: &str, correct_label: &str) -> Result<Event> {
        self.log(
            EventType::LabelAdded,
            format!("Label '{correct_label}' recorded for case {case_id}"),
            obj(json!({ "case_id": case_id, "correct_label": correct_label })),
        )
    }

    pub fn log_threshold_reached(&self, unused: usize, threshold: usize) -> Result<Event> {
        self.log(
            EventType::ThresholdReached,
            format!("Label threshold reached: {unused} unused labels (threshold: {threshold})"),
            obj(json!({ "unused": unused, "threshold": threshold })),
        )
    }
}

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
