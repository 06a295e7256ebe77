//! Training Configuration
//! Mission: Validated hyperparameter bundle with admin-managed overrides

use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fsio;

/// Supported optimizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Optimizer {
    Adam,
    SGD,
    AdamW,
    RMSprop,
}

pub const ALLOWED_OPTIMIZERS: [&str; 4] = ["Adam", "SGD", "AdamW", "RMSprop"];

/// Validated hyperparameter bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    pub optimizer: Optimizer,
    pub dropout: f64,
    pub augmentation_applied: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 16,
            learning_rate: 1e-4,
            optimizer: Optimizer::Adam,
            dropout: 0.3,
            augmentation_applied: true,
        }
    }
}

impl TrainingConfig {
    pub fn default_json() -> Value {
        serde_json::to_value(Self::default()).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Persistent training configuration. `load` merges the stored bundle over
/// defaults so new fields always have a value; `save` merges a validated
/// patch into defaults and writes the whole document.
pub struct TrainingConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TrainingConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn merged_with_defaults(patch: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = match TrainingConfig::default_json() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Active configuration; a missing or unreadable file yields defaults.
    pub fn load(&self) -> TrainingConfig {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return TrainingConfig::default();
        };
        let Ok(Value::Object(stored)) = serde_json::from_str::<Value>(&raw) else {
            return TrainingConfig::default();
        };
        let merged = Self::merged_with_defaults(&stored);
        serde_json::from_value(Value::Object(merged)).unwrap_or_default()
    }

    /// Merge a patch into defaults and persist the full bundle. Callers must
    /// validate first; an invalid patch here is a programming error surfaced
    /// as a deserialization failure.
    pub fn save(&self, patch: &Map<String, Value>) -> Result<TrainingConfig> {
        let _guard = self.lock.lock();
        let merged = Self::merged_with_defaults(patch);
        let raw =
            serde_json::to_string_pretty(&Value::Object(merged.clone())).context("serialize training config")?;
        fsio::atomic_write(&self.path, raw.as_bytes())?;
        serde_json::from_value(Value::Object(merged)).context("merged training config is invalid")
    }

    /// Validate a partial configuration. Returns one human-readable error
    /// per violation; an empty list gates `save` at the API boundary.
    pub fn validate(patch: &Map<String, Value>) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(value) = patch.get("epochs") {
            check_int_range("epochs", value, 1, 100, &mut errors);
        }
        if let Some(value) = patch.get("batch_size") {
            check_int_range("batch_size", value, 1, 128, &mut errors);
        }
        if let Some(value) = patch.get("learning_rate") {
            check_float_range("learning_rate", value, 1e-6, 1.0, &mut errors);
        }
        if let Some(value) = patch.get("dropout") {
            check_float_range("dropout", value, 0.0, 0.9, &mut errors);
        }
        if let Some(value) = patch.get("optimizer") {
            match value.as_str() {
                Some(name) if ALLOWED_OPTIMIZERS.contains(&name) => {}
                Some(name) => errors.push(format!(
                    "optimizer: value '{name}' not in allowed values {ALLOWED_OPTIMIZERS:?}"
                )),
                None => errors.push("optimizer: expected string".to_string()),
            }
        }
        if let Some(value) = patch.get("augmentation_applied") {
            if !value.is_boolean() {
                errors.push("augmentation_applied: expected bool".to_string());
            }
        }

        errors
    }
}

fn check_int_range(key: &str, value: &Value, min: i64, max: i64, errors: &mut Vec<String>) {
    match value.as_i64() {
        Some(n) if value.is_i64() || value.is_u64() => {
            if n < min {
                errors.push(format!("{key}: value {n} is below minimum {min}"));
            } else if n > max {
                errors.push(format!("{key}: value {n} is above maximum {max}"));
            }
        }
        _ => errors.push(format!("{key}: expected int")),
    }
}

fn check_float_range(key: &str, value: &Value, min: f64, max: f64, errors: &mut Vec<String>) {
    // Integers widen to float.
    match value.as_f64() {
        Some(x) => {
            if x < min {
                errors.push(format!("{key}: value {x} is below minimum {min}"));
            } else if x > max {
                errors.push(format!("{key}: value {x} is above maximum {max}"));
            }
        }
        None => errors.push(format!("{key}: expected float")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (TrainingConfigStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (
            TrainingConfigStore::new(dir.path().join("active_config.json")),
            dir,
        )
    }

    fn patch(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("patch must be an object"),
        }
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let (store, _dir) = test_store();
        assert_eq!(store.load(), TrainingConfig::default());
    }

    #[test]
    fn test_save_merges_patch_over_defaults() {
        let (store, _dir) = test_store();
        let saved = store
            .save(&patch(json!({"epochs": 20, "batch_size": 32})))
            .unwrap();
        assert_eq!(saved.epochs, 20);
        assert_eq!(saved.batch_size, 32);
        // Untouched fields keep their defaults.
        assert_eq!(saved.learning_rate, 1e-4);
        assert_eq!(saved.optimizer, Optimizer::Adam);

        let reloaded = store.load();
        assert_eq!(reloaded, saved);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let (store, dir) = test_store();
        std::fs::write(dir.path().join("active_config.json"), "{broken").unwrap();
        assert_eq!(store.load(), TrainingConfig::default());
    }

    #[test]
    fn test_validate_accepts_valid_patch() {
        let errors = TrainingConfigStore::validate(&patch(json!({
            "epochs": 10,
            "batch_size": 16,
            "learning_rate": 0.001,
            "optimizer": "AdamW",
            "dropout": 0.5,
            "augmentation_applied": false
        })));
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_validate_collects_all_violations() {
        let errors = TrainingConfigStore::validate(&patch(json!({
            "epochs": 500,
            "learning_rate": 10.0,
            "optimizer": "Adagrad"
        })));
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.starts_with("epochs:")));
        assert!(errors.iter().any(|e| e.starts_with("learning_rate:")));
        assert!(errors.iter().any(|e| e.starts_with("optimizer:")));
    }

    #[test]
    fn test_validate_widens_int_to_float() {
        let errors = TrainingConfigStore::validate(&patch(json!({"learning_rate": 1})));
        assert!(errors.is_empty());

        let errors = TrainingConfigStore::validate(&patch(json!({"dropout": 1})));
        assert_eq!(errors.len(), 1); // 1.0 is above the 0.9 maximum
    }

    #[test]
    fn test_validate_type_errors() {
        let errors = TrainingConfigStore::validate(&patch(json!({
            "epochs": "ten",
            "augmentation_applied": "yes"
        })));
        assert_eq!(errors.len(), 2);
    }
}
