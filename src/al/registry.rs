//! Model Registry
//! Mission: Version catalog, production pointer, and the promotion protocol

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::Settings;
use crate::fsio;

/// Lifecycle state of a registered model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Training,
    Evaluating,
    Production,
    Archived,
    Failed,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Training => "training",
            ModelStatus::Evaluating => "evaluating",
            ModelStatus::Production => "production",
            ModelStatus::Archived => "archived",
            ModelStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "training" => Some(ModelStatus::Training),
            "evaluating" => Some(ModelStatus::Evaluating),
            "production" => Some(ModelStatus::Production),
            "archived" => Some(ModelStatus::Archived),
            "failed" => Some(ModelStatus::Failed),
            _ => None,
        }
    }
}

/// One registered model version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub status: ModelStatus,
    pub created_at: String,
    /// Prior version this one was warm-started from; `None` for base runs.
    #[serde(default)]
    pub base_model: Option<String>,
    pub training_config: Value,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    pub path: PathBuf,
    /// Mirror copy under the production directory, when promoted.
    #[serde(default)]
    pub production_path: Option<PathBuf>,
}

/// A model entry together with its version id, for callers and responses.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub version_id: String,
    #[serde(flatten)]
    pub entry: ModelEntry,
}

/// Operator pin for inference, possibly different from production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveInference {
    pub version_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    models: BTreeMap<String, ModelEntry>,
    #[serde(default)]
    current_production: Option<String>,
    #[serde(default)]
    pending_promotion: Option<Value>,
    #[serde(default)]
    active_inference: Option<ActiveInference>,
}

/// Single-document model registry. Every mutation is load-mutate-rewrite
/// under one lock; promotion holds the lock across its file moves so readers
/// never observe a half-promoted state.
pub struct ModelRegistry {
    settings: Arc<Settings>,
    lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> RegistryDoc {
        let path = self.settings.registry_file();
        let Ok(raw) = fs::read_to_string(&path) else {
            return RegistryDoc::default();
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("model registry at {} is unreadable: {err}", path.display());
                RegistryDoc::default()
            }
        }
    }

    fn save(&self, doc: &RegistryDoc) -> Result<()> {
        let raw = serde_json::to_string_pretty(doc).context("serialize model registry")?;
        fsio::atomic_write(&self.settings.registry_file(), raw.as_bytes())
    }

    /// Next version id: `v<YYYYMMDD>_<NNN>`, NNN one past today's maximum.
    pub fn generate_version_id(&self) -> String {
        let _guard = self.lock.lock();
        let doc = self.load();
        let today = Utc::now().format("%Y%m%d").to_string();
        Self::next_version_for_day(&doc, &today)
    }

    fn next_version_for_day(doc: &RegistryDoc, day: &str) -> String {
        let prefix = format!("v{day}_");
        let max_seq = doc
            .models
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|seq| seq.parse::<u32>().ok())
            .max();
        match max_seq {
            Some(seq) => format!("{prefix}{:03}", seq + 1),
            None => format!("{prefix}001"),
        }
    }

    pub fn register_model(
        &self,
        version_id: &str,
        base_model: Option<&str>,
        training_config: Value,
        path: PathBuf,
        status: ModelStatus,
    ) -> Result<ModelEntry> {
        let _guard = self.lock.lock();
        let mut doc = self.load();

        let entry = ModelEntry {
            status,
            created_at: Utc::now().to_rfc3339(),
            base_model: base_model.map(str::to_string),
            training_config,
            architecture: None,
            metrics: Map::new(),
            path,
            production_path: None,
        };
        doc.models.insert(version_id.to_string(), entry.clone());
        self.save(&doc)?;
        Ok(entry)
    }

    pub fn update_status(&self, version_id: &str, status: ModelStatus) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        let Some(entry) = doc.models.get_mut(version_id) else {
            return Ok(false);
        };
        entry.status = status;
        self.save(&doc)?;
        Ok(true)
    }

    pub fn update_metrics(&self, version_id: &str, metrics: Map<String, Value>) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        let Some(entry) = doc.models.get_mut(version_id) else {
            return Ok(false);
        };
        entry.metrics = metrics;
        self.save(&doc)?;
        Ok(true)
    }

    /// Single write for the retrainer's completion step: final path, metrics,
    /// architecture, and status together.
    pub fn finish_training(
        &self,
        version_id: &str,
        path: PathBuf,
        metrics: Map<String, Value>,
        architecture: &str,
        status: ModelStatus,
    ) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        let Some(entry) = doc.models.get_mut(version_id) else {
            return Ok(false);
        };
        entry.path = path;
        entry.metrics = metrics;
        entry.architecture = Some(architecture.to_string());
        entry.status = status;
        self.save(&doc)?;
        Ok(true)
    }

    pub fn get_model(&self, version_id: &str) -> Option<ModelInfo> {
        let doc = self.load();
        doc.models.get(version_id).map(|entry| ModelInfo {
            version_id: version_id.to_string(),
            entry: entry.clone(),
        })
    }

    pub fn get_production_model(&self) -> Option<ModelInfo> {
        let doc = self.load();
        let version_id = doc.current_production?;
        doc.models.get(&version_id).map(|entry| ModelInfo {
            version_id: version_id.clone(),
            entry: entry.clone(),
        })
    }

    pub fn current_production(&self) -> Option<String> {
        self.load().current_production
    }

    /// Models, newest first, optionally filtered by status.
    pub fn list_models(&self, status: Option<ModelStatus>) -> Vec<ModelInfo> {
        let doc = self.load();
        let mut models: Vec<ModelInfo> = doc
            .models
            .into_iter()
            .filter(|(_, entry)| status.map_or(true, |s| entry.status == s))
            .map(|(version_id, entry)| ModelInfo { version_id, entry })
            .collect();
        models.sort_by(|a, b| b.entry.created_at.cmp(&a.entry.created_at));
        models
    }

    /// Promote a version to production.
    ///
    /// Archives the previous production entry, moving its file into
    /// `archive/<version>/`, then marks the target as production and mirrors
    /// its file to `production/model.pt` (the candidate copy stays in place
    /// for provenance). Atomic with respect to readers: the registry rewrite
    /// is a single replacement performed under the lock.
    pub fn promote(&self, version_id: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut doc = self.load();

        if !doc.models.contains_key(version_id) {
            return Ok(false);
        }

        // Archive the outgoing production model.
        if let Some(old_id) = doc.current_production.clone() {
            if old_id != version_id {
                if let Some(old) = doc.models.get_mut(&old_id) {
                    old.status = ModelStatus::Archived;
                    if old.path.exists() {
                        let basename = old
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| "model.pt".to_string());
                        let archive_path = self
                            .settings
                            .al_archive_dir()
                            .join(&old_id)
                            .join(basename);
                        move_file(&old.path, &archive_path)?;
                        old.path = archive_path;
                    }
                }
            }
        }

        let production_dir = self.settings.al_production_dir();
        {
            let entry = doc
                .models
                .get_mut(version_id)
                .context("promotion target vanished under lock")?;
            entry.status = ModelStatus::Production;

            if entry.path.exists() && !entry.path.starts_with(&production_dir) {
                let prod_path = production_dir.join("model.pt");
                fs::create_dir_all(&production_dir)
                    .with_context(|| format!("create {}", production_dir.display()))?;
                fs::copy(&entry.path, &prod_path).with_context(|| {
                    format!("copy {} to {}", entry.path.display(), prod_path.display())
                })?;
                entry.production_path = Some(prod_path);
            }
        }
        doc.current_production = Some(version_id.to_string());

        self.save(&doc)?;
        info!("📦 Model {version_id} promoted to production");
        Ok(true)
    }

    /// Roll back to an earlier version. Only archived or production targets
    /// are valid; the transition itself reuses the promotion protocol.
    pub fn rollback_to(&self, version_id: &str) -> Result<bool> {
        {
            let doc = self.load();
            let Some(entry) = doc.models.get(version_id) else {
                return Ok(false);
            };
            if !matches!(entry.status, ModelStatus::Archived | ModelStatus::Production) {
                return Ok(false);
            }
        }
        self.promote(version_id)
    }

    /// Delete a version and its weights file. The current production model
    /// cannot be deleted.
    pub fn delete(&self, version_id: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut doc = self.load();

        if !doc.models.contains_key(version_id) {
            return Ok(false);
        }
        if doc.current_production.as_deref() == Some(version_id) {
            return Ok(false);
        }

        if let Some(entry) = doc.models.remove(version_id) {
            if entry.path.exists() {
                fs::remove_file(&entry.path)
                    .with_context(|| format!("remove {}", entry.path.display()))?;
            }
        }
        self.save(&doc)?;
        Ok(true)
    }

    pub fn get_active_inference(&self) -> Option<ActiveInference> {
        self.load().active_inference
    }

    pub fn set_active_inference(&self, version_id: &str, path: PathBuf) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        if !doc.models.contains_key(version_id) {
            return Ok(false);
        }
        doc.active_inference = Some(ActiveInference {
            version_id: version_id.to_string(),
            path,
        });
        self.save(&doc)?;
        Ok(true)
    }
}

/// Move a file, creating the destination directory. Falls back to
/// copy-then-remove when rename crosses filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)
            .with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
        fs::remove_file(from).with_context(|| format!("remove {}", from.display()))?;
    }
    Ok(())
}
