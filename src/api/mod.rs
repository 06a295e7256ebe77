//! HTTP API Module
//! Mission: Route handlers and the shared application state

pub mod admin;
pub mod candidates;
pub mod cases;
pub mod error;

use std::sync::Arc;

use anyhow::Result;

use crate::al::promote::AutoPromoter;
use crate::al::registry::ModelRegistry;
use crate::al::retrain::Retrainer;
use crate::al::training_config::TrainingConfigStore;
use crate::al::{EventLog, LabelPool};
use crate::config::Settings;
use crate::crypto::Crypto;
use crate::model::{
    BlurScorer, Classifier, EmbeddingExtractor, LaplacianBlurScorer, ModelService, TrainerBackend,
};
use crate::storage::CaseStore;

pub use error::ApiError;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub case_store: Arc<CaseStore>,
    pub label_pool: Arc<LabelPool>,
    pub registry: Arc<ModelRegistry>,
    pub events: Arc<EventLog>,
    pub config_store: Arc<TrainingConfigStore>,
    pub model_service: Arc<ModelService>,
    pub blur_scorer: Arc<dyn BlurScorer>,
    pub crypto: Arc<Crypto>,
    pub retrainer: Arc<Retrainer>,
    pub promoter: Arc<AutoPromoter>,
}

impl AppState {
    /// Wire up every store and component. The classifier, trainer, and
    /// embedder are the external collaborators; any of them may be absent.
    pub fn build(
        settings: Settings,
        classifier: Option<Arc<dyn Classifier>>,
        trainer: Option<Arc<dyn TrainerBackend>>,
        embedder: Option<Arc<dyn EmbeddingExtractor>>,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let crypto = Arc::new(Crypto::new(
            settings.encrypt_storage,
            &settings.data_encryption_key,
        )?);

        let case_store = Arc::new(CaseStore::new(settings.clone(), crypto.clone()));
        let label_pool = Arc::new(LabelPool::new(settings.labels_pool_file()));
        let registry = Arc::new(ModelRegistry::new(settings.clone()));
        let events = Arc::new(EventLog::new(settings.event_log_file()));
        let config_store = Arc::new(TrainingConfigStore::new(settings.active_config_file()));

        let retrainer = Arc::new(Retrainer::new(
            settings.clone(),
            case_store.clone(),
            label_pool.clone(),
            registry.clone(),
            events.clone(),
            config_store.clone(),
            trainer,
            embedder,
        ));
        let promoter = Arc::new(AutoPromoter::new(registry.clone(), events.clone()));

        Ok(Self {
            settings,
            case_store,
            label_pool,
            registry,
            events,
            config_store,
            model_service: Arc::new(ModelService::new(classifier)),
            blur_scorer: Arc::new(LaplacianBlurScorer),
            crypto,
            retrainer,
            promoter,
        })
    }
}
