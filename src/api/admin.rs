//! Admin Endpoints
//! Mission: Training config, model lifecycle, retraining, and audit access

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::al::events::EventType;
use crate::al::registry::ModelStatus;
use crate::al::retrain::RetrainOptions;
use crate::al::training_config::{TrainingConfig, TrainingConfigStore};
use crate::al::worker::{RetrainJob, RetrainWorker};
use crate::api::{ApiError, AppState};
use crate::auth::models::UserContext;

/// State for the /admin router: the shared app state plus the single-slot
/// retrain worker handle.
#[derive(Clone)]
pub struct AdminState {
    pub app: AppState,
    pub worker: Arc<RetrainWorker>,
}

fn require_admin(ctx: &UserContext) -> Result<(), ApiError> {
    if ctx.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "Admin role required for this endpoint".to_string(),
        ))
    }
}

/// GET /admin/training-config
pub async fn get_training_config(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    Ok(Json(json!({
        "config": state.app.config_store.load(),
        "defaults": TrainingConfig::default(),
    })))
}

/// POST /admin/training-config
pub async fn set_training_config(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
    Json(patch): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let errors = TrainingConfigStore::validate(&patch);
    if !errors.is_empty() {
        return Err(ApiError::BadInput(errors.join("; ")));
    }

    let config = state.app.config_store.save(&patch)?;
    state
        .app
        .events
        .log_config_updated(&Value::Object(patch))?;
    Ok(Json(json!({ "config": config })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelsQuery {
    pub status: Option<String>,
}

/// GET /admin/models
pub async fn list_models(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let status = match query.status.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => Some(
            ModelStatus::from_str(raw)
                .ok_or_else(|| ApiError::BadInput(format!("Unknown model status '{raw}'")))?,
        ),
        None => None,
    };

    let models = state.app.registry.list_models(status);
    Ok(Json(json!({
        "total": models.len(),
        "models": models,
        "current_production": state.app.registry.current_production(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /admin/models/{version_id}/promote
pub async fn promote_model(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
    Path(version_id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let reason = body.reason.unwrap_or_else(|| "Manual promotion".to_string());
    let outcome = state.app.promoter.manual_promote(&version_id, &reason)?;
    if !outcome.success {
        let message = outcome.error.unwrap_or_else(|| "Promotion failed".to_string());
        return Err(if message.contains("not found") {
            ApiError::NotFound(message)
        } else {
            ApiError::Internal(message)
        });
    }

    Ok(Json(json!({
        "status": "ok",
        "version_id": version_id,
        "previous_production": outcome.previous_production,
    })))
}

/// POST /admin/models/{version_id}/rollback
pub async fn rollback_model(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
    Path(version_id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let reason = body.reason.unwrap_or_else(|| "Manual rollback".to_string());
    let outcome = state.app.promoter.rollback(Some(&version_id), &reason)?;
    if !outcome.success {
        let message = outcome.error.unwrap_or_else(|| "Rollback failed".to_string());
        return Err(if message.contains("not found") {
            ApiError::NotFound(message)
        } else {
            ApiError::BadInput(message)
        });
    }

    Ok(Json(json!({
        "status": "ok",
        "from_version": outcome.from_version,
        "to_version": outcome.to_version,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrainTriggerRequest {
    #[serde(default)]
    pub architecture: Option<String>,
    /// Bypass the unused-label threshold gate. The retrainer's hard minimum
    /// still applies.
    #[serde(default)]
    pub force: bool,
}

/// POST /admin/retrain/trigger
///
/// Enqueues a retraining round on the single-slot worker and returns the
/// pre-allocated version id immediately. Progress is polled via
/// `/admin/retrain/status`; the outcome also lands in the event log.
pub async fn trigger_retrain(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
    Json(body): Json<RetrainTriggerRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    if !state.app.retrainer.trainer_available() {
        return Err(ApiError::Unavailable(
            "No training backend is configured".to_string(),
        ));
    }

    let unused = state.app.label_pool.unused_label_count();
    let threshold = state.app.settings.retrain_min_new_labels;
    if !body.force && unused < threshold {
        return Err(ApiError::BadInput(format!(
            "Retrain threshold not reached: {unused} unused labels, {threshold} required \
             (pass force=true to override)"
        )));
    }

    state.app.events.log_retrain_triggered(unused, threshold)?;

    let version_id = state.app.registry.generate_version_id();
    let job = RetrainJob {
        options: RetrainOptions {
            architecture: body.architecture,
            version_id: Some(version_id.clone()),
            ..Default::default()
        },
        auto_promote: true,
    };
    if !state.worker.try_enqueue(job) {
        return Err(ApiError::Conflict(
            "A retraining job is already running".to_string(),
        ));
    }

    Ok(Json(json!({
        "status": "started",
        "version_id": version_id,
        "unused_labels": unused,
        "threshold": threshold,
    })))
}

/// GET /admin/retrain/status
pub async fn retrain_status(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let worker = state.worker.status();
    let evaluating = state.app.registry.list_models(Some(ModelStatus::Evaluating));
    let training = state.app.registry.list_models(Some(ModelStatus::Training));

    Ok(Json(json!({
        "retrain_status": {
            "worker": worker,
            "labels": {
                "total": state.app.label_pool.label_count(),
                "unused": state.app.label_pool.unused_label_count(),
            },
            "training": training,
            "evaluating": evaluating,
            "current_production": state.app.registry.current_production(),
        },
        "threshold": state.app.settings.retrain_min_new_labels,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub event_type: Option<String>,
}

/// GET /admin/events
pub async fn get_events(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let limit = query.limit.unwrap_or(50);
    let events = match query.event_type.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => {
            let event_type = EventType::from_str(raw)
                .ok_or_else(|| ApiError::BadInput(format!("Unknown event type '{raw}'")))?;
            state.app.events.by_type(event_type, limit)
        }
        None => state.app.events.recent(limit),
    };

    Ok(Json(json!({ "total": events.len(), "events": events })))
}

/// GET /admin/labels/count
pub async fn labels_count(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let total = state.app.label_pool.label_count();
    let unused = state.app.label_pool.unused_label_count();
    let threshold = state.app.settings.retrain_min_new_labels;
    Ok(Json(json!({
        "total": total,
        "unused": unused,
        "threshold": threshold,
        "threshold_reached": unused >= threshold,
    })))
}

/// GET /admin/labels
pub async fn list_labels(
    State(state): State<AdminState>,
    Extension(ctx): Extension<UserContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;

    let labels = state.app.label_pool.get_all();
    let mut per_label: BTreeMap<String, usize> = BTreeMap::new();
    for record in &labels {
        *per_label.entry(record.correct_label.clone()).or_default() += 1;
    }

    Ok(Json(json!({
        "total": labels.len(),
        "per_label": per_label,
        "labels": labels,
    })))
}
