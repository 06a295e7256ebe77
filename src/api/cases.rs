//! Case Endpoints
//! Mission: Image intake, case lifecycle, and reviewer corrections

use axum::extract::{Multipart, Path, Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::auth::models::{normalize_user_id, UserContext};
use crate::model::Prediction;
use crate::storage::models::{CaseFilter, CasePayload, CaseUpdate};
use crate::storage::{AnnotationResult, EntryKind, LedgerEntry, ReleaseOutcome, SkipReason};

/// POST /cases/next-id
pub async fn next_case_id(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
) -> Result<Json<Value>, ApiError> {
    let case_id = state.case_store.allocate_case_id(&ctx.user_id)?;
    Ok(Json(json!({ "case_id": case_id })))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub case_id: String,
}

/// POST /cases/release-id
pub async fn release_case_id(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Json(payload): Json<ReleaseRequest>,
) -> Result<Json<Value>, ApiError> {
    let case_id = payload.case_id.trim();
    if case_id.is_empty() || !case_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::BadInput("Invalid case_id".to_string()));
    }

    let outcome = state.case_store.release_case_id(&ctx.user_id, case_id)?;
    let body = match outcome {
        ReleaseOutcome::Released { case_id } => json!({ "status": "ok", "case_id": case_id }),
        ReleaseOutcome::Skipped { reason, last_case_id } => {
            let mut body = json!({ "status": "skipped", "reason": &reason });
            if reason == SkipReason::CounterMismatch {
                body["last_case_id"] = json!(last_case_id);
            }
            body
        }
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct CheckImageQuery {
    pub case_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckImageResponse {
    pub status: &'static str,
    pub message: String,
    pub blur_score: f64,
    pub predictions: Vec<Prediction>,
    pub image_id: String,
    pub case_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
}

/// POST /check-image (multipart)
///
/// Quality-gates an uploaded dermatoscopic image, runs the production
/// classifier, stores the image, and appends an image entry to the ledger.
pub async fn check_image(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Query(query): Query<CheckImageQuery>,
    mut multipart: Multipart,
) -> Result<Json<CheckImageResponse>, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut form_case_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadInput("Malformed multipart body".to_string()))?
    {
        match field.name() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::BadInput("Failed to read uploaded file".to_string()))?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("case_id") => {
                if let Ok(text) = field.text().await {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        form_case_id = Some(text);
                    }
                }
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| ApiError::BadInput("Missing file field".to_string()))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|_| ApiError::BadInput("Invalid image file".to_string()))?;

    let blur_score = state.blur_scorer.score(&img);
    let predictions = state.model_service.predict(&img);

    let image_id = Uuid::new_v4().to_string();
    let case_id = match form_case_id.or(query.case_id).filter(|c| !c.trim().is_empty()) {
        Some(case_id) => case_id,
        None => state.case_store.allocate_case_id(&ctx.user_id)?,
    };

    save_image(&state, &img, &image_id, &ctx.user_id)?;

    let (status, message) = if blur_score >= state.settings.blur_threshold {
        ("success", "Image processed".to_string())
    } else {
        (
            "fail",
            format!(
                "Image is too blurry (score={blur_score:.2}, threshold={})",
                state.settings.blur_threshold
            ),
        )
    };

    let entry: LedgerEntry = serde_json::from_value(json!({
        "case_id": &case_id,
        "image_id": &image_id,
        "blur_score": blur_score,
        "predictions": &predictions,
        "status": status,
        "created_at": chrono::Utc::now().to_rfc3339(),
        "user_id": &ctx.user_id,
        "user_role": (!ctx.role_str().is_empty()).then(|| ctx.role_str()),
    }))
    .map_err(|e| ApiError::Internal(format!("build image entry: {e}")))?;
    state.case_store.record_image(&ctx.user_id, &entry)?;

    Ok(Json(CheckImageResponse {
        status,
        message,
        blur_score,
        predictions,
        image_id,
        case_id,
        user_id: ctx.user_id.clone(),
        user_role: (!ctx.role_str().is_empty()).then(|| ctx.role_str().to_string()),
    }))
}

/// Re-encode as JPEG (quality 90) and write it under the user's directory,
/// encrypted as `.bin` with a fresh nonce when encryption is on.
fn save_image(
    state: &AppState,
    img: &image::DynamicImage,
    image_id: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    let mut jpeg = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90);
    // JPEG cannot carry an alpha channel; normalize to RGB first.
    image::DynamicImage::ImageRgb8(img.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|e| ApiError::Internal(format!("encode image: {e}")))?;

    let user_dir = state.settings.user_storage_dir(user_id);
    std::fs::create_dir_all(&user_dir)
        .map_err(|e| ApiError::Internal(format!("create user storage: {e}")))?;

    let dest = user_dir.join(format!("{image_id}.{}", state.crypto.image_extension()));
    let payload = if state.crypto.is_enabled() {
        state.crypto.encrypt_bytes(&jpeg)?
    } else {
        jpeg
    };
    std::fs::write(&dest, payload)
        .map_err(|e| ApiError::Internal(format!("write image: {e}")))?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CasesQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub include_uncertain: Option<bool>,
    pub include_rejected: Option<bool>,
}

/// GET /cases
pub async fn get_cases(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Query(query): Query<CasesQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = CaseFilter {
        status: query.status,
        limit: query.limit.unwrap_or(100),
        include_uncertain: query.include_uncertain.unwrap_or(true),
        include_rejected: query.include_rejected.unwrap_or(true),
    };

    let cases = if ctx.has_global_access() {
        state.case_store.read_cases_global(&filter)
    } else {
        state.case_store.read_cases(&ctx.user_id, &filter)
    };
    Ok(Json(json!({ "cases": cases })))
}

/// POST /cases
pub async fn log_case(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Json(payload): Json<CasePayload>,
) -> Result<Json<Value>, ApiError> {
    let entry = state.case_store.upsert_case_summary(
        &ctx.user_id,
        ctx.role_str(),
        payload.into_entry(),
        EntryKind::Case,
        "pending",
    )?;
    Ok(Json(json!({
        "status": "ok",
        "message": "logged",
        "case_id": entry.case_id,
        "case_status": entry.status,
    })))
}

/// POST /cases/uncertain
pub async fn log_uncertain_case(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Json(payload): Json<CasePayload>,
) -> Result<Json<Value>, ApiError> {
    let entry = state.case_store.upsert_case_summary(
        &ctx.user_id,
        ctx.role_str(),
        payload.into_entry(),
        EntryKind::Uncertain,
        "pending",
    )?;
    Ok(Json(json!({
        "status": "ok",
        "message": "uncertain_logged",
        "case_id": entry.case_id,
        "case_status": entry.status,
    })))
}

/// POST /cases/reject
pub async fn reject_case(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Json(payload): Json<CasePayload>,
) -> Result<Json<Value>, ApiError> {
    state.case_store.upsert_case_summary(
        &ctx.user_id,
        ctx.role_str(),
        payload.into_entry(),
        EntryKind::Reject,
        "rejected",
    )?;
    Ok(Json(json!({ "status": "ok", "message": "rejected_logged" })))
}

/// PUT /cases/{case_id}
pub async fn update_case(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Path(case_id): Path<String>,
    Json(patch): Json<CaseUpdate>,
) -> Result<Json<Value>, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::BadInput("No fields to update".to_string()));
    }
    let target_user = patch.user_id.as_deref().and_then(normalize_user_id);

    let updated = if ctx.has_global_access() {
        match target_user {
            Some(owner) => state.case_store.update_case(&owner, &case_id, &patch)?,
            None => state.case_store.update_case_global(&case_id, &patch)?,
        }
    } else {
        state
            .case_store
            .update_case(&ctx.user_id, &case_id, &patch)?
    };

    if updated.is_none() {
        return Err(ApiError::NotFound("Case not found".to_string()));
    }
    Ok(Json(json!({ "status": "ok", "case_id": case_id })))
}

#[derive(Debug, Deserialize)]
pub struct LabelSubmission {
    pub correct_label: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// POST /cases/{case_id}/label
pub async fn submit_label(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Path(case_id): Path<String>,
    Json(payload): Json<LabelSubmission>,
) -> Result<Json<Value>, ApiError> {
    if ctx.is_gp() {
        return Err(ApiError::Forbidden(
            "GP role is not allowed to label rejected cases".to_string(),
        ));
    }

    let updated = state
        .case_store
        .submit_label(
            &ctx.user_id,
            &case_id,
            &payload.correct_label,
            payload.notes.as_deref(),
            &ctx.user_id,
        )?
        .ok_or_else(|| ApiError::NotFound("Case not found".to_string()))?;

    record_label_in_pool(&state, &updated, &payload.correct_label, &ctx.user_id)?;

    Ok(Json(json!({
        "status": "ok",
        "message": "Label submitted successfully",
        "case_id": case_id,
        "correct_label": payload.correct_label,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AnnotationSubmission {
    pub image_index: i64,
    pub correct_label: String,
    #[serde(default)]
    pub annotations: Option<Value>,
    #[serde(default)]
    pub case_user_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub annotated_at: Option<String>,
}

/// POST /cases/{case_id}/annotations
///
/// Saves reviewer strokes/boxes and the corrected label onto a rejected
/// case. Doctors and admins may annotate across users; an ambiguous case id
/// must be disambiguated with `case_user_id`.
pub async fn save_annotations(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Path(case_id): Path<String>,
    Json(payload): Json<AnnotationSubmission>,
) -> Result<Json<Value>, ApiError> {
    if ctx.is_gp() {
        return Err(ApiError::Forbidden(
            "GP role is not allowed to annotate rejected cases".to_string(),
        ));
    }

    let explicit_owner = payload.case_user_id.as_deref().and_then(normalize_user_id);

    // Own ledger first; cross-user search only for reviewers without an
    // explicit owner.
    let mut result = state.case_store.apply_annotations(
        Some(explicit_owner.as_deref().unwrap_or(&ctx.user_id)),
        &case_id,
        &payload.correct_label,
        payload.annotations.clone(),
        payload.image_index,
        payload.notes.as_deref(),
        payload.annotated_at.as_deref(),
        &ctx.user_id,
    )?;

    if matches!(result, AnnotationResult::NotFound)
        && explicit_owner.is_none()
        && ctx.can_review_all_cases()
    {
        result = state.case_store.apply_annotations(
            None,
            &case_id,
            &payload.correct_label,
            payload.annotations.clone(),
            payload.image_index,
            payload.notes.as_deref(),
            payload.annotated_at.as_deref(),
            &ctx.user_id,
        )?;
    }

    let updated = match result {
        AnnotationResult::Updated(entry) => entry,
        AnnotationResult::NotFound => {
            return Err(ApiError::NotFound("Rejected case not found".to_string()))
        }
        AnnotationResult::Ambiguous => {
            return Err(ApiError::Conflict(
                "Multiple rejected cases found for case_id; provide case_user_id".to_string(),
            ))
        }
    };

    record_label_in_pool(&state, &updated, &payload.correct_label, &ctx.user_id)?;

    Ok(Json(json!({
        "status": "ok",
        "message": "Annotations saved successfully",
        "case_id": case_id,
        "correct_label": payload.correct_label,
    })))
}

/// Feed a corrected case into the label pool and audit the addition. Cases
/// without stored image paths have nothing to train on and are skipped.
fn record_label_in_pool(
    state: &AppState,
    entry: &LedgerEntry,
    correct_label: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    if entry.image_paths.is_empty() {
        return Ok(());
    }
    let Some(case_id) = entry.case_id.as_deref() else {
        return Ok(());
    };

    state
        .label_pool
        .add_label(case_id, entry.image_paths.clone(), correct_label, user_id)?;
    state.events.log_label_added(case_id, correct_label)?;

    let unused = state.label_pool.unused_label_count();
    let threshold = state.settings.retrain_min_new_labels;
    if unused == threshold {
        state.events.log_threshold_reached(unused, threshold)?;
        info!("📊 Label threshold reached ({unused}/{threshold})");
    }
    Ok(())
}
