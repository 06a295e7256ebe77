//! Active Learning Candidates Endpoint
//! Mission: Turn ledger state into ranked uncertainty-sampling candidates

use std::collections::HashMap;
use std::path::Path;

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::al::sampler::{self, CandidateCase, CandidateImage};
use crate::api::{ApiError, AppState};
use crate::auth::models::UserContext;
use crate::storage::models::EntryKind;
use crate::storage::LedgerEntry;

#[derive(Debug, Default, Deserialize)]
pub struct CandidatesRequest {
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub include_labeled: Option<bool>,
}

/// POST /active-learning/candidates
///
/// Reviewers rank across every user's cases; GPs only across their own.
pub async fn get_candidates(
    State(state): State<AppState>,
    Extension(ctx): Extension<UserContext>,
    Json(payload): Json<CandidatesRequest>,
) -> Result<Json<Value>, ApiError> {
    let entries = if ctx.can_review_all_cases() {
        state.case_store.read_all_entries()
    } else {
        state.case_store.read_user_entries(&ctx.user_id)
    };

    if entries.is_empty() {
        return Ok(Json(json!({
            "candidates": [],
            "total_candidates": 0,
            "message": "No cases available",
        })));
    }

    let include_labeled = payload
        .include_labeled
        .unwrap_or(state.settings.candidates_include_labeled);
    let entry_type_filter = payload
        .entry_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(EntryKind::from_str);
    let status_filter = payload
        .status
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    let image_entries: HashMap<&str, &LedgerEntry> = entries
        .iter()
        .filter_map(|e| e.image_id.as_deref().map(|id| (id, e)))
        .collect();

    let mut cases = Vec::new();
    for entry in &entries {
        if !entry.is_summary() {
            continue;
        }
        if !include_labeled && entry.correct_label.as_deref().is_some_and(|l| !l.is_empty()) {
            continue;
        }
        if let Some(kind) = entry_type_filter {
            if entry.entry_type != Some(kind) {
                continue;
            }
        }
        if let Some(status) = &status_filter {
            let matches = entry
                .status
                .as_deref()
                .is_some_and(|s| s.to_lowercase() == *status);
            if !matches {
                continue;
            }
        }

        let images = entry
            .image_paths
            .iter()
            .map(|path| {
                let image_id = Path::new(path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string());
                let mut image = CandidateImage {
                    path: Some(path.clone()),
                    image_id: image_id.clone(),
                    ..Default::default()
                };
                if let Some(img_entry) =
                    image_id.as_deref().and_then(|id| image_entries.get(id))
                {
                    image.predictions = img_entry.predictions.clone();
                    image.blur_score = img_entry.blur_score;
                    image.status = img_entry.status.clone();
                }
                image
            })
            .collect();

        cases.push(CandidateCase {
            entry: entry.clone(),
            images,
        });
    }

    if cases.is_empty() {
        return Ok(Json(json!({
            "candidates": [],
            "total_candidates": 0,
            "message": "No cases with images available",
        })));
    }

    let top_k = match payload.top_k {
        Some(k) if k > 0 => k as usize,
        Some(_) => cases.len(),
        None => state.settings.candidates_top_k,
    };

    let selection = sampler::get_candidates(cases, top_k);
    Ok(Json(serde_json::to_value(selection).map_err(|e| {
        ApiError::Internal(format!("serialize candidate selection: {e}"))
    })?))
}
