//! Authentication Middleware
//! Mission: Enforce the API key and resolve caller identity on every request

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::auth::api::AuthState;
use crate::auth::models::{normalize_user_id, UserContext, UserRole};

/// Middleware protecting the API surface. Verifies the shared `X-API-Key`,
/// then resolves the caller from a Bearer token or, failing that, from the
/// legacy `X-User-Id` / `X-User-Role` headers. The resolved `UserContext`
/// rides in the request extensions for handlers.
pub async fn user_context_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if !state.api_key.is_empty() {
        let provided = req
            .headers()
            .get("X-API-Key")
            .and_then(|h| h.to_str().ok());
        if provided != Some(state.api_key.as_str()) {
            return Err(AuthError::InvalidApiKey);
        }
    }

    let bearer = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")));

    let context = if let Some(token) = bearer {
        let claims = state
            .jwt_handler
            .validate_token(token)
            .map_err(|_| AuthError::InvalidToken)?;
        UserContext {
            user_id: claims.sub,
            role: Some(claims.role),
            first_name: claims.first_name,
            last_name: claims.last_name,
        }
    } else {
        // Legacy identity headers, kept for older field clients.
        let user_id = req
            .headers()
            .get("X-User-Id")
            .and_then(|h| h.to_str().ok())
            .and_then(normalize_user_id)
            .ok_or(AuthError::MissingIdentity)?;
        let role = req
            .headers()
            .get("X-User-Role")
            .and_then(|h| h.to_str().ok())
            .and_then(UserRole::from_str);
        UserContext {
            user_id,
            role,
            first_name: String::new(),
            last_name: String::new(),
        }
    };

    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

/// Extract the caller context inserted by the middleware.
pub fn extract_context(req: &Request) -> Option<&UserContext> {
    req.extensions().get::<UserContext>()
}

/// Authentication errors surfaced before a handler runs.
#[derive(Debug)]
pub enum AuthError {
    InvalidApiKey,
    MissingIdentity,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            AuthError::InvalidApiKey => {
                (StatusCode::UNAUTHORIZED, "unauthorized", "Invalid API key")
            }
            AuthError::MissingIdentity => (
                StatusCode::BAD_REQUEST,
                "bad_input",
                "Missing Authorization header or X-User-Id header",
            ),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or expired token",
            ),
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}
