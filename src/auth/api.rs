//! Authentication API
//! Mission: Login endpoint issuing JWT access tokens

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::{info, warn};

use crate::auth::jwt::JwtHandler;
use crate::auth::models::{LoginRequest, TokenResponse, UserInfo};
use crate::auth::user_store::UserStore;

/// Shared auth state.
#[derive(Clone)]
pub struct AuthState {
    pub user_store: Arc<UserStore>,
    pub jwt_handler: Arc<JwtHandler>,
    pub api_key: String,
}

impl AuthState {
    pub fn new(user_store: Arc<UserStore>, jwt_handler: Arc<JwtHandler>, api_key: String) -> Self {
        Self {
            user_store,
            jwt_handler,
            api_key,
        }
    }
}

/// Login endpoint - POST /auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, LoginError> {
    info!("🔐 Login attempt: {}", payload.username);

    let user = state
        .user_store
        .authenticate(&payload.username, &payload.password)
        .map_err(|_| LoginError::Internal)?
        .ok_or_else(|| {
            warn!("❌ Failed login attempt: {}", payload.username);
            LoginError::InvalidCredentials
        })?;

    let access_token = state
        .jwt_handler
        .generate_token(&user)
        .map_err(|_| LoginError::Internal)?;

    info!("✅ Login successful: {} ({})", user.username, user.role.as_str());

    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
        user: UserInfo::from_user(&user),
    }))
}

/// Login failures.
#[derive(Debug)]
pub enum LoginError {
    InvalidCredentials,
    Internal,
}

impl IntoResponse for LoginError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind, message) = match self {
            LoginError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid username or password",
            ),
            LoginError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Internal server error",
            ),
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_error_responses() {
        let invalid = LoginError::InvalidCredentials.into_response();
        assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);

        let internal = LoginError::Internal.into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
