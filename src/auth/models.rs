//! Authentication Models
//! Mission: Users, roles, and token payloads for the triage platform

use serde::{Deserialize, Serialize};

/// Clinical roles for RBAC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserRole {
    #[serde(rename = "gp")]
    Gp, // Field practitioner: own cases only, no labeling
    #[serde(rename = "doctor")]
    Doctor, // Reviewing doctor: all cases, labels and annotations
    #[serde(rename = "admin")]
    Admin, // Full access including /admin endpoints
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Gp => "gp",
            UserRole::Doctor => "doctor",
            UserRole::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "gp" => Some(UserRole::Gp),
            "doctor" => Some(UserRole::Doctor),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

/// User account. The username doubles as the storage user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // bcrypt hash - never serialize
    pub role: UserRole,
    pub first_name: String,
    pub last_name: String,
    pub created_at: String,
}

/// JWT claims payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject (user_id)
    pub role: UserRole,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub exp: usize, // expiration timestamp
    pub iat: usize, // issued-at timestamp
}

/// Caller identity resolved by the middleware, from JWT claims or the
/// legacy identity headers.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub role: Option<UserRole>,
    pub first_name: String,
    pub last_name: String,
}

impl UserContext {
    pub fn role_str(&self) -> &str {
        self.role.map(|r| r.as_str()).unwrap_or("")
    }

    pub fn is_admin(&self) -> bool {
        self.role == Some(UserRole::Admin)
    }

    pub fn is_gp(&self) -> bool {
        self.role == Some(UserRole::Gp)
    }

    /// Whether this caller may read every user's cases.
    pub fn has_global_access(&self) -> bool {
        self.is_admin()
    }

    /// Whether this caller sees all cases when selecting AL candidates.
    pub fn can_review_all_cases(&self) -> bool {
        matches!(self.role, Some(UserRole::Doctor) | Some(UserRole::Admin))
    }
}

/// Login request body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Sanitized user info returned after login.
#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
}

impl UserInfo {
    pub fn from_user(user: &User) -> Self {
        Self {
            user_id: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role,
        }
    }
}

/// Login response.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str, // always "bearer"
    pub user: UserInfo,
}

/// Strip a caller-supplied user id down to filesystem-safe characters.
pub fn normalize_user_id(user_id: &str) -> Option<String> {
    let cleaned: String = user_id
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&UserRole::Gp).unwrap(), r#""gp""#);
        let role: UserRole = serde_json::from_str(r#""doctor""#).unwrap();
        assert_eq!(role, UserRole::Doctor);
    }

    #[test]
    fn test_role_string_conversion() {
        assert_eq!(UserRole::from_str("ADMIN"), Some(UserRole::Admin));
        assert_eq!(UserRole::from_str("nurse"), None);
    }

    #[test]
    fn test_context_capabilities() {
        let gp = UserContext {
            user_id: "gp01".into(),
            role: Some(UserRole::Gp),
            first_name: String::new(),
            last_name: String::new(),
        };
        assert!(gp.is_gp());
        assert!(!gp.has_global_access());
        assert!(!gp.can_review_all_cases());

        let doctor = UserContext {
            role: Some(UserRole::Doctor),
            ..gp.clone()
        };
        assert!(doctor.can_review_all_cases());
        assert!(!doctor.has_global_access());

        let admin = UserContext {
            role: Some(UserRole::Admin),
            ..gp
        };
        assert!(admin.has_global_access());
        assert!(admin.can_review_all_cases());
    }

    #[test]
    fn test_normalize_user_id() {
        assert_eq!(normalize_user_id("  user-01 "), Some("user-01".to_string()));
        assert_eq!(
            normalize_user_id("../etc/passwd"),
            Some("etcpasswd".to_string())
        );
        assert_eq!(normalize_user_id("   "), None);
    }
}
