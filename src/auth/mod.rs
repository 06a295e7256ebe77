//! Authentication Module
//! Mission: Secure API access with JWT tokens, RBAC, and the shared API key

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod user_store;

pub use api::AuthState;
pub use jwt::JwtHandler;
pub use middleware::user_context_middleware;
pub use models::{UserContext, UserRole};
pub use user_store::UserStore;
