//! Skin-Lesion Triage Backend
//! Mission: Quality-gate uploads, track case evidence, and close the
//! active-learning loop from reviewer corrections to model promotion

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::{
    middleware as axum_mw,
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dermatriage_backend::al::worker::RetrainWorker;
use dermatriage_backend::api::admin::{self, AdminState};
use dermatriage_backend::api::{candidates, cases};
use dermatriage_backend::auth::{api as auth_api, user_context_middleware, AuthState, JwtHandler, UserStore};
use dermatriage_backend::middleware::logging::request_logging;
use dermatriage_backend::{AppState, Settings};

#[derive(Debug, Parser)]
#[command(name = "dermatriage", about = "Clinical skin-lesion triage backend")]
struct Args {
    /// Bind address
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Bind port
    #[arg(long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Root directory for per-user case storage
    #[arg(long, env = "STORAGE_ROOT")]
    storage_root: Option<String>,

    /// Root directory for the active-learning workspace
    #[arg(long, env = "AL_ROOT")]
    al_root: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut settings = Settings::from_env();
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(root) = args.storage_root {
        settings.storage_root = root.into();
        settings.legacy_metadata_file =
            settings.storage_root.join(&settings.metadata_filename);
        if std::env::var("USERS_DB_PATH").is_err() {
            settings.users_db_path = settings.storage_root.join("users.db");
        }
    }
    if let Some(root) = args.al_root {
        settings.al_root = root.into();
    }

    info!("🩺 Skin-lesion triage backend starting");
    info!("📁 Case storage: {}", settings.storage_root.display());
    info!("🧪 AL workspace: {}", settings.al_root.display());
    if settings.encrypt_storage {
        info!("🔒 Storage encryption ENABLED");
    }

    // Auth stack: SQLite user store + HS256 tokens + shared API key.
    let user_store = Arc::new(UserStore::new(&settings.users_db_path)?);
    let jwt_handler = Arc::new(JwtHandler::new(
        settings.jwt_secret.clone(),
        settings.jwt_expiration_hours,
    ));
    let auth_state = AuthState::new(user_store, jwt_handler, settings.api_key.clone());

    let allowed_origins = settings.allowed_origins.clone();
    let host = settings.host.clone();
    let port = settings.port;

    // Core stores and AL components. The classifier, trainer backend, and
    // embedding extractor are deployment-provided; without them the server
    // runs the quality gate in dummy-prediction mode and reports retraining
    // as unavailable.
    let app_state = AppState::build(settings, None, None, None)?;
    if !app_state.model_service.is_loaded() {
        info!("🤖 No classifier wired in - running in dummy prediction mode");
    }

    let worker = Arc::new(RetrainWorker::spawn(
        app_state.retrainer.clone(),
        app_state.promoter.clone(),
    ));
    let admin_state = AdminState {
        app: app_state.clone(),
        worker,
    };

    let auth_router = Router::new()
        .route("/auth/login", post(auth_api::login))
        .with_state(auth_state.clone());

    let case_routes = Router::new()
        .route("/cases/next-id", post(cases::next_case_id))
        .route("/cases/release-id", post(cases::release_case_id))
        .route("/check-image", post(cases::check_image))
        .route("/cases", get(cases::get_cases).post(cases::log_case))
        .route("/cases/uncertain", post(cases::log_uncertain_case))
        .route("/cases/reject", post(cases::reject_case))
        .route("/cases/:case_id", put(cases::update_case))
        .route("/cases/:case_id/label", post(cases::submit_label))
        .route("/cases/:case_id/annotations", post(cases::save_annotations))
        .route(
            "/active-learning/candidates",
            post(candidates::get_candidates),
        )
        .route_layer(axum_mw::from_fn_with_state(
            auth_state.clone(),
            user_context_middleware,
        ))
        .with_state(app_state.clone());

    let admin_routes = Router::new()
        .route(
            "/admin/training-config",
            get(admin::get_training_config).post(admin::set_training_config),
        )
        .route("/admin/models", get(admin::list_models))
        .route("/admin/models/:version_id/promote", post(admin::promote_model))
        .route(
            "/admin/models/:version_id/rollback",
            post(admin::rollback_model),
        )
        .route("/admin/retrain/trigger", post(admin::trigger_retrain))
        .route("/admin/retrain/status", get(admin::retrain_status))
        .route("/admin/events", get(admin::get_events))
        .route("/admin/labels", get(admin::list_labels))
        .route("/admin/labels/count", get(admin::labels_count))
        .route_layer(axum_mw::from_fn_with_state(
            auth_state,
            user_context_middleware,
        ))
        .with_state(admin_state);

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(auth_router)
        .merge(case_routes)
        .merge(admin_routes)
        .layer(cors_layer(&allowed_origins))
        .layer(axum_mw::from_fn(request_logging));

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("🎯 API server listening on {addr}");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
