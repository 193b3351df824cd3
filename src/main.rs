mod api;
mod auth;
mod config;
mod db;
mod event_bus;
mod feed;
mod models;

use std::ops::Deref;
use std::sync::Arc;

use gotcha::axum::extract::FromRef;
use gotcha::axum::response::{IntoResponse, Response};
use gotcha::Gotcha;
use gotcha::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::api::{agents, users, vehicle_stream, vehicles};
use crate::auth::{auth_middleware, AuthState};
use crate::config::Settings;
use crate::db::DatabaseService;
use crate::event_bus::EventBus;

// ============================================================================
// Database wrapper
// ============================================================================

/// Database service wrapper for state extraction
#[derive(Clone)]
pub struct Db(pub Arc<DatabaseService>);

impl Deref for Db {
    type Target = DatabaseService;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Database error: {0}")]
    Database(#[from] conservator::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] conservator::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal server error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    pub fn to_status_code(&self) -> gotcha::axum::http::StatusCode {
        use gotcha::axum::http::StatusCode;
        match self {
            TrackerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TrackerError::Migration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TrackerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TrackerError::Auth(_) => StatusCode::UNAUTHORIZED,
            TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
            TrackerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TrackerError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ============================================================================
// Application state
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub settings: Settings,
    pub bus: EventBus,
}

impl Default for AppState {
    fn default() -> Self {
        unimplemented!()
    }
}

// Allow extracting Db from GotchaContext
impl FromRef<gotcha::GotchaContext<AppState, Settings>> for Db {
    fn from_ref(ctx: &gotcha::GotchaContext<AppState, Settings>) -> Self {
        ctx.state.db.clone()
    }
}

// Allow extracting Settings from GotchaContext
impl FromRef<gotcha::GotchaContext<AppState, Settings>> for Settings {
    fn from_ref(ctx: &gotcha::GotchaContext<AppState, Settings>) -> Self {
        ctx.state.settings.clone()
    }
}

// Allow extracting the event bus from GotchaContext
impl FromRef<gotcha::GotchaContext<AppState, Settings>> for EventBus {
    fn from_ref(ctx: &gotcha::GotchaContext<AppState, Settings>) -> Self {
        ctx.state.bus.clone()
    }
}

// ============================================================================
// Health check handler
// ============================================================================

async fn health_check() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting Vehicle Tracker Server");

    let settings = Settings::new().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if settings.application.database_url.is_empty() {
        return Err(TrackerError::Config("database_url is not set".to_string()).into());
    }

    info!("Initializing database...");
    let db_service = Arc::new(DatabaseService::new(&settings.application.database_url)?);

    info!("Running database migrations...");
    db_service.migrate().await?;

    let db = Db(db_service);

    info!("Starting event bus...");
    let bus = EventBus::new();
    bus.run()?;

    let app_settings = settings.application.clone();
    let auth_state = AuthState {
        settings: app_settings.clone(),
        users: db.0.clone(),
    };
    let app_state = AppState {
        db: db.clone(),
        settings: app_settings,
        bus: bus.clone(),
    };

    let addr = format!("{}:{}", &settings.basic.host, &settings.basic.port);
    info!("Starting server on http://{}", addr);

    let served = Gotcha::with_types::<AppState, Settings>()
        .state(app_state)
        .config(settings)
        // Health check
        .get("/api", health_check)
        // User and login routes
        .get("/user/", users::list_users)
        .post("/user/", users::create_user)
        .get("/user/:uuid", users::get_user)
        .delete("/user/:uuid", users::delete_user)
        .post("/auth/", users::authorize)
        .get("/auth/", users::check_auth)
        // Agent routes
        .get("/agent/", agents::list_agents)
        .post("/agent/:uuid/sync", agents::sync_agent)
        .post("/agents/:uuid/sync", agents::sync_agent)
        // Vehicle routes
        .get("/vehicle/", vehicles::list_vehicles)
        .post("/vehicle/", vehicles::create_vehicle)
        .get("/vehicle/filter", vehicles::filter_vehicles)
        .get("/vehicle/type/", vehicles::list_vehicle_types)
        .get("/vehicle/:plate_id", vehicles::get_vehicle)
        .delete("/vehicle/:plate_id", vehicles::delete_vehicle)
        .post("/vehicle/:plate_id/agent", vehicles::set_vehicle_agent)
        .delete("/vehicle/:plate_id/agent", vehicles::unset_vehicle_agent)
        .put("/vehicle/:plate_id/groups", vehicles::set_vehicle_groups)
        // Group routes
        .get("/vehicle/group/", vehicles::list_groups)
        .post("/vehicle/group/", vehicles::create_group)
        .delete("/vehicle/group/:group_id", vehicles::delete_group)
        // Live feed
        .get("/ws/vehicle/filter", vehicle_stream::ws_vehicle_filter)
        .layer(gotcha::axum::middleware::from_fn_with_state(
            auth_state,
            auth_middleware,
        ))
        .with_cors()
        .with_openapi()
        .listen(addr)
        .await;

    info!("Stopping event bus...");
    bus.shutdown().await;

    served?;
    Ok(())
}
