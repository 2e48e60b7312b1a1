//! # Server Configuration
//!
//! Router assembly, shared state and the OpenAPI document for the
//! integrations service.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, patch, post},
};
use sea_orm::DatabaseConnection;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::gateway::IntegrationGateway;
use crate::handlers;
use crate::notify::{LogNotificationSink, NotificationSink};
use crate::providers::ProviderRegistry;
use crate::telemetry::trace_context_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub gateway: Arc<IntegrationGateway>,
}

impl AppState {
    /// Wire the gateway from configuration. Fails when the crypto key is
    /// missing or malformed.
    pub fn build(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        registry: ProviderRegistry,
        notifier: Arc<dyn NotificationSink>,
    ) -> anyhow::Result<Self> {
        let key_bytes = config
            .crypto_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("crypto key is not configured"))?;
        let crypto_key = CryptoKey::new(key_bytes)?;

        let gateway = IntegrationGateway::new(
            Arc::new(db.clone()),
            crypto_key,
            Arc::new(registry),
            notifier,
            &config.integration,
        );

        Ok(Self {
            config,
            db,
            gateway: Arc::new(gateway),
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz));

    let protected_routes = Router::new()
        .route("/integrations", get(handlers::integrations::status))
        .route(
            "/integrations/{provider}",
            delete(handlers::integrations::disconnect),
        )
        .route(
            "/integrations/{provider}/connect",
            post(handlers::integrations::connect),
        )
        .route(
            "/integrations/{provider}/sync",
            post(handlers::integrations::sync),
        )
        .route(
            "/integrations/{provider}/picker-token",
            get(handlers::integrations::picker_token),
        )
        .route(
            "/integrations/{provider}/files/{file_id}",
            get(handlers::integrations::picked_file),
        )
        .route(
            "/integrations/{provider}/events",
            post(handlers::events::create_event),
        )
        .route(
            "/integrations/{provider}/events/{external_id}",
            patch(handlers::events::update_event).delete(handlers::events::delete_event),
        )
        .route("/events", get(handlers::events::list_events))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;
    let profile = config.profile.clone();

    let registry = ProviderRegistry::from_config(&config)?;
    let state = AppState::build(
        Arc::new(config),
        db,
        registry,
        Arc::new(LogNotificationSink),
    )?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Registers the operator bearer scheme referenced by protected paths
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::integrations::status,
        crate::handlers::integrations::connect,
        crate::handlers::integrations::disconnect,
        crate::handlers::integrations::sync,
        crate::handlers::integrations::picker_token,
        crate::handlers::integrations::picked_file,
        crate::handlers::events::list_events,
        crate::handlers::events::create_event,
        crate::handlers::events::update_event,
        crate::handlers::events::delete_event,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::integrations::StatusResponse,
            crate::handlers::integrations::ConnectResponse,
            crate::handlers::integrations::DisconnectResponse,
            crate::handlers::integrations::SyncResponse,
            crate::handlers::events::EventsResponse,
            crate::handlers::events::MirroredEvent,
            crate::gateway::ConnectRequest,
            crate::gateway::PickerToken,
            crate::gateway::ProviderStatus,
            crate::calendar::EventDraft,
            crate::calendar::EventPatch,
            crate::calendar::EventPayload,
            crate::providers::Provider,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service metadata and health"),
        (name = "integrations", description = "Provider connections, sync and picker access"),
        (name = "events", description = "Mirrored calendar events and mutations"),
    ),
    info(
        title = "Integrations API",
        description = "External account integrations: OAuth credentials and calendar mirroring",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
