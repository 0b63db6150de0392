//! Control-plane HTTP surface for the tunnel broker
//!
//! Exposes session creation, listing, discovery, close, connection details,
//! and health over axum, with an OpenAPI document and Swagger UI.

pub mod handlers;
pub mod models;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use portshare_broker::TunnelBroker;

/// Application state shared across handlers
pub struct AppState {
    pub broker: Arc<TunnelBroker>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Portshare API",
        version = "0.1.0",
        description = "Control plane for live tunnel sessions",
        contact(
            name = "Portshare Team",
            email = "team@portshare.dev"
        )
    ),
    paths(
        handlers::create_session,
        handlers::list_sessions,
        handlers::get_session,
        handlers::close_session,
        handlers::connection_details,
        handlers::discover,
        handlers::health_check,
    ),
    components(
        schemas(
            models::CreateSessionRequest,
            models::CreateSessionResponse,
            models::SessionList,
            models::CloseSessionResponse,
            models::HealthResponse,
            models::ErrorResponse,
            portshare_proto::SessionState,
            portshare_proto::SessionStats,
            portshare_proto::SessionSummary,
            portshare_proto::Visibility,
            portshare_proto::CloseReason,
            portshare_proto::ProjectMetadata,
            portshare_proto::ConnectionDetails,
            portshare_proto::TransportEndpoint,
        )
    ),
    tags(
        (name = "sessions", description = "Tunnel session management endpoints"),
        (name = "discovery", description = "Public session discovery endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS (for development)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().expect("valid bind address"),
            enable_cors: true,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, broker: Arc<TunnelBroker>) -> Self {
        let state = Arc::new(AppState { broker });
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let api_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route(
                "/api/sessions",
                post(handlers::create_session).get(handlers::list_sessions),
            )
            .route(
                "/api/sessions/{id}",
                get(handlers::get_session).delete(handlers::close_session),
            )
            .route(
                "/api/sessions/{id}/connection",
                get(handlers::connection_details),
            )
            .route("/api/discover", get(handlers::discover))
            .with_state(self.state.clone());

        // SwaggerUi automatically creates a route for /api/openapi.json
        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(api_router);

        let router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE])
                .allow_origin(tower_http::cors::Any);
            router.layer(cors)
        } else {
            router
        }
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
