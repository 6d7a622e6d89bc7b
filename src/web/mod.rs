//! Web server module.

mod error;
mod handlers;
mod watch;

pub use error::ApiError;
pub use handlers::{client_ip, macrodroid_export, mask_ip};

use crate::config::ServerConfig;
use crate::db::Store;
use crate::devices::DeviceService;
use crate::heartbeat::{DeviceLocks, HeartbeatProcessor};
use crate::mailer::Mailer;
use crate::tasks::Background;
use crate::watch::{Hub, Notifier};

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub devices: Arc<DeviceService>,
    pub heartbeat: Arc<HeartbeatProcessor>,
    pub hub: Arc<Hub>,
}

impl AppState {
    /// Wire the services around one store. Heartbeats and owner edits share
    /// the per-device locks.
    pub fn new(config: ServerConfig, store: Arc<Store>, background: Background, mailer: Mailer) -> Self {
        let hub = Arc::new(Hub::new(&config.limits));
        let notifier = Notifier::new(hub.clone(), background);
        let locks = Arc::new(DeviceLocks::new());

        let heartbeat = Arc::new(HeartbeatProcessor::new(
            store.clone(),
            config.limits.clone(),
            locks.clone(),
            notifier.clone(),
            mailer.clone(),
        ));
        let devices = Arc::new(DeviceService::new(
            store,
            config.limits.clone(),
            locks,
            notifier,
            mailer,
        ));

        Self {
            config: Arc::new(config),
            devices,
            heartbeat,
            hub,
        }
    }
}

/// Web server for Blackouts.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the server on the configured address.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = self.state.config.http_addr.parse()?;
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

fn cors(config: &ServerConfig) -> CorsLayer {
    let origin = match config.allow_origin.as_str() {
        "*" => AllowOrigin::from(Any),
        origin => match HeaderValue::from_str(origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                tracing::warn!("Invalid CORS origin {:?}, allowing any", origin);
                AllowOrigin::from(Any)
            }
        },
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// All routes live under `/u`. Static segments take precedence over the
/// heartbeat catch-all `/u/{token}`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/u/listing", get(handlers::handle_listing))
        .route("/u/v/{token}", get(handlers::handle_view))
        .route(
            "/u/e/{token}",
            get(handlers::handle_edit_view).post(handlers::handle_save),
        )
        .route("/u/email_send_code/{token}", post(handlers::handle_send_code))
        .route("/u/verify_email/{token}", post(handlers::handle_verify))
        .route("/u/change_token/{token}", post(handlers::handle_change_token))
        .route("/u/unsubscribe/{token}", get(handlers::handle_unsubscribe))
        .route("/u/toogle_event/{token}", post(handlers::handle_toggle_event))
        .route("/u/add_comment/{token}", post(handlers::handle_add_comment))
        .route("/u/create_device", post(handlers::handle_create_device))
        .route("/u/delete_device/{token}", post(handlers::handle_delete_device))
        .route("/u/watch", get(watch::handle_watch))
        .route("/u/uptime.macro", get(handlers::handle_macro))
        .route("/u/{token}", get(handlers::handle_heartbeat))
        .layer(cors(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}
