use crate::bridge::BridgeHub;
use crate::config::AppConfig;
use crate::eventlog::EventLog;
use crate::flow::ConnectFlow;
use crate::integration::{ConnectionSink, TracingConnectionSink};
use crate::loader::SdkLoader;
use crate::pluggy::PluggyClient;
use crate::status::StatusBoard;
use crate::widget::WidgetManager;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub flow: Arc<ConnectFlow>,
    pub bridge: BridgeHub,
    pub loader: Arc<SdkLoader>,
    pub widgets: Arc<WidgetManager>,
    pub log: Arc<EventLog>,
    pub status: Arc<StatusBoard>,
}

impl AppState {
    /// Wire every component around a single bridge hub. Must run inside a tokio runtime.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        Self::with_sink(config, Arc::new(TracingConnectionSink))
    }

    pub fn with_sink(config: AppConfig, sink: Arc<dyn ConnectionSink>) -> anyhow::Result<Self> {
        let log = Arc::new(EventLog::new(config.event_log_capacity));
        let status = Arc::new(StatusBoard::new());
        let bridge = BridgeHub::new(config.sdk.poll_interval);

        let loader = Arc::new(SdkLoader::new(
            Arc::new(bridge.clone()),
            config.sdk.clone(),
            log.clone(),
        ));
        loader.announce_readiness(status.clone());

        let widgets = Arc::new(WidgetManager::new(
            loader.clone(),
            config.widget.clone(),
            log.clone(),
            status.clone(),
            sink,
        ));
        let pluggy = PluggyClient::new(config.pluggy.clone(), log.clone())?;
        let flow = Arc::new(ConnectFlow::new(
            pluggy,
            loader.clone(),
            widgets.clone(),
            log.clone(),
            status.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            flow,
            bridge,
            loader,
            widgets,
            log,
            status,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let cors = state.config.enable_cors;
    let app = Router::new()
        .route("/", get(crate::api::serve_page))
        .route("/connect.js", get(crate::api::serve_script))
        .route("/api/connect/directives", get(crate::api::directives))
        .route("/api/connect/reports", post(crate::api::post_report))
        .route("/api/connect/start", post(crate::api::start_connect))
        .route("/api/connect/status", get(crate::api::get_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

pub async fn run(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "connect page listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutting down");
    }
}
