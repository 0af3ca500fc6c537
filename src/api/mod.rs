//! HTTP API server for the kiosk voice gateway

pub mod health;
pub mod voice;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::config::SettingsSource;
use crate::daemon::VoiceStack;
use crate::voice::{VoiceConnectionManager, VoiceOrchestrator};

/// Shared state for API handlers
pub struct ApiState {
    pub orchestrator: Arc<VoiceOrchestrator>,
    pub connections: Arc<VoiceConnectionManager>,
    pub settings: Arc<dyn SettingsSource>,
    pub stt_available: bool,
    pub tts_providers: Vec<&'static str>,
}

impl ApiState {
    /// Collect handler state from an assembled pipeline
    #[must_use]
    pub fn new(stack: &VoiceStack) -> Self {
        Self {
            orchestrator: Arc::clone(&stack.orchestrator),
            connections: Arc::clone(&stack.connections),
            settings: Arc::clone(&stack.settings),
            stt_available: stack.stt.is_available(),
            tts_providers: stack.engine.provider_names(),
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: Arc<ApiState>, port: u16, static_dir: Option<PathBuf>) -> Self {
        Self {
            state,
            port,
            static_dir,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .nest("/api/voice", voice::router(self.state.clone()))
            .nest("/ws", websocket::router(self.state.clone()))
            .merge(health::router());

        // Serve the kiosk web UI if configured
        if let Some(static_dir) = &self.static_dir {
            let index_file = static_dir.join("index.html");
            let serve_dir = ServeDir::new(static_dir)
                .not_found_service(ServeFile::new(&index_file));

            router = router.fallback_service(serve_dir);
            tracing::info!(path = %static_dir.display(), "serving static files");
        }

        // Kiosk UIs may be served from another origin
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Transport(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
