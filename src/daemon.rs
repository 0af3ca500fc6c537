//! Daemon - the main gateway service
//!
//! Wires configuration, providers and the voice pipeline together and runs
//! the HTTP/WebSocket server until interrupted.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tokio::sync::mpsc;

use crate::agent::{ChatCompletionsGenerator, ResponseGenerator};
use crate::api::{ApiServer, ApiState};
use crate::config::SettingsSource;
use crate::voice::stt::DeepgramLiveStt;
use crate::voice::tts::http_client;
use crate::voice::{
    SttProvider, SttSessionManager, TtsEngine, TtsProcessor, VoiceConnectionManager,
    VoiceOrchestrator,
};
use crate::{Config, Result};

/// STT events buffered between sessions and the orchestrator
const STT_EVENT_CAPACITY: usize = 256;

/// The assembled voice pipeline
#[derive(Clone)]
pub struct VoiceStack {
    pub settings: Arc<dyn SettingsSource>,
    pub connections: Arc<VoiceConnectionManager>,
    pub stt: Arc<SttSessionManager>,
    pub engine: Arc<TtsEngine>,
    pub processor: Arc<TtsProcessor>,
    pub orchestrator: Arc<VoiceOrchestrator>,
}

impl VoiceStack {
    /// Assemble the pipeline and start its STT event listener
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        engine: TtsEngine,
        stt_provider: Option<Arc<dyn SttProvider>>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let connections = Arc::new(VoiceConnectionManager::new());
        let (events_tx, events_rx) = mpsc::channel(STT_EVENT_CAPACITY);

        let stt = Arc::new(SttSessionManager::new(
            stt_provider,
            Arc::clone(&settings),
            Arc::clone(&connections),
            events_tx,
        ));
        let engine = Arc::new(engine);
        let processor = Arc::new(TtsProcessor::new(
            Arc::clone(&engine),
            Arc::clone(&connections),
            Arc::clone(&stt),
        ));
        let orchestrator = Arc::new(VoiceOrchestrator::new(
            Arc::clone(&connections),
            Arc::clone(&stt),
            Arc::clone(&processor),
            generator,
            Arc::clone(&settings),
        ));
        orchestrator.spawn_stt_listener(events_rx);

        Self {
            settings,
            connections,
            stt,
            engine,
            processor,
            orchestrator,
        }
    }

    /// Build the pipeline with the real providers named in `config`
    ///
    /// # Errors
    ///
    /// Returns error if an HTTP client or provider cannot be created
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = config.settings_source();
        let engine = TtsEngine::from_keys(Arc::clone(&settings), &config.api_keys, config.http_timeout)?;

        let stt_provider: Option<Arc<dyn SttProvider>> = match &config.api_keys.deepgram {
            Some(key) => Some(Arc::new(DeepgramLiveStt::new(key.expose_secret().to_string())?)),
            None => {
                tracing::warn!("DEEPGRAM_API_KEY not set - speech recognition unavailable");
                None
            }
        };

        if config.llm.api_key.is_none() {
            tracing::warn!(url = %config.llm.base_url, "no LLM API key configured");
        }
        let generator = Arc::new(ChatCompletionsGenerator::new(
            http_client(config.http_timeout)?,
            &config.llm,
        ));

        Ok(Self::new(settings, engine, stt_provider, generator))
    }
}

/// The kiosk voice daemon
pub struct Daemon {
    config: Config,
    stack: VoiceStack,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails
    pub fn new(config: Config) -> Result<Self> {
        let stack = VoiceStack::from_config(&config)?;
        Ok(Self { config, stack })
    }

    /// The assembled voice pipeline
    #[must_use]
    pub const fn stack(&self) -> &VoiceStack {
        &self.stack
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let settings = self.stack.settings.voice_settings();
        tracing::info!(
            port = self.config.api_server.port,
            tts_provider = %settings.tts.provider,
            tts_providers = ?self.stack.engine.provider_names(),
            stt_available = self.stack.stt.is_available(),
            conversation_mode = settings.conversation_mode,
            "daemon running"
        );

        let state = Arc::new(ApiState::new(&self.stack));
        let server = ApiServer::new(
            state,
            self.config.api_server.port,
            self.config.api_server.static_dir.clone(),
        );
        let mut server = server.spawn();

        tokio::select! {
            result = &mut server => {
                match result {
                    Ok(result) => result?,
                    Err(e) => tracing::error!(error = %e, "API server task failed"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("shutting down");
                self.stack.orchestrator.cancel_turn();
                self.stack.stt.close_all();
                server.abort();
            }
        }

        Ok(())
    }
}
