//! Configuration management for the kiosk voice gateway
//!
//! Static configuration (ports, API keys, LLM endpoint) is read once from the
//! environment. Voice settings are consumed through [`SettingsSource`], which
//! is queried on every turn so that changes apply without a restart.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Default listening port
pub const DEFAULT_PORT: u16 = 18790;

/// Kiosk voice gateway configuration
#[derive(Debug)]
pub struct Config {
    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// API keys for speech and LLM providers
    pub api_keys: ApiKeys,

    /// LLM endpoint used to generate responses
    pub llm: LlmConfig,

    /// Voice settings used when no settings file is present
    pub voice: VoiceSettings,

    /// Optional TOML file holding live voice settings
    pub settings_path: Option<PathBuf>,

    /// Request timeout applied to every provider HTTP call
    pub http_timeout: Duration,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Path to static files directory (kiosk web UI)
    pub static_dir: Option<PathBuf>,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (TTS, default LLM)
    pub openai: Option<SecretString>,

    /// `ElevenLabs` API key
    pub elevenlabs: Option<SecretString>,

    /// `Deepgram` API key (live STT and TTS)
    pub deepgram: Option<SecretString>,

    /// `UnrealSpeech` API key
    pub unrealspeech: Option<SecretString>,
}

/// LLM endpoint configuration (OpenAI-compatible chat completions)
#[derive(Debug)]
pub struct LlmConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Bearer token; falls back to the `OpenAI` key
    pub api_key: Option<SecretString>,

    /// System prompt sent with every request
    pub system_prompt: String,

    /// Upper bound on generated tokens
    pub max_tokens: u32,
}

/// Voice pipeline settings, refreshed per turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Keep listening after the assistant finishes speaking
    pub conversation_mode: bool,

    /// Speech synthesis settings
    pub tts: TtsSettings,

    /// Speech recognition settings
    pub stt: SttSettings,

    /// Phrase segmentation settings
    pub segmenter: SegmenterSettings,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            conversation_mode: true,
            tts: TtsSettings::default(),
            stt: SttSettings::default(),
            segmenter: SegmenterSettings::default(),
        }
    }
}

/// Text-to-speech settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    /// Whether speech synthesis is enabled at all
    pub enabled: bool,

    /// Provider name: `openai`, `elevenlabs`, `deepgram` or `unrealspeech`
    pub provider: String,

    /// Provider model identifier
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Requested output sample rate in Hz
    pub sample_rate: u32,

    /// Speed multiplier, where the provider supports it
    pub speed: f32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "openai".to_string(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            sample_rate: 24_000,
            speed: 1.0,
        }
    }
}

/// Speech-to-text settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    /// Provider model identifier
    pub model: String,

    /// BCP-47 language tag
    pub language: String,

    /// Sample rate of the inbound microphone audio in Hz
    pub sample_rate: u32,

    /// Milliseconds of silence before the provider finalizes an utterance
    pub endpointing_ms: u32,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            language: "en-US".to_string(),
            sample_rate: 16_000,
            endpointing_ms: 300,
        }
    }
}

/// Phrase segmentation and audio framing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    /// Minimum phrase length before a delimiter may split
    pub min_chars: usize,

    /// Minimum length of the first phrase in a turn
    pub first_phrase_min_chars: usize,

    /// Grace period before the first phrase is force-split
    pub first_phrase_grace_ms: u64,

    /// Target frame size for buffered audio
    pub frame_bytes: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            min_chars: crate::voice::DEFAULT_MIN_CHARS,
            first_phrase_min_chars: crate::voice::DEFAULT_FIRST_PHRASE_MIN_CHARS,
            first_phrase_grace_ms: 250,
            frame_bytes: crate::voice::DEFAULT_FRAME_BYTES,
        }
    }
}

impl SegmenterSettings {
    /// Grace period as a [`Duration`]
    #[must_use]
    pub const fn first_phrase_grace(&self) -> Duration {
        Duration::from_millis(self.first_phrase_grace_ms)
    }
}

/// Read-only source of voice settings
///
/// Implementations are queried at the start of every call that needs
/// settings; they must be cheap.
pub trait SettingsSource: Send + Sync {
    /// Current voice settings
    fn voice_settings(&self) -> VoiceSettings;
}

/// In-memory settings that can be replaced at runtime
#[derive(Debug, Default)]
pub struct StaticSettings {
    inner: RwLock<VoiceSettings>,
}

impl StaticSettings {
    /// Wrap a fixed set of settings
    #[must_use]
    pub const fn new(settings: VoiceSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Replace the current settings
    pub fn update(&self, settings: VoiceSettings) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

impl SettingsSource for StaticSettings {
    fn voice_settings(&self) -> VoiceSettings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Settings backed by a TOML file, re-read when its modification time changes
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    fallback: VoiceSettings,
    cache: Mutex<Option<(SystemTime, VoiceSettings)>>,
}

impl FileSettings {
    /// Watch `path`, using `fallback` while the file is missing or invalid
    #[must_use]
    pub const fn new(path: PathBuf, fallback: VoiceSettings) -> Self {
        Self {
            path,
            fallback,
            cache: Mutex::new(None),
        }
    }

    /// Path of the watched file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<VoiceSettings> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }
}

impl SettingsSource for FileSettings {
    fn voice_settings(&self) -> VoiceSettings {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        let Ok(modified) = std::fs::metadata(&self.path).and_then(|m| m.modified()) else {
            return cache
                .as_ref()
                .map_or_else(|| self.fallback.clone(), |(_, s)| s.clone());
        };

        if let Some((_, settings)) = cache.as_ref().filter(|(seen, _)| *seen == modified) {
            return settings.clone();
        }

        match self.read() {
            Ok(settings) => {
                tracing::info!(path = %self.path.display(), "loaded voice settings");
                *cache = Some((modified, settings.clone()));
                settings
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to load voice settings, keeping previous"
                );
                cache
                    .as_ref()
                    .map_or_else(|| self.fallback.clone(), |(_, s)| s.clone())
            }
        }
    }
}

/// Return the default settings file location
///
/// Uses `~/.config/kiosk-voice/settings.toml` on Linux
#[must_use]
pub fn default_settings_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "omni", "kiosk-voice")
        .map(|d| d.config_dir().join("settings.toml"))
}

fn env_secret(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl Config {
    /// Load configuration from the environment
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable cannot be parsed
    pub fn load() -> Result<Self> {
        let api_keys = ApiKeys {
            openai: env_secret("OPENAI_API_KEY"),
            elevenlabs: env_secret("ELEVENLABS_API_KEY"),
            deepgram: env_secret("DEEPGRAM_API_KEY"),
            unrealspeech: env_secret("UNREALSPEECH_API_KEY"),
        };

        let api_server = ApiServerConfig {
            port: parse_env("KIOSK_VOICE_PORT")?
                .or(parse_env("PORT")?)
                .unwrap_or(DEFAULT_PORT),
            static_dir: std::env::var("KIOSK_VOICE_STATIC_DIR")
                .ok()
                .map(PathBuf::from),
        };

        let llm = LlmConfig {
            base_url: std::env::var("KIOSK_LLM_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: std::env::var("KIOSK_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key: env_secret("KIOSK_LLM_API_KEY").or_else(|| env_secret("OPENAI_API_KEY")),
            system_prompt: std::env::var("KIOSK_SYSTEM_PROMPT").unwrap_or_else(|_| {
                "You are a helpful voice assistant on a kiosk. Answer briefly in plain spoken \
                 sentences without markdown."
                    .to_string()
            }),
            max_tokens: parse_env("KIOSK_LLM_MAX_TOKENS")?.unwrap_or(512),
        };

        let mut voice = VoiceSettings::default();
        if let Ok(provider) = std::env::var("KIOSK_TTS_PROVIDER") {
            voice.tts.provider = provider;
        }
        if let Ok(model) = std::env::var("KIOSK_TTS_MODEL") {
            voice.tts.model = model;
        }
        if let Ok(voice_id) = std::env::var("KIOSK_TTS_VOICE") {
            voice.tts.voice = voice_id;
        }
        if let Some(rate) = parse_env("KIOSK_TTS_SAMPLE_RATE")? {
            voice.tts.sample_rate = rate;
        }
        if let Some(enabled) = env_flag("KIOSK_TTS_ENABLED") {
            voice.tts.enabled = enabled;
        }
        if let Ok(model) = std::env::var("KIOSK_STT_MODEL") {
            voice.stt.model = model;
        }
        if let Some(mode) = env_flag("KIOSK_CONVERSATION_MODE") {
            voice.conversation_mode = mode;
        }

        let settings_path = std::env::var("KIOSK_SETTINGS_PATH")
            .ok()
            .map(PathBuf::from)
            .or_else(default_settings_path);

        let http_timeout =
            Duration::from_secs(parse_env("KIOSK_HTTP_TIMEOUT_SECS")?.unwrap_or(30));

        Ok(Self {
            api_server,
            api_keys,
            llm,
            voice,
            settings_path,
            http_timeout,
        })
    }

    /// Build the settings source for this configuration
    ///
    /// Uses the settings file when one exists, the environment defaults otherwise
    #[must_use]
    pub fn settings_source(&self) -> std::sync::Arc<dyn SettingsSource> {
        match &self.settings_path {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "watching voice settings file");
                std::sync::Arc::new(FileSettings::new(path.clone(), self.voice.clone()))
            }
            _ => std::sync::Arc::new(StaticSettings::new(self.voice.clone())),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| crate::Error::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}
