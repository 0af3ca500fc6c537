use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use kiosk_voice::voice::{TtsEngine, pcm_to_wav};
use kiosk_voice::{Config, Daemon, SettingsSource};

/// Kiosk Voice - real-time voice gateway for kiosk assistants
#[derive(Parser)]
#[command(name = "kiosk-voice", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "KIOSK_VOICE_PORT")]
    port: Option<u16>,

    /// Voice settings file (TOML), re-read when modified
    #[arg(long, env = "KIOSK_SETTINGS_PATH")]
    settings: Option<PathBuf>,

    /// Directory with the kiosk web UI
    #[arg(long, env = "KIOSK_VOICE_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the voice gateway (default)
    Serve,
    /// Synthesize a phrase with the configured provider and write a WAV file
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,

        /// Output file
        #[arg(short, long, default_value = "tts-test.wav")]
        output: PathBuf,

        /// Override the configured provider
        #[arg(short, long)]
        provider: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,kiosk_voice=info",
        1 => "info,kiosk_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }
    if let Some(path) = cli.settings {
        config.settings_path = Some(path);
    }
    if let Some(dir) = cli.static_dir {
        config.api_server.static_dir = Some(dir);
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(port = config.api_server.port, "starting kiosk voice gateway");
            let daemon = Daemon::new(config)?;
            daemon.run().await?;
            Ok(())
        }
        Command::TestTts {
            text,
            output,
            provider,
        } => test_tts(config, &text, &output, provider).await,
    }
}

/// Test TTS output through the full provider and buffering path
async fn test_tts(
    mut config: Config,
    text: &str,
    output: &Path,
    provider: Option<String>,
) -> anyhow::Result<()> {
    if let Some(provider) = provider {
        config.voice.tts.provider = provider;
    }
    // CLI overrides must not be shadowed by the settings file
    config.settings_path = None;

    let settings = config.settings_source();
    let voice = settings.voice_settings();
    let engine = TtsEngine::from_keys(settings, &config.api_keys, config.http_timeout)?;

    println!(
        "Testing TTS with {} ({}, voice {}): \"{text}\"\n",
        voice.tts.provider, voice.tts.model, voice.tts.voice
    );

    let started = Instant::now();
    let Some(mut stream) = engine.synthesize_stream(text).await? else {
        anyhow::bail!(
            "TTS provider \"{}\" unavailable (registered: {:?})",
            voice.tts.provider,
            engine.provider_names()
        );
    };

    let mut pcm = Vec::new();
    let mut frames = 0usize;
    while let Some(frame) = stream.chunks.next().await {
        let frame = frame?;
        if frames == 0 {
            println!("First audio after {} ms", started.elapsed().as_millis());
        }
        frames += 1;
        pcm.extend_from_slice(&frame);
    }

    println!(
        "Got {} bytes in {frames} frames at {} Hz ({} ms total)",
        pcm.len(),
        stream.sample_rate,
        started.elapsed().as_millis()
    );

    let wav = pcm_to_wav(&pcm, stream.sample_rate)?;
    tokio::fs::write(output, wav).await?;
    println!("Wrote {}", output.display());

    Ok(())
}
