use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use lisan_core::config::{CaptureSource, Config, LoggingConfig, PlaybackMode};
use lisan_core::lesson::LessonScript;
use lisan_core::protocol::Direction;
use lisan_media::{DiagnosticPlayback, MediaCapture, PlaybackSink, SilenceCapture};
use lisan_session::{
    SessionDeps, SessionEvent, SessionOptions, SessionStatus, TutorController, WebRtcConnector,
};
use lisan_signaling::{HttpCredentialFetcher, HttpSignalingNegotiator};

/// Whether this binary can open host audio devices.
const AUDIO_DEVICE: bool = cfg!(feature = "audio-device");

#[derive(Parser)]
#[command(
    name = "lisan",
    about = "Realtime voice tutor: a spoken Arabic lesson over WebRTC",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one lesson until Ctrl-C or until the remote side drops
    Lesson {
        /// Token endpoint (overrides token.url)
        #[arg(long)]
        token_url: Option<String>,

        /// Realtime model (overrides realtime.model)
        #[arg(long)]
        model: Option<String>,
    },

    /// Print the lesson script sent at the start of every session
    Script,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
    /// Write a default config file if none exists
    Init,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = if verbose {
                "debug"
            } else {
                logging.level.as_deref().unwrap_or("info")
            };
            let directives = std::iter::once(level.to_string())
                .chain(logging.filters.iter().cloned())
                .collect::<Vec<_>>()
                .join(",");
            EnvFilter::try_new(&directives)
                .with_context(|| format!("invalid log filter '{directives}'"))?
        }
    };

    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
    Ok(())
}

fn capture_for(source: CaptureSource) -> anyhow::Result<Arc<dyn MediaCapture>> {
    let capture: Arc<dyn MediaCapture> = match source {
        CaptureSource::Silence => Arc::new(SilenceCapture::new()),
        #[cfg(feature = "audio-device")]
        CaptureSource::Microphone => Arc::new(lisan_media::device::MicrophoneCapture::new()),
        #[cfg(not(feature = "audio-device"))]
        CaptureSource::Microphone => {
            anyhow::bail!("media.capture = microphone needs a build with --features audio-device")
        }
    };
    Ok(capture)
}

fn playback_for(mode: PlaybackMode) -> anyhow::Result<Arc<dyn PlaybackSink>> {
    let playback: Arc<dyn PlaybackSink> = match mode {
        PlaybackMode::Diagnostic => Arc::new(DiagnosticPlayback::new()),
        #[cfg(feature = "audio-device")]
        PlaybackMode::Speaker => Arc::new(lisan_media::device::SpeakerPlayback::new()),
        #[cfg(not(feature = "audio-device"))]
        PlaybackMode::Speaker => {
            anyhow::bail!("media.playback = speaker needs a build with --features audio-device")
        }
    };
    Ok(playback)
}

fn build_deps(config: &Config) -> anyhow::Result<SessionDeps> {
    Ok(SessionDeps {
        credentials: Arc::new(HttpCredentialFetcher::new(config.token_url())),
        capture: capture_for(config.capture_source())?,
        negotiator: Arc::new(HttpSignalingNegotiator::new(
            config.realtime_base_url(),
            config.realtime_model(),
        )),
        connector: Arc::new(WebRtcConnector::new(config.ice_servers())),
        playback: playback_for(config.playback_mode())?,
    })
}

/// Print transcripts as they arrive.
async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Control(observed)) if observed.direction == Direction::Inbound => {
                let event = &observed.event;
                match (event.event_type.as_str(), event.transcript()) {
                    ("response.audio_transcript.done", Some(text)) => println!("tutor: {text}"),
                    ("conversation.item.input_audio_transcription.completed", Some(text)) => {
                        println!("you:   {text}")
                    }
                    ("error", _) => tracing::warn!(payload = ?event.payload, "Remote error event"),
                    _ => {}
                }
            }
            Ok(SessionEvent::Status(status)) => tracing::debug!(?status, "Session status"),
            Ok(SessionEvent::Playback(signal)) => tracing::debug!(?signal, "Playback"),
            Ok(SessionEvent::Control(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_lesson(config: &Config) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate(AUDIO_DEVICE);
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }

    let controller = TutorController::new(build_deps(config)?, SessionOptions::from_config(config));
    let session = controller.session().await;
    let printer = tokio::spawn(print_events(session.subscribe()));

    tracing::info!(
        model = %config.realtime_model(),
        capture = ?config.capture_source(),
        playback = ?config.playback_mode(),
        "Connecting"
    );
    tokio::select! {
        result = controller.start() => {
            if let Err(e) = result {
                printer.abort();
                return Err(anyhow::Error::new(e).context("could not start the lesson"));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            controller.stop().await;
            printer.abort();
            return Ok(());
        }
    }

    println!("Lesson started. Press Ctrl-C to end it.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ending lesson");
            controller.stop().await;
        }
        _ = session.wait_for(SessionStatus::Stopped) => {
            tracing::warn!("The connection dropped and the lesson ended");
        }
    }
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Lesson { token_url, model } => {
            let mut config = config;
            if let Some(url) = token_url {
                config.token.get_or_insert_with(Default::default).url = url;
            }
            if let Some(model) = model {
                config.realtime.get_or_insert_with(Default::default).model = model;
            }
            run_lesson(&config).await?;
        }
        Commands::Script => {
            println!("{}", LessonScript::default().text());
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate(AUDIO_DEVICE);
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error:   {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
            ConfigAction::Init => {
                if config_path.exists() {
                    anyhow::bail!("{} already exists", config_path.display());
                }
                if let Some(dir) = config_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                Config::with_defaults().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
    }

    Ok(())
}
