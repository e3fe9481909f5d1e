//! # turnlink - Command Line Entry Point
//!
//! Runs one conversational turn against a gateway, sends a stop request, or serves the
//! loopback gateway for local development.
//!
//! ## Subcommands:
//! - **serve**: start the loopback gateway (input/output WebSockets, stop endpoint, health)
//! - **text**: send one text turn and print the final session state as JSON
//! - **audio**: upload a recording file as one audio turn; optionally save the reply audio
//! - **interrupt**: ask the gateway to stop a task
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the turn client and the gateway both run on the actix/tokio runtime
//! - **Result<T, E>**: every step propagates errors with `?` up to `main`
//! - **static**: a global shutdown flag shared with the signal handler task

// External crate imports - These are dependencies from Cargo.toml
use anyhow::{Context, Result};  // Error handling with context for the CLI
use clap::{Parser, Subcommand};  // Declarative argument parsing
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};  // Thread-safe boolean for shutdown
use tracing::{error, info, warn};  // Structured logging
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

// Our library crate
use turnlink::audio::{CaptureDevice, FileCapture};
use turnlink::gateway::{self, GatewayState};
use turnlink::interrupt::{HttpInterrupter, Interrupter};
use turnlink::{AppConfig, SessionSnapshot, TurnClient};

/// Global shutdown signal set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Parser)]
#[command(name = "turnlink", version, about = "Dual-channel turn client and loopback gateway")]
struct Cli {
    /// Configuration file (TOML); defaults to ./turnlink.toml when present
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the loopback gateway
    Serve,
    /// Send one text turn
    Text {
        /// Text to send
        content: String,
    },
    /// Upload a recording as one audio turn
    Audio {
        /// Recording to upload
        path: PathBuf,
        /// Where to write the reply audio, if any
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Ask the gateway to stop a task
    Interrupt {
        /// Task id returned when the turn was uploaded
        task_id: String,
    },
}

/// The application entry point.
///
/// ## What this function does:
/// 1. **Loads `.env`** and sets up logging
/// 2. **Loads configuration** from the file and `TURNLINK_` environment variables
/// 3. **Dispatches** to the chosen subcommand
///
/// ## Key Rust Concepts:
/// - `#[actix_web::main]`: sets up the async runtime the gateway and the client share
/// - `?`: returns early with the error, which `anyhow` prints with its context chain
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = AppConfig::load_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    config.validate()?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Text { content } => {
            let mut client = TurnClient::from_config(config)?;
            client.submit_text(&content)?;
            finish_turn(&mut client, None).await
        }
        Command::Audio { path, output } => {
            let recording = FileCapture::new(&path, config.audio.capture_segment_bytes)
                .take_recording()?;
            let mut client = TurnClient::from_config(config)?;
            client.submit_audio(recording)?;
            finish_turn(&mut client, output).await
        }
        Command::Interrupt { task_id } => {
            let interrupter = HttpInterrupter::new(&config)?;
            interrupter.stop(&task_id).await?;
            info!(task_id = %task_id, "Stop request accepted");
            Ok(())
        }
    }
}

/// Run the loopback gateway until SIGINT/SIGTERM.
async fn serve(config: AppConfig) -> Result<()> {
    config.validate_server()?;
    info!("Starting turnlink gateway v{}", env!("CARGO_PKG_VERSION"));

    let (server, addrs) = gateway::bind(&config, GatewayState::new(config.clone()))?;
    for addr in &addrs {
        info!("Listening on {}", addr);
    }

    setup_signal_handlers();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first wins: the server (usually an error) or a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping gateway...");
            server_handle.stop(true).await;
        }
    }

    info!("Gateway stopped gracefully");
    Ok(())
}

/// Wait for the turn to settle, print the session state and save any reply audio.
async fn finish_turn(client: &mut TurnClient, output: Option<PathBuf>) -> Result<()> {
    let snapshot = client.run_until_settled().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if let Some(path) = output {
        save_audio(client, &snapshot, &path)?;
    }

    if let Some(err) = &snapshot.last_error {
        anyhow::bail!("turn finished with an error: {}", err);
    }
    Ok(())
}

fn save_audio(client: &TurnClient, snapshot: &SessionSnapshot, path: &PathBuf) -> Result<()> {
    let audio = match snapshot.audio_handle.as_ref().and_then(|h| client.resolve_audio(h)) {
        Some(audio) => audio,
        None => {
            warn!("Turn produced no audio; nothing written to {}", path.display());
            return Ok(());
        }
    };

    std::fs::write(path, &audio.bytes)
        .with_context(|| format!("Failed to write audio to {}", path.display()))?;
    info!(
        path = %path.display(),
        bytes = audio.len(),
        media_type = %audio.media_type,
        "Reply audio saved"
    );
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g. "debug", "turnlink=trace")
/// - If not set, defaults to "turnlink=debug,actix_web=info"
///
/// Logs go to stderr so `text`/`audio` can print the session JSON on stdout.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnlink=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// ## Rust Concepts:
/// - **tokio::spawn**: runs the listener in a separate async task
/// - **tokio::select!**: waits for whichever signal comes first
/// - **Ordering::SeqCst**: makes the flag visible to every thread
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
