use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_realtime::http::{create_router, AppState, CaptureFactory, DeviceCaptureFactory};
use loqa_realtime::{Collaborators, Config, SessionController, SessionState, Voice};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "loqa-realtime")]
#[command(about = "Realtime voice sessions with a remote speech model")]
struct Cli {
    /// Config file (extension optional)
    #[arg(short, long, default_value = "config/loqa-realtime")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one session until Ctrl-C
    Run {
        /// Replay a WAV file instead of the microphone
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Voice for the assistant
        #[arg(long)]
        voice: Option<Voice>,

        /// Instructions for the model
        #[arg(long)]
        instructions: Option<String>,

        /// Resume (or name) a session
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Serve the HTTP control API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("Loqa Realtime v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    match cli.command {
        Command::Run {
            wav,
            voice,
            instructions,
            session_id,
        } => run(cfg, wav, voice, instructions, session_id).await,
        Command::Serve => serve(cfg).await,
    }
}

async fn run(
    cfg: Config,
    wav: Option<PathBuf>,
    voice: Option<Voice>,
    instructions: Option<String>,
    session_id: Option<String>,
) -> Result<()> {
    let mut session_config = cfg.session.clone();
    if let Some(voice) = voice {
        session_config.voice = voice;
    }
    if let Some(instructions) = instructions {
        session_config.instructions = instructions;
    }
    if let Some(session_id) = session_id {
        session_config.session_id = session_id;
    }

    let wav = wav.map(|p| p.to_string_lossy().into_owned());
    let capture = DeviceCaptureFactory.create(&session_config, wav.as_deref())?;
    let collaborators = Collaborators {
        connector: cfg.connector(),
        credentials: cfg.credentials(),
        store: cfg.open_store().await?,
        capture,
    };

    let session = Arc::new(SessionController::new(session_config, collaborators)?);
    let mut states = session.subscribe();

    session
        .start()
        .await
        .context("Failed to start voice session")?;
    info!("Session {} is live. Press Ctrl-C to stop.", session.session_id());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if let SessionState::Failed(failure) = &state {
                    warn!("Session failed: {:?}: {}", failure.reason, failure.message);
                    break;
                }
                if state.is_terminal() {
                    break;
                }
            }
        }
    }

    let stats = session.stop().await?;
    for turn in session.transcript().await {
        info!("[{:?}#{}] {}", turn.role, turn.sequence, turn.text());
    }
    info!(
        "Session ended: {} user turn(s), {} assistant turn(s), {} reconnect(s)",
        stats.user_turns, stats.assistant_turns, stats.reconnects
    );

    if let Some(failure) = stats.last_error {
        anyhow::bail!("Session failed ({:?}): {}", failure.reason, failure.message);
    }
    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    let state = AppState::new(
        cfg.session.clone(),
        cfg.connector(),
        cfg.credentials(),
        cfg.open_store().await?,
        Arc::new(DeviceCaptureFactory),
    )
    .with_retention(Duration::from_secs(cfg.service.http.session_retention_secs));

    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweeper.evict_finished().await;
        }
    });

    let app = create_router(state);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
