//! Terminal client for parley.
//!
//! stdout carries the conversation; tracing output goes to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley::capture::LineCapture;
use parley::conversation::SessionId;
use parley::synthesis::{CommandSynthesis, select_voice};
use parley::{
    ChatBackend, ChatConfig, EchoGuard, HttpBackend, OrchestratorState, StreamConsumer,
    TurnCommand, TurnEvent, TurnOrchestrator, pick_default_model,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Parley: talk to a streaming chat backend, hands-free if you like.
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a conversation. Each stdin line is one utterance.
    Chat {
        /// Reopen capture automatically after every reply.
        #[arg(long)]
        continuous: bool,

        /// Model to request instead of the configured or listed default.
        #[arg(long)]
        model: Option<String>,

        /// Do not speak replies.
        #[arg(long)]
        mute: bool,

        /// Continue an existing conversation (see `parley sessions`).
        #[arg(long)]
        session: Option<String>,
    },

    /// List models offered by the backend.
    Models,

    /// List conversations in the session registry.
    Sessions,

    /// List voices offered by the speech engine.
    Voices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parley=info,reqwest=warn,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Chat {
        continuous: false,
        model: None,
        mute: false,
        session: None,
    }) {
        Command::Chat {
            continuous,
            model,
            mute,
            session,
        } => run_chat(config, continuous, model, mute, session).await,
        Command::Models => list_models(config).await,
        Command::Sessions => list_sessions(config).await,
        Command::Voices => list_voices(config).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<ChatConfig> {
    if let Some(path) = path {
        return ChatConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let default_path = ChatConfig::default_config_path();
    if default_path.exists() {
        info!(path = %default_path.display(), "using config file");
        return ChatConfig::from_file(&default_path)
            .with_context(|| format!("loading config from {}", default_path.display()));
    }
    Ok(ChatConfig::default())
}

async fn resolve_model(backend: &HttpBackend, requested: Option<&str>) -> anyhow::Result<String> {
    if let Some(model) = requested.filter(|m| !m.trim().is_empty()) {
        return Ok(model.to_owned());
    }
    let models = match backend.list_models().await {
        Ok(models) => models,
        Err(e) => {
            warn!(code = e.code(), "model listing failed: {e}");
            Vec::new()
        }
    };
    pick_default_model(&models, None)
        .context("no model available; set backend.model in the config or pass --model")
}

async fn run_chat(
    mut config: ChatConfig,
    continuous: bool,
    model: Option<String>,
    mute: bool,
    session: Option<String>,
) -> anyhow::Result<()> {
    println!("Parley v{}", env!("CARGO_PKG_VERSION"));

    if mute {
        config.voice.output_enabled = false;
    }
    if continuous {
        config.conversation.continuous = true;
    }

    let backend = HttpBackend::new(config.backend.clone())?;
    let model = resolve_model(&backend, model.as_deref().or(config.backend.model.as_deref())).await?;
    info!(%model, base_url = %config.backend.base_url, "chat backend ready");

    let voices = if config.voice.output_enabled {
        CommandSynthesis::discover_voices(&config.voice)
            .await
            .unwrap_or_else(|e| {
                warn!(code = e.code(), "voice discovery failed: {e}");
                Vec::new()
            })
    } else {
        Vec::new()
    };
    let synthesis = CommandSynthesis::new(&config.voice, &voices);

    let guard = EchoGuard::new();
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let capture = LineCapture::new(
        line_rx,
        guard.clone(),
        Duration::from_millis(config.capture.listen_timeout_ms),
    );
    let listening = capture.listening();

    let consumer = StreamConsumer::new(
        Arc::new(backend),
        model,
        config.conversation.session_title_chars,
    );
    let mut orchestrator = TurnOrchestrator::new(
        &config,
        Box::new(capture),
        Box::new(synthesis),
        consumer,
        guard,
    );
    let events = orchestrator.subscribe();

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(route_input(command_tx.clone(), line_tx, listening));
    let renderer = tokio::spawn(render(events, cancel.clone()));

    if let Some(id) = session.filter(|id| !id.trim().is_empty()) {
        println!("Continuing conversation {id}.");
        let _ = command_tx.send(TurnCommand::ResumeSession(SessionId(id)));
    }
    if config.conversation.continuous {
        let _ = command_tx.send(TurnCommand::SetContinuous(true));
        println!("\nHands-free mode. Type an utterance when listening. Ctrl+C to quit.\n");
    } else {
        println!(
            "\nType a message, or /listen, /continuous on|off, /new, /resume <id>, /stop. Ctrl+C to quit.\n"
        );
    }
    drop(command_tx);

    // Returns on Ctrl+C, or when stdin is exhausted and the last turn is done.
    orchestrator.run(command_rx, cancel.clone()).await;
    cancel.cancel();
    let _ = renderer.await;
    Ok(())
}

/// Send each stdin line to capture when a cycle is listening, otherwise
/// treat it as a command or a typed message. Both channels close at EOF.
async fn route_input(
    commands: mpsc::UnboundedSender<TurnCommand>,
    utterances: mpsc::UnboundedSender<String>,
    listening: Arc<AtomicBool>,
) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let routed = if line.trim_start().starts_with('/') {
            match parse_command(&line) {
                Ok(command) => commands.send(command).is_ok(),
                Err(message) => {
                    println!("{message}");
                    true
                }
            }
        } else if listening.load(Ordering::SeqCst) {
            utterances.send(line).is_ok()
        } else {
            commands.send(TurnCommand::Submit(line)).is_ok()
        };
        if !routed {
            break;
        }
    }
}

fn parse_command(line: &str) -> Result<TurnCommand, String> {
    let mut words = line.trim().trim_start_matches('/').split_whitespace();
    let name = words.next().unwrap_or_default();
    let argument = words.next();
    match (name, argument) {
        ("continuous", Some("on")) => Ok(TurnCommand::SetContinuous(true)),
        ("continuous", Some("off")) => Ok(TurnCommand::SetContinuous(false)),
        ("continuous", _) => Err("usage: /continuous on|off".to_owned()),
        ("new", None) => Ok(TurnCommand::NewChat),
        ("stop", None) => Ok(TurnCommand::Stop),
        ("listen", None) => Ok(TurnCommand::StartCapture),
        ("resume", Some(id)) => Ok(TurnCommand::ResumeSession(SessionId(id.to_owned()))),
        ("resume", None) => Err("usage: /resume <session id>".to_owned()),
        _ => Err(format!(
            "unknown command `{}`; try /listen, /continuous on|off, /new, /resume <id>, /stop",
            line.trim()
        )),
    }
}

/// Print the conversation as it streams.
async fn render(mut events: broadcast::Receiver<TurnEvent>, cancel: CancellationToken) {
    let mut mid_reply = false;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(TurnEvent::StateChanged { to, .. }) => {
                    if to == OrchestratorState::Listening {
                        println!("(listening)");
                    }
                }
                Ok(TurnEvent::AssistantDelta(text)) => {
                    if !mid_reply {
                        print!("assistant: ");
                        mid_reply = true;
                    }
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                Ok(TurnEvent::AssistantFinal { text, failed }) => {
                    if failed {
                        if mid_reply {
                            println!();
                        }
                        println!("assistant: {text}");
                    } else if mid_reply {
                        println!();
                    }
                    mid_reply = false;
                }
                Ok(TurnEvent::Notice(message)) => println!("[{message}]"),
                Ok(TurnEvent::ContinuousMode { enabled }) => {
                    println!("[continuous mode {}]", if enabled { "on" } else { "off" });
                }
                Ok(TurnEvent::SessionBound(id)) => info!(session = %id, "conversation bound"),
                Ok(TurnEvent::PartialTranscript(_) | TurnEvent::UserTurn(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "renderer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn list_models(config: ChatConfig) -> anyhow::Result<()> {
    let backend = HttpBackend::new(config.backend.clone())?;
    let models = backend.list_models().await?;
    let default = pick_default_model(&models, config.backend.model.as_deref());
    if models.is_empty() {
        println!("No models listed.");
    }
    for model in &models {
        let marker = if default.as_deref() == Some(model.model.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{marker} {}", model.model);
    }
    Ok(())
}

async fn list_sessions(config: ChatConfig) -> anyhow::Result<()> {
    let backend = HttpBackend::new(config.backend)?;
    let sessions = backend.list_sessions().await?;
    if sessions.is_empty() {
        println!("No conversations yet.");
    }
    for session in sessions {
        println!(
            "{}  {}  {}",
            session.id,
            session.updated_at.as_deref().unwrap_or("-"),
            session.title
        );
    }
    Ok(())
}

async fn list_voices(config: ChatConfig) -> anyhow::Result<()> {
    let voices = CommandSynthesis::discover_voices(&config.voice).await?;
    let chosen = select_voice(&voices, &config.voice.language, &config.voice.preferred_voices);
    for voice in &voices {
        let marker = if chosen == Some(voice) { "*" } else { " " };
        println!("{marker} {:<24} {}", voice.name, voice.locale);
    }
    Ok(())
}
