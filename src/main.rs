use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use castsync::cli::{Args, DemoAction, Mode};
use castsync::config::CastConfig;
use castsync::model::{now_ms, CastState, CommandEnvelope, CommandStatus, Identity, RoomCode, RoomMeta};
use castsync::player::PlayerSession;
use castsync::retention::Retention;
use castsync::store::{MemoryStore, RealtimeStore};
use castsync::sync::Controller;
use castsync::widget::LoggingWidget;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging(config: &CastConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn print_snapshot(state: &CastState) {
    let controls = &state.controls;
    let playing = if controls.is_playing { "playing".green() } else { "paused".yellow() };
    let muted = if controls.is_muted { "muted".dimmed() } else { "sound on".normal() };
    println!("  {} | {} | index {}", playing, muted, state.current_index);
    if state.queue.is_empty() {
        println!("  {}", "(queue empty)".dimmed());
    }
    for (i, item) in state.queue.iter().enumerate() {
        let line = format!("{:>3}. {} [{}]", i, item.title, item.video_id);
        if i == state.current_index {
            println!("  {}", line.bold().cyan());
        } else {
            println!("  {}", line);
        }
    }
}

async fn wait_terminal(store: &dyn RealtimeStore, code: &RoomCode, id: &str) -> castsync::Result<CommandEnvelope> {
    let poll = async {
        loop {
            let log = store.commands(code).await?;
            if let Some(env) = log.into_iter().find(|e| e.id == id && e.status.is_terminal()) {
                return Ok::<_, castsync::CastError>(env);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(COMMAND_TIMEOUT, poll)
        .await
        .map_err(|_| castsync::CastError::CommandExecution(format!("command {id} did not finish in time")))?
}

async fn run_demo(config: &CastConfig, code: Option<String>, actions: Vec<DemoAction>) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new(config.store.channel_capacity));
    let player = Identity::new(format!("player-{}", uuid::Uuid::new_v4()), "Demo player");

    let requested = match code {
        Some(raw) => {
            let code = RoomCode::parse(&raw)?;
            store
                .create_room(RoomMeta::new(code.clone(), player.id.clone(), now_ms()), CastState::default())
                .await?;
            Some(code)
        }
        None => None,
    };
    let session = PlayerSession::attach(
        requested,
        player,
        store.clone(),
        Arc::new(LoggingWidget::default()),
        config,
    )
    .await?;
    let sweeper = Retention::new(store.clone(), config.retention_window()).spawn(config.cleanup_interval());

    let code = session.code().clone();
    println!("{} {}", "room".bold(), code.to_string().bold().magenta());
    let controller = Controller::join(store.clone(), code.clone(), Identity::guest()).await?;

    for DemoAction(command) in actions {
        let label = command.kind();
        let sent = controller.send(command).await?;
        let done = wait_terminal(store.as_ref(), &code, &sent.id).await?;
        match done.status {
            CommandStatus::Completed => println!("{} {}", "✓".green(), label.cyan()),
            _ => println!(
                "{} {} {}",
                "✗".red(),
                label.cyan(),
                done.error.unwrap_or_default().red()
            ),
        }
        print_snapshot(&store.read_state(&code).await?);
    }

    sweeper.abort();
    let outcome = session.shutdown().await?;
    println!("{} {:?}", "left room:".dimmed(), outcome);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let (config, rejected) = CastConfig::load_reporting(args.config.as_deref())?;
    init_logging(&config);
    for warning in &rejected {
        tracing::warn!(target: "castsync::config", "{warning}");
    }

    match args.command {
        Mode::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Mode::Demo { code, actions } => run_demo(&config, code, actions).await,
    }
}
