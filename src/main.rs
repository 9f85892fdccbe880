use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use offsync::cache::SqliteStorage;
use offsync::logging;
use offsync::net::{HttpFetcher, Method, Request};
use offsync::{Config, ControlMessage, Engine, EngineEvent, EventOutcome, Providers};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "An offline-first response cache and background sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  /// Keep cache and queues in memory only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Serve JSON-line control messages on stdin until EOF
  Run {
    /// Seconds between maintenance heartbeats
    #[arg(long, default_value_t = 60)]
    heartbeat: u64,
  },
  /// Route one request through the engine
  Fetch {
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    #[arg(short, long)]
    body: Option<String>,
  },
  /// Print cache and queue status
  Status,
  /// Replay queued mutations and analytics now
  Sync,
  /// Delete every cache tier and both queues
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(&logging::default_log_dir(), args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let engine = Arc::new(start_engine(config, args.ephemeral).await?);

  match args.command.unwrap_or(Command::Run { heartbeat: 60 }) {
    Command::Run { heartbeat } => serve(engine, Duration::from_secs(heartbeat)).await?,
    Command::Fetch { url, method, body } => fetch(&engine, &url, &method, body).await?,
    Command::Status => {
      emit(&engine.status().await)?;
    }
    Command::Sync => {
      let results = engine.scheduler().run_cycle().await.unwrap_or_default();
      let analytics = engine.scheduler().sync_analytics().await;
      info!(?analytics, "analytics sync finished");
      emit(&results)?;
    }
    Command::Clear => {
      engine.clear().await;
      eprintln!("Cache and queues cleared");
    }
  }

  Ok(())
}

async fn start_engine(config: Config, ephemeral: bool) -> Result<Engine> {
  let fetcher = Arc::new(HttpFetcher::new()?);
  let providers = if ephemeral {
    Providers::memory(fetcher)
  } else {
    let path = match config.database_path() {
      Some(path) => path,
      None => SqliteStorage::default_path()?,
    };
    info!(path = %path.display(), "opening storage");
    Providers::sqlite(SqliteStorage::open(&path)?, fetcher)
  };

  Engine::start(config, providers).await
}

async fn serve(engine: Arc<Engine>, heartbeat: Duration) -> Result<()> {
  engine.dispatch(EngineEvent::Install).await;
  engine.dispatch(EngineEvent::Activate).await;

  let (stop_tx, stop_rx) = oneshot::channel::<()>();
  let (mut notifications, background) = engine.spawn(heartbeat, async move {
    let _ = stop_rx.await;
  });

  let mut lines = BufReader::new(tokio::io::stdin()).lines();

  loop {
    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line? else { break };
        if line.trim().is_empty() {
          continue;
        }
        if let Some(message) = ControlMessage::parse(&line) {
          if let EventOutcome::Reply(reply) = engine.dispatch(EngineEvent::Message(message)).await {
            emit(&reply)?;
          }
        }
      }
      notification = notifications.recv() => match notification {
        Ok(notification) => emit(&notification)?,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "notification stream lagged");
        }
        Err(broadcast::error::RecvError::Closed) => break,
      },
    }
  }

  let _ = stop_tx.send(());
  background
    .await
    .map_err(|e| eyre!("Background loop failed: {}", e))?;
  Ok(())
}

async fn fetch(engine: &Engine, url: &str, method: &str, body: Option<String>) -> Result<()> {
  let method = Method::parse(method).ok_or_else(|| eyre!("Unsupported method: {}", method))?;
  let mut request = Request::new(method, engine.config().resolve(url)?);
  if let Some(body) = body {
    request = request
      .with_header("Content-Type", "application/json")
      .with_body(body);
  }

  let outcome = engine.dispatch(EngineEvent::Fetch(request)).await;
  engine.settle().await;

  let EventOutcome::Response(result) = outcome else {
    return Err(eyre!("Unexpected engine outcome: {:?}", outcome));
  };
  eprintln!("{} ({:?})", result.response.status, result.source);
  println!("{}", result.response.text());
  Ok(())
}

/// Write one JSON line to stdout.
fn emit<T: Serialize>(value: &T) -> Result<()> {
  let line = serde_json::to_string(value)?;
  let mut stdout = std::io::stdout().lock();
  writeln!(stdout, "{}", line)?;
  stdout.flush()?;
  Ok(())
}
