mod cache;
mod config;
mod control;
mod db;
mod error;
mod lifecycle;
mod logging;
mod net;
mod router;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use cache::CacheSource;
use db::Database;
use lifecycle::GenerationState;
use net::{HttpNetwork, Network, Request, Response};
use worker::{Event, EventOutcome, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline-first request interception cache with versioned store generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to daily files in this directory instead of stderr
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve requests through the interceptor and print the responses
  Fetch {
    /// Absolute URLs or paths relative to the configured origin
    #[arg(required = true)]
    targets: Vec<String>,
    /// Request method; anything but GET bypasses the cache
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Extra request header, "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Print status and headers before the body
    #[arg(short, long)]
    include: bool,
  },
  /// Show which strategy each target would use
  Classify {
    #[arg(required = true)]
    targets: Vec<String>,
  },
  /// Provision the configured generation
  Install,
  /// Activate the waiting generation, retiring all others
  Activate,
  /// Send a control message, e.g. '{"type":"SKIP_WAITING"}'
  Message { message: String },
  /// List generations and their stores
  Status {
    /// Also list the URLs held by each store
    #[arg(long)]
    entries: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let log_dir = args.log_dir.or_else(|| config.log.directory.clone());
  let _log_guard = logging::init(log_dir.as_deref())?;

  let db = Arc::new(Database::open(config.store.path.as_deref())?);
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(&config)?);
  let worker = ServiceWorker::new(config.clone(), db, network.clone())?;

  match args.command {
    Command::Fetch {
      targets,
      method,
      headers,
      include,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

      for target in targets {
        let mut request = Request::new(method.clone(), config.resolve(&target)?);
        for header in &headers {
          let (name, value) = header
            .split_once(':')
            .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
          request = request.with_header(name.trim(), value.trim());
        }
        fetch(&worker, network.as_ref(), request, include).await?;
      }
    }
    Command::Classify { targets } => {
      for target in targets {
        let request = Request::get(config.resolve(&target)?);
        match worker.classify(&request) {
          Some(decision) => println!("{}\t{}\t{:?}", request.url, decision.strategy, decision.rule),
          None => println!("{}\tpass-through", request.url),
        }
      }
    }
    Command::Install => {
      if let EventOutcome::Installed {
        installed,
        activated,
      } = worker.dispatch(Event::Install).await?
      {
        println!(
          "{}: {} ({} entries)",
          installed.generation, installed.state, installed.entries
        );
        if let Some(generation) = activated {
          println!("{}: active", generation);
        }
      }
    }
    Command::Activate => {
      if let EventOutcome::Activated(activated) = worker.dispatch(Event::Activate).await? {
        report_activation(activated, worker.current());
      }
    }
    Command::Message { message } => {
      if let EventOutcome::Messaged(activated) = worker.dispatch(Event::Message(message)).await? {
        report_activation(activated, worker.current());
      }
    }
    Command::Status { entries } => {
      for status in worker.status()? {
        let record = &status.record;
        let since = match (record.state, record.activated_at, record.retired_at) {
          (GenerationState::Retired, _, Some(at)) => format!("retired {}", at.format("%Y-%m-%d %H:%M:%S")),
          (_, Some(at), _) => format!("activated {}", at.format("%Y-%m-%d %H:%M:%S")),
          _ => format!("created {}", record.created_at.format("%Y-%m-%d %H:%M:%S")),
        };
        println!(
          "{}\t{}\t{} entries\t{}",
          record.generation, record.state, status.entries, since
        );

        if entries {
          for url in worker.entries(&record.generation)? {
            println!("  {}", url);
          }
        }
      }
    }
  }

  Ok(())
}

async fn fetch(
  worker: &ServiceWorker,
  network: &dyn Network,
  request: Request,
  include: bool,
) -> Result<()> {
  let url = request.url.clone();

  let outcome = worker.dispatch(Event::Fetch(request.clone())).await?;
  let EventOutcome::Fetched(intercepted) = outcome else {
    return Err(eyre!("Unexpected outcome for fetch of {}", url));
  };

  match intercepted {
    Some(Ok(mut resolved)) => {
      print_response(&resolved.response, Some(resolved.source), include)?;
      // Let background writes land before the process exits
      resolved.settle().await;
    }
    Some(Err(e)) => return Err(eyre!("Failed to fetch {}: {}", url, e)),
    None => {
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;
      print_response(&response, None, include)?;
    }
  }

  Ok(())
}

fn print_response(response: &Response, source: Option<CacheSource>, include: bool) -> Result<()> {
  let mut out = std::io::stdout().lock();

  if include {
    let source = match source {
      Some(CacheSource::Network) => "network",
      Some(CacheSource::Cache) => "cache",
      Some(CacheSource::Synthetic) => "synthetic",
      None => "pass-through",
    };
    writeln!(out, "HTTP {} ({})", response.status, source)?;
    for (name, value) in &response.headers {
      writeln!(out, "{}: {}", name, value)?;
    }
    writeln!(out)?;
  }

  out.write_all(&response.body)?;
  out.flush()?;
  Ok(())
}

fn report_activation(
  activated: Option<lifecycle::Generation>,
  current: Option<lifecycle::Generation>,
) {
  match (activated, current) {
    (Some(generation), _) => println!("{}: active", generation),
    (None, Some(current)) => println!("nothing waiting; {} stays active", current),
    (None, None) => println!("nothing waiting; no active generation"),
  }
}
