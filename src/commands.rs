//! Subcommands of the offsync binary

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use offsync::event::Event;
use offsync::http::HttpRequest;
use offsync::intercept::{ControlMessage, ControlReply};
use offsync::network::NetworkEvent;
use offsync::queue::{NewQueueItem, Operation};
use offsync::sync::SyncEvent;
use offsync::worker::{Condition, SortOrder};
use offsync::App;

/// Interval between status lines in `watch`
const WATCH_TICK: Duration = Duration::from_secs(30);

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show connectivity, queue and cache status
  Status,
  /// Queue a write for the server
  Enqueue {
    /// create, update or delete
    #[arg(long)]
    operation: String,
    #[arg(long)]
    entity_type: String,
    #[arg(long)]
    entity_id: String,
    /// Target path or absolute URL
    #[arg(long)]
    url: String,
    /// JSON payload
    #[arg(long)]
    payload: Option<String>,
    /// HTTP method (default depends on the operation)
    #[arg(long)]
    method: Option<String>,
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,
  },
  /// List queued writes, oldest first
  Queue {
    /// Only items that ran out of retries
    #[arg(long)]
    failed: bool,
    #[arg(long)]
    entity_type: Option<String>,
  },
  /// Remove writes that ran out of retries
  PurgeFailed,
  /// Replay the queue once
  Sync,
  /// Fetch a path through the interception layer
  Fetch { path: String },
  /// Inspect or manage the cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Run a data operation over a file holding a JSON array
  #[command(subcommand)]
  Compute(ComputeCommand),
  /// Follow network and sync events until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Entry counts, sweeping expired entries
  Stats,
  /// Entries per interception region
  Regions,
  Get { key: String },
  Set {
    key: String,
    /// JSON value
    value: String,
    #[arg(long)]
    ttl: Option<u64>,
  },
  Delete { key: String },
  /// Drop every intercepted response, keeping data entries
  Purge,
  /// Drop everything
  Clear,
}

#[derive(Subcommand, Debug)]
pub enum ComputeCommand {
  Search {
    file: PathBuf,
    keyword: String,
    #[arg(long = "field")]
    fields: Vec<String>,
  },
  Aggregate {
    file: PathBuf,
    group_by: String,
  },
  Filter {
    file: PathBuf,
    /// JSON values; an array matches any of its members
    #[arg(long = "where", value_name = "FIELD=VALUE")]
    conditions: Vec<String>,
  },
  Sort {
    file: PathBuf,
    field: String,
    #[arg(long)]
    desc: bool,
  },
  ParseJson { file: PathBuf },
}

pub async fn run(app: &App, command: Command) -> Result<()> {
  match command {
    Command::Status => status(app).await,
    Command::Enqueue {
      operation,
      entity_type,
      entity_id,
      url,
      payload,
      method,
      headers,
    } => {
      let operation: Operation = operation.parse()?;
      let url = app.interceptor.rules().resolve(&url)?;
      let payload = payload.map(|p| parse_json(&p)).transpose()?;

      let mut item =
        NewQueueItem::new(operation, &entity_type, &entity_id, payload, url.as_str());
      if let Some(method) = method {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
          .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
        item = item.with_method(method);
      }
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Header must look like NAME:VALUE, got {}", header))?;
        item = item.with_header(name.trim(), value.trim());
      }

      print_json(&app.enqueue(item)?)
    }
    Command::Queue {
      failed,
      entity_type,
    } => {
      let items = match (failed, entity_type) {
        (true, _) => app.queue.get_failed_items()?,
        (false, Some(entity_type)) => app.queue.get_by_entity_type(&entity_type)?,
        (false, None) => app.queue.get_all()?,
      };
      print_json(&items)
    }
    Command::PurgeFailed => {
      let removed = app.queue.remove_failed_items()?;
      println!("Removed {} failed item(s)", removed);
      Ok(())
    }
    Command::Sync => {
      if !app.network.is_online() {
        println!("Offline; {} item(s) stay queued", app.sync.pending_count()?);
        return Ok(());
      }
      match app.sync.trigger_sync().await {
        Some(report) => print_json(&report),
        None => {
          println!("A sync is already running");
          Ok(())
        }
      }
    }
    Command::Fetch { path } => {
      app.interceptor.install().await;
      let url = app.interceptor.rules().resolve(&path)?;
      let response = app.interceptor.fetch(HttpRequest::get(url)).await?;
      eprintln!("{} ({:?})", response.status, response.source);
      for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
      }
      println!("{}", response.text());
      Ok(())
    }
    Command::Cache(command) => cache(app, command).await,
    Command::Compute(command) => compute(app, command).await,
    Command::Watch => watch(app).await,
  }
}

async fn status(app: &App) -> Result<()> {
  let failed = app.queue.get_failed_items()?.len();
  let stats = app.cache.stats().await?;
  print_json(&json!({
    "network": app.network.state(),
    "queue": {
      "length": app.queue.len()?,
      "failed": failed,
    },
    "sync": app.sync.state(),
    "cache": stats,
  }))
}

async fn cache(app: &App, command: CacheCommand) -> Result<()> {
  match command {
    CacheCommand::Stats => print_json(&app.cache.stats().await?),
    CacheCommand::Regions => match app.interceptor.control(ControlMessage::ReportStatus).await? {
      ControlReply::Status(status) => print_json(&status),
      other => Err(eyre!("Unexpected control reply: {:?}", other)),
    },
    CacheCommand::Get { key } => match app.cache.entry(&key).await? {
      Some(entry) => print_json(&json!({
        "value": entry.payload,
        "metadata": app.cache.metadata(&key).await?,
      })),
      None => Err(eyre!("No live entry for {}", key)),
    },
    CacheCommand::Set { key, value, ttl } => {
      app.cache.set(&key, parse_json(&value)?, ttl).await?;
      Ok(())
    }
    CacheCommand::Delete { key } => {
      app.cache.delete(&key).await?;
      Ok(())
    }
    CacheCommand::Purge => {
      app.interceptor.control(ControlMessage::PurgeAll).await?;
      Ok(())
    }
    CacheCommand::Clear => {
      app.cache.clear().await?;
      Ok(())
    }
  }
}

async fn compute(app: &App, command: ComputeCommand) -> Result<()> {
  match command {
    ComputeCommand::Search {
      file,
      keyword,
      fields,
    } => {
      let fields = (!fields.is_empty()).then_some(fields);
      print_json(&app.compute.search(read_records(&file)?, &keyword, fields).await?)
    }
    ComputeCommand::Aggregate { file, group_by } => {
      print_json(&app.compute.aggregate(read_records(&file)?, &group_by).await?)
    }
    ComputeCommand::Filter { file, conditions } => {
      let conditions = conditions
        .iter()
        .map(|c| parse_condition(c))
        .collect::<Result<BTreeMap<_, _>>>()?;
      print_json(&app.compute.filter(read_records(&file)?, conditions).await?)
    }
    ComputeCommand::Sort { file, field, desc } => {
      let order = if desc { SortOrder::Desc } else { SortOrder::Asc };
      print_json(&app.compute.sort(read_records(&file)?, &field, order).await?)
    }
    ComputeCommand::ParseJson { file } => {
      let text = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      print_json(&app.compute.parse_json(&text).await?)
    }
  }
}

async fn watch(app: &App) -> Result<()> {
  app.start().await;
  let mut events = app.events(Some(WATCH_TICK));
  println!(
    "Watching ({}); Ctrl-C to stop",
    if app.network.is_online() { "online" } else { "offline" }
  );

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.next() => match event {
        Some(event) => println!("{}", describe(app, &event)?),
        None => break,
      },
    }
  }
  Ok(())
}

fn describe(app: &App, event: &Event) -> Result<String> {
  let line = match event {
    Event::Network(NetworkEvent::Recovered) => "network recovered".to_string(),
    Event::Network(NetworkEvent::Lost) => "network lost, serving from cache".to_string(),
    Event::Network(NetworkEvent::QualityChanged(quality)) => {
      format!("connection quality {:?}", quality)
    }
    Event::Sync(SyncEvent::Started) => "sync started".to_string(),
    Event::Sync(SyncEvent::ItemSynced { item_id, success }) => {
      format!("{} {}", item_id, if *success { "synced" } else { "failed" })
    }
    Event::Sync(SyncEvent::Completed(report)) => format!(
      "sync complete: {} succeeded, {} failed",
      report.succeeded(),
      report.failed()
    ),
    Event::Sync(SyncEvent::Failed(error)) => format!("sync error: {}", error),
    Event::Tick => format!(
      "{} queued, {} retries scheduled",
      app.sync.pending_count()?,
      app.sync.scheduled_retries().len()
    ),
  };
  Ok(line)
}

fn parse_json(text: &str) -> Result<Value> {
  serde_json::from_str(text).map_err(|e| eyre!("Invalid JSON: {}", e))
}

/// `field=value`; values that are not JSON are taken as strings.
fn parse_condition(text: &str) -> Result<(String, Condition)> {
  let (field, raw) = text
    .split_once('=')
    .ok_or_else(|| eyre!("Condition must look like FIELD=VALUE, got {}", text))?;
  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  let condition = serde_json::from_value(value)
    .map_err(|e| eyre!("Invalid condition {}: {}", text, e))?;
  Ok((field.to_string(), condition))
}

fn read_records(path: &Path) -> Result<Vec<Value>> {
  let text = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  serde_json::from_str(&text)
    .map_err(|e| eyre!("{} does not hold a JSON array: {}", path.display(), e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}
