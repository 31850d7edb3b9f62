mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use offsync::{logging, App, Config};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline cache, mutation queue and sync for web clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Server origin, overriding the config file
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.server.origin = origin;
  }

  let _log_guard = logging::init(&config.logging)?;

  let app = App::new(config).await?;
  let outcome = commands::run(&app, args.command).await;
  app.shutdown();
  outcome
}
