use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use tripsync::protocol::{EntityKey, TripRecord};
use tripsync::{
    ApiClient, ApiError, ConfigError, Credential, RealtimeSyncClient, SharedCache, SyncConfig, TripSource, TripWatcher,
    WatchOptions, WatchTarget,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing token; pass --token or set TRIPSYNC_TOKEN")]
    MissingToken,
    #[error("nothing to watch; pass trip ids or --mine")]
    NothingToWatch,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "tripsync", about = "Trip status API and realtime watch CLI")]
struct Cli {
    #[arg(long, env = "TRIPSYNC_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "TRIPSYNC_REALTIME_URL")]
    realtime_url: Option<String>,

    #[arg(long, env = "TRIPSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Trip(TripCommand),
    /// Mount watchers and print the cache on every change until Ctrl-C.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct TripCommand {
    #[command(subcommand)]
    command: TripSubcommand,
}

#[derive(Subcommand, Debug)]
enum TripSubcommand {
    Get {
        trip_id: String,
    },
    List,
    Cancel {
        trip_id: String,
    },
    SelectGuide {
        trip_id: String,
        #[arg(long)]
        guide: String,
    },
    Pay {
        trip_id: String,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    trip_ids: Vec<String>,

    #[arg(long, default_value_t = false, help = "Watch the authenticated user's trip list")]
    mine: bool,

    #[arg(long, help = "Override the reconciliation interval")]
    poll_interval_ms: Option<u64>,
}

impl WatchArgs {
    fn targets(&self) -> Vec<WatchTarget> {
        let mut targets: Vec<WatchTarget> = self.trip_ids.iter().map(|id| WatchTarget::Trip(EntityKey::from(id.as_str()))).collect();
        if self.mine {
            targets.push(WatchTarget::MyTrips);
        }
        targets
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = load_config(&cli, |key| std::env::var(key).ok())?;
    let credential = cli.token.as_deref().map(Credential::bearer).ok_or(CliError::MissingToken)?;

    match cli.command {
        Command::Trip(trip) => run_trip(&config, &credential, trip).await,
        Command::Watch(args) => run_watch(&config, credential, args).await,
    }
}

/// Flags take precedence over the environment for the endpoint URLs.
fn load_config(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Result<SyncConfig, ConfigError> {
    SyncConfig::from_lookup(|key| match key {
        "TRIPSYNC_API_URL" => cli.api_url.clone(),
        "TRIPSYNC_REALTIME_URL" => cli.realtime_url.clone(),
        other => env(other),
    })
}

async fn run_trip(config: &SyncConfig, credential: &Credential, trip: TripCommand) -> Result<(), CliError> {
    let api = ApiClient::from_config(config, credential)?;
    match trip.command {
        TripSubcommand::Get { trip_id } => print_record(&api.fetch_trip(&trip_id.into()).await?),
        TripSubcommand::List => {
            let trips = api.fetch_trips().await?;
            print_json(&serde_json::to_value(trips)?)
        }
        TripSubcommand::Cancel { trip_id } => print_record(&api.cancel_trip(&trip_id.into()).await?),
        TripSubcommand::SelectGuide { trip_id, guide } => print_record(&api.select_guide(&trip_id.into(), &guide).await?),
        TripSubcommand::Pay { trip_id } => print_record(&api.pay_trip(&trip_id.into()).await?),
    }
}

async fn run_watch(config: &SyncConfig, credential: Credential, args: WatchArgs) -> Result<(), CliError> {
    let targets = args.targets();
    if targets.is_empty() {
        return Err(CliError::NothingToWatch);
    }

    let api: Arc<dyn TripSource> = Arc::new(ApiClient::from_config(config, &credential)?);
    let sync = RealtimeSyncClient::websocket(config.realtime_url.clone(), config.reconnect);
    sync.connect(credential);

    let mut options = WatchOptions::from(config);
    if let Some(ms) = args.poll_interval_ms {
        options.poll_interval = Duration::from_millis(ms.max(1));
    }

    let cache = SharedCache::default();
    let mut watchers = Vec::with_capacity(targets.len());
    for target in targets {
        watchers.push(TripWatcher::mount(&sync, Arc::clone(&api), cache.clone(), target, options).await);
    }
    info!(watchers = watchers.len(), realtime_url = %config.realtime_url, "watching; Ctrl-C to stop");

    let mut changes = cache.changes();
    let mut statuses = sync.status_changes();
    print_snapshot(&cache)?;

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => break signal.map_err(CliError::from),
            changed = changes.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                if let Err(error) = print_snapshot(&cache) {
                    break Err(error);
                }
            }
            changed = statuses.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let status = *statuses.borrow_and_update();
                info!(?status, "realtime status changed");
            }
        }
    };

    for watcher in watchers {
        watcher.unmount().await;
    }
    sync.disconnect();
    result
}

fn print_snapshot(cache: &SharedCache) -> Result<(), CliError> {
    let line = json!({ "revision": cache.revision(), "trips": cache.snapshot() });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn print_record(record: &TripRecord) -> Result<(), CliError> {
    print_json(&serde_json::to_value(record)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
