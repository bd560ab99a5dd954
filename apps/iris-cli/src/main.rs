mod ui;

use std::{
    env,
    fs::File,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use iris_capture::{FrameSource, ImageFileSource, SyntheticSource};
use iris_network::{Connector, LoopbackConnector, LoopbackService, WebSocketConnector};
use iris_ops::{init_tracing, init_tracing_with_writer, PreferenceStore};
use iris_orchestrator::StreamingPipeline;
use iris_types::{
    config::{IrisConfig, PrivacyConfig},
    state::UiSnapshot,
};
use tokio::{sync::watch, time::interval};
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/dev.toml";
const DASHBOARD_LOG: &str = "iris-cli.log";

#[derive(Debug, Parser)]
#[command(name = "iris-cli", about = "Stream frames to a face-analysis service")]
struct Args {
    /// TOML config file (falls back to $IRIS_CONFIG, then configs/dev.toml).
    config: Option<PathBuf>,
    /// Override the service URL from the config.
    #[arg(long)]
    url: Option<String>,
    /// Talk to the built-in simulated service instead of a real one.
    #[arg(long)]
    loopback: bool,
    /// Simulated inference latency for --loopback.
    #[arg(long, default_value_t = 120)]
    latency_ms: u64,
    /// Render a terminal dashboard instead of log lines.
    #[arg(long)]
    dashboard: bool,
    /// Stream a still image instead of the synthetic gradient.
    #[arg(long)]
    image: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.clone());
    if let Some(url) = &args.url {
        config.network.url = url.clone();
    }

    if args.dashboard {
        let file = File::create(DASHBOARD_LOG)
            .with_context(|| format!("unable to create {DASHBOARD_LOG}"))?;
        init_tracing_with_writer(&config.ops, Mutex::new(file))?;
    } else {
        init_tracing(&config.ops)?;
    }

    let preferences = match &config.ops.preferences_path {
        Some(path) => Some(PreferenceStore::open(path)?),
        None => None,
    };
    if let Some(preferences) = &preferences {
        if let Some(privacy) = preferences.get::<PrivacyConfig>("privacy").await? {
            info!("Applying saved privacy preferences");
            config.privacy = privacy;
        }
    }

    let connector: Arc<dyn Connector> = if args.loopback {
        let service =
            LoopbackService::default().with_latency(Duration::from_millis(args.latency_ms));
        Arc::new(LoopbackConnector::new(service))
    } else {
        Arc::new(WebSocketConnector::new())
    };

    match &args.image {
        Some(path) => {
            let source = ImageFileSource::open(path)?;
            drive(config.clone(), source, connector, args.dashboard).await?;
        }
        None => {
            let source = SyntheticSource::new(640, 480);
            drive(config.clone(), source, connector, args.dashboard).await?;
        }
    }

    if let Some(preferences) = preferences {
        preferences.set("privacy", &config.privacy).await?;
        preferences.set("last_url", &config.network.url).await?;
        preferences.save().await?;
    }
    Ok(())
}

async fn drive<S>(
    config: IrisConfig,
    source: S,
    connector: Arc<dyn Connector>,
    dashboard: bool,
) -> Result<()>
where
    S: FrameSource + 'static,
{
    let summary = format!(
        "{} every {}ms, max {} in flight",
        config.network.url, config.capture.interval_ms, config.throttle.max_in_flight
    );
    let mut pipeline = StreamingPipeline::start(config, source, connector)?;
    let snapshots = pipeline.subscribe();

    if dashboard {
        let mut ui = tokio::task::spawn_blocking(move || ui::run(snapshots, summary));
        tokio::select! {
            result = pipeline.run() => { result?; }
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            finished = &mut ui => {
                if let Ok(Err(err)) = finished {
                    warn!("Dashboard failed: {err}");
                }
            }
        }
        pipeline.stop();
        // The dashboard exits once the snapshot sender is gone.
        drop(pipeline);
        if !ui.is_finished() {
            let _ = ui.await;
        }
        return Ok(());
    }

    info!("Streaming to {summary}");
    tokio::select! {
        result = pipeline.run() => { result?; }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = log_summaries(snapshots) => {}
    }
    pipeline.stop();
    Ok(())
}

async fn log_summaries(snapshots: watch::Receiver<UiSnapshot>) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let snapshot = snapshots.borrow().clone();
        let perf = &snapshot.performance;
        info!(
            "{:?} | faces {} | fps {:.1} | latency avg {:.0}ms last {:.0}ms | sent {} accepted {} dropped {} timed out {}",
            snapshot.connection,
            snapshot.faces.len(),
            perf.fps,
            perf.avg_latency_ms,
            perf.last_latency_ms,
            perf.counters.sent,
            perf.counters.accepted,
            perf.counters.throttled,
            perf.counters.timed_out,
        );
        if let Some(error) = &snapshot.last_error {
            warn!("Last service error: {error}");
        }
    }
}

fn load_config(from_args: Option<PathBuf>) -> IrisConfig {
    let from_env = env::var("IRIS_CONFIG").ok().map(PathBuf::from);
    let path = from_args
        .or(from_env)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    match IrisConfig::from_file(&path) {
        Ok(cfg) => {
            if let Err(err) = cfg.validate() {
                eprintln!(
                    "Invalid config in '{}': {err}. Falling back to internal defaults.",
                    path.display()
                );
                IrisConfig::default()
            } else {
                cfg
            }
        }
        Err(err) => {
            eprintln!(
                "Failed to load config from '{}': {err}. Falling back to internal defaults.",
                path.display()
            );
            IrisConfig::default()
        }
    }
}
