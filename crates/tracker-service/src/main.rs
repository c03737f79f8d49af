use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracker_core::drives::mounted_volumes;
use tracker_core::identity::DeviceIdentity;
use tracker_core::paths::{data_dir, settings_path, state_dir};
use tracker_core::scrub::SystemProbe;
use tracker_core::settings::TrackerSettings;
use tracker_core::storage::{load_settings, save_settings};
use tracker_core::telemetry::{LogSink, TelemetrySink};
use tracker_service::service::{ServiceContext, TrackerService};
use tracker_service::sink::HttpSink;
use tracker_service::source::build_source;
use tracker_service::BUILD_VERSION;

#[derive(Parser, Debug)]
#[command(author, version, about = "File access telemetry service", long_about = None)]
struct Cli {
    /// Log at debug level, including every dispatched record
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tracker until interrupted
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print this machine's pseudonymous device id
    DeviceId {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run { data_dir } => run_command(data_dir).await,
        Commands::DeviceId { data_dir } => device_id_command(data_dir),
    }
}

/// The platform data dir is only looked up when no override is given; it
/// needs a home directory.
fn resolve_data_dir(data_dir_override: Option<PathBuf>) -> Result<PathBuf> {
    match data_dir_override {
        Some(dir) => Ok(dir),
        None => data_dir(),
    }
}

fn load_or_init_settings(data: &Path) -> Result<TrackerSettings> {
    std::fs::create_dir_all(data)
        .with_context(|| format!("creating data directory {}", data.display()))?;
    let path = settings_path(data);
    let mut settings = load_settings(&path)?;
    if !path.exists() {
        save_settings(&path, &settings)?;
        info!(path = %path.display(), "wrote default settings");
    }
    settings.apply_env_overrides();
    settings.validate()?;
    Ok(settings)
}

fn device_id_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir_override)?;
    load_or_init_settings(&data)?;
    let identity = DeviceIdentity::detect(BUILD_VERSION);
    println!("Device ID: {}", identity.device_id());
    println!("Build: {}", identity.build_version());
    Ok(())
}

async fn run_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = resolve_data_dir(data_dir_override)?;
    let settings = load_or_init_settings(&data)?;
    let identity = Arc::new(DeviceIdentity::detect(BUILD_VERSION));
    info!(device_id = %identity.device_id(), build = BUILD_VERSION, "device identity ready");

    let mut http_sink = None;
    let sink: Arc<dyn TelemetrySink> = match &settings.telemetry.endpoint {
        Some(endpoint) => {
            let (sink, handle) = HttpSink::spawn(endpoint.clone(), &settings.telemetry, &identity)?;
            http_sink = Some((sink.clone(), handle));
            sink as Arc<dyn TelemetrySink>
        }
        None => {
            warn!("no telemetry endpoint configured; records go to the log only");
            Arc::new(LogSink)
        }
    };

    // No kernel trace provider is linked into this build.
    let source = build_source(&settings, None)?;

    let snapshot_roots = if settings.snapshot.roots.is_empty() {
        mounted_volumes().into_iter().map(|v| v.mount_point).collect()
    } else {
        settings.snapshot.roots.iter().map(PathBuf::from).collect()
    };
    let ctx = ServiceContext {
        identity,
        sink,
        probe: Arc::new(SystemProbe::new()),
        state_dir: state_dir(&data),
        metrics_interval: Duration::from_secs(settings.metrics_interval_secs),
        snapshot_enabled: settings.snapshot.enabled,
        snapshot_roots,
    };

    let mut service = TrackerService::new(ctx, vec![source]);
    service.start()?;
    info!("service started");
    signal::ctrl_c().await?;
    info!("service stopping");
    let report = service.stop().await?;
    if let Some(dispatch) = report.dispatch {
        info!(
            dispatched = dispatch.dispatched,
            drained = dispatch.drained,
            "final dispatch totals"
        );
    }

    if let Some((sink, handle)) = http_sink {
        sink.shutdown();
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("telemetry sink did not flush in time");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_data_dir(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[test]
    fn first_run_writes_default_settings() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let settings = load_or_init_settings(&data).unwrap();
        assert!(settings_path(&data).exists());
        assert_eq!(settings.metrics_interval_secs, 60);
    }
}
