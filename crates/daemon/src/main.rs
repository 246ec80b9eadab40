use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thea_core::adapters::{OsFilesystem, SystemClock};
use thea_core::metadata::{MetadataFetcher, OmdbFetcher};
use thea_core::store::{MediaStore, PostgresMediaStore};
use thea_core::transcode::{FfmpegRunner, TranscoderRunner};
use thea_core::workflow::WorkflowSet;
use thea_core::{
    default_config_path, load_config, validate_config, Config, Orchestrator, Queue,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let config = match load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("thea: {e:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    info!("--- starting Thea (version {VERSION}) ---");

    match run(config).await {
        Ok(()) => info!("--- Thea shut down cleanly ---"),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

fn load() -> Result<Config> {
    let config_path = std::env::var("THEA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path());

    let config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    validate_config(&config).context("configuration validation failed")?;
    Ok(config)
}

fn init_logging(config: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.filter_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: Config) -> Result<()> {
    info!(
        import = %config.formatter.import_path.display(),
        output = %config.formatter.output_path.display(),
        "configuration loaded"
    );

    let queue = Arc::new(Queue::open(&config.cache_path).context("failed to open queue cache")?);

    let store: Arc<dyn MediaStore> = Arc::new(
        PostgresMediaStore::connect(&config.database.url())
            .await
            .context("failed to connect to media database")?,
    );

    let omdb_config = config
        .omdb_config()
        .context("omdb_api_key is required")?;
    let fetcher: Arc<dyn MetadataFetcher> = Arc::new(
        OmdbFetcher::new(omdb_config).context("failed to construct metadata fetcher")?,
    );

    let runner: Arc<dyn TranscoderRunner> = Arc::new(FfmpegRunner::new(config.runner_config()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator_config(),
        queue,
        Arc::new(WorkflowSet::new()),
        store,
        fetcher,
        runner,
        Arc::new(OsFilesystem),
        Arc::new(SystemClock),
    ));

    orchestrator
        .start()
        .await
        .context("orchestrator startup failed")?;

    wait_for_signal().await;
    info!("interrupt received; shutting down");
    orchestrator.stop().await;

    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
