use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use transcode_factory::api::{ApiServer, AppState};
use transcode_factory::config::{FactoryConfig, resolve_config_path};
use transcode_factory::database::{self, JobRepository, SqlxJobRepository};
use transcode_factory::encoder::{Encoder, FfmpegEncoder};
use transcode_factory::hub::{self, HubConfig};
use transcode_factory::logging;
use transcode_factory::pipeline::{Pipeline, SchedulerContext};

/// Single-node media transcode factory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config_path = resolve_config_path(args.config);
    let config = FactoryConfig::load(Some(&config_path))
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let _log_guard =
        logging::init_logging(&config.app_log_directory).context("Failed to initialize logging")?;

    info!(
        config = %config_path.display(),
        db = %config.db_path.display(),
        transcode_limit = config.transcode_limit,
        crop_limit = config.crop_limit,
        copy_limit = config.copy_limit,
        "transcode-factory starting"
    );

    std::fs::create_dir_all(&config.log_directory).with_context(|| {
        format!(
            "Failed to create encoder log directory {}",
            config.log_directory.display()
        )
    })?;

    let (pool, write_pool) = database::open(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let repo: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool, write_pool));

    let cancel = CancellationToken::new();
    logging::start_retention_cleanup(config.app_log_directory.clone(), cancel.child_token());

    let (hub, hub_tasks) = hub::start(repo.clone(), HubConfig::default(), cancel.clone());
    let encoder: Arc<dyn Encoder> = Arc::new(FfmpegEncoder::new(
        &config.ffmpeg_path,
        &config.ffprobe_path,
    ));
    let ctx = Arc::new(SchedulerContext::new(
        repo,
        encoder,
        hub,
        config.pipeline_config(),
        cancel.clone(),
    ));

    let pipeline = Pipeline::start(ctx.clone())
        .await
        .context("Failed to start the pipeline")?;

    let server = ApiServer::new(
        config.listen_addr()?,
        AppState::new(ctx.clone()),
        cancel.clone(),
    );
    let server_task = tokio::spawn(server.run());

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("API server failed: {}", e);
            cancel.cancel();
        }
        Err(e) => {
            error!("API server task panicked: {}", e);
            cancel.cancel();
        }
    }

    pipeline.join().await;
    hub_tasks.join().await;
    info!("transcode-factory stopped");

    Ok(())
}
