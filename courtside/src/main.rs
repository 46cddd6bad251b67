//! Edge controller CLI: drives cameras, recording sessions and pipeline
//! runs on one court device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::{eyre, Context, Result};
use tracing::{info, warn};

use courtside_camera::CameraAdapter;
use courtside_catalog::{Catalog, CatalogCredentials, FirestoreCatalog};
use courtside_config::{parse_config_file, CourtsideConfig};
use courtside_encode::{BatchEncodeFleet, EncodeFleet, FleetConfig};
use courtside_log::LogRing;
use courtside_pipeline::{
    CameraSources, PipelineConfig, PipelineDeps, PipelineOrchestrator,
};
use courtside_recorder::{RecorderConfig, RecordingController, StopOutcome};
use courtside_registry::{RegistryClient, VideoRegistry};
use courtside_transfer::{S3ChapterStore, TransferConfig, TransferEngine, TransferPath};

#[derive(Debug, Parser)]
#[command(author, version, about = "courtside edge controller")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, env = "COURTSIDE_CONFIG", default_value = "courtside.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List cameras reachable over the USB-Ethernet links.
    Discover,
    /// Record one session on one camera, from arm to drain.
    Record {
        #[arg(long)]
        interface: String,
        /// Stop automatically after this many seconds; default waits for
        /// ctrl-c.
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Pipeline operations.
    #[command(subcommand)]
    Pipeline(PipelineCommand),
    /// Catalog session queries.
    #[command(subcommand)]
    Sessions(SessionsCommand),
}

#[derive(Debug, Subcommand)]
enum PipelineCommand {
    /// Run the pipeline over sessions pending upload, or explicit ids.
    Run {
        #[arg(long)]
        pending: bool,
        #[arg(long = "session")]
        sessions: Vec<String>,
        /// Leave camera storage alone even on full success.
        #[arg(long)]
        keep_sd: bool,
    },
    /// List persisted runs.
    List,
    /// Show one run's persisted state.
    Status {
        #[arg(long)]
        run: String,
    },
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// Sessions recorded here that still need chapter upload.
    Pending,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        parse_config_file(&cli.config)
            .wrap_err_with(|| format!("reading {}", cli.config.display()))?
    } else {
        let mut cfg = CourtsideConfig::default();
        cfg.apply_env()?;
        cfg
    };

    let ring = LogRing::new();
    let log_path = config.log_dir.join("courtside.log");
    let _log_guard = courtside_log::initiate_logging(Some(&log_path), ring, false)
        .map_err(|e| eyre!("logging setup failed: {e}"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("courtside-runtime")
        .build()?;
    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Command, config: CourtsideConfig) -> Result<()> {
    match command {
        Command::Discover => discover(&config).await,
        Command::Record {
            interface,
            duration,
        } => record(&config, &interface, duration).await,
        Command::Pipeline(cmd) => pipeline(&config, cmd).await,
        Command::Sessions(SessionsCommand::Pending) => sessions_pending(&config).await,
    }
}

fn camera_adapter(config: &CourtsideConfig) -> Result<Arc<CameraAdapter>> {
    Ok(Arc::new(CameraAdapter::new(
        config.camera_angle_map.clone(),
    )?))
}

fn catalog_client(config: &CourtsideConfig) -> Result<Arc<dyn Catalog>> {
    let path = config
        .catalog
        .credentials_path
        .as_ref()
        .ok_or_else(|| eyre!("no catalog credentials path configured"))?;
    let credentials = CatalogCredentials::from_file(path)?;
    Ok(Arc::new(FirestoreCatalog::new(credentials)?))
}

fn registry_client(config: &CourtsideConfig) -> Option<Arc<dyn VideoRegistry>> {
    let registry = config.registry.as_ref()?;
    match RegistryClient::new(
        &registry.backend_url,
        &registry.auth_email,
        &registry.auth_password,
    ) {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            warn!("video registry unavailable: {err}");
            None
        }
    }
}

async fn discover(config: &CourtsideConfig) -> Result<()> {
    let adapter = camera_adapter(config)?;
    let cameras = adapter.discover().await?;
    if cameras.is_empty() {
        println!("no cameras found");
        return Ok(());
    }
    for cam in cameras {
        let angle = cam
            .angle
            .map(|a| a.to_string())
            .unwrap_or_else(|| "UNK".to_string());
        println!(
            "{}\t{}\t{}\t{}",
            cam.interface,
            cam.peer_ip,
            angle,
            if cam.name.is_empty() { "-" } else { &cam.name }
        );
    }
    Ok(())
}

async fn record(
    config: &CourtsideConfig,
    interface: &str,
    duration: Option<u64>,
) -> Result<()> {
    let adapter = camera_adapter(config)?;
    let controller = RecordingController::new(
        adapter.clone(),
        RecorderConfig {
            recorder_exe: config.recorder_exe.clone(),
            ..RecorderConfig::default()
        },
    );

    let started = controller.start(interface).await?;
    println!(
        "recording on {} ({}, angle {})",
        interface,
        started.camera_name,
        started
            .angle
            .map(|a| a.to_string())
            .unwrap_or_else(|| "UNK".to_string())
    );

    // Sessions without one of the four angles are never persisted; they can
    // still be recorded and drained locally.
    let catalog = match catalog_client(config) {
        Ok(catalog) => Some(catalog),
        Err(err) => {
            warn!("catalog unavailable, session will not be registered: {err}");
            None
        }
    };
    let session_id = match (&catalog, started.angle) {
        (Some(catalog), Some(angle)) => {
            let id = catalog
                .create_session(
                    &config.jetson_id,
                    &started.camera_name,
                    angle,
                    &started.segment_session,
                    interface,
                )
                .await?;
            Some(id)
        }
        _ => None,
    };

    match duration {
        Some(secs) => {
            println!("recording for {secs}s ...");
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        None => {
            println!("recording; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    match controller.stop(interface).await? {
        StopOutcome::ArmCancelled { error } => {
            println!("recording never confirmed: {error}");
        }
        StopOutcome::Drained(outcome) => {
            println!(
                "drained {} chapters, {} bytes",
                outcome.chapters.len(),
                outcome.total_bytes
            );
            if let (Some(catalog), Some(id)) = (&catalog, &session_id) {
                catalog
                    .finalize_session(
                        id,
                        outcome.ended_at,
                        outcome.chapters.len() as u32,
                        outcome.total_bytes,
                    )
                    .await?;
                info!("session {id} finalized in the catalog");
            }
            for chapter in &outcome.chapters {
                println!("  {}/{} ({} bytes)", chapter.directory, chapter.filename, chapter.size_bytes);
            }
        }
    }
    Ok(())
}

async fn build_orchestrator(
    config: &CourtsideConfig,
    catalog: Arc<dyn Catalog>,
    keep_sd: bool,
) -> Result<Arc<PipelineOrchestrator>> {
    let adapter = camera_adapter(config)?;

    let transfer_config = TransferConfig {
        chunk_size: config.download.chunk_size,
        connect_timeout: Duration::from_secs(config.download.connect_timeout_secs),
        read_timeout: Duration::from_secs(config.download.read_timeout_secs),
        max_retries: config.download.max_retries,
        ..TransferConfig::default()
    };

    let pipeline_config = PipelineConfig {
        jetson_id: config.jetson_id.clone(),
        location: config.upload.location.clone(),
        state_dir: config.state_dir.clone(),
        auto_delete_sd: config.upload.delete_after_upload && !keep_sd,
        transfer_path: TransferPath::Streaming,
        keep_alive_interval: Duration::from_secs(config.download.keep_alive_secs),
        ..PipelineConfig::default()
    };

    let store = S3ChapterStore::from_env(&config.upload.region, config.upload.bucket.clone()).await;
    let engine = Arc::new(TransferEngine::new(Arc::new(store), transfer_config));

    let encode: Option<Arc<dyn EncodeFleet>> = if config.batch.use_gpu_transcode {
        let fleet_config = FleetConfig {
            job_queue: config.batch.job_queue.clone(),
            job_queue_large: config.batch.job_queue_large.clone(),
            job_definition: config.batch.job_definition.clone(),
            job_definition_extract: config.batch.job_definition_extract.clone(),
            bucket: config.upload.bucket.clone(),
        };
        let fleet = BatchEncodeFleet::from_env(&config.batch.region, fleet_config).await;
        Some(Arc::new(fleet))
    } else {
        None
    };

    let deps = PipelineDeps {
        catalog,
        cameras: adapter,
        sources: Arc::new(CameraSources {
            connect_timeout: Duration::from_secs(config.download.connect_timeout_secs),
        }),
        engine,
        encode,
        registry: registry_client(config),
    };
    Ok(Arc::new(PipelineOrchestrator::new(pipeline_config, deps)))
}

async fn pipeline(config: &CourtsideConfig, command: PipelineCommand) -> Result<()> {
    match command {
        PipelineCommand::Run {
            pending,
            sessions,
            keep_sd,
        } => {
            let catalog = catalog_client(config)?;
            let mut selected = Vec::new();
            if pending {
                selected = catalog.pending_upload(&config.jetson_id).await?;
            }
            for id in &sessions {
                match catalog.get_session(id).await? {
                    Some(doc) => selected.push(doc),
                    None => warn!("session {id} not found in the catalog"),
                }
            }
            if selected.is_empty() {
                println!("nothing to do: no sessions selected");
                return Ok(());
            }

            let orchestrator = build_orchestrator(config, catalog, keep_sd).await?;
            let state = orchestrator.run(selected).await;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        PipelineCommand::List => {
            for run in courtside_pipeline::list_runs(&config.state_dir) {
                println!(
                    "{}\t{:?}\t{}\tsessions {}/{}\tgames {}/{}",
                    run.pipeline_id,
                    run.status,
                    run.created_at,
                    run.sessions_completed,
                    run.total_sessions,
                    run.games_completed,
                    run.total_games
                );
            }
            Ok(())
        }
        PipelineCommand::Status { run } => {
            let path = config.state_dir.join(format!("{run}.json"));
            let contents = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("no state for run {run}"))?;
            println!("{contents}");
            Ok(())
        }
    }
}

async fn sessions_pending(config: &CourtsideConfig) -> Result<()> {
    let catalog = catalog_client(config)?;
    let pending = catalog.pending_upload(&config.jetson_id).await?;
    if pending.is_empty() {
        println!("no sessions pending upload");
        return Ok(());
    }
    for session in pending {
        println!(
            "{}\t{}\t{}\t{} chapters\t{} bytes",
            session.id,
            session.angle_code,
            session.segment_session,
            session.total_chapters,
            session.total_size_bytes
        );
    }
    Ok(())
}
