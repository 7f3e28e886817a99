use clap::{Parser, Subcommand};
use fs2::FileExt;
use log::{info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use radio_dash::api::{self, AppState};
use radio_dash::auth::{hash_password, Auth};
use radio_dash::autodj::{AutoDj, DjSettings};
use radio_dash::bus::ChangeBus;
use radio_dash::config::Config;
use radio_dash::dash::{DashPipeline, PipelineSettings};
use radio_dash::live::{LiveController, LiveSettings};
use radio_dash::manifest::{ManifestBuilder, ManifestSettings};
use radio_dash::model::seconds;
use radio_dash::producer::{EncoderSettings, SegmentProducer};
use radio_dash::source::SourceStore;
use radio_dash::store::Store;

#[derive(Parser, Debug)]
#[command(author, version, about = "24/7 internet radio over MPEG-DASH")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broadcast engine and the editor API
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the argon2 hash of a password
    HashPassword {
        password: String,
    },
    /// Create an editor account
    AddEditor {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
        login: String,
        password: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let rt = tokio::runtime::Runtime::new()?;
    match args.command {
        Command::Serve { config } => rt.block_on(serve(config)),
        Command::HashPassword { password } => rt.block_on(async {
            println!("{}", hash_password(&password).await?);
            Ok::<(), Box<dyn std::error::Error>>(())
        }),
        Command::AddEditor {
            config,
            login,
            password,
        } => rt.block_on(add_editor(config, login, password)),
    }
}

fn ensure_dir(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .map_err(|e| format!("Failed to create directory '{}': {}", path.display(), e))?;
    Ok(())
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new(""))
}

async fn open_store(config: &Config) -> Result<Store, Box<dyn std::error::Error>> {
    ensure_dir(parent_of(&config.storage_path))?;
    let store = Store::open(&config.storage_path).await.map_err(|e| {
        format!(
            "Failed to open timeline database '{}': {}",
            config.storage_path.display(),
            e
        )
    })?;
    Ok(store)
}

async fn add_editor(
    config_path: PathBuf,
    login: String,
    password: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&config_path)?;
    let store = open_store(&config).await?;
    let hash = hash_password(&password).await?;
    let id = store.new_editor(&login, &hash).await?;
    println!("Created editor '{}' with id {}", login, id);
    Ok(())
}

async fn serve(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&config_path)?;

    // Acquire exclusive lock to prevent two engines on one timeline
    ensure_dir(parent_of(&config.storage_path))?;
    let lock_path = config.lock_path();
    let lock_file = File::create(&lock_path)
        .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path.display(), e))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        format!(
            "Another engine is already using '{}'. Lock file: {}",
            config.storage_path.display(),
            lock_path.display()
        )
    })?;

    ensure_dir(&config.content_dir)?;
    ensure_dir(parent_of(&config.manifest_path))?;
    ensure_dir(&config.source.path)?;

    let store = open_store(&config).await?;
    let bus = ChangeBus::new();
    let cancel = CancellationToken::new();
    let sources = SourceStore::new(
        &config.source.path,
        config.source.nesting_depth,
        config.source.id_length,
    );
    let auth = Auth::with_root_password(
        &config.secret,
        seconds(config.token_ttl),
        config.root_pass.as_deref(),
    )
    .await?;

    let manifest = ManifestBuilder::new(ManifestSettings {
        path: config.manifest_path.clone(),
        chunk_length: config.chunk_length(),
        buffer_time: seconds(config.buffer_time),
        buffer_depth: seconds(config.buffer_depth),
        minimum_update_period: seconds(config.client_update_freq),
        utc_timing_url: config.utc_timing_url.clone(),
    });
    let producer = SegmentProducer::new(
        &config.content_dir,
        EncoderSettings {
            program: config.encoder.program.clone(),
            args: config.encoder.args.clone(),
            chunk_length: config.chunk_length(),
        },
        store.clone(),
        sources.clone(),
    );
    let pipeline = DashPipeline::new(
        store.clone(),
        manifest,
        producer,
        PipelineSettings {
            horizon: config.dash_horizon(),
            update_freq: seconds(config.dash_update_freq),
            retain_after_end: seconds(config.buffer_time),
        },
        bus.subscribe(),
    );

    let dj = Arc::new(AutoDj::new(
        store.clone(),
        bus.clone(),
        DjSettings {
            time_delay: seconds(config.autodj.time_delay),
            segments_buff: config.autodj.segments_buff,
        },
    ));
    let live = Arc::new(LiveController::new(
        store.clone(),
        bus.clone(),
        LiveSettings {
            program: config.live.program.clone(),
            args: config.live.args.clone(),
            step: seconds(config.live.step),
            delay: seconds(config.live.delay),
            wait_before_delete: seconds(config.live.wait_before_delete),
            stop_timeout: Duration::from_secs_f64(config.live.stop_timeout.max(0.0)),
            chunk_length: config.chunk_length(),
            content_dir: config.content_dir.clone(),
        },
    ));

    let pipeline_task = tokio::spawn(pipeline.run(cancel.child_token()));
    let dj_task = {
        let dj = Arc::clone(&dj);
        let cancel = cancel.child_token();
        tokio::spawn(async move { dj.run(cancel).await })
    };

    let state = Arc::new(AppState {
        store,
        bus,
        auth,
        sources,
        dj,
        live,
        cancel: cancel.clone(),
    });
    let app = api::router(state, &config.content_dir, &config.manifest_path);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", config.bind, e))?;
    info!("Listening on {} ({:?})", config.bind, config.env);

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .map_err(|e| format!("Server error: {}", e))?;

    cancel.cancel();
    if let Err(e) = dj_task.await {
        warn!("AutoDJ task failed: {}", e);
    }
    if let Err(e) = pipeline_task.await {
        warn!("DASH pipeline task failed: {}", e);
    }
    info!("Shutdown complete");
    // Lock is released when lock_file is dropped
    drop(lock_file);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received");
}
