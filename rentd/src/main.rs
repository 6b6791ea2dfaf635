use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rentd::driver::{ContainerDriver, Driver, VmDriver, VmTools};
use rentd::rest::{AppState, create_router};
use rentd::{AuditLogger, BackendKind, Catalog, Config, LifecycleManager, SshKeygen};

#[derive(Parser)]
#[command(name = "rentd")]
#[command(about = "Short-lived container and VM rentals")]
struct Args {
    /// Data directory for images, credentials and VM disks
    #[arg(short, long, default_value = "/var/lib/rentd")]
    data_dir: PathBuf,

    /// REST listen address
    #[arg(short, long, default_value = "127.0.0.1:8780")]
    listen: String,

    /// Host name renters use to reach their resources
    #[arg(long, default_value = "127.0.0.1")]
    public_host: String,

    /// Docker daemon socket (default: platform default)
    #[arg(long)]
    docker_socket: Option<String>,

    /// QEMU system emulator binary
    #[arg(long, default_value = "qemu-system-x86_64")]
    qemu: String,

    /// JSON file with catalog entries overriding the built-in templates
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Start resources as soon as they are provisioned
    #[arg(long)]
    auto_start: bool,

    /// Seconds a VM gets to power off before it is killed
    #[arg(long, default_value_t = 30)]
    stop_timeout: u64,

    /// Backends to enable
    #[arg(long, value_delimiter = ',', default_value = "container,vm")]
    backends: Vec<BackendKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rentd=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = Config::new(&args.data_dir);
    config.public_host = args.public_host.clone();
    config.auto_start = args.auto_start;
    config.stop_timeout = Duration::from_secs(args.stop_timeout);
    config.prepare().await?;

    info!(data_dir = %args.data_dir.display(), "Initializing rentd");

    let catalog = match &args.catalog {
        Some(path) => Catalog::load(path).await?,
        None => Catalog::default(),
    };
    let catalog = Arc::new(catalog);

    let mut drivers: Vec<Arc<dyn Driver>> = Vec::new();
    if args.backends.contains(&BackendKind::Container) {
        let docker = ContainerDriver::connect(
            args.docker_socket.as_deref(),
            config.volumes_dir(),
            config.public_host.clone(),
        )?;
        if let Err(e) = docker.ping().await {
            warn!(error = %e, "Docker ping failed, container requests will fail until it is up");
        }
        drivers.push(Arc::new(docker));
    }
    if args.backends.contains(&BackendKind::Vm) {
        let tools = VmTools {
            qemu: args.qemu.clone(),
            ..VmTools::default()
        };
        drivers.push(Arc::new(VmDriver::new(
            config.vm_dir(),
            tools,
            config.public_host.clone(),
            config.stop_timeout,
        )));
    }

    let keygen = Arc::new(SshKeygen::new(config.credentials_dir()));
    let manager = LifecycleManager::new(
        &config,
        catalog,
        drivers,
        keygen,
        Arc::new(AuditLogger::new()),
    )?;

    let router = create_router(Arc::new(AppState {
        manager: manager.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("REST API listening on {}", args.listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
