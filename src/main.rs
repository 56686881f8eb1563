//! Volume Orchestrator CLI
//!
//! Runs storage services declared in a configuration document and drives
//! the host mount engine.
//!
//! ```text
//! volume-orchestrator --config services.yml volumes --service nas --attachments
//! volume-orchestrator --config services.yml volume-create --service nas data
//! volume-orchestrator mount 10.0.0.4:/exports/data /mnt/data
//! volume-orchestrator --config services.yml serve
//! ```

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_orchestrator::domain::types::{
    DeviceFormatOpts, DeviceMountOpts, VolumeAttachOpts, VolumeCreateOpts, VolumeDetachOpts,
    VolumeInspectOpts, VolumesOpts,
};
use volume_orchestrator::service::{resolve_driver_name, to_task_value};
use volume_orchestrator::{
    drivers, os, Config, DriverFamily, DriverRegistry, Error, LocalDevices, OsDriver, Result,
    ServiceSet, StorageService,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Orchestrator - one volume lifecycle over pluggable storage drivers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration document (YAML)
    #[arg(long, short, env = "VOLUME_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured services and their drivers
    Services,

    /// List registered drivers by family
    Drivers,

    /// Identity of this host as a service's backend sees it
    Instance {
        #[arg(long, short)]
        service: String,
    },

    /// Device map of this host for a service's driver
    LocalDevices {
        #[arg(long, short)]
        service: String,
    },

    /// List volumes of a service
    Volumes {
        #[arg(long, short)]
        service: String,
        /// Include attachments and their status on this host
        #[arg(long)]
        attachments: bool,
    },

    /// Inspect one volume
    VolumeInspect {
        #[arg(long, short)]
        service: String,
        volume_id: String,
        #[arg(long)]
        attachments: bool,
    },

    /// Create a volume
    VolumeCreate {
        #[arg(long, short)]
        service: String,
        name: String,
        /// Size in GiB, for backends that provision capacity
        #[arg(long)]
        size: Option<u64>,
        #[arg(long)]
        availability_zone: Option<String>,
    },

    /// Remove a volume and everything it holds
    VolumeRemove {
        #[arg(long, short)]
        service: String,
        volume_id: String,
    },

    /// Attach a volume to this host
    VolumeAttach {
        #[arg(long, short)]
        service: String,
        volume_id: String,
        #[arg(long)]
        force: bool,
    },

    /// Detach a volume from this host
    VolumeDetach {
        #[arg(long, short)]
        service: String,
        volume_id: String,
        #[arg(long)]
        force: bool,
    },

    /// Show the mount table, optionally filtered
    Mounts {
        #[arg(long, default_value = "")]
        device: String,
        #[arg(long, default_value = "")]
        mount_point: String,
    },

    /// Mount a device, export or object filesystem
    Mount {
        device: String,
        mount_point: String,
        #[arg(long, default_value = "")]
        options: String,
        #[arg(long, default_value = "")]
        label: String,
    },

    /// Unmount a mount point
    Unmount { mount_point: String },

    /// Create a filesystem on a block device
    Format {
        device: String,
        #[arg(long, default_value = "ext4")]
        fs_type: String,
        /// Format even when a filesystem is already present
        #[arg(long)]
        overwrite: bool,
    },

    /// Run all services with health and metrics endpoints
    Serve {
        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
        health_addr: String,

        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: String,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);
    info!(version = volume_orchestrator::VERSION, "Starting {}", volume_orchestrator::NAME);

    let config = load_config(args.config.as_ref())?;
    let registry = volume_orchestrator::default_registry();

    match args.command {
        Command::Drivers => {
            let listing = json!({
                "storage": registry.names(DriverFamily::Storage),
                "os": registry.names(DriverFamily::Os),
                "executor": registry.names(DriverFamily::Executor),
            });
            print_json(&listing)
        }
        Command::Mounts { device, mount_point } => {
            let driver = os_driver(&config, &registry).await?;
            print_json(&to_task_value(driver.mounts(&device, &mount_point).await?)?)
        }
        Command::Mount {
            device,
            mount_point,
            options,
            label,
        } => {
            let driver = os_driver(&config, &registry).await?;
            let opts = DeviceMountOpts {
                mount_options: options,
                mount_label: label,
            };
            driver.mount(&device, &mount_point, &opts).await
        }
        Command::Unmount { mount_point } => {
            os_driver(&config, &registry).await?.unmount(&mount_point).await
        }
        Command::Format {
            device,
            fs_type,
            overwrite,
        } => {
            let driver = os_driver(&config, &registry).await?;
            let opts = DeviceFormatOpts {
                new_fs_type: fs_type,
                overwrite,
            };
            driver.format(&device, &opts).await
        }
        Command::Serve {
            health_addr,
            metrics_addr,
        } => serve(&config, &registry, &health_addr, &metrics_addr).await,
        command => {
            let services = ServiceSet::from_config(&config, &registry).await?;
            let outcome = run_service_command(command, &services, &registry).await;
            services.shutdown().await;
            print_json(&outcome?)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::new(),
    };
    for registration in drivers::config_registrations() {
        config.register(&registration);
    }
    Ok(config)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Storage Commands
// =============================================================================

async fn run_service_command(
    command: Command,
    services: &ServiceSet,
    registry: &DriverRegistry,
) -> Result<Value> {
    match command {
        Command::Services => {
            let listing: Vec<Value> = services
                .iter()
                .map(|s| json!({ "name": s.name(), "driver": s.driver().name() }))
                .collect();
            Ok(Value::Array(listing))
        }
        Command::Instance { service } => {
            let service = services.get(&service)?;
            service
                .task_execute(
                    |driver| async move { to_task_value(driver.instance_inspect().await?) },
                    None,
                )
                .wait()
                .await
        }
        Command::LocalDevices { service } => {
            let service = services.get(&service)?;
            to_task_value(local_devices(&service, registry).await?)
        }
        Command::Volumes {
            service,
            attachments,
        } => {
            let service = services.get(&service)?;
            let opts = VolumesOpts {
                attachments,
                local_devices: if attachments {
                    Some(local_devices(&service, registry).await?)
                } else {
                    None
                },
            };
            service
                .task_execute(
                    move |driver| async move { to_task_value(driver.volumes(&opts).await?) },
                    None,
                )
                .wait()
                .await
        }
        Command::VolumeInspect {
            service,
            volume_id,
            attachments,
        } => {
            let service = services.get(&service)?;
            let opts = VolumeInspectOpts {
                attachments,
                local_devices: if attachments {
                    Some(local_devices(&service, registry).await?)
                } else {
                    None
                },
            };
            service
                .task_execute(
                    move |driver| async move {
                        to_task_value(driver.volume_inspect(&volume_id, &opts).await?)
                    },
                    None,
                )
                .wait()
                .await
        }
        Command::VolumeCreate {
            service,
            name,
            size,
            availability_zone,
        } => {
            let service = services.get(&service)?;
            let opts = VolumeCreateOpts {
                size,
                availability_zone,
                ..Default::default()
            };
            service
                .task_execute(
                    move |driver| async move {
                        to_task_value(driver.volume_create(&name, &opts).await?)
                    },
                    None,
                )
                .wait()
                .await
        }
        Command::VolumeRemove { service, volume_id } => {
            let service = services.get(&service)?;
            service
                .task_execute(
                    move |driver| async move {
                        driver.volume_remove(&volume_id).await?;
                        Ok(json!({ "removed": volume_id }))
                    },
                    None,
                )
                .wait()
                .await
        }
        Command::VolumeAttach {
            service,
            volume_id,
            force,
        } => {
            let service = services.get(&service)?;
            let executor = executor(&service, registry).await?;
            let opts = VolumeAttachOpts {
                instance_id: match &executor {
                    Some(executor) => Some(executor.instance_id().await?),
                    None => None,
                },
                force,
                local_devices: Some(local_devices(&service, registry).await?),
                ..Default::default()
            };
            service
                .task_execute(
                    move |driver| async move {
                        let (volume, token) = driver.volume_attach(&volume_id, &opts).await?;
                        Ok(json!({ "volume": volume, "attachToken": token }))
                    },
                    None,
                )
                .wait()
                .await
        }
        Command::VolumeDetach {
            service,
            volume_id,
            force,
        } => {
            let service = services.get(&service)?;
            let opts = VolumeDetachOpts {
                force,
                local_devices: Some(local_devices(&service, registry).await?),
            };
            service
                .task_execute(
                    move |driver| async move {
                        to_task_value(driver.volume_detach(&volume_id, &opts).await?)
                    },
                    None,
                )
                .wait()
                .await
        }
        other => Err(Error::Usage(format!("{:?} does not address a service", other))),
    }
}

/// Initialized executor for a service's driver, if one is registered
async fn executor(
    service: &StorageService,
    registry: &DriverRegistry,
) -> Result<Option<Box<dyn volume_orchestrator::StorageExecutor>>> {
    let driver_name = service.driver().name().to_string();
    if !registry.contains(DriverFamily::Executor, &driver_name) {
        return Ok(None);
    }
    let mut executor = registry.new_storage_executor(&driver_name)?;
    executor.init(service.config()).await?;
    if !executor.supported() {
        warn!(driver = %driver_name, "Executor prerequisites missing on this host");
    }
    Ok(Some(executor))
}

/// Device map from the driver's executor, else straight from the mount table
async fn local_devices(service: &StorageService, registry: &DriverRegistry) -> Result<LocalDevices> {
    match executor(service, registry).await? {
        Some(executor) => executor.local_devices().await,
        None => {
            let driver_name = resolve_driver_name(service.config())
                .unwrap_or_else(|| service.driver().name().to_string());
            os::local_devices(driver_name).await
        }
    }
}

async fn os_driver(config: &Config, registry: &DriverRegistry) -> Result<Box<dyn OsDriver>> {
    let mut driver = registry.new_os_driver(os::linux::DRIVER_NAME)?;
    driver.init(config).await?;
    Ok(driver)
}

// =============================================================================
// Serve
// =============================================================================

async fn serve(
    config: &Config,
    registry: &DriverRegistry,
    health_addr: &str,
    metrics_addr: &str,
) -> Result<()> {
    let health_addr: SocketAddr = health_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;
    let metrics_addr: SocketAddr = metrics_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    let ready = Arc::new(AtomicBool::new(false));
    let shutdown = CancellationToken::new();

    let health = tokio::spawn(run_health_server(health_addr, ready.clone(), shutdown.clone()));
    let metrics = tokio::spawn(run_metrics_server(metrics_addr, shutdown.clone()));

    let services = ServiceSet::from_config(config, registry).await?;
    for service in services.iter() {
        info!(service = service.name(), driver = service.driver().name(), "Service ready");
    }
    ready.store(true, Ordering::SeqCst);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    ready.store(false, Ordering::SeqCst);
    shutdown.cancel();
    services.shutdown().await;

    for (name, server) in [("health", health), ("metrics", metrics)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(server = name, error = %e, "Server error"),
            Err(e) => error!(server = name, error = %e, "Server task failed"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so stdout stays parseable JSON
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    volume_orchestrator::service::metrics::register();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(content_type) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, content_type);
                            }
                            response
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to encode metrics");
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
