//! IoT Node - host simulation
//!
//! Runs the lifecycle core against file-backed storage and firmware slots,
//! a simulated radio, and an stdin console standing in for the HTTP peer.

mod sim;

use clap::Parser;
use iot_core::connectivity::LinkOutcome;
use iot_core::firmware::FileSlots;
use iot_core::hal::{LogIndicator, Platform, Startable};
use iot_core::provision::{CredentialOutcome, PROVISION_ROUTE};
use iot_core::router::{self, Method, Request, API_KEY_HEADER, DEFAULT_BASE_PATH};
use iot_core::storage::FileStore;
use iot_core::update::UPDATE_ROUTE;
use iot_core::{
    BootMode, ConnectivityManager, ConnectivityService, Coordinator, CoreConfig, CoreError, DeviceIdentity,
    LinkMode, MacAddress, NetworkCredentials, ProvisioningSession, RouteTable, UpdatePipeline, UpdateService,
};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use sim::{HostPlatform, SimDriver};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// mDNS service type advertised by the node
const SERVICE_TYPE: &str = "_iot._tcp.local.";
const HTTP_PORT: u16 = 80;

/// IoT lifecycle node (host simulation)
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the key-value store and firmware slots
    #[arg(short, long, default_value = "./iot-data")]
    data_dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Require this key on authenticated routes
    #[arg(long)]
    api_key: Option<String>,

    /// Fail the first N association attempts
    #[arg(long, default_value = "0")]
    fail_first: u32,

    /// Version of the factory image in slot A
    #[arg(long, default_value = "1.0.0")]
    version_string: String,

    /// MAC address to simulate; otherwise kept in the data dir
    #[arg(long)]
    mac: Option<MacAddress>,
}

/// Console input, parsed on the stdin thread
#[derive(Debug)]
enum Command {
    Update(PathBuf),
    Status,
    Provision {
        credentials: NetworkCredentials,
        payload: String,
    },
    Drop,
    Restart(Option<Duration>),
    State,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };

    info!(
        "IoT node starting (data dir {}, firmware {})",
        args.data_dir.display(),
        args.version_string
    );

    let store = Arc::new(FileStore::open(args.data_dir.join("nvs"))?);
    let slots = FileSlots::open(args.data_dir.join("firmware"), &args.version_string)?;
    let platform = Arc::new(match args.mac {
        Some(mac) => HostPlatform::with_mac(mac),
        None => HostPlatform::load_or_create(&args.data_dir)?,
    });
    let mac = platform.mac();

    let mut coordinator = Coordinator::new(config.clone(), Arc::new(LogIndicator::new()), platform.clone());
    let ctx = coordinator.context();
    let mode = coordinator.boot(store.as_ref())?;

    // Routes
    let mut routes = RouteTable::default();
    if let Some(key) = &args.api_key {
        routes = routes.with_api_key(key.clone());
    }
    router::register_reboot(&mut routes, ctx.clone(), config.restart.default_delay)?;

    let pipeline = Arc::new(UpdatePipeline::new(ctx.clone(), config.update.clone(), Box::new(slots)));
    register_update_routes(&mode, &pipeline, &mut routes)?;

    // Subsystems, stopped in this order on restart
    let (drop_tx, drop_rx) = mpsc::unbounded_channel();
    let session = match mode {
        BootMode::Provisioning => {
            let session = ProvisioningSession::new(ctx.clone(), store.clone(), config.provisioning.clone(), mac);
            session.register_routes(&mut routes)?;
            session.start()?;
            info!("Provisioning service {} waiting for a peer", session.service_name());
            Some(session)
        }
        BootMode::Station { credentials } => {
            info!("Joining {}", credentials.ssid);
            let driver = SimDriver::station(mac, args.fail_first, drop_rx);
            let manager = ConnectivityManager::new(driver, config.backoff.clone(), LinkMode::Station, ctx.clone());
            let mut wifi = ConnectivityService::new(manager);
            wifi.start()?;
            coordinator.register(Box::new(wifi));
            None
        }
    };

    let mut ota = UpdateService(pipeline);
    ota.start()?;
    coordinator.register(Box::new(ota));

    let identity = coordinator
        .identity()
        .cloned()
        .unwrap_or_else(|| DeviceIdentity::fallback(mac));
    let mdns = match advertise(&identity, &args.version_string) {
        Ok(daemon) => Some(daemon),
        Err(e) => {
            warn!("mDNS: Advertising failed: {}", e);
            None
        }
    };

    let routes = Arc::new(routes);
    let api_key = args.api_key.clone();

    // Spawn stdin handler for console commands
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(16);
    std::thread::spawn(move || {
        println!("\nCommands:");
        println!("  update <file>                      - Upload a firmware image");
        println!("  status                             - Show update status");
        println!("  provision <ssid> <password> <json> - Provision the device");
        println!("  drop                               - Simulate link loss");
        println!("  restart [ms]                       - Request a restart");
        println!("  state                              - Show device state");
        println!("  quit                               - Exit\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }

            let command = match parts[0] {
                "update" if parts.len() >= 2 => Command::Update(PathBuf::from(parts[1])),
                "status" => Command::Status,
                "provision" if parts.len() >= 4 => Command::Provision {
                    credentials: NetworkCredentials::new(parts[1], parts[2]),
                    payload: parts[3..].join(" "),
                },
                "drop" => Command::Drop,
                "restart" => match parts.get(1).map(|ms| ms.parse::<u64>()) {
                    None => Command::Restart(None),
                    Some(Ok(ms)) => Command::Restart(Some(Duration::from_millis(ms))),
                    Some(Err(_)) => {
                        println!("Invalid delay (must be milliseconds)");
                        continue;
                    }
                },
                "state" => Command::State,
                "quit" | "exit" => std::process::exit(0),
                _ => {
                    println!("Unknown command. Try: update <file>");
                    continue;
                }
            };
            if command_tx.blocking_send(command).is_err() {
                break;
            }
        }
    });

    // Main event loop
    let run = coordinator.run();
    tokio::pin!(run);
    let report = loop {
        tokio::select! {
            report = &mut run => break report,

            Some(command) = command_rx.recv() => match command {
                Command::Update(path) => {
                    let image = match tokio::fs::read(&path).await {
                        Ok(image) => image,
                        Err(e) => {
                            println!("Cannot read {}: {}", path.display(), e);
                            continue;
                        }
                    };
                    let mut request = Request::new(Method::Post, route(UPDATE_ROUTE))
                        .with_body(image, config.update.chunk_size);
                    if let Some(key) = &api_key {
                        request = request.with_header(API_KEY_HEADER, key.clone());
                    }
                    let routes = routes.clone();
                    tokio::spawn(async move {
                        let response = routes.handle(request).await;
                        println!("{} {}", response.status, response.body);
                    });
                }
                Command::Status => {
                    let mut request = Request::new(Method::Get, route(UPDATE_ROUTE));
                    if let Some(key) = &api_key {
                        request = request.with_header(API_KEY_HEADER, key.clone());
                    }
                    let response = routes.handle(request).await;
                    println!("{} {}", response.status, response.body);
                }
                Command::Provision { credentials, payload } => {
                    let Some(session) = session.clone() else {
                        println!("Device is already provisioned");
                        continue;
                    };
                    let routes = routes.clone();
                    let ctx = ctx.clone();
                    let backoff = config.backoff.clone();
                    tokio::spawn(async move {
                        session.on_credentials_received(&credentials);
                        let driver = SimDriver::provisioning(mac, &credentials.password);
                        let mut manager = ConnectivityManager::new(driver, backoff, LinkMode::Provisioning, ctx);
                        match manager.connect().await {
                            Ok(()) => {
                                if let Err(e) = session.on_credential_success(&credentials) {
                                    println!("Credentials rejected: {}", e);
                                    return;
                                }
                            }
                            Err(LinkOutcome::ProvisioningFailed(e)) => {
                                match session.on_credential_failure(e.is_auth()) {
                                    CredentialOutcome::Retry { remaining } => {
                                        println!("Association failed ({}), {} attempts left", e, remaining)
                                    }
                                    outcome => println!("Association failed ({}): {:?}", e, outcome),
                                }
                                return;
                            }
                            Err(outcome) => {
                                println!("Association failed: {:?}", outcome);
                                return;
                            }
                        }

                        let request = Request::new(Method::Post, route(PROVISION_ROUTE))
                            .with_body(payload.into_bytes(), 256);
                        let response = routes.handle(request).await;
                        println!("{} {}", response.status, response.body);
                    });
                }
                Command::Drop => {
                    if drop_tx.send(()).is_err() {
                        println!("No station link to drop");
                    }
                }
                Command::Restart(delay) => {
                    let delay = delay.unwrap_or(config.restart.default_delay);
                    if !ctx.request_restart(delay) {
                        println!("Restart already pending");
                    }
                }
                Command::State => {
                    println!(
                        "state={} queue={} lock={:?} restart={:?}",
                        ctx.state(),
                        ctx.queue_depth(),
                        ctx.task_lock().holder(),
                        ctx.restart_pending()
                    );
                }
            },
        }
    };

    info!(
        "Shutdown after {:?}: stopped {:?}, failed {:?}",
        report.delay, report.stopped, report.failed
    );
    if let Some(daemon) = mdns {
        if let Err(e) = daemon.shutdown() {
            warn!("mDNS: Shutdown failed: {}", e);
        }
    }
    if !platform.was_reset() {
        error!("Consumer loop ended without a reset");
    }
    Ok(())
}

/// Firmware uploads are served only once the device runs on its own network
fn register_update_routes(
    mode: &BootMode,
    pipeline: &Arc<UpdatePipeline>,
    routes: &mut RouteTable,
) -> Result<bool, CoreError> {
    match mode {
        BootMode::Provisioning => Ok(false),
        BootMode::Station { .. } => {
            pipeline.register_routes(routes)?;
            Ok(true)
        }
    }
}

fn route(path: &str) -> String {
    format!("{}{}", DEFAULT_BASE_PATH, path)
}

/// Announce the device as `{hostname}._iot._tcp.local.`
fn advertise(identity: &DeviceIdentity, version: &str) -> Result<ServiceDaemon, mdns_sd::Error> {
    let daemon = ServiceDaemon::new()?;
    let hostname = identity.hostname();
    let host = format!("{}.local.", hostname);

    let mut properties = HashMap::new();
    properties.insert("uuid".to_string(), identity.unique_id.clone());
    properties.insert("name".to_string(), identity.friendly_name.clone());
    properties.insert("version".to_string(), version.to_string());

    let service_info = ServiceInfo::new(SERVICE_TYPE, &hostname, &host, (), HTTP_PORT, properties)?;
    daemon.register(service_info)?;
    info!("mDNS: Advertising {} on {}", hostname, SERVICE_TYPE);
    Ok(daemon)
}
