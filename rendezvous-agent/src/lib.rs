use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use rendezvous_core::{
    local_ip, ClientConfig, DiscoveryClient, DiscoveryError, ServiceDescriptor, TlsConfig,
    DEFAULT_ROOT,
};
use tokio::signal;
use tokio::time;
use tokio_util::sync::CancellationToken;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "rendezvous-agent",
    about = "Rendezvous agent - registers a service instance in etcd and tracks its peers"
)]
pub struct Cli {
    /// etcd endpoints, comma separated
    #[arg(
        long,
        env = "RENDEZVOUS_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    pub endpoints: Vec<String>,

    /// Namespace under which instances are published
    #[arg(long, env = "RENDEZVOUS_ROOT", default_value = DEFAULT_ROOT)]
    pub root: String,

    /// etcd user
    #[arg(long, env = "RENDEZVOUS_USER", requires = "password")]
    pub user: Option<String>,

    /// etcd password
    #[arg(long, env = "RENDEZVOUS_PASSWORD", requires = "user")]
    pub password: Option<String>,

    /// CA certificate (PEM) for TLS to etcd
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Client certificate (PEM) for mutual TLS
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// Client key (PEM) for mutual TLS
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Service name to register
    #[arg(long, required_unless_present = "discover_only")]
    pub name: Option<String>,

    /// Display name, defaults to the service name
    #[arg(long)]
    pub alias: Option<String>,

    /// Address other processes should dial, defaults to the outbound IP
    #[arg(long)]
    pub ip: Option<String>,

    /// Port other processes should dial
    #[arg(long, default_value = "")]
    pub port: String,

    /// Transport tag, e.g. http, https, tcp
    #[arg(long, default_value = "http")]
    pub interface: String,

    /// Payload encoding tag
    #[arg(long, default_value = "json")]
    pub protocol: String,

    /// Only watch the registry, do not register
    #[arg(long)]
    pub discover_only: bool,

    /// Seconds between logged snapshots of discovered services (0 disables)
    #[arg(long, default_value_t = 10)]
    pub report_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new()
            .with_endpoints(self.endpoints.iter().cloned())
            .with_root(&self.root);

        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            config = config.with_credentials(user.clone(), password.clone());
        }

        if self.ca_cert.is_some() || self.cert.is_some() {
            config = config.with_tls(TlsConfig {
                ca_cert: self.ca_cert.clone(),
                client_cert: self.cert.clone(),
                client_key: self.key.clone(),
                domain: None,
            });
        }

        config
    }

    /// Descriptor for this host, or `None` in discover-only mode.
    pub fn descriptor(&self) -> Result<Option<ServiceDescriptor>, DiscoveryError> {
        if self.discover_only {
            return Ok(None);
        }

        let name = self
            .name
            .clone()
            .ok_or_else(|| DiscoveryError::Config("--name is required".to_string()))?;
        let ip = match &self.ip {
            Some(ip) => ip.clone(),
            None => local_ip()
                .map(|ip| ip.to_string())
                .ok_or_else(|| DiscoveryError::Config("cannot determine local ip".to_string()))?,
        };

        let mut descriptor = ServiceDescriptor::new(name, ip, self.port.clone())
            .with_interface(self.interface.clone())
            .with_protocol(self.protocol.clone());
        if let Some(alias) = &self.alias {
            descriptor = descriptor.with_alias(alias.clone());
        }

        Ok(Some(descriptor))
    }
}

/// Initialize logging with the specified log level
fn init_logging(level: &str) {
    use logforth::append;
    use logforth::filter::EnvFilter;
    use logforth::layout::TextLayout;

    let filter = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => {
            eprintln!("Invalid log level: {}, defaulting to info", level);
            "info"
        }
    };

    logforth::starter_log::builder()
        .dispatch(|d| {
            d.filter(EnvFilter::from(filter))
                .append(append::Stderr::default().with_layout(TextLayout::default().no_color()))
        })
        .apply();
}

/// Graceful shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}

/// Register `descriptor` again every time the lease is lost, backing off
/// between attempts, until `shutdown` fires.
///
/// A rejected descriptor is returned as an error after cancelling `shutdown`.
pub async fn supervise_registration(
    client: Arc<DiscoveryClient>,
    descriptor: ServiceDescriptor,
    shutdown: CancellationToken,
) -> Result<(), DiscoveryError> {
    let mut retry_delay = INITIAL_RETRY_DELAY;

    loop {
        match client
            .register_until(descriptor.clone(), shutdown.child_token())
            .await
        {
            Ok(()) => {
                info!("Registration of {} stopped", descriptor.name);
                return Ok(());
            }
            Err(e @ DiscoveryError::Config(_)) => {
                error!("Registration of {} rejected: {}", descriptor.name, e);
                shutdown.cancel();
                return Err(e);
            }
            Err(e) => {
                error!("Registration of {} failed: {}", descriptor.name, e);
                if matches!(e, DiscoveryError::LeaseFailure(_)) {
                    // The instance was registered until the lease was lost.
                    retry_delay = INITIAL_RETRY_DELAY;
                }
                warn!(
                    "Retrying registration in {} seconds with exponential backoff",
                    retry_delay.as_secs()
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = time::sleep(retry_delay) => {}
        }
        retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY);
    }
}

async fn report_services(
    client: Arc<DiscoveryClient>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => info!("Discovered services: {}", client.all_services()),
        }
    }
}

/// Run the agent until Ctrl+C, SIGTERM or an unrecoverable registration error.
pub async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let descriptor = cli.descriptor()?;
    let config = cli.client_config();

    info!("Starting Rendezvous agent");
    info!("etcd endpoints: {:?} | root: /{}/", config.endpoints, config.root);

    let client = Arc::new(DiscoveryClient::connect(config).await?);
    let shutdown = CancellationToken::new();

    let watcher = client.watcher();

    let reporter = (cli.report_interval > 0).then(|| {
        tokio::spawn(report_services(
            client.clone(),
            Duration::from_secs(cli.report_interval),
            shutdown.clone(),
        ))
    });

    let registration = descriptor.map(|descriptor| {
        tokio::spawn(supervise_registration(
            client.clone(),
            descriptor,
            shutdown.clone(),
        ))
    });

    shutdown_signal(shutdown.clone()).await;

    let mut outcome = Ok(());
    if let Some(registration) = registration {
        match registration.await {
            Ok(result) => outcome = result,
            Err(e) => error!("Registration task panicked: {}", e),
        }
    }
    client.shutdown();
    if let Err(e) = watcher.await {
        error!("Watcher task panicked: {}", e);
    }
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    outcome?;
    info!("Rendezvous agent shut down gracefully");
    Ok(())
}
