use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use env_logger::Env;
use ipamd::config::DaemonConfig;
use ipamd::config_loader::{self, CliOverrides};
use ipamd::daemon::{serve, DriverSocket, IpamDaemon};
use ipamd::directory::InMemoryDirectory;
use ipamd::ip::Allocator;
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

/// IPAM daemon allocating container subnets and addresses over a Unix socket
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration YAML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the driver socket
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Driver name; the socket is <socket-dir>/<driver-name>.sock
    #[arg(long)]
    driver_name: Option<String>,

    /// Network view used when a request names none
    #[arg(long)]
    network_view: Option<String>,

    /// Comma-separated CIDR list subnets are carved from
    #[arg(long)]
    network_container: Option<String>,

    /// Default prefix length of carved subnets
    #[arg(long)]
    prefix_length: Option<u8>,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            socket_dir: self.socket_dir.clone(),
            driver_name: self.driver_name.clone(),
            network_view: self.network_view.clone(),
            network_container: self.network_container.clone(),
            prefix_length: self.prefix_length,
            log_level: self.log_level.clone(),
        }
    }
}

/// Parse a plain level name (`info`, `debug`, ...)
fn level_filter(level: &str) -> Option<LevelFilter> {
    level.trim().parse().ok()
}

/// Initialise logging before anything else can log.
///
/// `RUST_LOG` takes full control when set. Otherwise every record passes the
/// logger and the global maximum level does the filtering, so a `log_level`
/// read later from the config file can still raise or lower it.
fn init_logging(cli_level: Option<&str>) -> bool {
    if std::env::var_os(env_logger::DEFAULT_FILTER_ENV).is_some() {
        env_logger::Builder::from_env(Env::default()).init();
        return false;
    }
    env_logger::Builder::new().filter_level(LevelFilter::Trace).init();
    log::set_max_level(LevelFilter::Info);
    if let Some(level) = cli_level {
        match level_filter(level) {
            Some(filter) => log::set_max_level(filter),
            None => warn!("Ignoring unknown log level '{}'", level),
        }
    }
    true
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();
    let level_adjustable = init_logging(args.log_level.as_deref());

    info!("Starting ipamd {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config {
        info!("Configuration file: {:?}", path);
    }

    let mut config = match &args.config {
        Some(path) => config_loader::load_config(path)?,
        None => DaemonConfig::default(),
    };
    config_loader::apply_cli_overrides(&mut config, &args.overrides())?;

    if level_adjustable && args.log_level.is_none() {
        if let Some(level) = &config.log_level {
            match level_filter(level) {
                Some(filter) => log::set_max_level(filter),
                None => warn!("Ignoring unknown log_level '{}'", level),
            }
        }
    }
    config_loader::apply_env_overrides(&mut config);
    info!("Config is {:?}", config);

    let pool = config.container_pool()?;
    info!("Network containers: {}", pool.len());
    let allocator = Allocator::new(
        Arc::new(InMemoryDirectory::new()),
        pool,
        config.network_view.clone(),
        config.prefix_length,
    )
    .with_empty_mac_policy(config.empty_mac);
    let daemon = Arc::new(IpamDaemon::new(allocator, config.check_network));

    let socket = DriverSocket::new(&config.socket_dir, &config.driver_name);
    let socket_file = socket.socket_file().to_path_buf();
    serve(daemon, socket, config.rpc_timeout)
        .wrap_err_with(|| format!("Failed to serve on '{}'", socket_file.display()))?;

    Ok(())
}
