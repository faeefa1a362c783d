use crate::config::DaemonConfig;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::info;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Environment variable that turns view/network/gateway resolution on or off
pub const CHECK_NETWORK_ENV: &str = "CHECK_NETWORK";

/// Load and parse daemon configuration from a YAML file
pub fn load_config(config_path: &Path) -> Result<DaemonConfig> {
    info!("Loading configuration from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open config file '{}'", config_path.display()))?;

    let config: DaemonConfig = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse config file '{}'", config_path.display()))?;

    config.validate()?;

    Ok(config)
}

/// Command-line settings that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub socket_dir: Option<PathBuf>,
    pub driver_name: Option<String>,
    pub network_view: Option<String>,
    pub network_container: Option<String>,
    pub prefix_length: Option<u8>,
    pub log_level: Option<String>,
}

/// Apply command-line overrides to a loaded configuration
pub fn apply_cli_overrides(config: &mut DaemonConfig, overrides: &CliOverrides) -> Result<()> {
    if let Some(dir) = &overrides.socket_dir {
        config.socket_dir = dir.clone();
    }
    if let Some(name) = &overrides.driver_name {
        config.driver_name = name.clone();
    }
    if let Some(view) = &overrides.network_view {
        config.network_view = view.clone();
    }
    if let Some(containers) = &overrides.network_container {
        config.network_container = containers.clone();
    }
    if let Some(prefix_length) = overrides.prefix_length {
        config.prefix_length = prefix_length;
    }
    if let Some(level) = &overrides.log_level {
        config.log_level = Some(level.clone());
    }

    // Re-validate after applying overrides
    config.validate()?;

    Ok(())
}

/// Interpret `CHECK_NETWORK`: unset or `true` enables network checks, anything else disables them
pub fn check_network_enabled(value: Option<&str>) -> bool {
    match value {
        None | Some("") => true,
        Some(v) => v.eq_ignore_ascii_case("true"),
    }
}

/// Apply environment overrides read from the daemon's process environment
pub fn apply_env_overrides(config: &mut DaemonConfig) {
    let value = std::env::var(CHECK_NETWORK_ENV).ok();
    if value.is_some() {
        config.check_network = check_network_enabled(value.as_deref());
        info!("{}={:?}: network checks {}", CHECK_NETWORK_ENV, value, if config.check_network { "enabled" } else { "disabled" });
    }
}
