use anyhow::Result;
use tether_native::HostConfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::Cli;

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

/// Config file (or defaults) overlaid with explicit flags.
pub(crate) fn resolve_host_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if let Some(bundle_dir) = &cli.bundle_dir {
        config.bundle_dir = bundle_dir.clone();
    }
    if let Some(app_dir) = &cli.app_dir {
        config.app_dir = app_dir.clone();
    }
    if let Some(user_data_dir) = &cli.user_data_dir {
        config.user_data_dir = user_data_dir.clone();
    }
    if let Some(trust_timeout_ms) = cli.trust_timeout_ms {
        config.trust_timeout_ms = trust_timeout_ms;
    }
    config.validate()?;
    Ok(config)
}
