use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "tether",
    about = "Inspect and patch host bundles and administer the native trust store",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "TETHER_CONFIG",
        global = true,
        help = "Optional JSON host config; flags below override its fields"
    )]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        long = "bundle-dir",
        env = "TETHER_BUNDLE_DIR",
        global = true,
        help = "Trusted directory native module files are loaded from"
    )]
    pub(crate) bundle_dir: Option<PathBuf>,

    #[arg(
        long = "app-dir",
        env = "TETHER_APP_DIR",
        global = true,
        help = "Host application directory served to approved native code"
    )]
    pub(crate) app_dir: Option<PathBuf>,

    #[arg(
        long = "user-data-dir",
        env = "TETHER_USER_DATA_DIR",
        global = true,
        help = "Per-user state directory holding trusted-native.json"
    )]
    pub(crate) user_data_dir: Option<PathBuf>,

    #[arg(
        long = "trust-timeout-ms",
        env = "TETHER_TRUST_TIMEOUT_MS",
        global = true,
        help = "Milliseconds to wait for a trust decision before blocking"
    )]
    pub(crate) trust_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Report which action anchors a bundle contains.
    Locate {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long, default_value_t = false, help = "Print the report as JSON")]
        json: bool,
    },
    /// Patch a bundle so its action builders dispatch through interceptors.
    Transform {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long, help = "Output path; defaults to stdout")]
        out: Option<PathBuf>,
    },
    /// Administer trusted native code hashes.
    Trust {
        #[command(subcommand)]
        command: TrustCommand,
    },
    /// Check settings export files.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Print the resolved host configuration as JSON.
    Config,
}

#[derive(Debug, Subcommand)]
pub(crate) enum TrustCommand {
    /// List always-allowed hashes.
    List,
    /// Print the content hash of a native payload and whether it is trusted.
    Hash {
        #[arg(long)]
        file: PathBuf,
    },
    /// Remove a hash so its payload prompts again.
    Revoke { hash: String },
}

#[derive(Debug, Subcommand)]
pub(crate) enum SettingsCommand {
    Validate {
        #[arg(long)]
        file: PathBuf,
    },
}
