//! cipherfs - transparent encrypt-at-rest overlay filesystem
//!
//! Usage:
//!   cipherfs <mount_point> <backing_dir> [-o option[,option...]]

use anyhow::{Context, Result};
use cipherfs::{
    config::{Config, KeyEncoding, KeySource},
    crypto::provider_from_source,
    fs::{mount_options, CipherFs, CryptCore},
};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cipherfs")]
#[command(version)]
#[command(about = "Transparent encrypt-at-rest overlay filesystem")]
struct Cli {
    /// Mount point directory
    mount_point: PathBuf,

    /// Directory holding the encrypted files
    backing_dir: PathBuf,

    /// FUSE mount options, comma separated
    #[arg(short = 'o', value_delimiter = ',')]
    options: Vec<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read the passphrase from a file
    #[arg(long, conflicts_with = "key_env")]
    key_file: Option<PathBuf>,

    /// Read the passphrase from an environment variable
    #[arg(long)]
    key_env: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    config.mount.mount_point = cli.mount_point;
    config.mount.backing_dir = cli.backing_dir;
    config.mount.fuse_options.extend(cli.options);
    if let Some(path) = cli.key_file {
        config.crypto.key = KeySource::File {
            path,
            encoding: KeyEncoding::Raw,
        };
    }
    if let Some(var) = cli.key_env {
        config.crypto.key = KeySource::Env { var };
    }
    config.validate()?;

    let keys = provider_from_source(&config.crypto.key).context("Failed to set up key source")?;
    keys.passphrase().context("Passphrase unavailable")?;

    let mount_point = config.mount.mount_point.clone();
    std::fs::create_dir_all(&mount_point)
        .with_context(|| format!("Failed to create mount point {:?}", mount_point))?;

    let options = mount_options(&config.mount);
    let fs = CipherFs::new(CryptCore::new(&config, keys));

    info!(
        "Mounting {:?} at {:?}",
        config.mount.backing_dir, mount_point
    );
    fuser::mount2(fs, &mount_point, &options)
        .with_context(|| format!("Failed to mount at {:?}", mount_point))?;
    info!("Unmounted {:?}", mount_point);

    Ok(())
}

/// Config file given on the command line, else the per-user one if present,
/// else defaults; environment overrides applied on top
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(p) => Some(expand_tilde(p)),
        None => dirs::config_dir()
            .map(|d| d.join("cipherfs").join("config.json"))
            .filter(|p| p.exists()),
    };

    let mut config = match path {
        Some(p) => Config::read(&p).with_context(|| format!("Failed to load {:?}", p))?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
