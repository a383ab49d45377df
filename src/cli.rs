use crate::settings::{self, Settings, SettingsResult};
use clap::{ArgGroup, Parser};
use colored::*;
use std::path::{Path, PathBuf};

/// hashswitch - profit-switching GPU mining daemon
#[derive(Parser, Debug)]
#[command(name = "hashswitch")]
#[command(author = "Hashswitch Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mines the most profitable NiceHash algorithm on each GPU", long_about = None)]
#[command(group(ArgGroup::new("mode").args(["benchmark_all", "benchmark_missing", "list_devices"])))]
pub struct Args {
    /// Benchmark all algorithms on all devices
    #[arg(long)]
    pub benchmark_all: bool,

    /// Benchmark algorithm-device combinations not yet measured
    #[arg(long)]
    pub benchmark_missing: bool,

    /// List available devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Print more information
    #[arg(short, long)]
    pub verbose: bool,

    /// Print output from the mining process
    #[arg(long)]
    pub show_mining: bool,

    /// Directory for configuration and benchmark files
    #[arg(short, long, value_name = "DIR", env = "HASHSWITCH_CONFIG_DIR")]
    pub configdir: Option<PathBuf>,

    /// Path to the excavator binary (default: <configdir>/excavator/excavator)
    #[arg(long, value_name = "PATH")]
    pub excavator: Option<PathBuf>,

    /// NiceHash wallet address (saved to settings)
    #[arg(long, value_name = "ADDRESS")]
    pub wallet: Option<String>,

    /// Worker name (saved to settings)
    #[arg(long, value_name = "NAME")]
    pub worker: Option<String>,

    /// NiceHash region, e.g. eu or usa (saved to settings)
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,
}

impl Args {
    /// Default log filter for the selected verbosity
    pub fn log_filter(&self) -> &'static str {
        if self.show_mining {
            "debug"
        } else if self.verbose {
            "info,excavator=warn"
        } else {
            "warn,excavator=warn"
        }
    }

    /// Copy `--wallet`, `--worker` and `--region` into `settings`.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(wallet) = &self.wallet {
            settings.nicehash.wallet = wallet.clone();
        }
        if let Some(worker) = &self.worker {
            settings.nicehash.workername = worker.clone();
        }
        if let Some(region) = &self.region {
            settings.nicehash.region = region.clone();
        }
    }

    /// Load settings from `config_dir`, apply the command-line overrides and
    /// save them back. Fails without writing anything if no wallet is set.
    pub fn prepare_settings(&self, config_dir: &Path) -> SettingsResult<Settings> {
        let mut loaded = settings::load_settings(config_dir)?;
        self.apply_overrides(&mut loaded);
        loaded.nicehash.subscription()?;
        settings::save_settings(config_dir, &loaded)?;
        Ok(loaded)
    }
}

pub fn display_banner() {
    let rule = "=".repeat(56);
    println!("{}", rule.bright_cyan());
    println!(
        "  {}  {}",
        "hashswitch".bright_white().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_green()
    );
    println!("  {}", "Profit switching for NiceHash | excavator backend".yellow());
    println!("{}", rule.bright_cyan());
}
