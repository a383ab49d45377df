//! Persistent settings (`settings.json`) and benchmark results
//! (`benchmarks.json`) kept in the configuration directory.

use crate::devices::Device;
use crate::excavator::Subscription;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_FILENAME: &str = "settings.json";
pub const BENCHMARKS_FILENAME: &str = "benchmarks.json";

/// device -> algorithm name -> average speed per sub-algorithm
pub type BenchmarkTable = BTreeMap<Device, BTreeMap<String, Vec<f64>>>;

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid excavator listen address '{0}'")]
    ListenAddress(String),

    #[error("No NiceHash wallet configured")]
    MissingWallet,
}

/// Default configuration directory (`~/.config/hashswitch`)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hashswitch")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NiceHashSettings {
    pub wallet: String,
    pub workername: String,
    pub region: String,
}

impl Default for NiceHashSettings {
    fn default() -> Self {
        Self {
            wallet: String::new(),
            workername: "hashswitch".to_string(),
            region: "usa".to_string(),
        }
    }
}

impl NiceHashSettings {
    /// Stratum credentials; a wallet is required.
    pub fn subscription(&self) -> SettingsResult<Subscription> {
        let wallet = self.wallet.trim();
        if wallet.is_empty() {
            return Err(SettingsError::MissingWallet);
        }
        Ok(Subscription {
            region: self.region.clone(),
            wallet: wallet.to_string(),
            worker: self.workername.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcavatorSettings {
    /// `ip:port` to run the API on; empty picks a free local port
    pub listen: String,

    /// Extra command-line arguments, whitespace separated
    pub args: String,
}

impl ExcavatorSettings {
    pub fn listen_address(&self) -> SettingsResult<Option<SocketAddr>> {
        let listen = self.listen.trim();
        if listen.is_empty() {
            return Ok(None);
        }
        listen
            .parse()
            .map(Some)
            .map_err(|_| SettingsError::ListenAddress(listen.to_string()))
    }

    pub fn extra_args(&self) -> Vec<String> {
        self.args.split_whitespace().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchingSettings {
    /// Seconds between switching decisions
    pub interval: u64,

    /// Minimum relative improvement before switching (0.1 = 10%)
    pub threshold: f64,
}

impl Default for SwitchingSettings {
    fn default() -> Self {
        Self {
            interval: 60,
            threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Seconds between excavator health checks
    pub interval: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self { interval: 10 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub nicehash: NiceHashSettings,
    pub excavator: ExcavatorSettings,
    pub switching: SwitchingSettings,
    pub watchdog: WatchdogSettings,
}

impl Settings {
    pub fn switching_interval(&self) -> Duration {
        Duration::from_secs(self.switching.interval.max(1))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog.interval.max(1))
    }
}

/// Load `settings.json` from `config_dir`, or defaults if it does not exist.
pub fn load_settings(config_dir: &Path) -> SettingsResult<Settings> {
    let path = config_dir.join(SETTINGS_FILENAME);
    match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).map_err(|source| SettingsError::Json { path, source }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!("No {} found, using defaults", path.display());
            Ok(Settings::default())
        }
        Err(source) => Err(SettingsError::Io { path, source }),
    }
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> SettingsResult<()> {
    let path = config_dir.join(SETTINGS_FILENAME);
    let text = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Json {
        path: path.clone(),
        source,
    })?;
    write_file(config_dir, &path, &text)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredSpeeds {
    Single(f64),
    Multiple(Vec<f64>),
}

impl From<StoredSpeeds> for Vec<f64> {
    fn from(stored: StoredSpeeds) -> Self {
        match stored {
            StoredSpeeds::Single(speed) => vec![speed],
            StoredSpeeds::Multiple(speeds) => speeds,
        }
    }
}

impl From<&Vec<f64>> for StoredSpeeds {
    fn from(speeds: &Vec<f64>) -> Self {
        match speeds.as_slice() {
            [speed] => StoredSpeeds::Single(*speed),
            _ => StoredSpeeds::Multiple(speeds.clone()),
        }
    }
}

type StoredBenchmarks = BTreeMap<String, BTreeMap<String, StoredSpeeds>>;

/// Load `benchmarks.json`, keeping only entries for `devices`.
pub fn load_benchmarks(config_dir: &Path, devices: &[Device]) -> SettingsResult<BenchmarkTable> {
    let path = config_dir.join(BENCHMARKS_FILENAME);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BenchmarkTable::new()),
        Err(source) => return Err(SettingsError::Io { path, source }),
    };
    let stored: StoredBenchmarks =
        serde_json::from_str(&text).map_err(|source| SettingsError::Json { path, source })?;
    Ok(benchmarks_from_stored(stored, devices))
}

fn benchmarks_from_stored(stored: StoredBenchmarks, devices: &[Device]) -> BenchmarkTable {
    let mut table = BenchmarkTable::new();
    for (key, speeds) in stored {
        let Some(device) = devices.iter().find(|d| d.key() == key) else {
            tracing::debug!("Dropping benchmarks for absent device {}", key);
            continue;
        };
        table.insert(
            device.clone(),
            speeds
                .into_iter()
                .map(|(algorithm, speeds)| (algorithm, speeds.into()))
                .collect(),
        );
    }
    table
}

pub fn save_benchmarks(config_dir: &Path, table: &BenchmarkTable) -> SettingsResult<()> {
    let path = config_dir.join(BENCHMARKS_FILENAME);
    let stored: StoredBenchmarks = table
        .iter()
        .map(|(device, speeds)| {
            (
                device.key(),
                speeds
                    .iter()
                    .map(|(algorithm, speeds)| (algorithm.clone(), StoredSpeeds::from(speeds)))
                    .collect(),
            )
        })
        .collect();
    let text = serde_json::to_string_pretty(&stored).map_err(|source| SettingsError::Json {
        path: path.clone(),
        source,
    })?;
    write_file(config_dir, &path, &text)
}

fn write_file(config_dir: &Path, path: &Path, text: &str) -> SettingsResult<()> {
    fs::create_dir_all(config_dir).map_err(|source| SettingsError::Io {
        path: config_dir.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}
