//! Runnable algorithms: what the profit switcher assigns to devices.
//!
//! There is a single worker backend (excavator), so an algorithm is just a
//! row of the capability catalog plus the devices currently attached to it.

use crate::devices::{Device, Vendor};
use crate::excavator::{ExcavatorError, ExcavatorResult, ExcavatorServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const SHORT_WARMUP: Duration = Duration::from_secs(30);
pub const LONG_WARMUP: Duration = Duration::from_secs(300);

/// Excavator algorithms run by default
pub const EXCAVATOR_ALGORITHMS: &[&str] = &[
    "equihash",
    "pascal",
    "decred",
    "blake2s",
    "daggerhashimoto",
    "lyra2rev2",
    "daggerhashimoto_decred",
    "daggerhashimoto_pascal",
    "keccak",
    "neoscrypt",
    "cryptonightV7",
    "cryptonightV8",
    "lyra2z",
    "x16r",
];

/// How long a benchmark must warm up before sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warmup {
    Short,
    Long,
}

impl Warmup {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Short => SHORT_WARMUP,
            Self::Long => LONG_WARMUP,
        }
    }
}

/// One row of the capability catalog
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmSpec {
    /// Name used in benchmark records (e.g., "excavator_equihash")
    pub name: String,

    /// Name excavator knows the algorithm by (e.g., "daggerhashimoto_pascal")
    pub excavator_name: String,

    /// Sub-algorithms, in the order speeds are reported
    pub algorithms: Vec<String>,

    pub warmup: Warmup,

    /// Vendors whose devices this algorithm can run on
    pub vendors: Vec<Vendor>,
}

impl AlgorithmSpec {
    pub fn excavator(excavator_name: &str) -> Self {
        Self {
            name: format!("excavator_{}", excavator_name),
            excavator_name: excavator_name.to_string(),
            algorithms: excavator_name
                .split('_')
                .map(|sub| sub.to_lowercase())
                .collect(),
            warmup: Warmup::Short,
            vendors: vec![Vendor::Nvidia],
        }
    }

    pub fn accepts(&self, device: &Device) -> bool {
        self.vendors.contains(&device.vendor)
    }
}

/// The default catalog
pub fn default_catalog() -> Vec<AlgorithmSpec> {
    EXCAVATOR_ALGORITHMS
        .iter()
        .map(|name| AlgorithmSpec::excavator(name))
        .collect()
}

struct Attached {
    devices: Vec<Device>,
    benchmarking: bool,
}

/// An algorithm bound to the excavator supervisor
pub struct ExcavatorAlgorithm {
    spec: AlgorithmSpec,
    server: Arc<ExcavatorServer>,
    attached: Mutex<Attached>,
}

impl std::fmt::Debug for ExcavatorAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<algorithm:{} {:?}>", self.spec.name, self.spec.algorithms)
    }
}

impl ExcavatorAlgorithm {
    pub fn new(spec: AlgorithmSpec, server: Arc<ExcavatorServer>) -> Self {
        Self {
            spec,
            server,
            attached: Mutex::new(Attached {
                devices: Vec::new(),
                benchmarking: false,
            }),
        }
    }

    /// One runnable per catalog row, all sharing `server`.
    pub fn from_catalog(catalog: &[AlgorithmSpec], server: &Arc<ExcavatorServer>) -> Vec<Arc<Self>> {
        catalog
            .iter()
            .cloned()
            .map(|spec| Arc::new(Self::new(spec, server.clone())))
            .collect()
    }

    pub fn spec(&self) -> &AlgorithmSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn server(&self) -> &Arc<ExcavatorServer> {
        &self.server
    }

    pub fn accepts(&self, device: &Device) -> bool {
        self.spec.accepts(device)
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.attached.lock().await.devices.clone()
    }

    pub async fn benchmarking(&self) -> bool {
        self.attached.lock().await.benchmarking
    }

    /// Restart excavator first if it is down.
    async fn ensure_running(&self) -> ExcavatorResult<()> {
        if !self.server.is_running().await && self.server.ensure_running().await? {
            tracing::info!("Excavator restarted before {} update", self.spec.name);
        }
        Ok(())
    }

    /// Run this algorithm on exactly `devices`.
    ///
    /// Only the difference from the currently attached set is applied. The
    /// attached set is updated device by device, so a failure part way
    /// through leaves it matching excavator and the next call resumes.
    ///
    /// # Panics
    /// If any device is rejected by [`accepts`](Self::accepts).
    pub async fn set_devices(&self, devices: &[Device]) -> ExcavatorResult<()> {
        assert!(
            devices.iter().all(|d| self.accepts(d)),
            "{} assigned a device it cannot run on",
            self.spec.name
        );
        self.ensure_running().await?;

        let mut attached = self.attached.lock().await;
        let benchmarking = attached.benchmarking;
        self.transition(&mut attached.devices, devices, benchmarking)
            .await
            .map_err(ExcavatorError::into_not_running)
    }

    /// Switch benchmarking mode, re-attaching the current devices under the
    /// benchmark (or production) context names.
    pub async fn set_benchmarking(&self, benchmarking: bool) -> ExcavatorResult<()> {
        let mut attached = self.attached.lock().await;
        if attached.benchmarking == benchmarking {
            return Ok(());
        }
        let devices = attached.devices.clone();
        if !devices.is_empty() {
            self.ensure_running().await?;
            let old_mode = attached.benchmarking;
            self.transition(&mut attached.devices, &[], old_mode)
                .await
                .map_err(ExcavatorError::into_not_running)?;
            attached.benchmarking = benchmarking;
            self.transition(&mut attached.devices, &devices, benchmarking)
                .await
                .map_err(ExcavatorError::into_not_running)?;
        } else {
            attached.benchmarking = benchmarking;
        }
        Ok(())
    }

    async fn transition(
        &self,
        current: &mut Vec<Device>,
        target: &[Device],
        benchmarking: bool,
    ) -> ExcavatorResult<()> {
        let detach: Vec<Device> = current
            .iter()
            .filter(|d| !target.contains(d))
            .cloned()
            .collect();
        let attach: Vec<Device> = target
            .iter()
            .filter(|d| !current.contains(d))
            .cloned()
            .collect();

        for device in detach {
            self.server
                .stop_work(&self.spec.excavator_name, &device)
                .await?;
            current.retain(|d| d != &device);
        }
        for device in attach {
            self.server
                .start_work(&self.spec.excavator_name, &device, benchmarking)
                .await?;
            current.push(device);
        }
        Ok(())
    }

    /// Total speed of each sub-algorithm across the attached devices.
    pub async fn current_speeds(&self) -> ExcavatorResult<Vec<f64>> {
        self.ensure_running().await?;
        self.read_speeds().await
    }

    /// Like [`current_speeds`](Self::current_speeds) but never restarts
    /// excavator; a dead process shows up as `NotRunning`.
    pub async fn read_speeds(&self) -> ExcavatorResult<Vec<f64>> {
        let devices = self.devices().await;
        let per_device = self
            .server
            .device_speeds(&devices)
            .await
            .map_err(ExcavatorError::into_not_running)?;

        Ok(self
            .spec
            .algorithms
            .iter()
            .map(|sub| {
                per_device
                    .iter()
                    .filter_map(|speeds| speeds.get(sub))
                    .sum::<f64>()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_spec() {
        let spec = AlgorithmSpec::excavator("daggerhashimoto_pascal");
        assert_eq!(spec.name, "excavator_daggerhashimoto_pascal");
        assert_eq!(spec.algorithms, vec!["daggerhashimoto", "pascal"]);
        assert_eq!(spec.warmup.duration(), SHORT_WARMUP);
    }

    #[test]
    fn test_sub_algorithms_are_lowercase() {
        let spec = AlgorithmSpec::excavator("cryptonightV7");
        assert_eq!(spec.excavator_name, "cryptonightV7");
        assert_eq!(spec.algorithms, vec!["cryptonightv7"]);
    }

    #[test]
    fn test_accepts_nvidia() {
        let spec = AlgorithmSpec::excavator("equihash");
        assert!(spec.accepts(&Device::nvidia(1, "GPU-aaaa", "Card")));
    }

    #[test]
    fn test_default_catalog() {
        let catalog = default_catalog();
        assert_eq!(catalog.len(), EXCAVATOR_ALGORITHMS.len());
        assert!(catalog.iter().any(|a| a.algorithms.len() == 2));
    }
}
