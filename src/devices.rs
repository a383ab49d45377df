use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::process::Command;

/// Device vendor (NVIDIA-only for now)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Nvidia,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nvidia")
    }
}

/// A physical compute device.
///
/// Identity is the vendor UUID: equality, hashing and ordering ignore the
/// other fields.
#[derive(Debug, Clone)]
pub struct Device {
    /// Vendor UUID (e.g., "GPU-5f1c...")
    pub uuid: String,

    /// PCI bus number, used to find the device in excavator's `device.list`
    pub pci_bus: u32,

    /// Product name (e.g., "GeForce GTX 1660 SUPER")
    pub name: String,

    pub vendor: Vendor,
}

impl Device {
    pub fn nvidia(pci_bus: u32, uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            pci_bus,
            name: name.into(),
            vendor: Vendor::Nvidia,
        }
    }

    /// Stable key used in the benchmarks file
    pub fn key(&self) -> String {
        format!("{}_{}", self.vendor, self.uuid)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl PartialOrd for Device {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Device {
    fn cmp(&self, other: &Self) -> Ordering {
        self.uuid.cmp(&other.uuid)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur during device enumeration
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("nvidia-smi failed: {0}")]
    NvidiaSmi(String),

    #[error("Unparseable nvidia-smi line: {0}")]
    Parse(String),
}

/// Enumerate NVIDIA devices via `nvidia-smi`.
///
/// A missing `nvidia-smi` binary means no NVIDIA devices, not an error.
pub fn enumerate_nvidia() -> DeviceResult<Vec<Device>> {
    let out = Command::new("nvidia-smi")
        .arg("--query-gpu=pci.bus,uuid,name")
        .arg("--format=csv,noheader")
        .output();

    let out = match out {
        Ok(out) => out,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("nvidia-smi not found, assuming no NVIDIA devices");
            return Ok(Vec::new());
        }
        Err(e) => return Err(DeviceError::NvidiaSmi(e.to_string())),
    };
    if !out.status.success() {
        return Err(DeviceError::NvidiaSmi(
            String::from_utf8_lossy(&out.stderr).trim().to_string(),
        ));
    }

    let devices = parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))?;
    tracing::info!("Found {} NVIDIA device(s)", devices.len());
    Ok(devices)
}

/// Parse `pci.bus,uuid,name` CSV rows (bus number in hex, e.g. `0x01`).
pub fn parse_nvidia_smi(output: &str) -> DeviceResult<Vec<Device>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.splitn(3, ',').map(|p| p.trim()).collect();
            if parts.len() < 3 {
                return Err(DeviceError::Parse(line.to_string()));
            }
            let pci_bus = u32::from_str_radix(parts[0].trim_start_matches("0x"), 16)
                .map_err(|_| DeviceError::Parse(line.to_string()))?;
            Ok(Device::nvidia(pci_bus, parts[1], parts[2]))
        })
        .collect()
}
