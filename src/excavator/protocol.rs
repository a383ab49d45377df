use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Excavator API errors
#[derive(Debug, thiserror::Error)]
pub enum ExcavatorError {
    /// Could not open a connection (refused, or connect timed out)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Socket failure after the connection was established
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The response carried a non-null `error` field
    #[error("Excavator rejected {method}: {response}")]
    ProtocolError { method: String, response: Value },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Excavator exited during startup")]
    StartFailed,

    #[error("Failed to launch excavator: {0}")]
    Spawn(String),

    #[error("Excavator not running: {0}")]
    NotRunning(String),

    #[error("Device {0} is not known to excavator")]
    UnknownDevice(String),
}

impl ExcavatorError {
    /// Socket-level failures: "process not up" rather than "process misbehaving".
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::ConnectionError(_) | Self::IoError(_))
    }

    /// Excavator could not be launched at all; retrying will not help.
    pub fn is_start_failure(&self) -> bool {
        matches!(self, Self::StartFailed | Self::Spawn(_))
    }

    /// Translate socket-level failures into `NotRunning` for the algorithm layer.
    pub fn into_not_running(self) -> Self {
        if self.is_transport() {
            Self::NotRunning(self.to_string())
        } else {
            self
        }
    }
}

pub type ExcavatorResult<T> = Result<T, ExcavatorError>;

/// Excavator API methods used by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcavatorMethod {
    Info,
    Subscribe,
    Unsubscribe,
    Quit,
    DeviceList,
    WorkerAdd,
    WorkerFree,
    WorkerList,
    AlgorithmAdd,
    AlgorithmRemove,
}

impl ExcavatorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Quit => "quit",
            Self::DeviceList => "device.list",
            Self::WorkerAdd => "worker.add",
            Self::WorkerFree => "worker.free",
            Self::WorkerList => "worker.list",
            Self::AlgorithmAdd => "algorithm.add",
            Self::AlgorithmRemove => "algorithm.remove",
        }
    }
}

impl std::fmt::Display for ExcavatorMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Excavator JSON-RPC request. All parameters travel as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcavatorRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<String>,
}

impl ExcavatorRequest {
    pub fn new(method: ExcavatorMethod, params: Vec<String>) -> Self {
        Self {
            id: 1,
            method: method.as_str().to_string(),
            params,
        }
    }

    /// Serialize to a single line terminated by `\n`.
    ///
    /// Compact serde_json output never contains a raw newline: newlines inside
    /// strings are emitted as the `\n` escape, so the terminator is the only
    /// frame boundary.
    pub fn to_json_line(&self) -> ExcavatorResult<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Excavator JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcavatorResponse {
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(default)]
    pub error: Option<Value>,

    /// Method-specific payload (`workers`, `devices`, `worker_id`, ...)
    #[serde(flatten)]
    pub body: serde_json::Map<String, Value>,
}

impl ExcavatorResponse {
    pub fn is_error(&self) -> bool {
        matches!(&self.error, Some(e) if !e.is_null())
    }

    pub fn field(&self, name: &str) -> ExcavatorResult<&Value> {
        self.body
            .get(name)
            .ok_or_else(|| ExcavatorError::InvalidResponse(format!("missing field '{}'", name)))
    }

    /// Re-encode the full response (used for protocol error reports).
    pub fn to_value(&self) -> Value {
        let mut map = self.body.clone();
        map.insert("id".to_string(), self.id.map(Value::from).unwrap_or(Value::Null));
        map.insert("error".to_string(), self.error.clone().unwrap_or(Value::Null));
        Value::Object(map)
    }
}

/// One entry of `device.list`
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device_id: u32,
    pub details: DeviceDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDetails {
    pub bus_id: u32,
}

/// One entry of `worker.list`
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEntry {
    pub device_id: u32,
    #[serde(default)]
    pub algorithms: Vec<WorkerAlgorithm>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerAlgorithm {
    pub name: String,
    pub speed: f64,
}

/// `worker.add` payload: `worker_id` may come back as a number or a string.
pub fn parse_worker_id(response: &ExcavatorResponse) -> ExcavatorResult<u64> {
    match response.field("worker_id")? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ExcavatorError::InvalidResponse(format!("bad worker_id {}", n))),
        Value::String(s) => s
            .parse()
            .map_err(|_| ExcavatorError::InvalidResponse(format!("bad worker_id '{}'", s))),
        other => Err(ExcavatorError::InvalidResponse(format!(
            "worker_id not a number: {}",
            other
        ))),
    }
}

pub fn parse_devices(response: &ExcavatorResponse) -> ExcavatorResult<Vec<DeviceEntry>> {
    Ok(serde_json::from_value(response.field("devices")?.clone())?)
}

pub fn parse_workers(response: &ExcavatorResponse) -> ExcavatorResult<Vec<WorkerEntry>> {
    Ok(serde_json::from_value(response.field("workers")?.clone())?)
}
