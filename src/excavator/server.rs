use super::protocol::{
    parse_devices, parse_worker_id, parse_workers, ExcavatorError, ExcavatorMethod,
    ExcavatorResult,
};
use super::resource::{context_name, AlgorithmContext, Shared};
use super::transport::{Transport, DEFAULT_TIMEOUT};
use crate::devices::Device;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

/// NiceHash mining protocol port
pub const NHMP_PORT: u16 = 3200;

/// Stratum credentials handed to excavator's `subscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub region: String,
    pub wallet: String,
    pub worker: String,
}

impl Subscription {
    pub fn params(&self) -> Vec<String> {
        vec![
            format!("nhmp.{}.nicehash.com:{}", self.region, NHMP_PORT),
            format!("{}.{}:x", self.wallet, self.worker),
        ]
    }
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the excavator binary (provisioned by the caller)
    pub executable: PathBuf,

    /// Address excavator listens on (`-i`/`-p`)
    pub address: SocketAddr,

    /// Extra command-line arguments appended after `-i`/`-p`
    pub extra_args: Vec<String>,

    /// Pause between `info` probes while waiting for startup
    pub poll_interval: Duration,

    /// Per-call API timeout
    pub rpc_timeout: Duration,
}

impl ServerConfig {
    pub fn new(executable: impl Into<PathBuf>, address: SocketAddr) -> Self {
        Self {
            executable: executable.into(),
            address,
            extra_args: Vec::new(),
            poll_interval: Duration::from_millis(250),
            rpc_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Pick a free local port for excavator to listen on.
pub fn ephemeral_address() -> std::io::Result<SocketAddr> {
    let listener =
        std::net::TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
    listener.local_addr()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Worker {
    id: u64,
    benchmarking: bool,
}

/// A running (algorithm, device) worker, as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub algorithm: String,
    pub device: Device,
    pub worker_id: u64,
    pub benchmarking: bool,
}

struct ServerState {
    config: ServerConfig,
    transport: Transport,
    process: Mutex<Option<Child>>,
    subscription: Option<Subscription>,
    /// PCI bus -> excavator device id, re-read on every start
    device_map: HashMap<u32, u32>,
    /// (algorithm, device) -> worker; survives stop() so start() can rebuild
    workers: HashMap<(String, Device), Worker>,
    /// context name -> reference-counted algorithm context
    contexts: HashMap<String, Shared<AlgorithmContext>>,
}

/// Excavator process supervisor.
///
/// All state lives behind one `RwLock`. Anything that changes excavator
/// (start, stop, attach, detach, subscribe) takes the write half; speed and
/// liveness queries share the read half and therefore never overlap a
/// restart.
pub struct ExcavatorServer {
    state: RwLock<ServerState>,
}

impl ExcavatorServer {
    pub fn new(config: ServerConfig) -> Self {
        let transport = Transport::new(config.address).with_timeout(config.rpc_timeout);
        Self {
            state: RwLock::new(ServerState {
                config,
                transport,
                process: Mutex::new(None),
                subscription: None,
                device_map: HashMap::new(),
                workers: HashMap::new(),
                contexts: HashMap::new(),
            }),
        }
    }

    pub async fn transport(&self) -> Transport {
        self.state.read().await.transport.clone()
    }

    pub async fn address(&self) -> SocketAddr {
        self.state.read().await.config.address
    }

    /// Launch excavator and wait until it answers.
    pub async fn start(&self) -> ExcavatorResult<()> {
        let mut state = self.state.write().await;
        if state.process_alive() {
            return Ok(());
        }
        state.start().await
    }

    /// Unsubscribe, ask excavator to quit and wait for the process to exit.
    pub async fn stop(&self) -> ExcavatorResult<()> {
        let mut state = self.state.write().await;
        state.stop().await
    }

    /// Whether the process is still alive, without querying the API.
    pub async fn is_alive(&self) -> bool {
        self.state.read().await.process_alive()
    }

    /// Process alive *and* answering `info`.
    pub async fn is_running(&self) -> bool {
        self.state.read().await.probe().await
    }

    /// Restart excavator unless it is already healthy. Returns whether a
    /// restart happened.
    ///
    /// Liveness is re-checked under the write lock, so concurrent callers
    /// that all saw a dead process trigger a single restart.
    pub async fn ensure_running(&self) -> ExcavatorResult<bool> {
        let mut state = self.state.write().await;
        if state.probe().await {
            return Ok(false);
        }
        tracing::warn!("Excavator is not running, restarting");
        state.kill().await;
        state.start().await?;
        Ok(true)
    }

    /// Change stratum credentials. When running, excavator is re-subscribed
    /// in place and attached workers are left alone.
    pub async fn set_subscription(&self, subscription: Subscription) -> ExcavatorResult<()> {
        let mut state = self.state.write().await;
        if state.subscription.as_ref() == Some(&subscription) {
            return Ok(());
        }
        state.subscription = Some(subscription);
        if state.process_alive() {
            state
                .transport
                .send(ExcavatorMethod::Unsubscribe, Vec::new())
                .await?;
            state.subscribe().await?;
        }
        Ok(())
    }

    /// Change the listen address, restarting excavator if it is running.
    pub async fn set_address(&self, address: SocketAddr) -> ExcavatorResult<()> {
        let mut state = self.state.write().await;
        if state.config.address == address {
            return Ok(());
        }
        let was_running = state.process_alive();
        if was_running {
            state.stop().await?;
        }
        state.config.address = address;
        state.transport = Transport::new(address).with_timeout(state.config.rpc_timeout);
        if was_running {
            state.start().await?;
        }
        Ok(())
    }

    pub async fn set_extra_args(&self, extra_args: Vec<String>) {
        self.state.write().await.config.extra_args = extra_args;
    }

    /// Run `algorithm` on `device`. Already-running pairs are left alone.
    pub async fn start_work(
        &self,
        algorithm: &str,
        device: &Device,
        benchmarking: bool,
    ) -> ExcavatorResult<()> {
        let mut state = self.state.write().await;
        state.start_work(algorithm, device, benchmarking).await
    }

    /// Stop running `algorithm` on `device`. Unknown pairs are ignored.
    pub async fn stop_work(&self, algorithm: &str, device: &Device) -> ExcavatorResult<()> {
        let mut state = self.state.write().await;
        state.stop_work(algorithm, device).await
    }

    /// Per-device speeds (algorithm name -> hashes/s) from one `worker.list`.
    pub async fn device_speeds(
        &self,
        devices: &[Device],
    ) -> ExcavatorResult<Vec<HashMap<String, f64>>> {
        let state = self.state.read().await;
        let device_ids = devices
            .iter()
            .map(|device| state.device_id(device))
            .collect::<ExcavatorResult<Vec<u32>>>()?;

        let response = state
            .transport
            .send(ExcavatorMethod::WorkerList, Vec::new())
            .await?;
        let workers = parse_workers(&response)?;

        Ok(device_ids
            .iter()
            .map(|device_id| {
                let mut speeds = HashMap::new();
                for worker in workers.iter().filter(|w| w.device_id == *device_id) {
                    for algorithm in &worker.algorithms {
                        *speeds.entry(algorithm.name.to_lowercase()).or_insert(0.0) +=
                            algorithm.speed;
                    }
                }
                speeds
            })
            .collect())
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.state.read().await;
        let mut workers: Vec<WorkerInfo> = state
            .workers
            .iter()
            .map(|((algorithm, device), worker)| WorkerInfo {
                algorithm: algorithm.clone(),
                device: device.clone(),
                worker_id: worker.id,
                benchmarking: worker.benchmarking,
            })
            .collect();
        workers.sort_by(|a, b| (&a.algorithm, &a.device).cmp(&(&b.algorithm, &b.device)));
        workers
    }

    /// Current holder count of an algorithm context (0 if never created).
    pub async fn context_holders(&self, name: &str) -> u32 {
        let state = self.state.read().await;
        state.contexts.get(name).map(Shared::holders).unwrap_or(0)
    }
}

impl ServerState {
    fn process_alive(&self) -> bool {
        let mut process = self.process.lock().unwrap_or_else(|e| e.into_inner());
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn probe(&self) -> bool {
        self.process_alive()
            && self
                .transport
                .send(ExcavatorMethod::Info, Vec::new())
                .await
                .is_ok()
    }

    fn take_process(&self) -> Option<Child> {
        self.process.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn device_id(&self, device: &Device) -> ExcavatorResult<u32> {
        self.device_map
            .get(&device.pci_bus)
            .copied()
            .ok_or_else(|| ExcavatorError::UnknownDevice(device.to_string()))
    }

    async fn start(&mut self) -> ExcavatorResult<()> {
        let address = self.config.address;
        tracing::info!(
            "Starting excavator: {} -i {} -p {}",
            self.config.executable.display(),
            address.ip(),
            address.port()
        );

        let mut child = Command::new(&self.config.executable)
            .arg("-i")
            .arg(address.ip().to_string())
            .arg("-p")
            .arg(address.port().to_string())
            .args(&self.config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExcavatorError::Spawn(format!("{}: {}", self.config.executable.display(), e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        // No overall deadline; only the process exiting counts as failure.
        loop {
            if self
                .transport
                .send(ExcavatorMethod::Info, Vec::new())
                .await
                .is_ok()
            {
                break;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::error!("Excavator exited during startup ({})", status);
                    return Err(ExcavatorError::StartFailed);
                }
                Ok(None) => {}
                Err(e) => return Err(ExcavatorError::IoError(e)),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        *self.process.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        tracing::info!("Excavator is up on {}", address);

        self.read_devices().await?;
        self.subscribe().await?;

        // Contexts died with the previous process; rebuild every registration.
        self.contexts.clear();
        let previous: Vec<((String, Device), Worker)> = self.workers.drain().collect();
        for (idx, ((algorithm, device), worker)) in previous.iter().enumerate() {
            if let Err(e) = self.start_work(algorithm, device, worker.benchmarking).await {
                tracing::error!("Failed to restore {} on {}: {}", algorithm, device, e);
                // Keep the rest registered so the next start retries them.
                for (key, worker) in previous[idx..].iter().cloned() {
                    self.workers.entry(key).or_insert(worker);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn stop(&mut self) -> ExcavatorResult<()> {
        let Some(mut child) = self.take_process() else {
            return Ok(());
        };
        tracing::info!("Stopping excavator");

        if let Err(e) = self
            .transport
            .send(ExcavatorMethod::Unsubscribe, Vec::new())
            .await
        {
            tracing::warn!("unsubscribe failed: {}", e);
        }
        if let Err(e) = self.transport.send_only(ExcavatorMethod::Quit, Vec::new()).await {
            tracing::warn!("quit failed ({}), killing excavator", e);
            let _ = child.start_kill();
        }
        let status = child.wait().await?;
        tracing::info!("Excavator exited ({})", status);

        self.device_map.clear();
        self.contexts.clear();
        Ok(())
    }

    /// Kill a crashed or hung process without talking to it.
    async fn kill(&mut self) {
        if let Some(mut child) = self.take_process() {
            if let Err(e) = child.kill().await {
                tracing::debug!("kill: {}", e);
            }
        }
        self.device_map.clear();
        self.contexts.clear();
    }

    async fn read_devices(&mut self) -> ExcavatorResult<()> {
        let response = self
            .transport
            .send(ExcavatorMethod::DeviceList, Vec::new())
            .await?;
        self.device_map = parse_devices(&response)?
            .into_iter()
            .map(|entry| (entry.details.bus_id, entry.device_id))
            .collect();
        tracing::debug!("Excavator device map (bus -> id): {:?}", self.device_map);
        Ok(())
    }

    async fn subscribe(&self) -> ExcavatorResult<()> {
        match &self.subscription {
            Some(subscription) => {
                tracing::info!(
                    "Subscribing to {} as {}.{}",
                    subscription.region,
                    subscription.wallet,
                    subscription.worker
                );
                self.transport
                    .send(ExcavatorMethod::Subscribe, subscription.params())
                    .await?;
                Ok(())
            }
            None => {
                tracing::warn!("No stratum credentials configured, not subscribing");
                Ok(())
            }
        }
    }

    async fn start_work(
        &mut self,
        algorithm: &str,
        device: &Device,
        benchmarking: bool,
    ) -> ExcavatorResult<()> {
        let key = (algorithm.to_string(), device.clone());
        if self.workers.contains_key(&key) {
            return Ok(());
        }
        let device_id = self.device_id(device)?;

        let mut grabbed = Vec::new();
        for sub in algorithm.split('_') {
            let name = context_name(sub, benchmarking);
            let transport = self.transport.clone();
            let context = self
                .contexts
                .entry(name.clone())
                .or_insert_with(|| Shared::new(AlgorithmContext::new(name.clone(), transport)));
            let result = context.grab().await;
            if let Err(e) = result {
                let _ = self.release_contexts(&grabbed).await;
                return Err(e);
            }
            grabbed.push(name);
        }

        let worker_name = context_name(algorithm, benchmarking);
        let added = self
            .transport
            .send(
                ExcavatorMethod::WorkerAdd,
                vec![worker_name.clone(), device_id.to_string()],
            )
            .await
            .and_then(|response| parse_worker_id(&response));
        match added {
            Ok(id) => {
                tracing::info!("worker.add {} on {} -> worker {}", worker_name, device, id);
                self.workers.insert(key, Worker { id, benchmarking });
                Ok(())
            }
            Err(e) => {
                let _ = self.release_contexts(&grabbed).await;
                Err(e)
            }
        }
    }

    async fn stop_work(&mut self, algorithm: &str, device: &Device) -> ExcavatorResult<()> {
        self.destroy_idle_contexts().await;

        let key = (algorithm.to_string(), device.clone());
        let Some(worker) = self.workers.get(&key).copied() else {
            return Ok(());
        };

        let freed = self
            .transport
            .send(ExcavatorMethod::WorkerFree, vec![worker.id.to_string()])
            .await;
        if matches!(&freed, Err(e) if e.is_transport()) {
            // Excavator state unknown; keep the registration so the diff is retried.
            return freed.map(|_| ());
        }
        match &freed {
            Ok(_) => tracing::info!("worker.free {} ({} on {})", worker.id, algorithm, device),
            Err(e) => tracing::error!("worker.free {} failed: {}", worker.id, e),
        }
        self.workers.remove(&key);

        let names: Vec<String> = algorithm
            .split('_')
            .map(|sub| context_name(sub, worker.benchmarking))
            .collect();
        let released = self.release_contexts(&names).await;
        freed.and(released)
    }

    /// Release every context in `names`, returning the first failure.
    async fn release_contexts(&mut self, names: &[String]) -> ExcavatorResult<()> {
        let mut result = Ok(());
        for name in names {
            if let Some(context) = self.contexts.get_mut(name) {
                if let Err(e) = context.release().await {
                    tracing::error!("Failed to release context {}: {}", name, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Retry teardown of contexts whose last release failed to remove them.
    async fn destroy_idle_contexts(&mut self) {
        for (name, context) in self.contexts.iter_mut() {
            if context.is_held() || !context.is_live() {
                continue;
            }
            if let Err(e) = context.destroy_idle().await {
                tracing::warn!("Context {} still not removed: {}", name, e);
            }
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    tracing::debug!(target: "excavator", "{}", line.trim_end());
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "excavator", "output stream error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_params() {
        let subscription = Subscription {
            region: "eu".to_string(),
            wallet: "3Qe7nT9hBSVoXr8rM2TG6pq82AmLVKHy23".to_string(),
            worker: "rig1".to_string(),
        };
        assert_eq!(
            subscription.params(),
            vec![
                "nhmp.eu.nicehash.com:3200".to_string(),
                "3Qe7nT9hBSVoXr8rM2TG6pq82AmLVKHy23.rig1:x".to_string(),
            ]
        );
    }

    #[test]
    fn test_ephemeral_address_is_local() {
        let addr = ephemeral_address().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_not_running_before_start() {
        let server = ExcavatorServer::new(ServerConfig::new(
            "/nonexistent/excavator",
            ephemeral_address().unwrap(),
        ));
        assert!(!server.is_running().await);
        assert!(server.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let server = ExcavatorServer::new(ServerConfig::new(
            "/nonexistent/excavator",
            ephemeral_address().unwrap(),
        ));
        assert!(matches!(server.start().await, Err(ExcavatorError::Spawn(_))));
    }
}
