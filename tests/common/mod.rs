#![allow(dead_code)]

use hashswitch::devices::Device;
use hashswitch::excavator::ServerConfig;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Stand-in for the excavator process: marks itself running, waits until
/// the API's `quit` (or a test) drops a marker file, then exits.
const PROCESS_SCRIPT: &str = r#"#!/bin/sh
DIR="$(dirname "$0")"
echo "fake excavator on $2:$4"
touch "$DIR/running"
while [ ! -f "$DIR/quit" ]; do sleep 0.05; done
rm -f "$DIR/running"
rm -f "$DIR/quit"
"#;

const FAILING_SCRIPT: &str = "#!/bin/sh\necho 'cannot initialise' >&2\nexit 1\n";

/// (device_id, bus_id) pairs reported by `device.list`
const DEVICES: [(u32, u32); 2] = [(0, 1), (1, 2)];

pub fn device_a() -> Device {
    Device::nvidia(1, "GPU-aaaa", "Fake GPU A")
}

pub fn device_b() -> Device {
    Device::nvidia(2, "GPU-bbbb", "Fake GPU B")
}

#[derive(Default)]
struct FakeState {
    requests: Vec<(String, Vec<String>)>,
    next_worker: u64,
    /// worker id -> (algorithm, device id)
    workers: BTreeMap<u64, (String, u32)>,
    contexts: HashSet<String>,
    speeds: HashMap<String, f64>,
    failing: HashSet<String>,
    /// Drop connections while no process is marked running
    tied_to_process: bool,
}

/// In-process excavator API with a scripted process next to it.
pub struct FakeExcavator {
    pub address: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    dir: TempDir,
}

impl FakeExcavator {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir.path().join("excavator"), PROCESS_SCRIPT);
        write_script(&dir.path().join("broken"), FAILING_SCRIPT);

        let state = Arc::new(Mutex::new(FakeState::default()));
        let quit_file = dir.path().join("quit");
        let running_file = dir.path().join("running");
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tied = accept_state.lock().unwrap().tied_to_process;
                if tied && !running_file.exists() {
                    continue;
                }
                tokio::spawn(serve(socket, accept_state.clone(), quit_file.clone()));
            }
        });

        Self { address, state, dir }
    }

    pub fn executable(&self) -> PathBuf {
        self.dir.path().join("excavator")
    }

    pub fn broken_executable(&self) -> PathBuf {
        self.dir.path().join("broken")
    }

    pub fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.executable(), self.address);
        config.poll_interval = Duration::from_millis(20);
        config.rpc_timeout = Duration::from_secs(2);
        config
    }

    /// Make the process exit as if it had crashed. Its workers and
    /// contexts go with it.
    pub fn crash(&self) {
        {
            let mut state = self.lock();
            state.workers.clear();
            state.contexts.clear();
        }
        std::fs::write(self.dir.path().join("quit"), b"").unwrap();
    }

    /// Only answer the API while the scripted process is up, like the real
    /// excavator.
    pub fn answer_only_while_running(&self) {
        self.lock().tied_to_process = true;
    }

    /// From now on the process fails to start.
    pub fn break_executable(&self) {
        // Replace rather than rewrite: a running script keeps reading its file.
        let staged = self.dir.path().join("excavator.new");
        write_script(&staged, FAILING_SCRIPT);
        std::fs::rename(staged, self.executable()).unwrap();
    }

    pub fn set_speed(&self, algorithm: &str, speed: f64) {
        self.lock().speeds.insert(algorithm.to_string(), speed);
    }

    /// Answer the next `method` call with an error.
    pub fn fail_next(&self, method: &str) {
        self.lock().failing.insert(method.to_string());
    }

    pub fn requests(&self) -> Vec<(String, Vec<String>)> {
        self.lock().requests.clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.lock().requests.iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn calls(&self, method: &str) -> Vec<Vec<String>> {
        self.lock()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls(method).len()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Workers excavator currently runs, as (algorithm, device id)
    pub fn workers(&self) -> Vec<(String, u32)> {
        self.lock().workers.values().cloned().collect()
    }

    pub fn contexts(&self) -> Vec<String> {
        let mut contexts: Vec<String> = self.lock().contexts.iter().cloned().collect();
        contexts.sort();
        contexts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

fn write_script(path: &std::path::Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn serve(socket: TcpStream, state: Arc<Mutex<FakeState>>, quit_file: PathBuf) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(_) => break,
        };
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params: Vec<String> = request["params"]
            .as_array()
            .map(|p| p.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let response = {
            let mut state = state.lock().unwrap();
            state.requests.push((method.clone(), params.clone()));
            respond(&mut state, &method, &params)
        };
        if method == "quit" {
            std::fs::write(&quit_file, b"").ok();
        }
        let mut out = response.to_string();
        out.push('\n');
        if write.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn respond(state: &mut FakeState, method: &str, params: &[String]) -> Value {
    if state.failing.remove(method) {
        return json!({"id": 1, "error": format!("{} refused", method)});
    }
    match method {
        "info" => json!({"id": 1, "error": null, "version": "fake-1.0"}),
        "device.list" => json!({
            "id": 1,
            "error": null,
            "devices": DEVICES
                .iter()
                .map(|(id, bus)| json!({"device_id": id, "name": "Fake GPU", "details": {"bus_id": bus}}))
                .collect::<Vec<_>>(),
        }),
        "algorithm.add" => {
            state.contexts.insert(params[0].clone());
            json!({"id": 1, "error": null})
        }
        "algorithm.remove" => {
            state.contexts.remove(&params[0]);
            json!({"id": 1, "error": null})
        }
        "worker.add" => {
            let id = state.next_worker;
            state.next_worker += 1;
            let device_id = params[1].parse().unwrap_or(u32::MAX);
            state.workers.insert(id, (params[0].clone(), device_id));
            json!({"id": 1, "error": null, "worker_id": id})
        }
        "worker.free" => {
            let id: u64 = params[0].parse().unwrap_or(u64::MAX);
            state.workers.remove(&id);
            json!({"id": 1, "error": null})
        }
        "worker.list" => {
            let workers: Vec<Value> = state
                .workers
                .values()
                .map(|(algorithm, device_id)| {
                    let subs = algorithm.trim_start_matches("benchmark-").split('_');
                    json!({
                        "device_id": device_id,
                        "algorithms": subs
                            .map(|sub| json!({
                                "name": sub,
                                "speed": state.speeds.get(sub).copied().unwrap_or(0.0),
                            }))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            json!({"id": 1, "error": null, "workers": workers})
        }
        _ => json!({"id": 1, "error": null}),
    }
}

/// Poll `check` every 20 ms for up to five seconds.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
