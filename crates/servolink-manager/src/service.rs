use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use servolink_proto::{RpcServer, Value, ValueMap};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::config::ServiceSpec;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct RunningService {
    child: Child,
}

impl RunningService {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawns and reaps the configured helper services on request.
pub struct ProcessManager {
    specs: BTreeMap<String, ServiceSpec>,
    running: Mutex<HashMap<String, RunningService>>,
}

impl ProcessManager {
    pub fn new(specs: BTreeMap<String, ServiceSpec>) -> Self {
        Self { specs, running: Mutex::new(HashMap::new()) }
    }

    /// Starts a service (idempotent) and waits for its readiness probe.
    pub async fn start_service(
        &self,
        name: &str,
        timeout_override_s: Option<f64>,
    ) -> Result<Value> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| anyhow!("unknown service '{name}'"))?
            .clone();

        let mut running = self.running.lock().await;
        if let Some(service) = running.get_mut(name) {
            if service.is_alive() {
                return Ok(self.describe_locked(name, &mut running));
            }
            running.remove(name);
        }

        let mut command = Command::new(&spec.command);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command.kill_on_drop(true);

        let child = command.spawn().with_context(|| {
            format!("failed to spawn service '{name}' ({})", spec.command)
        })?;
        info!(
            "service started: name={}, pid={}",
            name,
            child.id().unwrap_or(0)
        );
        running.insert(name.to_string(), RunningService { child });
        drop(running);

        if let Some(port) = spec.ready_port {
            let host = spec.ready_host.as_deref().unwrap_or("127.0.0.1");
            let budget = Duration::from_secs_f64(
                timeout_override_s.unwrap_or(spec.start_timeout_s).max(0.1),
            );
            if let Err(err) = wait_for_port(host, port, budget).await {
                // The child stays running; callers decide whether a slow
                // start is fatal.
                warn!(
                    "service readiness probe failed: name={}, error={}",
                    name, err
                );
                bail!("service '{name}' did not become ready: {err}");
            }
        }

        let mut running = self.running.lock().await;
        Ok(self.describe_locked(name, &mut running))
    }

    /// Kills a running service and reaps it.
    pub async fn stop_service(
        &self,
        name: &str,
        timeout_override_s: Option<f64>,
    ) -> Result<Value> {
        if !self.specs.contains_key(name) {
            bail!("unknown service '{name}'");
        }
        let stop_timeout = Duration::from_secs_f64(
            timeout_override_s
                .or_else(|| {
                    self.specs.get(name).map(|spec| spec.stop_timeout_s)
                })
                .unwrap_or(5.0)
                .max(0.1),
        );

        let mut running = self.running.lock().await;
        let Some(mut service) = running.remove(name) else {
            let mut reply = ValueMap::new();
            reply.insert("status".to_string(), Value::Str("stopped".into()));
            return Ok(Value::Map(reply));
        };
        drop(running);

        service.child.start_kill().ok();
        match timeout(stop_timeout, service.child.wait()).await {
            Ok(Ok(status)) => {
                info!(
                    "service stopped: name={}, status={}",
                    name, status
                );
            }
            Ok(Err(err)) => {
                warn!("service reap failed: name={}, error={}", name, err);
            }
            Err(_) => {
                warn!("service did not exit in time: name={}", name);
            }
        }

        let mut reply = ValueMap::new();
        reply.insert("status".to_string(), Value::Str("stopped".into()));
        Ok(Value::Map(reply))
    }

    /// Snapshot of all configured services and their states.
    pub async fn list_services(&self) -> Value {
        let mut running = self.running.lock().await;
        let mut services = ValueMap::new();
        for name in self.specs.keys() {
            services
                .insert(name.clone(), describe_service(name, &mut running));
        }
        let mut reply = ValueMap::new();
        reply.insert("services".to_string(), Value::Map(services));
        Value::Map(reply)
    }

    fn describe_locked(
        &self,
        name: &str,
        running: &mut HashMap<String, RunningService>,
    ) -> Value {
        let mut reply = ValueMap::new();
        let state = describe_service(name, running);
        let running_now = state
            .as_map()
            .and_then(|map| map.get("state"))
            .and_then(Value::as_str)
            == Some("running");
        reply.insert(
            "status".to_string(),
            Value::Str(if running_now { "running" } else { "stopped" }.into()),
        );
        reply.insert("service".to_string(), state);
        Value::Map(reply)
    }

    /// Wires the manager endpoints onto an RPC server.
    pub fn register_endpoints(self: &Arc<Self>, server: &mut RpcServer) {
        let manager = self.clone();
        server.register("start_service", true, move |data| {
            let manager = manager.clone();
            Box::pin(async move {
                let (name, timeout_s) = parse_service_request(data)?;
                manager.start_service(&name, timeout_s).await
            })
        });
        let manager = self.clone();
        server.register("stop_service", true, move |data| {
            let manager = manager.clone();
            Box::pin(async move {
                let (name, timeout_s) = parse_service_request(data)?;
                manager.stop_service(&name, timeout_s).await
            })
        });
        let manager = self.clone();
        server.register("list_services", false, move |_data| {
            let manager = manager.clone();
            Box::pin(async move { Ok(manager.list_services().await) })
        });
    }
}

fn describe_service(
    name: &str,
    running: &mut HashMap<String, RunningService>,
) -> Value {
    let mut state = ValueMap::new();
    let alive = running.get_mut(name).map(|service| service.is_alive());
    match alive {
        Some(true) => {
            let service = running.get(name).expect("checked above");
            state.insert("state".to_string(), Value::Str("running".into()));
            if let Some(pid) = service.pid() {
                state.insert("pid".to_string(), Value::Int(pid as i64));
            }
        }
        Some(false) => {
            running.remove(name);
            state.insert("state".to_string(), Value::Str("stopped".into()));
        }
        None => {
            state.insert("state".to_string(), Value::Str("stopped".into()));
        }
    }
    Value::Map(state)
}

fn parse_service_request(
    data: Option<Value>,
) -> Result<(String, Option<f64>)> {
    let data = data.ok_or_else(|| anyhow!("request requires data"))?;
    let map = data.as_map().ok_or_else(|| anyhow!("data must be a map"))?;
    let name = map
        .get("service")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("request missing 'service'"))?
        .to_string();
    let timeout_s = map.get("timeout_s").and_then(Value::as_f64);
    Ok((name, timeout_s))
}

async fn wait_for_port(host: &str, port: u16, budget: Duration) -> Result<()> {
    let deadline = Instant::now() + budget;
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(_) => return Ok(()),
            Err(_) if Instant::now() < deadline => {
                sleep(READY_POLL_INTERVAL).await;
            }
            Err(err) => {
                return Err(anyhow!(
                    "port {host}:{port} not reachable within {:.1}s: {err}",
                    budget.as_secs_f64()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use servolink_proto::Value;

    use super::ProcessManager;
    use crate::config::ServiceSpec;

    fn sleeper_spec() -> ServiceSpec {
        ServiceSpec {
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
            cwd: None,
            ready_host: None,
            ready_port: None,
            start_timeout_s: 2.0,
            stop_timeout_s: 2.0,
        }
    }

    fn manager() -> Arc<ProcessManager> {
        let mut specs = BTreeMap::new();
        specs.insert("sleeper".to_string(), sleeper_spec());
        Arc::new(ProcessManager::new(specs))
    }

    fn service_state(listing: &Value, name: &str) -> String {
        listing
            .as_map()
            .and_then(|map| map.get("services"))
            .and_then(Value::as_map)
            .and_then(|services| services.get(name))
            .and_then(Value::as_map)
            .and_then(|service| service.get("state"))
            .and_then(Value::as_str)
            .unwrap_or("missing")
            .to_string()
    }

    #[tokio::test]
    async fn start_list_stop_cycle() {
        let manager = manager();

        let reply =
            manager.start_service("sleeper", None).await.expect("start");
        assert_eq!(
            reply.as_map().and_then(|map| map.get("status")),
            Some(&Value::Str("running".into()))
        );

        let listing = manager.list_services().await;
        assert_eq!(service_state(&listing, "sleeper"), "running");

        // Starting again is idempotent.
        manager.start_service("sleeper", None).await.expect("restart");

        manager.stop_service("sleeper", None).await.expect("stop");
        let listing = manager.list_services().await;
        assert_eq!(service_state(&listing, "sleeper"), "stopped");
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let manager = manager();
        assert!(manager.start_service("ghost", None).await.is_err());
        assert!(manager.stop_service("ghost", None).await.is_err());
    }
}
