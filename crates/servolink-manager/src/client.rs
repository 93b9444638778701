use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use servolink_proto::{ClientOptions, RpcClient, Value, ValueMap};
use tokio::time::{sleep, Instant};

const ENSURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client side of the process supervisor.
pub struct ManagerClient {
    client: RpcClient,
}

impl ManagerClient {
    pub fn new(host: &str, port: u16, options: ClientOptions) -> Self {
        Self { client: RpcClient::new(host, port, options) }
    }

    pub async fn start_service(
        &mut self,
        service: &str,
        timeout_s: Option<f64>,
    ) -> Result<Value> {
        self.call("start_service", service, timeout_s).await
    }

    pub async fn stop_service(
        &mut self,
        service: &str,
        timeout_s: f64,
    ) -> Result<Value> {
        self.call("stop_service", service, Some(timeout_s)).await
    }

    pub async fn list_services(&mut self) -> Result<Value> {
        Ok(self.client.call_endpoint("list_services", None).await?)
    }

    /// Starts the service and polls the listing until it reports running
    /// or the deadline passes.
    pub async fn ensure_service(
        &mut self,
        service: &str,
        timeout_s: f64,
    ) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout_s.max(0.1));

        let reply = self.start_service(service, Some(timeout_s)).await?;
        if reply_status(&reply) != Some("running") {
            bail!("failed to start service '{service}': {reply:?}");
        }
        if service_state(&reply) == Some("running") {
            return Ok(());
        }

        while Instant::now() < deadline {
            let listing = self.list_services().await?;
            let state = listing
                .as_map()
                .and_then(|map| map.get("services"))
                .and_then(Value::as_map)
                .and_then(|services| services.get(service))
                .and_then(Value::as_map)
                .and_then(|entry| entry.get("state"))
                .and_then(Value::as_str);
            if state == Some("running") {
                return Ok(());
            }
            sleep(ENSURE_POLL_INTERVAL).await;
        }
        Err(anyhow!(
            "timed out waiting for service '{service}' to become ready"
        ))
    }

    async fn call(
        &mut self,
        endpoint: &str,
        service: &str,
        timeout_s: Option<f64>,
    ) -> Result<Value> {
        let mut data = ValueMap::new();
        data.insert("service".to_string(), Value::Str(service.to_string()));
        if let Some(timeout_s) = timeout_s {
            data.insert("timeout_s".to_string(), Value::Float(timeout_s));
        }
        Ok(self.client.call_endpoint(endpoint, Some(Value::Map(data))).await?)
    }
}

fn reply_status(reply: &Value) -> Option<&str> {
    reply.as_map()?.get("status")?.as_str()
}

fn service_state(reply: &Value) -> Option<&str> {
    reply
        .as_map()?
        .get("service")?
        .as_map()?
        .get("state")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use servolink_proto::{ClientOptions, RpcServer};

    use super::ManagerClient;
    use crate::config::ServiceSpec;
    use crate::service::ProcessManager;

    async fn spawn_manager_service() -> u16 {
        let mut specs = BTreeMap::new();
        specs.insert(
            "sleeper".to_string(),
            ServiceSpec {
                command: "sleep".to_string(),
                args: vec!["5".to_string()],
                cwd: None,
                ready_host: None,
                ready_port: None,
                start_timeout_s: 2.0,
                stop_timeout_s: 2.0,
            },
        );
        let manager = Arc::new(ProcessManager::new(specs));

        let mut server =
            RpcServer::bind("127.0.0.1", 0, None).await.expect("bind");
        manager.register_endpoints(&mut server);
        let port = server.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        port
    }

    #[tokio::test]
    async fn ensure_service_round_trip() {
        let port = spawn_manager_service().await;
        let mut client =
            ManagerClient::new("127.0.0.1", port, ClientOptions::default());

        client.ensure_service("sleeper", 3.0).await.expect("ensure");
        client.stop_service("sleeper", 2.0).await.expect("stop");

        let err = client
            .ensure_service("ghost", 1.0)
            .await
            .expect_err("unknown service");
        assert!(err.to_string().contains("ghost"));
    }
}
