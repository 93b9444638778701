use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use servolink_driver::Teleoperator;
use servolink_proto::{Action, RpcServer, Value, ValueMap};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Transform applied to a teleop action given the peer's robot observation.
pub type ActionPipeline = Box<
    dyn Fn(&BTreeMap<String, f64>, &ValueMap) -> BTreeMap<String, f64>
        + Send
        + Sync,
>;

/// Serves one local teleoperator to remote orchestrators: `get_action`
/// mirrors the peer's robot observation into the driver, reads an action
/// and runs the optional transform pipelines.
pub struct TeleopActionServer {
    teleop_id: String,
    teleop: Mutex<Box<dyn Teleoperator>>,
    teleop_action_processor: Option<ActionPipeline>,
    robot_action_processor: Option<ActionPipeline>,
}

impl TeleopActionServer {
    pub fn new(
        teleop_id: String,
        teleop: Box<dyn Teleoperator>,
        teleop_action_processor: Option<ActionPipeline>,
        robot_action_processor: Option<ActionPipeline>,
    ) -> Self {
        Self {
            teleop_id,
            teleop: Mutex::new(teleop),
            teleop_action_processor,
            robot_action_processor,
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.teleop
            .lock()
            .await
            .connect()
            .await
            .context("teleop connect failed")
    }

    pub async fn disconnect(&self) {
        if let Err(err) = self.teleop.lock().await.disconnect().await {
            warn!("teleop disconnect failed: error={err}");
        }
    }

    async fn handle_get_action(&self, data: Option<Value>) -> Result<Value> {
        let robot_obs = data
            .as_ref()
            .and_then(Value::as_map)
            .and_then(|map| map.get("observation"))
            .and_then(Value::as_map)
            .and_then(|observation| observation.get("robot"))
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();

        let mut teleop = self.teleop.lock().await;
        teleop.on_observation(&robot_obs).await.ok();
        let raw_action = teleop
            .get_action()
            .await
            .map_err(|err| anyhow!("teleop read failed: {err}"))?;
        drop(teleop);

        let teleop_action = match &self.teleop_action_processor {
            Some(pipeline) => pipeline(&raw_action, &robot_obs),
            None => raw_action,
        };
        let robot_action = match &self.robot_action_processor {
            Some(pipeline) => pipeline(&teleop_action, &robot_obs),
            None => teleop_action,
        };

        let mut reply = ValueMap::new();
        reply.insert("action".to_string(), Action::new(robot_action).to_value());
        Ok(Value::Map(reply))
    }

    fn handle_sync_config(&self) -> Value {
        let mut reply = ValueMap::new();
        reply.insert("status".to_string(), Value::Str("ok".into()));
        reply.insert(
            "teleop_id".to_string(),
            Value::Str(self.teleop_id.clone()),
        );
        Value::Map(reply)
    }

    pub fn register_endpoints(self: &Arc<Self>, server: &mut RpcServer) {
        let teleop = self.clone();
        server.register("get_action", true, move |data| {
            let teleop = teleop.clone();
            Box::pin(async move { teleop.handle_get_action(data).await })
        });
        let teleop = self.clone();
        server.register("sync_config", true, move |_data| {
            let teleop = teleop.clone();
            Box::pin(async move { Ok(teleop.handle_sync_config()) })
        });
    }

    /// Connects the driver, serves until killed, then disconnects even on
    /// error paths.
    pub async fn serve(self: Arc<Self>, server: RpcServer) -> Result<()> {
        self.connect().await?;
        info!("teleop action server ready: teleop_id={}", self.teleop_id);
        let result = server.run().await;
        self.disconnect().await;
        result.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use servolink_driver::{ScriptedTeleopConfig, ScriptedTeleoperator};
    use servolink_proto::{
        ensure_action, ClientOptions, RpcClient, RpcServer, Value, ValueMap,
    };

    use super::TeleopActionServer;

    async fn spawn_server() -> (u16, tokio::task::JoinHandle<()>) {
        let teleop = ScriptedTeleoperator::new(ScriptedTeleopConfig {
            joints: vec!["elbow".to_string()],
            amplitude: 0.5,
            period_ticks: 10,
        });
        let service = Arc::new(TeleopActionServer::new(
            "sim-gamepad".to_string(),
            Box::new(teleop),
            None,
            Some(Box::new(|action, _obs| {
                action.iter().map(|(k, v)| (k.clone(), v * 2.0)).collect()
            })),
        ));

        let mut server =
            RpcServer::bind("127.0.0.1", 0, None).await.expect("bind");
        service.register_endpoints(&mut server);
        let port = server.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            let _ = service.serve(server).await;
        });
        (port, handle)
    }

    #[tokio::test]
    async fn get_action_runs_driver_and_pipelines() {
        let (port, _handle) = spawn_server().await;
        let mut client =
            RpcClient::new("127.0.0.1", port, ClientOptions::default());

        let mut observation = ValueMap::new();
        observation.insert("robot".to_string(), Value::Map(ValueMap::new()));
        let mut data = ValueMap::new();
        data.insert("observation".to_string(), Value::Map(observation));

        let reply = client
            .call_endpoint("get_action", Some(Value::Map(data)))
            .await
            .expect("get_action");
        let action = ensure_action(
            reply
                .as_map()
                .and_then(|map| map.get("action"))
                .expect("action field"),
        )
        .expect("action envelope");
        let value = action.actions.get("elbow.pos").expect("channel");
        assert!(value.abs() <= 1.0 + 1e-9);
    }

    #[tokio::test]
    async fn sync_config_reports_teleop_id() {
        let (port, _handle) = spawn_server().await;
        let mut client =
            RpcClient::new("127.0.0.1", port, ClientOptions::default());

        let reply = client
            .call_endpoint("sync_config", Some(Value::Map(ValueMap::new())))
            .await
            .expect("sync_config");
        assert_eq!(
            reply.as_map().and_then(|map| map.get("teleop_id")),
            Some(&Value::Str("sim-gamepad".into()))
        );
    }
}
