use std::any::Any;
use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use servolink_driver::Teleoperator;
use servolink_manager::ManagerClient;
use servolink_proto::{
    ensure_action, Action, ClientOptions, Observation, RpcClient, RpcError,
    Value, ValueMap,
};
use tracing::{info, warn};

use crate::providers::{
    apply_pipeline, numeric_only, robot_payload, ActionPipeline,
    CommandProvider,
};

/// Wraps a local teleoperator driver: `prepare` connects, `shutdown`
/// disconnects, `compute` reads one action and runs the two optional
/// transform pipelines.
pub struct LocalTeleopProvider {
    teleop: Box<dyn Teleoperator>,
    teleop_action_processor: Option<ActionPipeline>,
    robot_action_processor: Option<ActionPipeline>,
}

impl LocalTeleopProvider {
    pub fn new(
        teleop: Box<dyn Teleoperator>,
        teleop_action_processor: Option<ActionPipeline>,
        robot_action_processor: Option<ActionPipeline>,
    ) -> Self {
        Self { teleop, teleop_action_processor, robot_action_processor }
    }
}

#[async_trait]
impl CommandProvider for LocalTeleopProvider {
    async fn prepare(&mut self) -> Result<()> {
        self.teleop.connect().await.context("teleop connect failed")?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.teleop.disconnect().await.context("teleop disconnect failed")?;
        Ok(())
    }

    async fn compute(&mut self, observation: &Observation) -> Result<Action> {
        let robot_obs = robot_payload(observation);
        self.teleop.on_observation(&robot_obs).await.ok();

        let raw_action =
            self.teleop.get_action().await.context("teleop read failed")?;
        let teleop_action = apply_pipeline(
            self.teleop_action_processor.as_ref(),
            raw_action,
            &robot_obs,
        );
        let robot_action = apply_pipeline(
            self.robot_action_processor.as_ref(),
            teleop_action,
            &robot_obs,
        );
        Ok(Action::new(robot_action))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Supervisor hookup for remote teleop: the named service is started before
/// use and stopped again on shutdown.
pub struct ManagedService {
    pub client: ManagerClient,
    pub service: String,
    pub start_timeout_s: f64,
    pub stop_timeout_s: f64,
    started: bool,
}

impl ManagedService {
    pub fn new(
        client: ManagerClient,
        service: String,
        start_timeout_s: f64,
        stop_timeout_s: f64,
    ) -> Self {
        Self { client, service, start_timeout_s, stop_timeout_s, started: false }
    }
}

/// Nested RPC client to a teleop action server on another host. `prepare`
/// re-opens the socket and pings; `shutdown` keeps the connection pool
/// alive and only stops the supervised peer service, if any.
pub struct RemoteTeleopProvider {
    host: String,
    port: u16,
    timeout_ms: u64,
    api_token: Option<String>,
    client: Option<RpcClient>,
    manager: Option<ManagedService>,
}

impl RemoteTeleopProvider {
    pub fn new(
        host: String,
        port: u16,
        timeout_ms: u64,
        api_token: Option<String>,
        manager: Option<ManagedService>,
    ) -> Self {
        Self { host, port, timeout_ms, api_token, client: None, manager }
    }

    async fn ensure_manager_service(&mut self) -> Result<()> {
        let Some(manager) = self.manager.as_mut() else {
            return Ok(());
        };
        info!(
            "requesting supervised start: service={}",
            manager.service
        );
        manager
            .client
            .ensure_service(&manager.service, manager.start_timeout_s)
            .await
            .with_context(|| {
                format!("failed to start service '{}'", manager.service)
            })?;
        manager.started = true;
        Ok(())
    }

    async fn stop_manager_service(&mut self) {
        let Some(manager) = self.manager.as_mut() else {
            return;
        };
        if !manager.started {
            return;
        }
        info!("requesting supervised stop: service={}", manager.service);
        if let Err(err) = manager
            .client
            .stop_service(&manager.service, manager.stop_timeout_s)
            .await
        {
            warn!(
                "failed to stop supervised service: service={}, error={}",
                manager.service, err
            );
        }
        manager.started = false;
    }
}

#[async_trait]
impl CommandProvider for RemoteTeleopProvider {
    async fn prepare(&mut self) -> Result<()> {
        self.ensure_manager_service().await?;

        match self.client.as_mut() {
            Some(client) => client.reset(),
            None => {
                self.client = Some(RpcClient::new(
                    &self.host,
                    self.port,
                    ClientOptions {
                        timeout_ms: self.timeout_ms,
                        api_token: self.api_token.clone(),
                        ..Default::default()
                    },
                ));
            }
        }

        let client = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow!("remote teleop client not initialised"))?;
        if !client.ping().await {
            bail!(
                "failed to reach teleop server {}:{}",
                self.host,
                self.port
            );
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stop_manager_service().await;
        Ok(())
    }

    async fn compute(&mut self, observation: &Observation) -> Result<Action> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow!("remote teleop client not connected"))?;

        let mut request = ValueMap::new();
        request.insert(
            "observation".to_string(),
            Value::Map(numeric_observation_payload(observation)),
        );

        let reply = match client
            .call_endpoint("get_action", Some(Value::Map(request)))
            .await
        {
            Ok(reply) => reply,
            Err(RpcError::Timeout) => bail!("remote teleop timed out"),
            Err(err) => return Err(err.into()),
        };

        let reply_map = reply
            .as_map()
            .ok_or_else(|| anyhow!("remote teleop reply is not a map"))?;
        let action_value = reply_map.get("action").ok_or_else(|| {
            anyhow!("remote teleop response missing action")
        })?;
        Ok(ensure_action(action_value)?)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Trims an observation to a numeric-only snapshot for the wire: numeric
/// `robot`/`base` channels, numeric free keys, scalar metadata.
pub fn numeric_observation_payload(observation: &Observation) -> ValueMap {
    let mut trimmed = ValueMap::new();

    let robot = observation
        .payload
        .get("robot")
        .and_then(Value::as_map)
        .map(numeric_only)
        .unwrap_or_default();
    let base = observation
        .payload
        .get("base")
        .and_then(Value::as_map)
        .map(numeric_only)
        .unwrap_or_default();
    trimmed.insert("robot".to_string(), float_map(robot));
    trimmed.insert("base".to_string(), float_map(base));

    for (key, value) in &observation.payload {
        if key == "robot" || key == "base" {
            continue;
        }
        if let Some(number) = value.as_f64() {
            trimmed.insert(key.clone(), Value::Float(number));
        }
    }

    trimmed
        .insert("timestamp_ns".to_string(), Value::Int(observation.timestamp_ns));
    if let Some(metadata) = &observation.metadata {
        let mut scalars = ValueMap::new();
        for (key, value) in metadata {
            if value.is_numeric_scalar() || matches!(value, Value::Str(_)) {
                scalars.insert(key.clone(), value.clone());
            }
        }
        trimmed.insert("metadata".to_string(), Value::Map(scalars));
    }
    trimmed
}

fn float_map(values: BTreeMap<String, f64>) -> Value {
    let mut map = ValueMap::new();
    for (key, value) in values {
        map.insert(key, Value::Float(value));
    }
    Value::Map(map)
}
