use servolink_proto::{
    ensure_action, Action, Observation, RpcClient, RpcError, Status, Value,
    ValueMap,
};
use tracing::debug;

use super::service::ObservationMode;

/// One classified `get_action` exchange.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The orchestrator returned an action, possibly with a new
    /// observation-mode hint for the next tick.
    Action { action: Action, hint: Option<ObservationMode> },
    /// The orchestrator is shutting down; the loop must stop.
    Shutdown,
}

/// Edge-side view of the orchestrator's command channel.
pub struct CommandChannelClient {
    client: RpcClient,
}

impl CommandChannelClient {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    /// Sends one observation and classifies the reply. Timeout/transport
    /// errors bubble up as `RpcError` for the caller's fallback ladder.
    pub async fn compute_action(
        &mut self,
        observation: &Observation,
    ) -> Result<CommandOutcome, RpcError> {
        let mut data = ValueMap::new();
        data.insert("observation".to_string(), observation.to_value());

        let reply = self
            .client
            .call_endpoint("get_action", Some(Value::Map(data)))
            .await?;
        let map = reply.as_map().ok_or_else(|| {
            RpcError::MalformedReply("get_action reply is not a map".into())
        })?;

        if let Some(status_value) = map.get("status") {
            let status = Status::from_value(status_value)
                .map_err(|err| RpcError::MalformedReply(err.to_string()))?;
            if status.status == "shutdown" {
                return Ok(CommandOutcome::Shutdown);
            }
            return Err(RpcError::MalformedReply(format!(
                "unexpected status '{}'",
                status.status
            )));
        }

        let action_value = map.get("action").ok_or_else(|| {
            RpcError::MalformedReply("reply missing action".into())
        })?;
        let action = ensure_action(action_value)
            .map_err(|err| RpcError::MalformedReply(err.to_string()))?;

        let hint = map
            .get("observation_hint")
            .and_then(Value::as_str)
            .and_then(ObservationMode::parse);
        if hint.is_none() {
            debug!("reply carried no usable observation hint");
        }

        Ok(CommandOutcome::Action { action, hint })
    }

    /// Publishes the edge configuration for orchestrator introspection.
    pub async fn sync_config(&mut self, config: Value) -> Result<(), RpcError> {
        let reply = self.client.call_endpoint("sync_config", Some(config)).await?;
        let ok = reply
            .as_map()
            .and_then(|map| map.get("status"))
            .and_then(Value::as_str)
            == Some("ok");
        if !ok {
            return Err(RpcError::MalformedReply(
                "sync_config was not acknowledged".into(),
            ));
        }
        Ok(())
    }

    pub async fn ping(&mut self) -> bool {
        self.client.ping().await
    }
}
