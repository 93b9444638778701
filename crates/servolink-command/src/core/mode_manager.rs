use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use servolink_dispatch::ModeEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::service::CommandService;

/// How long the orchestrator waits for the edge to acknowledge shutdown
/// before exiting anyway.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolution of the cooperative shutdown handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAck {
    Acknowledged,
    TimedOut,
}

/// Applies operator mode events to the command service, in arrival order.
pub struct ModeManager {
    service: Arc<CommandService>,
    aliases: HashMap<String, String>,
    ai_key: Option<String>,
    idle_key: Option<String>,
    data_key: Option<String>,
}

impl ModeManager {
    pub fn new(
        service: Arc<CommandService>,
        aliases: HashMap<String, String>,
        ai_key: Option<String>,
        idle_key: Option<String>,
        data_key: Option<String>,
    ) -> Self {
        Self { service, aliases, ai_key, idle_key, data_key }
    }

    /// Consumes dispatcher events until a shutdown event is handled, the
    /// queue closes, or the token is cancelled.
    pub async fn run(
        self,
        mut events_rx: mpsc::Receiver<ModeEvent>,
        shutdown: CancellationToken,
    ) {
        let mut teleop_aliases: Vec<&String> = self
            .aliases
            .keys()
            .filter(|alias| !alias.starts_with("teleop:"))
            .collect();
        teleop_aliases.sort();
        if !teleop_aliases.is_empty() {
            info!(
                "teleop aliases available: aliases={}",
                teleop_aliases
                    .iter()
                    .map(|alias| alias.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if self.ai_key.is_some() {
            info!(r#"ai mode available: {{"infer": "<instruction>"}}"#);
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ModeEvent::Teleop { alias } => self.switch_teleop(&alias).await,
                ModeEvent::Infer { instruction } => {
                    self.switch_infer(&instruction).await;
                }
                ModeEvent::Idle { reason } => self.switch_idle(reason).await,
                ModeEvent::Data { command } => self.data_command(&command).await,
                ModeEvent::Shutdown { reason } => {
                    self.handle_shutdown(reason).await;
                    break;
                }
            }
        }
    }

    fn resolve(&self, alias: &str) -> String {
        self.aliases
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.to_string())
    }

    async fn clear_ai_instruction(&self) {
        if let Some(ai_key) = &self.ai_key {
            self.service.clear_ai_instruction(ai_key).await.ok();
        }
    }

    async fn switch_teleop(&self, alias: &str) {
        self.clear_ai_instruction().await;
        let key = self.resolve(alias);
        if let Err(err) = self.service.set_active(&key).await {
            warn!("mode switch failed: alias={}, error={}", alias, err);
        }
    }

    async fn switch_infer(&self, instruction: &str) {
        let Some(ai_key) = &self.ai_key else {
            warn!("inference requested but no ai provider is configured");
            return;
        };
        if let Err(err) =
            self.service.set_ai_instruction(ai_key, instruction).await
        {
            warn!("failed to store instruction: error={err}");
            return;
        }
        if let Err(err) = self.service.set_active(ai_key).await {
            warn!("mode switch failed: key={}, error={}", ai_key, err);
        }
    }

    async fn switch_idle(&self, reason: Option<String>) {
        let Some(idle_key) = &self.idle_key else {
            warn!("idle requested but no idle provider is configured");
            return;
        };
        if let Some(reason) = reason {
            info!("idle requested: reason={}", reason);
        }
        if let Err(err) = self.service.set_active(idle_key).await {
            warn!("mode switch failed: key={}, error={}", idle_key, err);
        }
        self.clear_ai_instruction().await;
    }

    async fn data_command(&self, command: &str) {
        let Some(data_key) = &self.data_key else {
            warn!("data command received but no data provider is configured");
            return;
        };
        if let Err(err) = self.service.data_control(data_key, command).await {
            warn!("data command failed: command={}, error={}", command, err);
        }
    }

    /// Cooperative shutdown: park on idle, flag the service, then wait up
    /// to two seconds for the shutdown envelope to reach a requester. The
    /// orchestrator exits either way.
    async fn handle_shutdown(&self, reason: Option<String>) -> ShutdownAck {
        info!(
            "shutdown requested: reason={}",
            reason.as_deref().unwrap_or("-")
        );

        if let Some(idle_key) = &self.idle_key {
            if let Err(err) = self.service.set_active(idle_key).await {
                warn!("failed to park on idle: error={err}");
            }
        }

        let ack = self.service.initiate_shutdown().await;
        let resolution = match timeout(SHUTDOWN_ACK_TIMEOUT, ack).await {
            Ok(Ok(())) => {
                info!("edge acknowledged shutdown");
                ShutdownAck::Acknowledged
            }
            _ => {
                warn!("no shutdown acknowledgement from edge (timeout)");
                ShutdownAck::TimedOut
            }
        };

        self.service.run_token().cancel();
        resolution
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use std::time::Duration;

    use servolink_dispatch::ModeEvent;
    use servolink_proto::{Value, ValueMap};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::ModeManager;
    use crate::core::service::CommandService;
    use crate::providers::{CommandProvider, IdleCommandProvider};

    fn build_service() -> Arc<CommandService> {
        let mut providers: HashMap<String, Box<dyn CommandProvider>> =
            HashMap::new();
        providers
            .insert("idle".to_string(), Box::new(IdleCommandProvider::default()));
        let mut actions = BTreeMap::new();
        actions.insert("a".to_string(), 1.0);
        providers.insert(
            "teleop:gamepad".to_string(),
            Box::new(IdleCommandProvider::new(actions)),
        );
        Arc::new(
            CommandService::new(
                providers,
                "idle",
                None,
                CancellationToken::new(),
            )
            .expect("build service"),
        )
    }

    fn aliases() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("gamepad".to_string(), "teleop:gamepad".to_string());
        map.insert("teleop:gamepad".to_string(), "teleop:gamepad".to_string());
        map
    }

    fn observation_request() -> Option<Value> {
        let mut payload = ValueMap::new();
        payload.insert("robot".to_string(), Value::Map(ValueMap::new()));
        let mut data = ValueMap::new();
        data.insert(
            "observation".to_string(),
            servolink_proto::Observation::new(payload).to_value(),
        );
        Some(Value::Map(data))
    }

    #[tokio::test]
    async fn alias_and_key_both_switch_the_same_provider() {
        let service = build_service();
        let manager = ModeManager::new(
            service.clone(),
            aliases(),
            None,
            Some("idle".to_string()),
            None,
        );
        let (events_tx, events_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let run = tokio::spawn(manager.run(events_rx, stop.clone()));

        events_tx
            .send(ModeEvent::Teleop { alias: "gamepad".to_string() })
            .await
            .expect("send event");
        // Wait until the switch is visible.
        for _ in 0..100 {
            if service.active_provider().await.as_deref()
                == Some("teleop:gamepad")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            service.active_provider().await.as_deref(),
            Some("teleop:gamepad")
        );

        events_tx
            .send(ModeEvent::Idle { reason: None })
            .await
            .expect("send event");
        for _ in 0..100 {
            if service.active_provider().await.as_deref() == Some("idle") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(service.active_provider().await.as_deref(), Some("idle"));

        stop.cancel();
        let _ = timeout(Duration::from_secs(2), run).await;
    }

    #[tokio::test]
    async fn shutdown_event_flags_service_and_exits_after_ack() {
        let service = build_service();
        let token = service.run_token();
        let manager = ModeManager::new(
            service.clone(),
            aliases(),
            None,
            Some("idle".to_string()),
            None,
        );
        let (events_tx, events_rx) = mpsc::channel(8);
        let run =
            tokio::spawn(manager.run(events_rx, CancellationToken::new()));

        events_tx
            .send(ModeEvent::Shutdown { reason: None })
            .await
            .expect("send event");

        // Act as the edge: poll get_action until the shutdown envelope
        // arrives, which acknowledges the handshake.
        let mut saw_shutdown = false;
        for _ in 0..200 {
            let reply = service
                .handle_get_action(observation_request())
                .await
                .expect("get_action");
            if reply
                .as_map()
                .is_some_and(|map| map.contains_key("status"))
            {
                saw_shutdown = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_shutdown);

        timeout(Duration::from_secs(3), run)
            .await
            .expect("manager exits")
            .expect("join");
        assert!(token.is_cancelled());
    }
}
