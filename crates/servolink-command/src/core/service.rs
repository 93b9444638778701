use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use servolink_proto::{
    ensure_observation, Action, RpcServer, Status, Value, ValueMap,
};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::providers::{CommandProvider, ObservationHint};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("provider '{key}' failed to prepare: {source}")]
    Prepare { key: String, source: anyhow::Error },
    #[error("provider '{key}' is not a {expected} provider")]
    WrongProvider { key: String, expected: &'static str },
}

/// Callback observing every observation/action exchange. Errors are logged
/// and swallowed; the exchange itself never fails because of the hook.
pub type ExchangeHook =
    Box<dyn Fn(&Value, &Value, &str) -> Result<()> + Send + Sync>;

struct ServiceState {
    providers: HashMap<String, Box<dyn CommandProvider>>,
    active_key: Option<String>,
    prepared: HashSet<String>,
    current_mode: String,
    observation_hint: ObservationHint,
    last_config: Option<Value>,
    shutdown_requested: bool,
    shutdown_ack: Option<oneshot::Sender<()>>,
}

/// Owns the provider registry and serializes every lifecycle transition
/// and `get_action` exchange behind one lock. At most one provider is
/// prepared at any instant.
pub struct CommandService {
    state: Mutex<ServiceState>,
    default_key: String,
    exchange_hook: Option<ExchangeHook>,
    run_token: CancellationToken,
}

impl CommandService {
    pub fn new(
        providers: HashMap<String, Box<dyn CommandProvider>>,
        default_key: &str,
        exchange_hook: Option<ExchangeHook>,
        run_token: CancellationToken,
    ) -> Result<Self> {
        if !providers.contains_key(default_key) {
            return Err(anyhow!("default provider '{default_key}' not found"));
        }
        Ok(Self {
            state: Mutex::new(ServiceState {
                providers,
                active_key: None,
                prepared: HashSet::new(),
                current_mode: default_key.to_string(),
                observation_hint: ObservationHint::Numeric,
                last_config: None,
                shutdown_requested: false,
                shutdown_ack: None,
            }),
            default_key: default_key.to_string(),
            exchange_hook,
            run_token,
        })
    }

    pub fn run_token(&self) -> CancellationToken {
        self.run_token.clone()
    }

    pub async fn available_providers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> =
            state.providers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Switches the active provider: a no-op when `key` is already active
    /// and prepared, otherwise the current provider is shut down first and
    /// the new one prepared. A preparation failure leaves no provider
    /// active.
    pub async fn set_active(&self, key: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        activate_locked(&mut state, key).await
    }

    /// Shuts the active provider down exactly once; used when the
    /// orchestrator itself exits.
    pub async fn shutdown_active(&self) {
        let mut state = self.state.lock().await;
        deactivate_locked(&mut state).await;
    }

    /// Marks shutdown requested. The returned receiver resolves once the
    /// shutdown status envelope has been delivered to a requester.
    pub async fn initiate_shutdown(&self) -> oneshot::Receiver<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        state.shutdown_requested = true;
        state.shutdown_ack = Some(ack_tx);
        ack_rx
    }

    pub async fn set_ai_instruction(
        &self,
        key: &str,
        instruction: &str,
    ) -> Result<(), ServiceError> {
        self.with_ai(key, |ai| ai.set_instruction(instruction)).await
    }

    pub async fn clear_ai_instruction(
        &self,
        key: &str,
    ) -> Result<(), ServiceError> {
        self.with_ai(key, |ai| ai.clear_instruction()).await
    }

    async fn with_ai<F>(&self, key: &str, apply: F) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut crate::providers::AiCommandProvider),
    {
        let mut state = self.state.lock().await;
        let provider = state
            .providers
            .get_mut(key)
            .ok_or_else(|| ServiceError::UnknownProvider(key.to_string()))?;
        let Some(ai) = provider
            .as_any_mut()
            .downcast_mut::<crate::providers::AiCommandProvider>()
        else {
            return Err(ServiceError::WrongProvider {
                key: key.to_string(),
                expected: "ai",
            });
        };
        apply(ai);
        Ok(())
    }

    /// Routes an operator control command to the data-collection provider.
    pub async fn data_control(
        &self,
        key: &str,
        command: &str,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        let provider = state
            .providers
            .get_mut(key)
            .ok_or_else(|| ServiceError::UnknownProvider(key.to_string()))?;
        let Some(data) = provider
            .as_any_mut()
            .downcast_mut::<crate::providers::DataCollectionProvider>()
        else {
            return Err(ServiceError::WrongProvider {
                key: key.to_string(),
                expected: "data",
            });
        };
        if let Err(err) = data.handle_control_command(command).await {
            warn!("data control command failed: command={command}, error={err}");
        }
        Ok(())
    }

    /// The `get_action` endpoint body.
    pub async fn handle_get_action(&self, data: Option<Value>) -> Result<Value> {
        let data = data.ok_or_else(|| anyhow!("get_action requires data"))?;
        let observation_value = data
            .as_map()
            .and_then(|map| map.get("observation"))
            .ok_or_else(|| anyhow!("get_action data missing observation"))?;
        let observation = ensure_observation(observation_value)?;

        let mut state = self.state.lock().await;

        if state.shutdown_requested {
            let status = Status::new("shutdown");
            if let Some(ack) = state.shutdown_ack.take() {
                ack.send(()).ok();
            }
            // Delivery of the shutdown envelope ends the serve loop.
            self.run_token.cancel();
            let mut reply = ValueMap::new();
            reply.insert("status".to_string(), status.to_value());
            return Ok(Value::Map(reply));
        }

        if state.active_key.is_none() {
            let default_key = self.default_key.clone();
            activate_locked(&mut state, &default_key)
                .await
                .map_err(|err| anyhow!(err.to_string()))?;
        }

        let key = state
            .active_key
            .clone()
            .unwrap_or_else(|| self.default_key.clone());
        let provider = state
            .providers
            .get_mut(&key)
            .ok_or_else(|| anyhow!("active provider '{key}' disappeared"))?;

        let action = if provider.wants_full_observation()
            && !observation.contains_image()
        {
            // Backpressure: ask the edge to switch observation modes
            // without invoking the provider.
            info!("provider requires camera frames, requesting full observation");
            Action::empty()
        } else {
            provider
                .compute(&observation)
                .await
                .map_err(|err| anyhow!("provider '{key}' failed: {err}"))?
        };

        let hint = state.observation_hint;
        let mode = state.current_mode.clone();
        drop(state);

        let action_value = action.to_value();
        if let Some(hook) = &self.exchange_hook {
            if let Err(err) =
                hook(&observation.to_value(), &action_value, &mode)
            {
                warn!("exchange hook failed: error={err}");
            }
        }

        let mut reply = ValueMap::new();
        reply.insert("action".to_string(), action_value);
        reply.insert(
            "observation_hint".to_string(),
            Value::Str(hint.as_str().to_string()),
        );
        Ok(Value::Map(reply))
    }

    /// The `sync_config` endpoint body: stores the last-seen config for
    /// introspection.
    pub async fn handle_sync_config(&self, data: Option<Value>) -> Result<Value> {
        let mut state = self.state.lock().await;
        state.last_config = data;
        let mut reply = ValueMap::new();
        reply.insert("status".to_string(), Value::Str("ok".into()));
        Ok(Value::Map(reply))
    }

    pub async fn last_config(&self) -> Option<Value> {
        self.state.lock().await.last_config.clone()
    }

    pub async fn active_provider(&self) -> Option<String> {
        self.state.lock().await.active_key.clone()
    }

    /// Wires the service endpoints onto an RPC server.
    pub fn register_endpoints(
        self: &std::sync::Arc<Self>,
        server: &mut RpcServer,
    ) {
        let service = self.clone();
        server.register("get_action", true, move |data| {
            let service = service.clone();
            Box::pin(async move { service.handle_get_action(data).await })
        });
        let service = self.clone();
        server.register("sync_config", true, move |data| {
            let service = service.clone();
            Box::pin(async move { service.handle_sync_config(data).await })
        });
    }
}

async fn activate_locked(
    state: &mut ServiceState,
    key: &str,
) -> Result<(), ServiceError> {
    if !state.providers.contains_key(key) {
        return Err(ServiceError::UnknownProvider(key.to_string()));
    }
    if state.active_key.as_deref() == Some(key) && state.prepared.contains(key)
    {
        return Ok(());
    }

    deactivate_locked(state).await;

    let provider = state
        .providers
        .get_mut(key)
        .ok_or_else(|| ServiceError::UnknownProvider(key.to_string()))?;
    if let Err(source) = provider.prepare().await {
        state.active_key = None;
        return Err(ServiceError::Prepare { key: key.to_string(), source });
    }

    state.active_key = Some(key.to_string());
    state.prepared.insert(key.to_string());
    state.current_mode = key.to_string();
    state.observation_hint = state
        .providers
        .get(key)
        .map(|provider| provider.observation_hint())
        .unwrap_or(ObservationHint::Numeric);
    info!("active provider: key={}", key);
    Ok(())
}

async fn deactivate_locked(state: &mut ServiceState) {
    let Some(active) = state.active_key.take() else {
        return;
    };
    if let Some(provider) = state.providers.get_mut(&active) {
        if let Err(err) = provider.shutdown().await {
            warn!("provider shutdown failed: key={}, error={}", active, err);
        }
    }
    state.prepared.remove(&active);
    state.observation_hint = ObservationHint::Numeric;
}
