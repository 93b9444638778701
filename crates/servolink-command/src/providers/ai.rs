use std::any::Any;
use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use servolink_proto::{Action, Observation, RpcClient, RpcError, Value, ValueMap};
use tracing::{debug, info, warn};

use crate::adapters::{ActionAdapter, ObservationAdapter};
use crate::providers::{CommandProvider, ObservationHint};

const TASK_DESCRIPTION_KEY: &str = "annotation.human.task_description";

/// Learned-policy provider: holds a client to an inference server and a
/// prefetch ring of per-tick actions sized to the action horizon.
///
/// Setting or clearing the instruction drains the ring; the next `compute`
/// then pays for one inference call and refills it.
pub struct AiCommandProvider {
    client: RpcClient,
    instruction_key: String,
    instruction: Option<String>,
    observation_adapter: ObservationAdapter,
    action_adapter: ActionAdapter,
    action_horizon: usize,
    startup_timeout_ms: Option<u64>,
    preprocessed_frames: bool,
    pending: VecDeque<Action>,
}

impl AiCommandProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: RpcClient,
        instruction_key: String,
        observation_adapter: ObservationAdapter,
        action_adapter: ActionAdapter,
        action_horizon: usize,
        startup_timeout_ms: Option<u64>,
        preprocessed_frames: bool,
    ) -> Self {
        let action_horizon = action_horizon.max(1);
        Self {
            client,
            instruction_key,
            instruction: None,
            observation_adapter,
            action_adapter,
            action_horizon,
            startup_timeout_ms,
            preprocessed_frames,
            pending: VecDeque::with_capacity(action_horizon),
        }
    }

    pub fn set_instruction(&mut self, instruction: &str) {
        self.instruction = Some(instruction.to_string());
        self.pending.clear();
        info!("ai instruction set: instruction={}", instruction);
    }

    pub fn clear_instruction(&mut self) {
        self.instruction = None;
        self.pending.clear();
        info!("ai instruction cleared");
    }

    fn build_inference_payload(
        &self,
        observation: &Observation,
        instruction: &str,
    ) -> Result<ValueMap> {
        let mut payload = self.observation_adapter.build(observation)?;
        payload.insert(
            self.instruction_key.clone(),
            Value::Str(instruction.to_string()),
        );

        let description = match payload.get(TASK_DESCRIPTION_KEY) {
            Some(Value::List(items)) => Value::List(items.clone()),
            Some(other) => Value::List(vec![other.clone()]),
            None => Value::List(vec![Value::Str(instruction.to_string())]),
        };
        payload.insert(TASK_DESCRIPTION_KEY.to_string(), description);

        // Inference servers expect batched inputs: every remaining scalar
        // field becomes a single-element list.
        let keys: Vec<String> = payload.keys().cloned().collect();
        for key in keys {
            let Some(entry) = payload.get(&key) else {
                continue;
            };
            if matches!(
                entry,
                Value::NdArray(_) | Value::List(_) | Value::Modality(_)
            ) {
                continue;
            }
            let wrapped = Value::List(vec![entry.clone()]);
            payload.insert(key, wrapped);
        }
        Ok(payload)
    }

    async fn refill_pending(
        &mut self,
        observation: &Observation,
        instruction: &str,
    ) -> Result<()> {
        let payload = self.build_inference_payload(observation, instruction)?;

        let infer_start = Instant::now();
        let reply = match self
            .client
            .call_endpoint("get_action", Some(Value::Map(payload)))
            .await
        {
            Ok(reply) => reply,
            Err(RpcError::Timeout) => {
                warn!(
                    "inference timed out after {:.1}ms",
                    infer_start.elapsed().as_secs_f64() * 1000.0
                );
                return Err(RpcError::Timeout.into());
            }
            Err(err) => {
                warn!("inference call failed: error={err}");
                return Err(err.into());
            }
        };
        debug!(
            "inference round trip: elapsed_ms={:.1}",
            infer_start.elapsed().as_secs_f64() * 1000.0
        );

        let chunk = reply
            .as_map()
            .ok_or_else(|| anyhow!("inference reply is not a map"))?;
        let mut batches =
            self.action_adapter.extract(chunk, self.action_horizon)?;
        if batches.is_empty() {
            warn!("action adapter produced no actions, inserting noop");
            batches.push(Default::default());
        }
        batches.truncate(self.action_horizon);
        for batch in batches {
            self.pending.push_back(Action::new(batch));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandProvider for AiCommandProvider {
    async fn prepare(&mut self) -> Result<()> {
        self.pending.clear();

        // Probe the inference server under the (longer) startup deadline,
        // restoring the steady-state deadline regardless of outcome.
        let previous = self.client.timeout_ms();
        if let Some(startup) = self.startup_timeout_ms {
            self.client.set_timeout_ms(startup);
        }
        let reachable = self.client.ping().await;
        self.client.set_timeout_ms(previous);

        if !reachable {
            let (host, port) = self.client.endpoint();
            warn!(
                "inference server did not answer ping: host={}, port={}",
                host, port
            );
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    async fn compute(&mut self, observation: &Observation) -> Result<Action> {
        let Some(instruction) = self.instruction.clone() else {
            self.pending.clear();
            return Ok(Action::empty());
        };

        if self.pending.is_empty() {
            self.refill_pending(observation, &instruction).await?;
        }

        Ok(self.pending.pop_front().unwrap_or_else(Action::empty))
    }

    fn wants_full_observation(&self) -> bool {
        true
    }

    fn observation_hint(&self) -> ObservationHint {
        if self.preprocessed_frames {
            ObservationHint::FullPreprocessed
        } else {
            ObservationHint::Full
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use servolink_proto::{
        ClientOptions, NdArray, Observation, RpcClient, RpcServer, Value,
        ValueMap,
    };

    use super::AiCommandProvider;
    use crate::adapters::{ActionAdapter, ObservationAdapter};
    use crate::providers::CommandProvider;

    /// Inference stub replying with a three-step chunk and counting calls.
    async fn spawn_inference_stub() -> (u16, Arc<AtomicUsize>) {
        let mut server = RpcServer::bind("127.0.0.1", 0, None)
            .await
            .expect("bind inference stub");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        server.register("get_action", true, move |data| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let data = data.unwrap_or(Value::Nil);
                let request = data.as_map().cloned().unwrap_or_default();
                assert!(request.contains_key("language_instruction"));

                let mut reply = ValueMap::new();
                reply.insert(
                    "action.left_arm".to_string(),
                    Value::NdArray(
                        NdArray::from_f32(
                            vec![3, 1],
                            &[0.1, 0.2, 0.3],
                        )
                        .expect("chunk"),
                    ),
                );
                Ok(Value::Map(reply))
            })
        });
        let port = server.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (port, calls)
    }

    fn full_observation() -> Observation {
        let mut robot = ValueMap::new();
        robot.insert("elbow.pos".to_string(), Value::Float(0.5));
        robot.insert(
            "cam".to_string(),
            Value::NdArray(
                NdArray::from_u8(vec![2, 2, 3], vec![0; 12]).expect("frame"),
            ),
        );
        let mut payload = ValueMap::new();
        payload.insert("robot".to_string(), Value::Map(robot));
        Observation::new(payload)
    }

    fn groot_adapter() -> ActionAdapter {
        ActionAdapter::Groot(crate::adapters::Gr00tActionConfig {
            left_arm: vec!["elbow.pos".to_string()],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn chunk_is_prefetched_and_served_across_ticks() {
        let (port, calls) = spawn_inference_stub().await;
        let client =
            RpcClient::new("127.0.0.1", port, ClientOptions::default());
        let mut provider = AiCommandProvider::new(
            client,
            "language_instruction".to_string(),
            ObservationAdapter::Passthrough,
            groot_adapter(),
            8,
            None,
            false,
        );

        provider.set_instruction("pick the cup");
        let observation = full_observation();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let action =
                provider.compute(&observation).await.expect("compute");
            seen.push(action.actions["elbow.pos"]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!((seen[0] - 0.1).abs() < 1e-6);
        assert!((seen[1] - 0.2).abs() < 1e-6);
        assert!((seen[2] - 0.3).abs() < 1e-6);

        // The chunk is spent; the next tick triggers a second inference.
        provider.compute(&observation).await.expect("compute");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_instruction_yields_empty_actions_without_calls() {
        let (port, calls) = spawn_inference_stub().await;
        let client =
            RpcClient::new("127.0.0.1", port, ClientOptions::default());
        let mut provider = AiCommandProvider::new(
            client,
            "language_instruction".to_string(),
            ObservationAdapter::Passthrough,
            groot_adapter(),
            8,
            None,
            false,
        );

        let action = provider
            .compute(&full_observation())
            .await
            .expect("compute without instruction");
        assert!(action.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_instruction_drains_pending_chunk() {
        let (port, calls) = spawn_inference_stub().await;
        let client =
            RpcClient::new("127.0.0.1", port, ClientOptions::default());
        let mut provider = AiCommandProvider::new(
            client,
            "language_instruction".to_string(),
            ObservationAdapter::Passthrough,
            groot_adapter(),
            8,
            None,
            false,
        );

        provider.set_instruction("first");
        provider.compute(&full_observation()).await.expect("compute");
        provider.set_instruction("second");
        provider.compute(&full_observation()).await.expect("compute");

        // Each instruction change forced a fresh inference call.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
