use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use servolink_proto::{Action, Value, ValueMap};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::camera::CameraStreamer;
use super::client::{CommandChannelClient, CommandOutcome};
use super::filter::MedianActionFilter;
use super::service::RobotControlService;

/// What one tick decided about the loop's future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Shutdown,
}

/// Fixed-rate observe/call/apply loop with the tiered timeout fallback:
/// while misses stay within budget the literal fallback (or the previous
/// action) is replayed; past the budget the robot is commanded to zero and
/// the miss counter restarts.
pub struct CommandLoop {
    service: RobotControlService,
    client: CommandChannelClient,
    period: Duration,
    max_missed_actions: u32,
    fallback_action: Option<BTreeMap<String, f64>>,
    filter: Option<MedianActionFilter>,
    camera: Option<CameraStreamer>,
    missed_actions: u32,
}

impl CommandLoop {
    pub fn new(
        service: RobotControlService,
        client: CommandChannelClient,
        rate_hz: f64,
        max_missed_actions: u32,
        fallback_action: Option<BTreeMap<String, f64>>,
        filter: Option<MedianActionFilter>,
        camera: Option<CameraStreamer>,
    ) -> Self {
        Self {
            service,
            client,
            period: Duration::from_secs_f64(1.0 / rate_hz.max(1e-3)),
            max_missed_actions,
            fallback_action,
            filter,
            camera,
            missed_actions: 0,
        }
    }

    pub fn service_mut(&mut self) -> &mut RobotControlService {
        &mut self.service
    }

    pub fn client_mut(&mut self) -> &mut CommandChannelClient {
        &mut self.client
    }

    /// Runs until the orchestrator announces shutdown or the token is
    /// cancelled. A late tick never triggers a catch-up burst: the next
    /// tick simply starts immediately.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "control loop running: period_ms={:.1}, max_missed={}",
            self.period.as_secs_f64() * 1000.0,
            self.max_missed_actions
        );

        while !shutdown.is_cancelled() {
            let tick_start = Instant::now();
            if self.tick().await? == TickOutcome::Shutdown {
                info!("orchestrator requested shutdown, stopping loop");
                break;
            }

            let elapsed = tick_start.elapsed();
            if let Some(remaining) = self.period.checked_sub(elapsed) {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
        }

        Ok(())
    }

    /// One observe/call/apply exchange.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let (observation, raw) = self.service.observe().await?;

        if let Some(camera) = &self.camera {
            let mut wrapper = ValueMap::new();
            wrapper.insert("robot".to_string(), Value::Map(raw));
            camera.publish(&Value::Map(wrapper));
        }

        let action = match self.client.compute_action(&observation).await {
            Ok(CommandOutcome::Shutdown) => return Ok(TickOutcome::Shutdown),
            Ok(CommandOutcome::Action { action, hint }) => {
                self.missed_actions = 0;
                if let Some(mode) = hint {
                    self.service.set_observation_mode(mode);
                }
                match &mut self.filter {
                    Some(filter) => Action::new(filter.apply(&action.actions)),
                    None => action,
                }
            }
            Err(err) => {
                self.missed_actions += 1;
                warn!(
                    "action request failed: misses={}, error={}",
                    self.missed_actions, err
                );
                self.substitute_action()
            }
        };

        // Actuation faults are fatal: the loop prefers stopping over
        // driving a robot it cannot trust.
        self.service.apply(&action).await?;
        Ok(TickOutcome::Continue)
    }

    /// The tiered fallback: within budget the literal fallback (or the
    /// last applied action) is replayed; beyond it the zero vector.
    fn substitute_action(&mut self) -> Action {
        if self.missed_actions > self.max_missed_actions {
            self.missed_actions = 0;
            warn!("missed-action budget exhausted, commanding zero vector");
            return self.service.zero_command();
        }
        match &self.fallback_action {
            Some(fallback) => Action::new(fallback.clone()),
            None => self.service.fallback_command(),
        }
    }
}
