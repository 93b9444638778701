use std::any::Any;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use servolink_driver::Teleoperator;
use servolink_proto::{Action, Observation, Value, ValueMap};
use tracing::{debug, info, warn};

use crate::core::episode::EpisodeMachine;
use crate::providers::{
    apply_pipeline, robot_payload, ActionPipeline, CommandProvider,
    RemoteTeleopProvider,
};
use crate::sink::{DiskFrameSink, FrameSink};

const OBSERVATION_PREFIX: &str = "observation.";
const ACTION_PREFIX: &str = "action.";

/// Transform applied to the raw robot observation before frames are
/// buffered.
pub type ObservationPipeline = Box<dyn Fn(&ValueMap) -> ValueMap + Send + Sync>;

/// Where the reference teleop actions come from during collection.
pub enum TeleopSource {
    Local(Box<dyn Teleoperator>),
    Remote(RemoteTeleopProvider),
}

#[derive(Debug, Clone)]
pub struct DataCollectionSettings {
    pub root: PathBuf,
    pub resume: bool,
    pub episode_time: Duration,
    pub reset_time: Duration,
    pub num_episodes: usize,
    pub task: String,
    pub display_data: bool,
    pub announce: bool,
}

type SinkFactory = Box<dyn Fn() -> Result<Box<dyn FrameSink>> + Send + Sync>;

/// Dataset-recording passthrough: teleop actions keep flowing to the robot
/// while the episode machine decides which ticks are buffered into the
/// frame sink.
pub struct DataCollectionProvider {
    settings: DataCollectionSettings,
    teleop: TeleopSource,
    teleop_action_processor: Option<ActionPipeline>,
    robot_action_processor: Option<ActionPipeline>,
    robot_observation_processor: Option<ObservationPipeline>,
    sink_factory: SinkFactory,
    sink: Option<Box<dyn FrameSink>>,
    machine: EpisodeMachine,
}

impl DataCollectionProvider {
    pub fn new(
        settings: DataCollectionSettings,
        teleop: TeleopSource,
        teleop_action_processor: Option<ActionPipeline>,
        robot_action_processor: Option<ActionPipeline>,
        robot_observation_processor: Option<ObservationPipeline>,
    ) -> Self {
        let machine = EpisodeMachine::new(
            settings.episode_time,
            settings.reset_time,
            settings.num_episodes,
        )
        .with_announcements(settings.announce);
        let root = settings.root.clone();
        let resume = settings.resume;
        let sink_factory: SinkFactory = Box::new(move || {
            Ok(Box::new(DiskFrameSink::open(&root, resume)?)
                as Box<dyn FrameSink>)
        });
        Self {
            settings,
            teleop,
            teleop_action_processor,
            robot_action_processor,
            robot_observation_processor,
            sink_factory,
            sink: None,
            machine,
        }
    }

    /// Swaps the sink implementation; used by tests to record in memory.
    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = factory;
        self
    }

    pub fn episodes_recorded(&self) -> usize {
        self.machine.episodes_recorded()
    }

    pub fn buffer_size(&self) -> usize {
        self.sink.as_ref().map(|sink| sink.buffer_size()).unwrap_or(0)
    }

    /// Latches an operator control command and evaluates it synchronously
    /// on arrival; the same flags are re-read on every tick.
    pub async fn handle_control_command(&mut self, command: &str) -> Result<()> {
        let normalized = command.trim().to_ascii_lowercase();
        let Some(force) = self.machine.latch_command(&normalized) else {
            warn!("unknown data control command: command={}", normalized);
            return Ok(());
        };
        info!("data control command acknowledged: command={}", normalized);

        if let Some(sink) = self.sink.as_mut() {
            self.machine.advance(Instant::now(), sink.as_mut(), force).await?;
        }
        Ok(())
    }

    async fn fetch_teleop_action(
        &mut self,
        observation: &Observation,
        robot_obs: &ValueMap,
    ) -> Result<std::collections::BTreeMap<String, f64>> {
        let raw = match &mut self.teleop {
            TeleopSource::Local(teleop) => {
                teleop.on_observation(robot_obs).await.ok();
                teleop.get_action().await.context("teleop read failed")?
            }
            TeleopSource::Remote(provider) => {
                provider.compute(observation).await?.actions
            }
        };
        Ok(raw)
    }

}

#[async_trait]
impl CommandProvider for DataCollectionProvider {
    async fn prepare(&mut self) -> Result<()> {
        match &mut self.teleop {
            TeleopSource::Local(teleop) => {
                teleop.connect().await.context("teleop connect failed")?;
            }
            TeleopSource::Remote(provider) => {
                provider.prepare().await?;
            }
        }

        let sink = (self.sink_factory)()?;
        self.machine.start(Instant::now(), sink.num_episodes());
        self.sink = Some(sink);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            self.machine.flush_partial(sink.as_mut()).await;
        }
        self.sink = None;

        // Teardown runs unconditionally for both teleop modes.
        match &mut self.teleop {
            TeleopSource::Local(teleop) => {
                if let Err(err) = teleop.disconnect().await {
                    warn!("teleop disconnect failed: error={err}");
                }
            }
            TeleopSource::Remote(provider) => {
                if let Err(err) = provider.shutdown().await {
                    debug!("remote teleop shutdown: error={err}");
                }
            }
        }

        self.machine.reset_to_idle();
        info!("data collection stopped");
        Ok(())
    }

    async fn compute(&mut self, observation: &Observation) -> Result<Action> {
        if self.sink.is_none() {
            return Err(anyhow!("data provider is not prepared"));
        }

        let robot_obs = robot_payload(observation);
        let raw_action =
            self.fetch_teleop_action(observation, &robot_obs).await?;

        let teleop_action = apply_pipeline(
            self.teleop_action_processor.as_ref(),
            raw_action,
            &robot_obs,
        );
        let robot_action = apply_pipeline(
            self.robot_action_processor.as_ref(),
            teleop_action.clone(),
            &robot_obs,
        );

        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| anyhow!("data provider lost its sink"))?;

        if self.machine.is_recording() {
            let obs_processed = match &self.robot_observation_processor {
                Some(pipeline) => pipeline(&robot_obs),
                None => robot_obs.clone(),
            };
            let frame = build_frame_fields(
                &obs_processed,
                &teleop_action,
                &self.settings.task,
            );
            sink.add_frame(frame).await?;
            if self.settings.display_data {
                debug!(
                    "frame buffered: size={}, episode={}",
                    sink.buffer_size(),
                    self.machine.episodes_recorded() + 1
                );
            }
        }

        self.machine.advance(Instant::now(), sink.as_mut(), false).await?;

        Ok(Action::new(robot_action))
    }

    fn wants_full_observation(&self) -> bool {
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn build_frame_fields(
    obs_processed: &ValueMap,
    teleop_action: &std::collections::BTreeMap<String, f64>,
    task: &str,
) -> ValueMap {
    let mut frame = ValueMap::new();
    for (key, value) in obs_processed {
        frame.insert(format!("{OBSERVATION_PREFIX}{key}"), value.clone());
    }
    for (key, value) in teleop_action {
        frame.insert(format!("{ACTION_PREFIX}{key}"), Value::Float(*value));
    }
    frame.insert("task".to_string(), Value::Str(task.to_string()));
    frame
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use servolink_driver::{ScriptedTeleopConfig, ScriptedTeleoperator};
    use servolink_proto::{Observation, Value, ValueMap};

    use super::{
        DataCollectionProvider, DataCollectionSettings, TeleopSource,
    };
    use crate::providers::CommandProvider;
    use crate::sink::MemoryFrameSink;

    fn settings() -> DataCollectionSettings {
        DataCollectionSettings {
            root: PathBuf::from("/nonexistent"),
            resume: false,
            episode_time: Duration::from_millis(40),
            reset_time: Duration::from_millis(20),
            num_episodes: 1,
            task: "fold the towel".to_string(),
            display_data: false,
            announce: false,
        }
    }

    fn provider() -> DataCollectionProvider {
        let teleop = ScriptedTeleoperator::new(ScriptedTeleopConfig {
            joints: vec!["elbow".to_string()],
            amplitude: 0.3,
            period_ticks: 16,
        });
        DataCollectionProvider::new(
            settings(),
            TeleopSource::Local(Box::new(teleop)),
            None,
            None,
            None,
        )
        .with_sink_factory(Box::new(|| Ok(Box::new(MemoryFrameSink::new()))))
    }

    fn observation() -> Observation {
        let mut robot = ValueMap::new();
        robot.insert("elbow.pos".to_string(), Value::Float(0.1));
        let mut payload = ValueMap::new();
        payload.insert("robot".to_string(), Value::Map(robot));
        Observation::new(payload)
    }

    #[tokio::test]
    async fn frames_are_buffered_while_recording_and_task_is_tagged() {
        let mut provider = provider();
        provider.prepare().await.expect("prepare");

        let action =
            provider.compute(&observation()).await.expect("compute");
        assert!(action.actions.contains_key("elbow.pos"));
        assert_eq!(provider.buffer_size(), 1);

        provider.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn episode_completes_and_turns_into_passthrough() {
        let mut provider = provider();
        provider.prepare().await.expect("prepare");

        // Tick past one episode window plus the reset window.
        for _ in 0..8 {
            provider.compute(&observation()).await.expect("compute");
            tokio::time::sleep(Duration::from_millis(15)).await;
        }

        assert_eq!(provider.episodes_recorded(), 1);
        // Complete: teleop actions keep flowing, nothing is buffered.
        let action =
            provider.compute(&observation()).await.expect("compute");
        assert!(action.actions.contains_key("elbow.pos"));
        assert_eq!(provider.buffer_size(), 0);

        provider.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn stop_command_forces_completion() {
        let mut provider = provider();
        provider.prepare().await.expect("prepare");
        provider.compute(&observation()).await.expect("compute");

        provider.handle_control_command("STOP").await.expect("control");
        assert_eq!(provider.episodes_recorded(), 1);

        provider.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn unprepared_compute_is_an_error() {
        let mut provider = provider();
        let err =
            provider.compute(&observation()).await.expect_err("unprepared");
        assert!(err.to_string().contains("not prepared"));
    }
}
