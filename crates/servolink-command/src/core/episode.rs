use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::sink::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    Idle,
    Recording,
    Reset,
    Complete,
}

/// Operator intents latched between ticks. Every store is a plain boolean
/// write; the machine consumes them inside `advance`.
#[derive(Debug, Default)]
struct EpisodeFlags {
    stop: bool,
    exit_early: bool,
    rerecord: bool,
    reset_requested: bool,
    continue_after_reset: bool,
}

impl EpisodeFlags {
    fn clear(&mut self) {
        *self = EpisodeFlags::default();
    }
}

/// Clock-driven episode lifecycle for data collection.
///
/// States move `Idle -> Recording <-> Reset -> Complete`; `Recording` and
/// `Reset` always carry a deadline. Once the target episode count is
/// reached the machine stays `Complete` until it is prepared again.
pub struct EpisodeMachine {
    state: EpisodeState,
    deadline: Option<Instant>,
    episode_duration: Duration,
    reset_duration: Duration,
    target_episodes: usize,
    episodes_recorded: usize,
    flags: EpisodeFlags,
    complete_logged: bool,
    announce: bool,
}

impl EpisodeMachine {
    pub fn new(
        episode_duration: Duration,
        reset_duration: Duration,
        target_episodes: usize,
    ) -> Self {
        Self {
            state: EpisodeState::Idle,
            deadline: None,
            episode_duration: episode_duration.max(Duration::from_millis(1)),
            reset_duration,
            target_episodes,
            episodes_recorded: 0,
            flags: EpisodeFlags::default(),
            complete_logged: false,
            announce: false,
        }
    }

    /// Enables operator-audible announcements, mirrored into the log.
    pub fn with_announcements(mut self, enabled: bool) -> Self {
        self.announce = enabled;
        self
    }

    fn say(&self, message: &str) {
        if self.announce {
            info!("say: {}", message);
        }
    }

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == EpisodeState::Recording
    }

    pub fn episodes_recorded(&self) -> usize {
        self.episodes_recorded
    }

    /// Latches an operator command. Returns `Some(force)` when recognised;
    /// `force` asks for an immediate synchronous evaluation.
    pub fn latch_command(&mut self, command: &str) -> Option<bool> {
        match command {
            "stop" | "end" | "finish" => {
                self.flags.stop = true;
                Some(true)
            }
            "next" | "skip" => {
                self.flags.exit_early = true;
                Some(false)
            }
            "rerecord" | "redo" => {
                self.flags.rerecord = true;
                self.flags.exit_early = true;
                Some(false)
            }
            "reset" => {
                self.flags.reset_requested = true;
                Some(false)
            }
            "resume" | "next_stage" => {
                self.flags.continue_after_reset = true;
                Some(false)
            }
            "start" => Some(false),
            _ => None,
        }
    }

    /// Entry point after the provider prepared its sink: resumes at
    /// `Complete` when the target is already met, otherwise starts the
    /// first episode.
    pub fn start(&mut self, now: Instant, episodes_recorded: usize) {
        self.episodes_recorded = episodes_recorded;
        self.flags.clear();
        self.complete_logged = false;
        if self.target_reached() {
            info!(
                "dataset already holds {}/{} episodes, teleop passthrough only",
                self.episodes_recorded, self.target_episodes
            );
            self.mark_complete();
        } else {
            self.begin_recording(now, true);
        }
    }

    pub fn reset_to_idle(&mut self) {
        self.state = EpisodeState::Idle;
        self.deadline = None;
        self.flags.clear();
        self.complete_logged = false;
    }

    /// Evaluates latched flags and deadlines against `now`, persisting or
    /// discarding buffered frames through the sink as episodes close.
    pub async fn advance(
        &mut self,
        now: Instant,
        sink: &mut dyn FrameSink,
        force: bool,
    ) -> Result<()> {
        if self.flags.stop && self.state != EpisodeState::Complete {
            if matches!(
                self.state,
                EpisodeState::Recording | EpisodeState::Reset
            ) {
                self.finalize_episode(sink).await?;
            }
            self.flags.clear();
            self.mark_complete();
            return Ok(());
        }

        if self.flags.reset_requested && !self.flags.continue_after_reset {
            self.flags.reset_requested = false;
            match self.state {
                EpisodeState::Recording => {
                    self.finalize_episode(sink).await?;
                    if self.target_reached() {
                        self.mark_complete();
                    } else {
                        self.enter_reset(now);
                    }
                    return Ok(());
                }
                EpisodeState::Reset => {
                    self.begin_recording(now, false);
                    return Ok(());
                }
                _ => {}
            }
        }

        if self.flags.continue_after_reset {
            self.flags.continue_after_reset = false;
            self.flags.reset_requested = false;
            if self.state == EpisodeState::Reset {
                self.begin_recording(now, false);
                return Ok(());
            }
        }

        match self.state {
            EpisodeState::Recording => {
                let deadline_reached =
                    self.deadline.is_some_and(|deadline| now >= deadline);
                let exit_requested = self.flags.exit_early || force;
                if !(deadline_reached || exit_requested) {
                    return Ok(());
                }

                if self.flags.rerecord {
                    // Re-record discards the buffered frames instead of
                    // persisting them.
                    self.flags.rerecord = false;
                    self.flags.exit_early = false;
                    sink.clear_episode_buffer().await?;
                    info!("re-recording current episode on operator request");
                    self.begin_recording(now, false);
                    return Ok(());
                }

                self.finalize_episode(sink).await?;
                self.flags.exit_early = false;
                if self.target_reached() {
                    self.mark_complete();
                } else if !self.reset_duration.is_zero() && !force {
                    self.enter_reset(now);
                } else {
                    self.begin_recording(now, false);
                }
            }
            EpisodeState::Reset => {
                let deadline_reached =
                    self.deadline.is_some_and(|deadline| now >= deadline);
                if !(deadline_reached || self.flags.exit_early || force) {
                    return Ok(());
                }
                self.flags.exit_early = false;
                if self.target_reached() {
                    self.mark_complete();
                } else {
                    self.begin_recording(now, false);
                }
            }
            EpisodeState::Idle | EpisodeState::Complete => {}
        }

        Ok(())
    }

    /// Persists the buffered frames on shutdown so a partial episode is not
    /// lost. Best effort.
    pub async fn flush_partial(&mut self, sink: &mut dyn FrameSink) {
        if self.state != EpisodeState::Recording || sink.buffer_size() == 0 {
            return;
        }
        match sink.save_episode().await {
            Ok(()) => {
                self.episodes_recorded = sink.num_episodes();
                info!("saved partial episode on shutdown");
            }
            Err(err) => warn!("failed to save partial episode: error={err}"),
        }
    }

    fn target_reached(&self) -> bool {
        self.target_episodes > 0
            && self.episodes_recorded >= self.target_episodes
    }

    async fn finalize_episode(
        &mut self,
        sink: &mut dyn FrameSink,
    ) -> Result<()> {
        let size = sink.buffer_size();
        if size == 0 {
            return Ok(());
        }
        info!("finalizing episode: frames={}", size);
        sink.save_episode().await?;
        self.episodes_recorded = sink.num_episodes();
        Ok(())
    }

    fn begin_recording(&mut self, now: Instant, fresh: bool) {
        self.state = EpisodeState::Recording;
        self.deadline = Some(now + self.episode_duration);
        let verb = if fresh { "starting" } else { "resuming" };
        info!(
            "{} recording: episode={}/{}, window={:.1}s",
            verb,
            self.episodes_recorded + 1,
            self.target_episodes,
            self.episode_duration.as_secs_f64()
        );
        self.say(&format!(
            "Recording episode {}",
            self.episodes_recorded + 1
        ));
    }

    fn enter_reset(&mut self, now: Instant) {
        self.state = EpisodeState::Reset;
        self.deadline = Some(now + self.reset_duration);
        info!(
            "reset window open: duration={:.1}s",
            self.reset_duration.as_secs_f64()
        );
        self.say("Reset the environment");
    }

    fn mark_complete(&mut self) {
        self.state = EpisodeState::Complete;
        self.deadline = None;
        if !self.complete_logged {
            info!(
                "recording complete: episodes={}/{}",
                self.episodes_recorded, self.target_episodes
            );
            self.complete_logged = true;
            self.say("Stop recording");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use servolink_proto::{Value, ValueMap};

    use super::{EpisodeMachine, EpisodeState};
    use crate::sink::{FrameSink, MemoryFrameSink};

    fn frame() -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("observation.x".to_string(), Value::Int(1));
        map
    }

    fn machine() -> EpisodeMachine {
        EpisodeMachine::new(
            Duration::from_secs(1),
            Duration::from_millis(500),
            2,
        )
    }

    /// Drives the machine at a simulated 10 Hz: two 1 s episodes separated
    /// by a 0.5 s reset window, then passthrough with an empty buffer.
    #[tokio::test]
    async fn full_lifecycle_at_ten_hertz() {
        let mut sink = MemoryFrameSink::new();
        let mut machine = machine();
        let start = Instant::now();
        machine.start(start, 0);

        let tick = Duration::from_millis(100);
        let mut recorded_states = Vec::new();
        for step in 1..=40 {
            let now = start + tick * step;
            if machine.is_recording() {
                sink.add_frame(frame()).await.expect("buffer frame");
            }
            machine.advance(now, &mut sink, false).await.expect("advance");
            recorded_states.push(machine.state());
        }

        assert_eq!(sink.num_episodes(), 2);
        assert_eq!(machine.state(), EpisodeState::Complete);
        assert!(recorded_states.contains(&EpisodeState::Reset));
        assert_eq!(sink.buffer_size(), 0);
        // First episode buffered ten frames at 10 Hz.
        assert_eq!(sink.saved_episodes()[0].len(), 10);
    }

    #[tokio::test]
    async fn stop_command_finalizes_and_completes() {
        let mut sink = MemoryFrameSink::new();
        let mut machine = machine();
        let start = Instant::now();
        machine.start(start, 0);

        sink.add_frame(frame()).await.expect("buffer frame");
        let force = machine.latch_command("stop").expect("known command");
        assert!(force);
        machine
            .advance(start + Duration::from_millis(10), &mut sink, force)
            .await
            .expect("advance");

        assert_eq!(machine.state(), EpisodeState::Complete);
        assert_eq!(sink.num_episodes(), 1);
    }

    #[tokio::test]
    async fn rerecord_discards_buffered_frames() {
        let mut sink = MemoryFrameSink::new();
        let mut machine = machine();
        let start = Instant::now();
        machine.start(start, 0);

        sink.add_frame(frame()).await.expect("buffer frame");
        machine.latch_command("rerecord").expect("known command");
        machine
            .advance(start + Duration::from_millis(10), &mut sink, false)
            .await
            .expect("advance");

        assert_eq!(machine.state(), EpisodeState::Recording);
        assert_eq!(sink.num_episodes(), 0);
        assert_eq!(sink.buffer_size(), 0);
    }

    #[tokio::test]
    async fn reset_and_resume_cycle() {
        let mut sink = MemoryFrameSink::new();
        let mut machine = machine();
        let start = Instant::now();
        machine.start(start, 0);

        sink.add_frame(frame()).await.expect("buffer frame");
        machine.latch_command("reset").expect("known command");
        machine
            .advance(start + Duration::from_millis(10), &mut sink, false)
            .await
            .expect("advance");
        assert_eq!(machine.state(), EpisodeState::Reset);
        assert_eq!(sink.num_episodes(), 1);

        machine.latch_command("resume").expect("known command");
        machine
            .advance(start + Duration::from_millis(20), &mut sink, false)
            .await
            .expect("advance");
        assert_eq!(machine.state(), EpisodeState::Recording);
    }

    #[tokio::test]
    async fn prepared_at_target_goes_straight_to_complete() {
        let mut machine = machine();
        machine.start(Instant::now(), 2);
        assert_eq!(machine.state(), EpisodeState::Complete);
    }

    #[tokio::test]
    async fn episode_count_is_monotonic() {
        let mut sink = MemoryFrameSink::new();
        let mut machine = machine();
        let start = Instant::now();
        machine.start(start, 0);

        let mut last = machine.episodes_recorded();
        let tick = Duration::from_millis(100);
        for step in 1..=40 {
            let now = start + tick * step;
            if machine.is_recording() {
                sink.add_frame(frame()).await.expect("buffer frame");
            }
            machine.advance(now, &mut sink, false).await.expect("advance");
            assert!(machine.episodes_recorded() >= last);
            last = machine.episodes_recorded();
        }
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let mut machine = machine();
        assert!(machine.latch_command("dance").is_none());
    }
}
