use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use servolink_proto::{encode_value, Value, ValueMap};
use tracing::{debug, info};

/// Destination for recorded demonstration frames.
///
/// `add_frame` calls accumulate into an episode buffer; `save_episode`
/// persists and clears it. Implementations track `num_episodes` across
/// restarts so recording can resume.
#[async_trait]
pub trait FrameSink: Send {
    /// Field names seen so far, for introspection.
    fn features(&self) -> Vec<String>;

    async fn add_frame(&mut self, frame: ValueMap) -> Result<()>;

    async fn save_episode(&mut self) -> Result<()>;

    async fn clear_episode_buffer(&mut self) -> Result<()>;

    fn num_episodes(&self) -> usize;

    fn buffer_size(&self) -> usize;
}

/// Episode store that writes each saved episode as one MessagePack file
/// (`episode_00042.msgpack`, a list of frame maps) under a root directory.
#[derive(Debug)]
pub struct DiskFrameSink {
    root: PathBuf,
    buffer: Vec<ValueMap>,
    features: Vec<String>,
    episodes: usize,
}

impl DiskFrameSink {
    /// Opens the store. With `resume` the existing episode files are
    /// counted and recording continues after them; without it a non-empty
    /// root is refused.
    pub fn open(root: &Path, resume: bool) -> Result<Self> {
        std::fs::create_dir_all(root).with_context(|| {
            format!("failed to create dataset root {}", root.display())
        })?;

        let existing = count_episode_files(root)?;
        if existing > 0 && !resume {
            bail!(
                "dataset root {} already holds {} episodes (set resume to continue)",
                root.display(),
                existing
            );
        }
        if existing > 0 {
            info!(
                "resuming dataset: root={}, episodes={}",
                root.display(),
                existing
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            buffer: Vec::new(),
            features: Vec::new(),
            episodes: existing,
        })
    }

    fn episode_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("episode_{index:05}.msgpack"))
    }
}

#[async_trait]
impl FrameSink for DiskFrameSink {
    fn features(&self) -> Vec<String> {
        self.features.clone()
    }

    async fn add_frame(&mut self, frame: ValueMap) -> Result<()> {
        if self.features.is_empty() {
            self.features = frame.keys().cloned().collect();
        }
        self.buffer.push(frame);
        Ok(())
    }

    async fn save_episode(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            debug!("save_episode skipped: empty buffer");
            return Ok(());
        }

        let frames: Vec<Value> =
            self.buffer.drain(..).map(Value::Map).collect();
        let mut encoded = Vec::new();
        encode_value(&mut encoded, &Value::List(frames))
            .context("failed to encode episode")?;

        let path = self.episode_path(self.episodes);
        tokio::fs::write(&path, &encoded).await.with_context(|| {
            format!("failed to write episode file {}", path.display())
        })?;

        self.episodes += 1;
        info!(
            "episode saved: path={}, episodes={}",
            path.display(),
            self.episodes
        );
        Ok(())
    }

    async fn clear_episode_buffer(&mut self) -> Result<()> {
        let dropped = self.buffer.len();
        self.buffer.clear();
        if dropped > 0 {
            info!("episode buffer discarded: frames={}", dropped);
        }
        Ok(())
    }

    fn num_episodes(&self) -> usize {
        self.episodes
    }

    fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

fn count_episode_files(root: &Path) -> Result<usize> {
    let mut count = 0;
    let entries = std::fs::read_dir(root).with_context(|| {
        format!("failed to list dataset root {}", root.display())
    })?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("episode_") && name.ends_with(".msgpack") {
            count += 1;
        }
    }
    Ok(count)
}

/// Buffer-only sink used by tests and dry runs.
#[derive(Default)]
pub struct MemoryFrameSink {
    buffer: Vec<ValueMap>,
    saved: Vec<Vec<ValueMap>>,
}

impl MemoryFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_episodes(&self) -> &[Vec<ValueMap>] {
        &self.saved
    }
}

#[async_trait]
impl FrameSink for MemoryFrameSink {
    fn features(&self) -> Vec<String> {
        self.buffer
            .first()
            .map(|frame| frame.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn add_frame(&mut self, frame: ValueMap) -> Result<()> {
        self.buffer.push(frame);
        Ok(())
    }

    async fn save_episode(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.saved.push(std::mem::take(&mut self.buffer));
        }
        Ok(())
    }

    async fn clear_episode_buffer(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn num_episodes(&self) -> usize {
        self.saved.len()
    }

    fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use servolink_proto::{Value, ValueMap};

    use super::{DiskFrameSink, FrameSink};

    fn scratch_root() -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("servolink-sink-{}", uuid::Uuid::now_v7()))
    }

    fn frame(step: i64) -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("observation.x".to_string(), Value::Int(step));
        map.insert("action.a".to_string(), Value::Float(step as f64));
        map.insert("task".to_string(), Value::Str("demo".into()));
        map
    }

    #[tokio::test]
    async fn episodes_persist_and_resume_counts() {
        let root = scratch_root();
        {
            let mut sink =
                DiskFrameSink::open(&root, false).expect("open fresh");
            sink.add_frame(frame(1)).await.expect("add");
            sink.add_frame(frame(2)).await.expect("add");
            assert_eq!(sink.buffer_size(), 2);
            sink.save_episode().await.expect("save");
            assert_eq!(sink.num_episodes(), 1);
            assert_eq!(sink.buffer_size(), 0);
        }

        let resumed = DiskFrameSink::open(&root, true).expect("resume");
        assert_eq!(resumed.num_episodes(), 1);

        let err = DiskFrameSink::open(&root, false).expect_err("no overwrite");
        assert!(err.to_string().contains("resume"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn empty_buffer_save_is_a_noop_and_clear_discards() {
        let root = scratch_root();
        let mut sink = DiskFrameSink::open(&root, false).expect("open");

        sink.save_episode().await.expect("noop save");
        assert_eq!(sink.num_episodes(), 0);

        sink.add_frame(frame(1)).await.expect("add");
        sink.clear_episode_buffer().await.expect("clear");
        assert_eq!(sink.buffer_size(), 0);
        sink.save_episode().await.expect("still noop");
        assert_eq!(sink.num_episodes(), 0);

        let _ = std::fs::remove_dir_all(&root);
    }
}
