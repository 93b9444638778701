use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use servolink_proto::{encode_value, Dtype, NdArray, Value, ValueMap};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Depth of the shared publisher queue; overflow drops frames.
const PUBLISH_QUEUE_DEPTH: usize = 64;
/// Per-subscriber broadcast backlog before a slow reader starts skipping.
const SUBSCRIBER_BACKLOG: usize = 16;

/// One configured camera source, resolved against defaults.
#[derive(Debug, Clone)]
pub struct CameraSource {
    pub name: String,
    pub path: String,
    pub min_interval: Option<Duration>,
    pub quality: u8,
}

#[derive(Debug, Clone)]
pub struct CameraStreamSettings {
    pub host: String,
    pub port: u16,
    pub sources: Vec<CameraSource>,
}

#[derive(Clone)]
struct FrameJob {
    frame: NdArray,
    captured_at: f64,
}

struct SourceHandle {
    path: String,
    slot: watch::Sender<Option<FrameJob>>,
}

/// Best-effort camera fan-out: per-source encoder workers coalesce to the
/// latest frame, a bounded queue feeds the publisher, and slow subscribers
/// drop frames instead of blocking anyone.
pub struct CameraStreamer {
    sources: Vec<SourceHandle>,
    local_port: u16,
}

impl CameraStreamer {
    pub async fn start(
        settings: CameraStreamSettings,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind((settings.host.as_str(), settings.port))
                .await
                .with_context(|| {
                    format!(
                        "failed to bind camera publisher {}:{}",
                        settings.host, settings.port
                    )
                })?;
        let local_port = listener.local_addr()?.port();
        info!(
            "camera publisher listening: host={}, port={}, sources={}",
            settings.host,
            local_port,
            settings.sources.len()
        );

        let (queue_tx, queue_rx) =
            mpsc::channel::<(String, Arc<Vec<u8>>)>(PUBLISH_QUEUE_DEPTH);
        let (fanout_tx, _) =
            broadcast::channel::<(String, Arc<Vec<u8>>)>(SUBSCRIBER_BACKLOG);

        tokio::spawn(run_publisher(queue_rx, fanout_tx.clone(), shutdown.clone()));
        tokio::spawn(run_accept_loop(listener, fanout_tx, shutdown.clone()));

        let mut sources = Vec::with_capacity(settings.sources.len());
        for source in settings.sources {
            let (slot_tx, slot_rx) = watch::channel(None::<FrameJob>);
            tokio::spawn(run_worker(
                source.clone(),
                slot_rx,
                queue_tx.clone(),
                shutdown.clone(),
            ));
            sources.push(SourceHandle { path: source.path, slot: slot_tx });
        }

        Ok(Self { sources, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Hands the newest frames to the workers. Never blocks: each source
    /// keeps a single slot that is simply overwritten.
    pub fn publish(&self, observation: &Value) {
        let captured_at = unix_seconds();
        for source in &self.sources {
            let Some(frame) = observation
                .get_path(&source.path)
                .and_then(Value::as_array)
            else {
                continue;
            };
            source
                .slot
                .send_replace(Some(FrameJob { frame: frame.clone(), captured_at }));
        }
    }
}

async fn run_publisher(
    mut queue_rx: mpsc::Receiver<(String, Arc<Vec<u8>>)>,
    fanout_tx: broadcast::Sender<(String, Arc<Vec<u8>>)>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = queue_rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                // No subscribers is fine; frames are best effort.
                let _ = fanout_tx.send(message);
            }
        }
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    fanout_tx: broadcast::Sender<(String, Arc<Vec<u8>>)>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else {
                    break;
                };
                debug!("camera subscriber connected: peer={}", peer);
                let fanout_rx = fanout_tx.subscribe();
                tokio::spawn(run_subscriber(stream, fanout_rx, shutdown.clone()));
            }
        }
    }
}

async fn run_subscriber(
    mut stream: tokio::net::TcpStream,
    mut fanout_rx: broadcast::Receiver<(String, Arc<Vec<u8>>)>,
    shutdown: CancellationToken,
) {
    loop {
        let (topic, payload) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = fanout_rx.recv() => match received {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("camera subscriber lagging: skipped={}", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if write_parts(&mut stream, topic.as_bytes(), &payload).await.is_err() {
            debug!("camera subscriber dropped");
            break;
        }
    }
}

/// Writes one `[topic, payload]` message as two length-prefixed parts.
async fn write_parts(
    stream: &mut tokio::net::TcpStream,
    topic: &[u8],
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&(topic.len() as u32).to_be_bytes()).await?;
    stream.write_all(topic).await?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn run_worker(
    source: CameraSource,
    mut slot_rx: watch::Receiver<Option<FrameJob>>,
    queue_tx: mpsc::Sender<(String, Arc<Vec<u8>>)>,
    shutdown: CancellationToken,
) {
    let mut last_emit: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = slot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some(job) = slot_rx.borrow_and_update().clone() else {
            continue;
        };

        if let (Some(min_interval), Some(previous)) =
            (source.min_interval, last_emit)
        {
            if previous.elapsed() < min_interval {
                continue;
            }
        }

        let Some(encoded) = encode_frame(&job.frame, &source.name, job.captured_at, source.quality)
        else {
            // Unsupported rank or dtype; skip quietly.
            continue;
        };

        match queue_tx.try_send((source.name.clone(), Arc::new(encoded))) {
            Ok(()) => {
                last_emit = Some(Instant::now());
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("camera queue full, dropping frame: source={}", source.name);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    warn!("camera worker stopping: source={}", source.name);
}

/// JPEG-encodes a frame and wraps it in the camera envelope. Returns the
/// MessagePack payload bytes, or `None` for unsupported inputs.
fn encode_frame(
    frame: &NdArray,
    name: &str,
    captured_at: f64,
    quality: u8,
) -> Option<Vec<u8>> {
    let (jpeg, width, height) = encode_jpeg(frame, quality)?;

    let mut envelope = ValueMap::new();
    envelope.insert("camera".to_string(), Value::Str(name.to_string()));
    envelope.insert("timestamp".to_string(), Value::Float(captured_at));
    envelope.insert("encoding".to_string(), Value::Str("jpeg".into()));
    envelope.insert("width".to_string(), Value::Int(width as i64));
    envelope.insert("height".to_string(), Value::Int(height as i64));
    envelope.insert("quality".to_string(), Value::Int(quality as i64));
    envelope.insert("data".to_string(), Value::Bytes(jpeg));

    let mut payload = Vec::new();
    encode_value(&mut payload, &Value::Map(envelope)).ok()?;
    Some(payload)
}

/// Accepts u8 frames shaped HxW, HxWx1 or HxWx3; grayscale is expanded to
/// three channels before encoding.
fn encode_jpeg(frame: &NdArray, quality: u8) -> Option<(Vec<u8>, u16, u16)> {
    if frame.dtype() != Dtype::U8 {
        return None;
    }

    let (height, width, rgb): (usize, usize, Vec<u8>) = match frame.shape() {
        [height, width] => {
            (*height, *width, expand_gray(frame.data()))
        }
        [height, width, 1] => {
            (*height, *width, expand_gray(frame.data()))
        }
        [height, width, 3] => (*height, *width, frame.data().to_vec()),
        _ => return None,
    };
    if height == 0 || width == 0 || height > u16::MAX as usize || width > u16::MAX as usize {
        return None;
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode(&rgb, width as u32, height as u32, ExtendedColorType::Rgb8)
        .ok()?;
    Some((jpeg, width as u16, height as u16))
}

fn expand_gray(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() * 3);
    for pixel in data {
        rgb.extend_from_slice(&[*pixel, *pixel, *pixel]);
    }
    rgb
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
