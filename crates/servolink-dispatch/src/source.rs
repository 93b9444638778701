use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::parse_mode_command;
use crate::events::ModeEvent;

/// Serves one newline-delimited JSON line source: every line is parsed,
/// its events are enqueued in order, and `OK` / `ERROR: <msg>` is written
/// back per line. This is the shared core behind the stdin and socket
/// dispatchers.
pub async fn serve_lines<R, W>(
    reader: R,
    mut writer: W,
    events_tx: mpsc::Sender<ModeEvent>,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next_line() => match next.context("line read failed")? {
                Some(line) => line,
                None => break,
            },
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match handle_line(trimmed, &events_tx).await {
            Ok(()) => "OK\n".to_string(),
            Err(message) => format!("ERROR: {message}\n"),
        };
        if writer.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
        writer.flush().await.ok();
    }

    Ok(())
}

async fn handle_line(
    line: &str,
    events_tx: &mpsc::Sender<ModeEvent>,
) -> Result<(), String> {
    let data: serde_json::Value = serde_json::from_str(line)
        .map_err(|err| format!("invalid JSON ({err})"))?;
    if !data.is_object() {
        return Err("command must be a JSON object".to_string());
    }

    let events = parse_mode_command(&data);
    if events.is_empty() {
        return Err("unsupported command".to_string());
    }
    for event in events {
        events_tx
            .send(event)
            .await
            .map_err(|_| "dispatcher queue closed".to_string())?;
    }
    Ok(())
}

/// Reads operator commands from the process stdin; replies go to stdout.
pub async fn run_stdin_dispatcher(
    events_tx: mpsc::Sender<ModeEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("mode dispatcher reading from stdin");
    let reader = BufReader::new(tokio::io::stdin());
    serve_lines(reader, tokio::io::stdout(), events_tx, shutdown).await
}

/// Accepts operator connections on a unix socket; each client gets its own
/// line loop. Events from all clients share one FIFO queue.
pub async fn run_socket_dispatcher(
    path: PathBuf,
    events_tx: mpsc::Sender<ModeEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    prepare_socket_path(&path)?;
    let listener = UnixListener::bind(&path).with_context(|| {
        format!("failed to bind dispatcher socket {}", path.display())
    })?;
    info!("mode dispatcher listening: path={}", path.display());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("mode dispatcher stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("dispatcher accept failed")?;
                let events_tx = events_tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = stream.into_split();
                    let reader = BufReader::new(read_half);
                    if let Err(err) =
                        serve_lines(reader, write_half, events_tx, shutdown).await
                    {
                        debug!("dispatcher client ended: reason={err}");
                    }
                });
            }
        }
    }

    if let Err(err) = std::fs::remove_file(&path) {
        debug!("dispatcher socket cleanup skipped: error={err}");
    }
    Ok(())
}

fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create socket dir {}", parent.display())
            })?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path).with_context(|| {
            format!("failed to unlink stale socket {}", path.display())
        })?;
        warn!("removed stale dispatcher socket: path={}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};
    use tokio_util::sync::CancellationToken;

    use super::{run_socket_dispatcher, serve_lines};
    use crate::events::ModeEvent;

    #[tokio::test]
    async fn lines_produce_events_and_replies() {
        let (mut operator, dispatcher_side) = tokio::io::duplex(4096);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let (read_half, write_half) = tokio::io::split(dispatcher_side);
        let task = tokio::spawn(serve_lines(
            BufReader::new(read_half),
            write_half,
            events_tx,
            shutdown.clone(),
        ));

        operator
            .write_all(
                b"{\"teleop\": \"gamepad\"}\nnot json\n{\"dance\": 1}\n{\"shutdown\": \"\"}\n",
            )
            .await
            .expect("write commands");
        operator.shutdown().await.expect("close write side");

        let mut replies = String::new();
        operator.read_to_string(&mut replies).await.expect("read replies");
        task.await.expect("join").expect("serve ok");

        let lines: Vec<&str> = replies.lines().collect();
        assert_eq!(lines[0], "OK");
        assert!(lines[1].starts_with("ERROR: invalid JSON"));
        assert_eq!(lines[2], "ERROR: unsupported command");
        assert_eq!(lines[3], "OK");

        assert_eq!(
            events_rx.recv().await,
            Some(ModeEvent::Teleop { alias: "gamepad".to_string() })
        );
        assert_eq!(
            events_rx.recv().await,
            Some(ModeEvent::Shutdown { reason: None })
        );
    }

    #[tokio::test]
    async fn socket_dispatcher_accepts_clients() {
        let path = std::env::temp_dir()
            .join(format!("servolink-dispatch-{}.sock", std::process::id()));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(run_socket_dispatcher(
            path.clone(),
            events_tx,
            shutdown.clone(),
        ));

        // Wait for the socket to appear.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut client =
            UnixStream::connect(&path).await.expect("connect dispatcher");
        client
            .write_all(b"{\"idle\": \"\"}\n")
            .await
            .expect("send command");

        let mut reply = [0_u8; 3];
        client.read_exact(&mut reply).await.expect("read reply");
        assert_eq!(&reply, b"OK\n");

        let event = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("event within deadline");
        assert_eq!(event, Some(ModeEvent::Idle { reason: None }));

        shutdown.cancel();
        let _ = timeout(Duration::from_secs(2), server).await;
        let _ = std::fs::remove_file(&path);
    }
}
