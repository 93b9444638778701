use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{decode_value, encode_value, DEFAULT_MAX_FRAME_BYTES};
use crate::error::RpcError;
use crate::frame::{read_frame_async, write_frame_async};
use crate::value::{Value, ValueMap};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout_ms: u64,
    pub api_token: Option<String>,
    pub max_retries: usize,
    pub max_frame_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            api_token: None,
            max_retries: 1,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Request/reply client over one persistent framed connection.
///
/// Send and receive each run under the configured deadline; on `TIMEOUT` or
/// a transport error the socket is dropped and the call is retried until the
/// retry budget is spent. The half-open request on the abandoned socket is
/// never read again.
pub struct RpcClient {
    host: String,
    port: u16,
    timeout_ms: u64,
    api_token: Option<String>,
    max_retries: usize,
    max_frame_bytes: usize,
    stream: Option<TcpStream>,
}

impl RpcClient {
    pub fn new(host: &str, port: u16, options: ClientOptions) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_ms: options.timeout_ms.max(1),
            api_token: options.api_token,
            max_retries: options.max_retries,
            max_frame_bytes: options.max_frame_bytes,
            stream: None,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Replaces the deadline for subsequent calls. Callers that need a
    /// temporarily longer window (e.g. provider prepare) save the previous
    /// value and restore it regardless of outcome.
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms.max(1);
    }

    pub fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// Drops the current connection; the next call reconnects.
    pub fn reset(&mut self) {
        self.stream = None;
    }

    pub async fn call_endpoint(
        &mut self,
        endpoint: &str,
        data: Option<Value>,
    ) -> Result<Value, RpcError> {
        let mut request = ValueMap::new();
        request.insert("endpoint".to_string(), Value::Str(endpoint.into()));
        if let Some(data) = data {
            request.insert("data".to_string(), data);
        }
        if let Some(token) = &self.api_token {
            request.insert("api_token".to_string(), Value::Str(token.clone()));
        }
        let mut body = Vec::new();
        encode_value(&mut body, &Value::Map(request))?;

        let mut attempt = 0;
        loop {
            match self.exchange_once(&body).await {
                Ok(reply) => return parse_reply(reply),
                Err(err) if err.is_retryable() => {
                    self.stream = None;
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(err);
                    }
                    debug!(
                        "rpc call retrying: endpoint={}, attempt={}, error={}",
                        endpoint, attempt, err
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Liveness probe. A failed probe reinitialises the socket so the next
    /// call starts from a clean connection.
    pub async fn ping(&mut self) -> bool {
        match self.call_endpoint("ping", None).await {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    "ping failed: host={}, port={}, error={}",
                    self.host, self.port, err
                );
                self.stream = None;
                false
            }
        }
    }

    pub async fn kill_server(&mut self) -> Result<(), RpcError> {
        self.call_endpoint("kill", None).await.map(|_| ())
    }

    async fn exchange_once(&mut self, body: &[u8]) -> Result<Value, RpcError> {
        let deadline = Duration::from_millis(self.timeout_ms);

        if self.stream.is_none() {
            let connected =
                timeout(deadline, TcpStream::connect((self.host.as_str(), self.port)))
                    .await
                    .map_err(|_| RpcError::Timeout)?
                    .map_err(|err| RpcError::Transport(err.to_string()))?;
            connected.set_nodelay(true).ok();
            self.stream = Some(connected);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RpcError::Transport("no connection".to_string()))?;

        timeout(deadline, write_frame_async(stream, body))
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        let reply = timeout(deadline, read_frame_async(stream, self.max_frame_bytes))
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        Ok(decode_value(&reply, self.max_frame_bytes)?)
    }
}

fn parse_reply(reply: Value) -> Result<Value, RpcError> {
    if let Some(map) = reply.as_map() {
        if let Some(message) = map.get("error").and_then(Value::as_str) {
            return Err(RpcError::from_reply(message.to_string()));
        }
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::net::TcpListener;

    use super::{ClientOptions, RpcClient};
    use crate::error::RpcError;
    use crate::value::Value;

    #[tokio::test]
    async fn silent_server_times_out_and_retries() {
        let listener =
            TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("addr").port();
        let accept_task = tokio::spawn(async move {
            let mut held = Vec::new();
            // Accept and hold connections open without ever replying.
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut client = RpcClient::new(
            "127.0.0.1",
            port,
            ClientOptions { timeout_ms: 100, max_retries: 2, ..Default::default() },
        );

        let started = Instant::now();
        let err = client
            .call_endpoint("get_action", Some(Value::Nil))
            .await
            .expect_err("must time out");
        assert!(matches!(err, RpcError::Timeout));
        // Three attempts (initial + two retries), each bounded by the deadline.
        assert!(started.elapsed().as_millis() >= 300);
        accept_task.abort();
    }

    #[tokio::test]
    async fn unreachable_peer_fails_ping() {
        let listener =
            TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let mut client = RpcClient::new(
            "127.0.0.1",
            port,
            ClientOptions { timeout_ms: 200, ..Default::default() },
        );
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn scoped_timeout_restores_previous_value() {
        let mut client =
            RpcClient::new("127.0.0.1", 1, ClientOptions::default());
        let previous = client.timeout_ms();
        client.set_timeout_ms(60_000);
        assert_eq!(client.timeout_ms(), 60_000);
        client.set_timeout_ms(previous);
        assert_eq!(client.timeout_ms(), previous);
    }
}
