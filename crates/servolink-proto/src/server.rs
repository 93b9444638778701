use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{decode_value, encode_value, DEFAULT_MAX_FRAME_BYTES};
use crate::error::{ProtoError, RpcError};
use crate::frame::{read_frame_async, write_frame_async};
use crate::value::{Value, ValueMap};

type HandlerFn = Box<
    dyn Fn(Option<Value>) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

/// One named endpoint: a boxed async handler plus whether it takes `data`.
pub struct EndpointHandler {
    requires_data: bool,
    handler: HandlerFn,
}

/// Request/reply RPC server over framed MessagePack.
///
/// Requests on a single connection are handled strictly in order; every
/// connection gets its own task. `ping` and `kill` are always available.
pub struct RpcServer {
    listener: TcpListener,
    endpoints: HashMap<String, EndpointHandler>,
    api_token: Option<String>,
    max_frame_bytes: usize,
    running: CancellationToken,
}

impl RpcServer {
    pub async fn bind(
        host: &str,
        port: u16,
        api_token: Option<String>,
    ) -> Result<Self, RpcError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        Ok(Self {
            listener,
            endpoints: HashMap::new(),
            api_token,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            running: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        self.listener
            .local_addr()
            .map_err(|err| RpcError::Transport(err.to_string()))
    }

    pub fn set_max_frame_bytes(&mut self, max_frame_bytes: usize) {
        self.max_frame_bytes = max_frame_bytes;
    }

    /// Token cancelled by `kill` (or externally) to stop the server.
    pub fn run_token(&self) -> CancellationToken {
        self.running.clone()
    }

    pub fn register<F>(&mut self, name: &str, requires_data: bool, handler: F)
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, anyhow::Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.endpoints.insert(
            name.to_string(),
            EndpointHandler { requires_data, handler: Box::new(handler) },
        );
    }

    /// Runs the accept loop until `kill` is received or the token is
    /// cancelled externally.
    pub async fn run(self) -> Result<(), RpcError> {
        let addr = self.local_addr()?;
        info!("rpc server listening: addr={}", addr);

        let shared = Arc::new(ConnectionContext {
            endpoints: self.endpoints,
            api_token: self.api_token,
            max_frame_bytes: self.max_frame_bytes,
            running: self.running.clone(),
        });

        loop {
            tokio::select! {
                _ = self.running.cancelled() => {
                    info!("rpc server stopping");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted
                        .map_err(|err| RpcError::Transport(err.to_string()))?;
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, shared).await {
                            debug!("rpc connection closed: peer={}, reason={}", peer, err);
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

struct ConnectionContext {
    endpoints: HashMap<String, EndpointHandler>,
    api_token: Option<String>,
    max_frame_bytes: usize,
    running: CancellationToken,
}

async fn handle_connection(
    mut stream: TcpStream,
    shared: Arc<ConnectionContext>,
) -> Result<(), ProtoError> {
    stream.set_nodelay(true).ok();

    loop {
        let body = tokio::select! {
            _ = shared.running.cancelled() => break,
            read = read_frame_async(&mut stream, shared.max_frame_bytes) => {
                match read {
                    Ok(body) => body,
                    Err(ProtoError::Io(err))
                        if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let reply = match dispatch_request(&body, &shared).await {
            Ok(reply) => reply,
            Err(message) => {
                warn!("rpc request failed: error={}", message);
                error_reply(message)
            }
        };

        let mut encoded = Vec::new();
        encode_value(&mut encoded, &reply)?;
        write_frame_async(&mut stream, &encoded).await?;
    }

    Ok(())
}

/// Decodes, authenticates and executes one request. A `String` error is
/// embedded into the reply; the connection keeps serving.
async fn dispatch_request(
    body: &[u8],
    shared: &ConnectionContext,
) -> Result<Value, String> {
    let request = decode_value(body, shared.max_frame_bytes)
        .map_err(|err| format!("decode failed: {err}"))?;
    let request = request
        .as_map()
        .ok_or_else(|| "request must be a map".to_string())?;

    if let Some(expected) = &shared.api_token {
        let presented =
            request.get("api_token").and_then(Value::as_str).unwrap_or("");
        if presented != expected {
            return Ok(error_reply(
                "Unauthorized: invalid API token".to_string(),
            ));
        }
    }

    let endpoint = request
        .get("endpoint")
        .and_then(Value::as_str)
        .unwrap_or("get_action");

    match endpoint {
        "ping" => {
            let mut reply = ValueMap::new();
            reply.insert("status".to_string(), Value::Str("ok".into()));
            reply.insert(
                "message".to_string(),
                Value::Str("server is running".into()),
            );
            Ok(Value::Map(reply))
        }
        "kill" => {
            info!("kill request received, shutting down rpc server");
            shared.running.cancel();
            Ok(Value::Nil)
        }
        name => {
            let Some(handler) = shared.endpoints.get(name) else {
                return Err(format!("unknown endpoint: {name}"));
            };
            let data = if handler.requires_data {
                request.get("data").cloned()
            } else {
                None
            };
            (handler.handler)(data).await.map_err(|err| err.to_string())
        }
    }
}

fn error_reply(message: String) -> Value {
    let mut reply = ValueMap::new();
    reply.insert("error".to_string(), Value::Str(message));
    Value::Map(reply)
}

#[cfg(test)]
mod tests {
    use super::RpcServer;
    use crate::client::{ClientOptions, RpcClient};
    use crate::error::RpcError;
    use crate::value::Value;

    async fn spawn_echo_server(api_token: Option<String>) -> (u16, tokio::task::JoinHandle<()>) {
        let mut server = RpcServer::bind("127.0.0.1", 0, api_token)
            .await
            .expect("bind server");
        server.register("echo", true, |data| {
            Box::pin(async move { Ok(data.unwrap_or(Value::Nil)) })
        });
        let port = server.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            server.run().await.expect("server run");
        });
        (port, handle)
    }

    #[tokio::test]
    async fn ping_and_echo_round_trip() {
        let (port, handle) = spawn_echo_server(None).await;
        let mut client =
            RpcClient::new("127.0.0.1", port, ClientOptions::default());

        assert!(client.ping().await);

        let reply = client
            .call_endpoint("echo", Some(Value::Str("hi".into())))
            .await
            .expect("echo call");
        assert_eq!(reply, Value::Str("hi".into()));

        client.kill_server().await.expect("kill");
        handle.await.expect("server exits");
    }

    #[tokio::test]
    async fn unknown_endpoint_is_reported() {
        let (port, _handle) = spawn_echo_server(None).await;
        let mut client =
            RpcClient::new("127.0.0.1", port, ClientOptions::default());

        let err = client
            .call_endpoint("nope", None)
            .await
            .expect_err("unknown endpoint");
        assert!(matches!(err, RpcError::UnknownEndpoint(name) if name == "nope"));
    }

    #[tokio::test]
    async fn token_mismatch_is_unauthorized_and_server_survives() {
        let (port, _handle) =
            spawn_echo_server(Some("secret".to_string())).await;

        let mut wrong = RpcClient::new(
            "127.0.0.1",
            port,
            ClientOptions { api_token: Some("bad".to_string()), ..Default::default() },
        );
        let err = wrong
            .call_endpoint("echo", Some(Value::Nil))
            .await
            .expect_err("bad token");
        assert!(matches!(err, RpcError::Unauthorized));

        let mut right = RpcClient::new(
            "127.0.0.1",
            port,
            ClientOptions {
                api_token: Some("secret".to_string()),
                ..Default::default()
            },
        );
        assert!(right.ping().await);
    }
}
