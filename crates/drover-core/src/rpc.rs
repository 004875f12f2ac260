//! RPC bridge: connection-per-request JSON over TCP.
//!
//! One UTF-8 JSON object per connection: read until the first complete
//! value parses (or EOF), run the prompt, write one JSON reply, close. No
//! streaming and no persistent channel; callers that want a timeout bring
//! their own.

use crate::config::RpcConfig;
use crate::dispatch::{Dispatcher, PromptRequest};
use crate::output::Destination;
use crate::session::SessionManager;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Budget for reading the request off the socket. The downstream prompt
/// itself is unbounded here.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Requests past this size are rejected outright.
const MAX_REQUEST_BYTES: usize = 1 << 20;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RpcResponse {
    Ok { ok: bool, output: String },
    Err { ok: bool, error: String },
}

impl RpcResponse {
    fn ok(output: String) -> Self {
        RpcResponse::Ok { ok: true, output }
    }

    fn err(error: impl Into<String>) -> Self {
        RpcResponse::Err {
            ok: false,
            error: error.into(),
        }
    }
}

/// Handle to a running bridge. Dropping it does not stop the listener;
/// call [`RpcBridge::stop`].
pub struct RpcBridge {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl RpcBridge {
    /// Bind and start serving. With `port: 0` the OS picks a port;
    /// [`RpcBridge::local_addr`] reports the bound address.
    pub async fn start(
        config: &RpcConfig,
        dispatcher: Arc<Dispatcher>,
        manager: Arc<SessionManager>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let token = config.token.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        log::info!("rpc bridge shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                log::warn!("rpc accept failed: {e}");
                                continue;
                            }
                        };
                        let dispatcher = Arc::clone(&dispatcher);
                        let manager = Arc::clone(&manager);
                        let token = token.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, token, dispatcher, manager).await
                            {
                                log::warn!("rpc connection from {peer} failed: {e}");
                            }
                        });
                    }
                }
            }
        });

        log::info!("rpc bridge listening on {local_addr}");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    token: Option<String>,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<SessionManager>,
) -> std::io::Result<()> {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => process(request, token, dispatcher, manager).await,
        Ok(None) => return Ok(()), // bare connect-and-close
        Err(reason) => RpcResponse::err(reason),
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read until the first complete JSON value parses or the peer closes.
/// Trailing bytes after the value (a newline, typically) are ignored.
async fn read_request(stream: &mut TcpStream) -> Result<Option<RpcRequest>, &'static str> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            let mut values =
                serde_json::Deserializer::from_slice(&buf).into_iter::<RpcRequest>();
            match values.next() {
                Some(Ok(request)) => return Ok(Some(request)),
                Some(Err(e)) if e.is_eof() => {}
                Some(Err(_)) | None => return Err("bad-request"),
            }
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err("bad-request");
        }

        let read = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk)).await;
        match read {
            Ok(Ok(0)) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err("bad-request");
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) | Err(_) => return Err("bad-request"),
        }
    }
}

async fn process(
    request: RpcRequest,
    token: Option<String>,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<SessionManager>,
) -> RpcResponse {
    if let Some(ref expected) = token {
        if request.token.as_deref() != Some(expected.as_str()) {
            return RpcResponse::err("auth");
        }
    }

    let prompt = match request.prompt {
        Some(ref p) if !p.trim().is_empty() => p.clone(),
        _ => return RpcResponse::err("bad-request"),
    };

    let Some(session_id) = manager.resolve(request.session_id.as_deref()) else {
        return RpcResponse::err("no-active-session");
    };

    let ticket =
        match dispatcher.submit(&session_id, PromptRequest::new(prompt, Destination::Rpc)) {
            Ok(ticket) => ticket,
            Err(e) => return RpcResponse::err(e.to_string()),
        };

    match ticket.result.await {
        Ok(Ok(reply)) => RpcResponse::ok(reply.text),
        Ok(Err(failure)) => RpcResponse::err(failure.message),
        Err(_) => RpcResponse::err("session-down: dispatcher dropped the prompt"),
    }
}

// ============================================================================
// TESTS
// ============================================================================
