//! Framed JSON-RPC over TCP.
//!
//! Connections are directional: the dialing side sends requests, the
//! accepting side replies. A frame is a 4-byte big-endian length followed by
//! a JSON body. The client multiplexes concurrent calls over one connection
//! by tagging each request with an id and parking the caller on a oneshot
//! until the matching reply arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::types::Call;

/// Upper bound on a single frame; anything larger is a corrupt stream.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct CallFrame {
    id: u64,
    #[serde(flatten)]
    call: Call,
}

#[derive(Serialize, Deserialize)]
struct ReplyFrame {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    body: Value,
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds limit");
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Callers waiting for replies, keyed by request id. Once `closed` is set
/// every current and future call fails with that reason.
#[derive(Default)]
struct Pending {
    closed: Option<String>,
    waiters: HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>,
}

impl Pending {
    fn fail_all(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

/// One directional RPC connection to a peer.
///
/// `call` may be used from any number of tasks concurrently; replies are
/// routed back to the right caller by id. Dropping the client (or calling
/// [`RpcClient::close`]) tears the connection down and fails every in-flight
/// call.
pub struct RpcClient {
    peer: String,
    next_id: AtomicU64,
    pending: Arc<Mutex<Pending>>,
    writer: AsyncMutex<OwnedWriteHalf>,
    reader_task: JoinHandle<()>,
}

impl RpcClient {
    /// Dial `addr` and start the reply reader.
    pub async fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to dial {addr}"))?;
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();

        let pending: Arc<Mutex<Pending>> = Arc::default();
        let reader_task = tokio::spawn(read_replies(read, pending.clone(), addr.to_string()));

        Ok(RpcClient {
            peer: addr.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            writer: AsyncMutex::new(write),
            reader_task,
        })
    }

    /// The address this client dialed.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send `call` and wait for the reply, decoded as `T`.
    ///
    /// Fails on transport errors and when the peer's handler returned an
    /// error; the two are distinguished only by the message.
    pub async fn call<T: DeserializeOwned>(&self, call: Call) -> Result<T> {
        let method = call.method();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(reason) = &pending.closed {
                bail!("connection to {} closed: {reason}", self.peer);
            }
            pending.waiters.insert(id, tx);
        }

        let frame = serde_json::to_vec(&CallFrame { id, call })?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &frame).await {
                let mut pending = self.pending.lock().unwrap();
                pending.waiters.remove(&id);
                pending.fail_all(&format!("write failed: {e}"));
                return Err(e).with_context(|| format!("{method} to {}", self.peer));
            }
        }

        match rx.await {
            Ok(Ok(body)) => serde_json::from_value(body)
                .with_context(|| format!("bad {method} reply from {}", self.peer)),
            Ok(Err(remote)) => bail!("{method} to {}: {remote}", self.peer),
            Err(_) => bail!("connection to {} closed mid-call", self.peer),
        }
    }

    /// Tear the connection down, failing any in-flight calls.
    pub fn close(&self) {
        self.reader_task.abort();
        self.pending.lock().unwrap().fail_all("closed locally");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_replies(mut read: OwnedReadHalf, pending: Arc<Mutex<Pending>>, peer: String) {
    loop {
        let frame = match read_frame(&mut read).await {
            Ok(frame) => frame,
            Err(e) => {
                pending.lock().unwrap().fail_all(&format!("read failed: {e}"));
                return;
            }
        };
        let reply: ReplyFrame = match serde_json::from_slice(&frame) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping malformed reply frame");
                continue;
            }
        };
        let waiter = pending.lock().unwrap().waiters.remove(&reply.id);
        match waiter {
            Some(tx) => {
                let result = match reply.error {
                    Some(error) => Err(error),
                    None => Ok(reply.body),
                };
                let _ = tx.send(result);
            }
            None => tracing::debug!(%peer, id = reply.id, "reply for unknown call id"),
        }
    }
}

/// Serves the inbound half of a role: decides what each [`Call`] does.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, call: Call) -> Result<Value>;
}

/// Serialize a handler result for the reply frame.
pub fn reply<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Accept connections forever, serving each with `handler`. Returns only on
/// listener failure; cancel the surrounding task to stop accepting.
pub async fn serve(listener: TcpListener, handler: Arc<dyn Handler>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("accept failed")?;
        tracing::debug!(%addr, "accepted connection");
        tokio::spawn(serve_connection(stream, handler.clone()));
    }
}

/// Serve one connection: read request frames until EOF, spawning a task per
/// request so a slow handler never blocks the stream.
pub async fn serve_connection(stream: TcpStream, handler: Arc<dyn Handler>) {
    stream.set_nodelay(true).ok();
    let (mut read, write) = stream.into_split();
    let write = Arc::new(AsyncMutex::new(write));

    loop {
        let frame = match read_frame(&mut read).await {
            Ok(frame) => frame,
            // EOF or transport error: the peer is gone.
            Err(_) => return,
        };
        let call_frame: CallFrame = match serde_json::from_slice(&frame) {
            Ok(call_frame) => call_frame,
            Err(e) => {
                // Without an id there is nothing to reply to.
                tracing::warn!(error = %e, "dropping malformed request frame");
                continue;
            }
        };

        let handler = handler.clone();
        let write = write.clone();
        tokio::spawn(async move {
            let id = call_frame.id;
            let reply = match handler.handle(call_frame.call).await {
                Ok(body) => ReplyFrame {
                    id,
                    error: None,
                    body,
                },
                Err(e) => ReplyFrame {
                    id,
                    error: Some(format!("{e:#}")),
                    body: Value::Null,
                },
            };
            if let Ok(bytes) = serde_json::to_vec(&reply) {
                let mut writer = write.lock().await;
                let _ = write_frame(&mut *writer, &bytes).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Empty, KeypressRequest, ServerResponse};

    /// Echoes keypresses back in the response message; everything else is
    /// unsupported.
    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, call: Call) -> Result<Value> {
            match call {
                Call::Ping(_) => reply(&Empty {}),
                Call::RegisterKeypress(req) => {
                    reply(&ServerResponse::ok(format!("got {}", req.key)))
                }
                other => bail!("unsupported method {}", other.method()),
            }
        }
    }

    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, Arc::new(EchoHandler)));
        addr
    }

    #[tokio::test]
    async fn call_roundtrips_params_and_body() {
        let addr = spawn_server().await;
        let client = RpcClient::dial(&addr).await.unwrap();

        let resp: ServerResponse = client
            .call(Call::RegisterKeypress(KeypressRequest { key: 'p' }))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.message, "got p");
    }

    #[tokio::test]
    async fn handler_errors_reach_the_caller() {
        let addr = spawn_server().await;
        let client = RpcClient::dial(&addr).await.unwrap();

        let err = client
            .call::<Empty>(Call::Shutdown(Empty {}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported method Worker.Shutdown"));
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_connection() {
        let addr = spawn_server().await;
        let client = Arc::new(RpcClient::dial(&addr).await.unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for key in ['a', 'b', 'c', 'd', 'e'] {
            let client = client.clone();
            tasks.spawn(async move {
                let resp: ServerResponse = client
                    .call(Call::RegisterKeypress(KeypressRequest { key }))
                    .await
                    .unwrap();
                (key, resp.message)
            });
        }
        while let Some(result) = tasks.join_next().await {
            let (key, message) = result.unwrap();
            assert_eq!(message, format!("got {key}"));
        }
    }

    #[tokio::test]
    async fn calls_fail_once_the_peer_goes_away() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = RpcClient::dial(&addr).await.unwrap();

        // Accept then immediately drop the server side.
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
        drop(listener);

        let err = client.call::<Empty>(Call::Ping(Empty {})).await.unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("closed") || msg.contains("failed"),
            "unexpected error: {msg}"
        );
    }
}
