//! Frame transport: length-prefixed bincode messages over TCP.
//!
//! `RpcChannel` is the persistent client half used by stub caches: one
//! connection per remote, re-dialed once on failure, every call bounded by
//! a timeout. Transport failures surface as `NetworkError` with the
//! underlying diagnostic so callers never see raw io errors.

use crate::status::{Status, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Upper bound on a single frame; requests above this are rejected before
/// allocation.
pub const MAX_FRAME_BYTES: u32 = 64 << 20;

/// Default per-call deadline, matching the channel options of the original
/// gateway (3 s, one retry).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn send_frame<T, W>(writer: &mut W, msg: &T) -> anyhow::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(msg)?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        anyhow::bail!("frame of {} bytes exceeds limit", payload.len());
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn recv_frame<T, R>(reader: &mut R) -> anyhow::Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("incoming frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Persistent request/response channel to one remote endpoint.
///
/// The connection is dialed lazily and kept for the lifetime of the
/// channel; a failed exchange drops it and retries once on a fresh
/// connection. Calls on one channel are serialized, which also keeps the
/// request/response pairing on the single stream intact.
pub struct RpcChannel {
    addr: String,
    timeout: Duration,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
}

impl RpcChannel {
    pub fn new(addr: impl Into<String>) -> Self {
        RpcChannel {
            addr: addr.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_timeout(addr: impl Into<String>, timeout: Duration) -> Self {
        RpcChannel {
            addr: addr.into(),
            timeout,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Issues one request and awaits its reply. On transport failure the
    /// cached connection is dropped and the exchange retried once.
    pub async fn call<Req, Resp>(&self, req: &Req) -> Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut guard = self.conn.lock().await;
        let mut last_err = None;
        for attempt in 0..2 {
            if guard.is_none() {
                match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
                    Ok(Ok(stream)) => *guard = Some(stream),
                    Ok(Err(err)) => {
                        last_err = Some(format!("connect {}: {err}", self.addr));
                        continue;
                    }
                    Err(_) => {
                        last_err = Some(format!("connect {}: timed out", self.addr));
                        continue;
                    }
                }
            }
            let stream = guard.as_mut().expect("connection populated above");
            match tokio::time::timeout(self.timeout, Self::exchange(stream, req)).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(err)) => {
                    debug!(addr = %self.addr, attempt, "rpc exchange failed: {err}");
                    last_err = Some(err.to_string());
                    *guard = None;
                }
                Err(_) => {
                    last_err = Some(format!("call to {} timed out", self.addr));
                    *guard = None;
                }
            }
        }
        Err(Status::error(
            StatusCode::NetworkError,
            last_err.unwrap_or_else(|| "transport failure".to_string()),
        ))
    }

    async fn exchange<Req, Resp>(stream: &mut TcpStream, req: &Req) -> anyhow::Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        send_frame(stream, req).await?;
        recv_frame(stream).await
    }
}

/// Accept loop shared by all three servers: one task per connection, one
/// handler invocation per frame.
pub async fn serve<Req, Resp, H, Fut>(listener: TcpListener, handler: H) -> anyhow::Result<()>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + Sync + 'static,
    H: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Resp> + Send,
{
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                let req = match recv_frame::<Req, _>(&mut stream).await {
                    Ok(req) => req,
                    Err(err) => {
                        // EOF is the normal way for a client to hang up.
                        debug!(%peer, "connection closed: {err}");
                        return;
                    }
                };
                let resp = handler(req).await;
                if let Err(err) = send_frame(&mut stream, &resp).await {
                    warn!(%peer, "failed to write reply: {err}");
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Ping {
        Echo(String),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Pong {
        Echo(String),
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send_frame(&mut a, &Ping::Echo("hello".into())).await.unwrap();
        let got: Ping = recv_frame(&mut b).await.unwrap();
        assert_eq!(got, Ping::Echo("hello".into()));
    }

    #[tokio::test]
    async fn channel_calls_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, |req: Ping| async move {
            let Ping::Echo(s) = req;
            Pong::Echo(s)
        }));

        let channel = RpcChannel::new(addr.to_string());
        let resp: Pong = channel.call(&Ping::Echo("abc".into())).await.unwrap();
        assert_eq!(resp, Pong::Echo("abc".into()));
        // Second call reuses the cached connection.
        let resp: Pong = channel.call(&Ping::Echo("def".into())).await.unwrap();
        assert_eq!(resp, Pong::Echo("def".into()));
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_network_error() {
        let channel =
            RpcChannel::with_timeout("127.0.0.1:1", Duration::from_millis(200));
        let err = channel
            .call::<_, Pong>(&Ping::Echo("x".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::NetworkError);
        assert!(!err.message.is_empty());
    }
}
