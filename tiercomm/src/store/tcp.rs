//! TCP rendezvous store.
//!
//! Frames are little-endian and length-prefixed:
//! request `[op: u8][key_len: u32][key][val_len: u32][val]`, where op 1 is
//! SET and op 2 is GET (with an empty value). SET is acknowledged with a
//! single zero byte; GET is answered with `[len: u32][value]` once the key
//! exists, so a GET blocks server-side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use crate::error::{Result, TierCommError};
use crate::store::{MemoryStore, RendezvousStore};

const OP_SET: u8 = 1;
const OP_GET: u8 = 2;
const ACK: u8 = 0;

/// Keys and values are small (unique ids); anything larger is a corrupt frame.
const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Server side of the TCP store. Runs until dropped.
pub struct TcpStoreServer {
    local_addr: SocketAddr,
    accept_handle: tokio::task::JoinHandle<()>,
}

impl TcpStoreServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TierCommError::store_with_source("tcp store bind", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TierCommError::store_with_source("tcp store local_addr", e))?;
        let entries = Arc::new(MemoryStore::new());

        let accept_handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("tcp store: accept failed: {e}");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let entries = Arc::clone(&entries);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, &entries).await {
                        tracing::debug!(%peer, "tcp store: connection ended: {e}");
                    }
                });
            }
        });

        tracing::debug!(%local_addr, "tcp store server listening");
        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpStoreServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, entries: &MemoryStore) -> Result<()> {
    loop {
        let mut op = [0u8; 1];
        if stream.read_exact(&mut op).await.is_err() {
            // Client hung up between requests.
            return Ok(());
        }
        let key = read_field(&mut stream).await?;
        let value = read_field(&mut stream).await?;
        let key = String::from_utf8(key).map_err(|e| TierCommError::store_with_source("key", e))?;

        match op[0] {
            OP_SET => {
                entries.insert(&key, &value)?;
                stream.write_all(&[ACK]).await?;
            }
            OP_GET => {
                let found = entries.wait_for(&key).await?;
                write_field(&mut stream, &found).await?;
            }
            other => {
                return Err(TierCommError::store(format!("unknown op {other}")));
            }
        }
        stream.flush().await?;
    }
}

async fn read_field(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FIELD_LEN {
        return Err(TierCommError::store(format!("frame field too large: {len}")));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_field(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Client side of the TCP store.
///
/// Requests are serialized over one connection. On rank 0 the client also
/// owns the server so it lives as long as the store handle.
pub struct TcpStore {
    conn: Mutex<TcpStream>,
    _server: Option<TcpStoreServer>,
}

impl TcpStore {
    /// Connect to a store server, waiting up to `timeout` for it to come up.
    pub async fn connect<A>(addr: A, timeout: Duration) -> Result<Self>
    where
        A: ToSocketAddrs + Clone,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(addr.clone()).await {
                Ok(s) => break s,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::trace!("tcp store: server not reachable yet: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(TierCommError::store_with_source(
                        format!("tcp store unreachable after {}s", timeout.as_secs()),
                        e,
                    ));
                }
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| TierCommError::store_with_source("tcp store set_nodelay", e))?;
        Ok(Self {
            conn: Mutex::new(stream),
            _server: None,
        })
    }

    /// Tie a locally hosted server's lifetime to this client.
    pub fn with_server(mut self, server: TcpStoreServer) -> Self {
        self._server = Some(server);
        self
    }

    async fn request(&self, op: u8, key: &str, value: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.lock().await;
        conn.write_all(&[op]).await?;
        write_field(&mut conn, key.as_bytes()).await?;
        write_field(&mut conn, value).await?;
        conn.flush().await?;

        if op == OP_SET {
            let mut ack = [0u8; 1];
            conn.read_exact(&mut ack).await?;
            if ack[0] != ACK {
                return Err(TierCommError::store(format!("bad ack {}", ack[0])));
            }
            Ok(None)
        } else {
            Ok(Some(read_field(&mut conn).await?))
        }
    }
}

impl RendezvousStore for TcpStore {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.request(OP_SET, key, value).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.request(OP_GET, key, &[])
                .await?
                .ok_or_else(|| TierCommError::store("empty reply to get"))
        })
    }
}
