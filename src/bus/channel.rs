//! Internal message bus transport
//!
//! Two channel shapes connect the components: a publish channel (one
//! binder fanning out to topic-filtered subscribers) and a pull
//! channel (many connectors fanning in to one binder). Both run over
//! plain TCP with 4-byte big-endian length-delimited frames.
//!
//! On a publish connection the subscriber sends control frames
//! (`0x01 prefix` subscribe, `0x00 prefix` unsubscribe) and receives
//! every published envelope whose bytes start with one of its
//! prefixes; the empty prefix matches everything. Topic filtering is
//! therefore a byte-prefix match on the envelope itself, and the
//! envelope layouts are designed for it (see [`super::envelope`]).
//!
//! Publishes are fire-and-forget: a subscriber that cannot keep up is
//! skipped, a missing consumer drops the message. Connecting endpoints
//! retry in the background so the components can be started in any
//! order.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::{LocSrvError, Result};

const SUBSCRIBE: u8 = 0x01;
const UNSUBSCRIBE: u8 = 0x00;

/// Capacity of the per-server fan-out ring; subscribers that lag
/// further than this lose messages, they are never waited for.
const FANOUT_DEPTH: usize = 1024;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .new_codec()
}

/// Binding side of a publish channel.
pub struct PubServer {
    tx: broadcast::Sender<Bytes>,
    local_addr: std::net::SocketAddr,
}

impl PubServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LocSrvError::bus(format!("cannot bind publish endpoint {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(FANOUT_DEPTH);
        let accept_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((sock, peer)) => {
                        debug!("subscriber connected from {peer}");
                        tokio::spawn(serve_subscriber(sock, accept_tx.subscribe()));
                    }
                    Err(e) => {
                        warn!("publish endpoint accept failed: {e}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
        info!("publish endpoint bound on {local_addr}");
        Ok(Self { tx, local_addr })
    }

    /// Fan the message out; never blocks, never fails.
    pub fn publish(&self, msg: Vec<u8>) {
        // Err means no subscribers right now, which is fine.
        let _ = self.tx.send(Bytes::from(msg));
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

async fn serve_subscriber(sock: TcpStream, mut feed: broadcast::Receiver<Bytes>) {
    let mut framed = Framed::new(sock, codec());
    let mut prefixes: Vec<Vec<u8>> = Vec::new();
    loop {
        tokio::select! {
            ctrl = framed.next() => {
                let Some(Ok(ctrl)) = ctrl else {
                    debug!("subscriber gone");
                    return;
                };
                if ctrl.is_empty() {
                    continue;
                }
                let prefix = ctrl[1..].to_vec();
                match ctrl[0] {
                    SUBSCRIBE => prefixes.push(prefix),
                    UNSUBSCRIBE => {
                        if let Some(pos) = prefixes.iter().position(|p| *p == prefix) {
                            prefixes.swap_remove(pos);
                        }
                    }
                    op => warn!("unknown subscriber control byte {op:#04x}"),
                }
            }
            msg = feed.recv() => {
                match msg {
                    Ok(msg) => {
                        if prefixes.iter().any(|p| msg.starts_with(p))
                            && framed.send(msg).await.is_err()
                        {
                            debug!("subscriber write failed, dropping it");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("slow subscriber lost {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Connecting side of a publish channel. Reconnects (and
/// resubscribes) in the background, like the original's message
/// library did, so the binder may come and go.
pub struct SubClient {
    addr: String,
    prefixes: Vec<Vec<u8>>,
    framed: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl SubClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            prefixes: Vec::new(),
            framed: None,
        }
    }

    /// One connection attempt, replaying the current prefix set.
    /// Failure is fine; `recv` keeps retrying.
    async fn try_connect(&mut self) {
        if self.framed.is_some() {
            return;
        }
        let sock = match TcpStream::connect(&self.addr).await {
            Ok(sock) => sock,
            Err(e) => {
                debug!("cannot reach publish endpoint {}: {e}", self.addr);
                return;
            }
        };
        let mut framed = Framed::new(sock, codec());
        for prefix in &self.prefixes {
            let mut frame = vec![SUBSCRIBE];
            frame.extend_from_slice(prefix);
            if framed.send(Bytes::from(frame)).await.is_err() {
                return;
            }
        }
        debug!("subscribed to {} ({} topics)", self.addr, self.prefixes.len());
        self.framed = Some(framed);
    }

    pub async fn subscribe(&mut self, prefix: &[u8]) {
        self.prefixes.push(prefix.to_vec());
        if self.framed.is_none() {
            // fresh connection replays the whole set
            self.try_connect().await;
            return;
        }
        let mut frame = vec![SUBSCRIBE];
        frame.extend_from_slice(prefix);
        if let Some(framed) = self.framed.as_mut() {
            if framed.send(Bytes::from(frame)).await.is_err() {
                self.framed = None;
            }
        }
    }

    pub async fn unsubscribe(&mut self, prefix: &[u8]) {
        if let Some(pos) = self.prefixes.iter().position(|p| p == prefix) {
            self.prefixes.swap_remove(pos);
        }
        let mut frame = vec![UNSUBSCRIBE];
        frame.extend_from_slice(prefix);
        if let Some(framed) = self.framed.as_mut() {
            if framed.send(Bytes::from(frame)).await.is_err() {
                self.framed = None;
            }
        }
    }

    /// Next matching message. Retries the connection for as long as it
    /// takes; cancel by dropping the future.
    pub async fn recv(&mut self) -> Vec<u8> {
        loop {
            if self.framed.is_none() {
                self.try_connect().await;
                if self.framed.is_none() {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }
            match self.framed.as_mut().expect("connected above").next().await {
                Some(Ok(msg)) => return msg.to_vec(),
                Some(Err(e)) => {
                    warn!("publish stream from {} broke: {e}", self.addr);
                    self.framed = None;
                }
                None => {
                    debug!("publish endpoint {} closed, reconnecting", self.addr);
                    self.framed = None;
                }
            }
        }
    }
}

/// Binding (consumer) side of a pull channel.
pub struct PullServer {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    local_addr: std::net::SocketAddr,
}

impl PullServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LocSrvError::bus(format!("cannot bind pull endpoint {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((sock, peer)) => {
                        debug!("producer connected from {peer}");
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let mut framed = Framed::new(sock, codec());
                            while let Some(Ok(msg)) = framed.next().await {
                                if tx.send(msg.to_vec()).is_err() {
                                    return;
                                }
                            }
                            debug!("producer from {peer} gone");
                        });
                    }
                    Err(e) => {
                        warn!("pull endpoint accept failed: {e}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
        info!("pull endpoint bound on {local_addr}");
        Ok(Self { rx, local_addr })
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Drain without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

/// Connecting (producer) side of a pull channel.
pub struct PushClient {
    addr: String,
    framed: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl PushClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            framed: None,
        }
    }

    /// Deliver one message, reconnecting once if the previous
    /// connection went away. Undeliverable messages are an error the
    /// caller logs and forgets; the channel is best-effort.
    pub async fn send(&mut self, msg: Vec<u8>) -> Result<()> {
        for _ in 0..2 {
            if self.framed.is_none() {
                match TcpStream::connect(&self.addr).await {
                    Ok(sock) => self.framed = Some(Framed::new(sock, codec())),
                    Err(e) => {
                        return Err(LocSrvError::bus(format!(
                            "pull endpoint {} unreachable: {e}",
                            self.addr
                        )))
                    }
                }
            }
            let framed = self.framed.as_mut().unwrap();
            match framed.send(Bytes::from(msg.clone())).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("push to {} failed ({e}), reconnecting", self.addr);
                    self.framed = None;
                }
            }
        }
        Err(LocSrvError::bus(format!(
            "pull endpoint {} dropped the connection twice",
            self.addr
        )))
    }
}
