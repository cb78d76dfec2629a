//! TCP collector
//!
//! Owns the device-facing listener and every terminal socket. Each
//! accepted connection runs a small reader task that probes for the
//! wire protocol, deframes, and forwards completed packets to the
//! central loop; the central loop owns the connection registry, binds
//! IMEIs, evicts stale connections on duplicate logins, publishes raw
//! events, and writes responses back through the reader task's command
//! channel, which keeps per-connection ordering.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{now, Bcast, PubServer, PullServer, Resp};
use crate::config::Config;
use crate::error::Result;
use crate::proto::{self, Deframed, ProtoModule};

/// Read size per wakeup, and the binary protocol's deframer cap.
const MAXBUFFER: usize = 4096;

enum ConnCmd {
    Send(Vec<u8>),
    Close,
}

enum ConnEvent {
    Packets {
        id: u64,
        when: f64,
        pmod: &'static dyn ProtoModule,
        msgs: Vec<Deframed>,
    },
    Gone {
        id: u64,
    },
}

struct ConnHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    peer: SocketAddr,
    imei: Option<String>,
    pmod: Option<&'static dyn ProtoModule>,
}

pub struct Collector {
    listener: TcpListener,
    zpub: PubServer,
    zpull: PullServer,
    modules: Vec<&'static dyn ProtoModule>,
}

impl Collector {
    pub async fn bind(conf: &Config) -> Result<Self> {
        let modules = proto::enabled_modules(&conf.common.protocols)?;
        let zpub = PubServer::bind(&conf.collector.publishurl).await?;
        let zpull = PullServer::bind(&conf.collector.listenurl).await?;
        let listener = TcpListener::bind(("::", conf.collector.port)).await?;
        info!(
            "collector listening on {} for {} protocol(s)",
            listener.local_addr()?,
            modules.len()
        );
        Ok(Self {
            listener,
            zpub,
            zpull,
            modules,
        })
    }

    pub fn device_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn publish_addr(&self) -> SocketAddr {
        self.zpub.local_addr()
    }

    pub fn pull_addr(&self) -> SocketAddr {
        self.zpull.local_addr()
    }

    /// Serve until cancelled from outside.
    pub async fn serve(mut self) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut next_id: u64 = 0;
        let mut by_id: HashMap<u64, ConnHandle> = HashMap::new();
        let mut by_imei: HashMap<String, u64> = HashMap::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((sock, peer)) => {
                            let id = next_id;
                            next_id += 1;
                            info!("start serving connection {id} from {peer}");
                            if let Err(e) = enable_keepalive(&sock) {
                                warn!("cannot enable keepalive for {peer}: {e}");
                            }
                            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                            by_id.insert(id, ConnHandle {
                                cmd_tx,
                                peer,
                                imei: None,
                                pmod: None,
                            });
                            let modules = self.modules.clone();
                            let events_tx = events_tx.clone();
                            tokio::spawn(serve_connection(id, sock, modules, events_tx, cmd_rx));
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                Some(event) = events_rx.recv() => {
                    match event {
                        ConnEvent::Packets { id, when, pmod, msgs } => {
                            handle_packets(
                                &self.zpub, &mut by_id, &mut by_imei, id, when, pmod, msgs,
                            );
                        }
                        ConnEvent::Gone { id } => {
                            if let Some(handle) = by_id.remove(&id) {
                                info!("stop serving connection {id} (IMEI {:?})", handle.imei);
                                if let Some(imei) = handle.imei {
                                    // could have been replaced by a newer login
                                    if by_imei.get(&imei) == Some(&id) {
                                        by_imei.remove(&imei);
                                    }
                                }
                            }
                        }
                    }
                }
                Some(raw) = self.zpull.recv() => {
                    handle_pull(&self.zpub, &by_id, &by_imei, &raw);
                    // drain whatever else is already queued
                    while let Some(raw) = self.zpull.try_recv() {
                        handle_pull(&self.zpub, &by_id, &by_imei, &raw);
                    }
                }
            }
        }
    }
}

/// Run the collector until the process is interrupted.
pub async fn run(conf: &Config) -> Result<()> {
    let collector = Collector::bind(conf).await?;
    collector.serve().await
}

fn enable_keepalive(sock: &TcpStream) -> std::io::Result<()> {
    use socket2::SockRef;
    SockRef::from(sock).set_keepalive(true)
}

#[allow(clippy::too_many_arguments)]
fn handle_packets(
    zpub: &PubServer,
    by_id: &mut HashMap<u64, ConnHandle>,
    by_imei: &mut HashMap<String, u64>,
    id: u64,
    when: f64,
    pmod: &'static dyn ProtoModule,
    msgs: Vec<Deframed>,
) {
    if !by_id.contains_key(&id) {
        debug!("connection {id} gone, ignoring its packets");
        return;
    }
    by_id.get_mut(&id).expect("checked above").pmod = Some(pmod);
    for msg in msgs {
        let packet = match msg {
            Deframed::Packet(packet) => packet,
            Deframed::Error(err) => {
                let imei = &by_id[&id].imei;
                warn!("{err} from connection {id} (IMEI {imei:?})");
                continue;
            }
        };
        if by_id[&id].imei.is_none() {
            if let Some(imei) = pmod.imei_from_packet(&packet) {
                info!("LOGIN from connection {id} (IMEI {imei})");
                if let Some(&old_id) = by_imei.get(&imei) {
                    if old_id != id {
                        info!("removing stale connection {old_id} for IMEI {imei}");
                        if let Some(old) = by_id.get_mut(&old_id) {
                            // clear first so its teardown does not
                            // unbind the new owner
                            old.imei = None;
                            let _ = old.cmd_tx.send(ConnCmd::Close);
                        }
                    }
                }
                by_imei.insert(imei.clone(), id);
                by_id.get_mut(&id).expect("checked above").imei = Some(imei);
            }
        }
        let handle = &by_id[&id];
        debug!(
            "received from {} (IMEI {:?}): {}",
            handle.peer,
            handle.imei,
            hex::encode(&packet)
        );
        zpub.publish(
            Bcast {
                is_incoming: true,
                proto: pmod.proto_of_message(&packet),
                imei: handle.imei.clone(),
                when,
                peeraddr: Some(handle.peer),
                packet: packet.clone(),
            }
            .packed(),
        );
        if pmod.is_goodbye_packet(&packet) {
            debug!("goodbye from connection {id} (IMEI {:?})", handle.imei);
            let _ = handle.cmd_tx.send(ConnCmd::Close);
        }
        if let Some(respmsg) = pmod.inline_response(&packet) {
            // responses to the very connection that triggered them are
            // routed by id, so they work before the IMEI is bound
            deliver(
                zpub,
                by_id,
                id,
                &Resp {
                    imei: by_id[&id].imei.clone(),
                    when: now(),
                    packet: respmsg,
                },
            );
        }
    }
}

fn handle_pull(
    zpub: &PubServer,
    by_id: &HashMap<u64, ConnHandle>,
    by_imei: &HashMap<String, u64>,
    raw: &[u8],
) {
    let resp = match Resp::decode(raw) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("undecodable response envelope: {e}");
            return;
        }
    };
    let Some(id) = resp.imei.as_ref().and_then(|imei| by_imei.get(imei)) else {
        info!("not connected (IMEI {:?})", resp.imei);
        return;
    };
    deliver(zpub, by_id, *id, &resp);
}

/// Frame the response for the connection's protocol, hand it to the
/// writer, and publish the outgoing broadcast with the response's own
/// `when` so subscribers see the original event time.
fn deliver(zpub: &PubServer, by_id: &HashMap<u64, ConnHandle>, id: u64, resp: &Resp) {
    let Some(handle) = by_id.get(&id) else {
        info!("connection {id} gone, dropping response");
        return;
    };
    let Some(pmod) = handle.pmod else {
        warn!("connection {id} has no bound protocol, dropping response");
        return;
    };
    let framed = match pmod.enframe(&resp.packet, handle.imei.as_deref()) {
        Ok(framed) => framed,
        Err(e) => {
            warn!("cannot frame response for connection {id}: {e}");
            return;
        }
    };
    debug!("sending to connection {id}: {}", hex::encode(&framed));
    if handle.cmd_tx.send(ConnCmd::Send(framed)).is_err() {
        info!("connection {id} is closing, response dropped");
        return;
    }
    zpub.publish(
        Bcast {
            is_incoming: false,
            proto: pmod.proto_of_message(&resp.packet),
            imei: handle.imei.clone(),
            when: resp.when,
            peeraddr: Some(handle.peer),
            packet: resp.packet.clone(),
        }
        .packed(),
    );
}

/// Reader/writer task for one terminal socket. Reads in arrival
/// order, writes in enqueue order, reports deframed packets and its
/// own death to the central loop.
async fn serve_connection(
    id: u64,
    sock: TcpStream,
    modules: Vec<&'static dyn ProtoModule>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
) {
    let (mut rd, mut wr) = sock.into_split();
    let mut pmod: Option<&'static dyn ProtoModule> = None;
    let mut stream: Option<Box<dyn proto::Stream>> = None;
    let mut buf = vec![0u8; MAXBUFFER];
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnCmd::Send(bytes)) => {
                        if let Err(e) = wr.write_all(&bytes).await {
                            warn!("sending to connection {id}: {e}");
                            break;
                        }
                    }
                    Some(ConnCmd::Close) | None => break,
                }
            }
            read = rd.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        info!("EOF reading from connection {id}");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("reading from connection {id}: {e}");
                        break;
                    }
                };
                let segment = &buf[..n];
                if pmod.is_none() {
                    pmod = proto::probe(&modules, segment);
                    stream = pmod.map(|m| m.stream());
                }
                let (Some(pmod), Some(stream)) = (pmod, stream.as_mut()) else {
                    info!(
                        "unrecognizable {} bytes of data {} from connection {id}",
                        n,
                        hex::encode(&segment[..n.min(32)])
                    );
                    continue;
                };
                let msgs = stream.recv(segment);
                if !msgs.is_empty()
                    && events_tx
                        .send(ConnEvent::Packets { id, when: now(), pmod, msgs })
                        .is_err()
                {
                    break;
                }
            }
        }
    }
    if let Some(stream) = stream.as_mut() {
        let rest = stream.close();
        if !rest.is_empty() {
            warn!(
                "{} bytes in buffer on close of connection {id}: {}",
                rest.len(),
                hex::encode(&rest[..rest.len().min(64)])
            );
        }
    }
    let _ = events_tx.send(ConnEvent::Gone { id });
}
