//! WebSocket gateway
//!
//! Serves browsers on one port: a plain GET `/` returns the
//! configured HTML page, an upgrade on `/ws` opens a live session. Each session holds a set of IMEI subscriptions; the
//! union of all sessions' sets is kept subscribed on the rectifier's
//! publish channel, so the gateway only receives reports somebody is
//! watching. Operator commands typed in the browser are translated
//! into device packets and pushed to the collector.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::bus::{now, rtopic, PushClient, Rept, Resp, SubClient};
use crate::config::Config;
use crate::error::Result;
use crate::evstore::EvStore;
use crate::proto::{self, ProtoModule};

const DEFAULT_BACKLOG: u32 = 5;

type Subscriptions = Arc<Mutex<HashMap<u64, HashSet<String>>>>;

struct GatewayState {
    store: EvStore,
    modules: Vec<&'static dyn ProtoModule>,
    push: tokio::sync::Mutex<PushClient>,
    rept_tx: broadcast::Sender<Rept>,
    subs: Subscriptions,
    subs_changed: mpsc::UnboundedSender<()>,
    next_client: AtomicU64,
    htmlfile: Option<String>,
}

pub struct Gateway {
    listener: TcpListener,
    app: Router,
}

impl Gateway {
    pub async fn bind(conf: &Config) -> Result<Self> {
        let modules = proto::enabled_modules(&conf.common.protocols)?;
        let store = open_store_readonly(&conf.storage.dbfn).await?;
        let (rept_tx, _) = broadcast::channel(256);
        let (subs_changed, notify_rx) = mpsc::unbounded_channel();
        let subs: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

        let zsub = SubClient::new(conf.rectifier.publishurl.clone());
        tokio::spawn(feed_reports(zsub, rept_tx.clone(), notify_rx, subs.clone()));

        let state = Arc::new(GatewayState {
            store,
            modules,
            push: tokio::sync::Mutex::new(PushClient::new(conf.collector.listenurl.clone())),
            rept_tx,
            subs,
            subs_changed,
            next_client: AtomicU64::new(0),
            htmlfile: conf.wsgateway.htmlfile.clone(),
        });
        let app = Router::new()
            .route("/", get(root))
            .route("/ws", get(ws_handler))
            .with_state(state);
        let listener = TcpListener::bind(("::", conf.wsgateway.port)).await?;
        info!("websocket gateway listening on {}", listener.local_addr()?);
        Ok(Self { listener, app })
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        axum::serve(self.listener, self.app).await?;
        Ok(())
    }
}

pub async fn run(conf: &Config) -> Result<()> {
    Gateway::bind(conf).await?.serve().await
}

/// The gateway only reads the event store; creating it is the storage
/// component's job, but when the gateway starts first the schema is
/// laid down once so the read-only open does not fail.
async fn open_store_readonly(dbfn: &str) -> Result<EvStore> {
    if let Ok(store) = EvStore::open_readonly(dbfn).await {
        return Ok(store);
    }
    drop(EvStore::open(dbfn).await?);
    EvStore::open_readonly(dbfn).await
}

/// Keep the rectifier-channel subscription set equal to the union of
/// all clients' IMEI sets, and fan incoming reports out to sessions.
async fn feed_reports(
    mut zsub: SubClient,
    rept_tx: broadcast::Sender<Rept>,
    mut notify_rx: mpsc::UnboundedReceiver<()>,
    subs: Subscriptions,
) {
    let mut active: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            changed = notify_rx.recv() => {
                if changed.is_none() {
                    return;
                }
                let needed: HashSet<String> = {
                    let subs = subs.lock().expect("subscription map lock");
                    subs.values().flatten().cloned().collect()
                };
                for imei in needed.difference(&active) {
                    zsub.subscribe(&rtopic(imei)).await;
                }
                for imei in active.difference(&needed) {
                    zsub.unsubscribe(&rtopic(imei)).await;
                }
                debug!("subscribed to: {needed:?}");
                active = needed;
            }
            buffer = zsub.recv() => {
                match Rept::decode(&buffer) {
                    Ok(rept) => {
                        // nobody listening is fine
                        let _ = rept_tx.send(rept);
                    }
                    Err(e) => warn!("undecodable report envelope: {e}"),
                }
            }
        }
    }
}

async fn root(State(state): State<Arc<GatewayState>>) -> Response {
    serve_html(&state).await
}

async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn serve_html(state: &GatewayState) -> Response {
    let Some(htmlfile) = &state.htmlfile else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "HTML data not configured on the server\r\n",
        )
            .into_response();
    };
    match tokio::fs::read(htmlfile).await {
        Ok(htmldata) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            htmldata,
        )
            .into_response(),
        Err(e) => {
            warn!("cannot read {htmlfile}: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "HTML file could not be opened\r\n",
            )
                .into_response()
        }
    }
}

async fn client_session(mut socket: WebSocket, state: Arc<GatewayState>) {
    let id = state.next_client.fetch_add(1, Ordering::Relaxed);
    info!("websocket client {id} connected");
    state
        .subs
        .lock()
        .expect("subscription map lock")
        .insert(id, HashSet::new());
    let mut reports = state.rept_tx.subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // pings are answered by the stack
                    Some(Err(e)) => {
                        debug!("websocket client {id} read error: {e}");
                        break;
                    }
                };
                let replies = handle_client_message(&state, id, text.as_str()).await;
                let mut dead = false;
                for reply in replies {
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        dead = true;
                        break;
                    }
                }
                if dead {
                    break;
                }
            }
            report = reports.recv() => {
                match report {
                    Ok(rept) => {
                        if let Some(reply) = forward_report(&state, id, &rept) {
                            if socket.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("websocket client {id} lost {n} reports");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state
        .subs
        .lock()
        .expect("subscription map lock")
        .remove(&id);
    let _ = state.subs_changed.send(());
    info!("websocket client {id} gone");
}

/// A rectified report for a session: only if the session subscribes
/// to the IMEI, forwarded as the rectified JSON plus the imei, and
/// never the internal approximate-location kind.
fn forward_report(state: &GatewayState, id: u64, rept: &Rept) -> Option<String> {
    let imei = rept.imei.as_ref()?;
    {
        let subs = state.subs.lock().expect("subscription map lock");
        if !subs.get(&id).is_some_and(|imeis| imeis.contains(imei)) {
            return None;
        }
    }
    let Ok(Value::Object(mut msg)) = serde_json::from_str(&rept.payload) else {
        warn!("unparseable report payload for {imei}");
        return None;
    };
    if msg.get("type").and_then(Value::as_str) == Some("approximate_location") {
        return None;
    }
    msg.insert("imei".to_string(), json!(imei));
    Some(Value::Object(msg).to_string())
}

async fn handle_client_message(state: &Arc<GatewayState>, id: u64, text: &str) -> Vec<String> {
    let Ok(Value::Object(msg)) = serde_json::from_str(text) else {
        warn!("unparseable message from websocket client {id}: {text}");
        return Vec::new();
    };
    let msg_type = msg
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if msg_type == "subscribe" {
        let imeis: HashSet<String> = msg
            .get("imei")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let backlog = msg
            .get("backlog")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_BACKLOG, |n| n as u32);
        debug!("subscription list of client {id} is now {imeis:?}");
        {
            let mut subs = state.subs.lock().expect("subscription map lock");
            subs.insert(id, imeis.clone());
        }
        let _ = state.subs_changed.send(());
        let mut replies = Vec::new();
        for imei in &imeis {
            match state.store.fetch(imei, backlog).await {
                Ok(rows) => {
                    for mut row in rows {
                        if let Value::Object(entry) = &mut row {
                            entry.insert("type".to_string(), json!("location"));
                            if let Some(devtime) = entry.remove("devtime") {
                                entry.insert("timestamp".to_string(), devtime);
                            }
                        }
                        replies.push(row.to_string());
                    }
                }
                Err(e) => warn!("backlog fetch for {imei} failed: {e}"),
            }
        }
        return replies;
    }
    // anything else is a command for a terminal
    vec![send_command(state, &msg_type, &msg).await]
}

/// Translate a browser command into a device packet and push it
/// towards the collector; the reply describes success or why not.
async fn send_command(
    state: &Arc<GatewayState>,
    cmd: &str,
    msg: &Map<String, Value>,
) -> String {
    let imei = msg.get("imei").and_then(Value::as_str).map(str::to_string);
    let cmdresult = |imei: &Option<String>, result: String| {
        json!({"type": "cmdresult", "imei": imei, "result": result}).to_string()
    };
    if cmd.is_empty() || imei.is_none() {
        info!("unhandled message {cmd} {imei:?}");
        return cmdresult(&imei, "Did not get imei or cmd".to_string());
    }
    let imei = imei.expect("checked above");
    let pmod = match state.store.fetchpmod(&imei).await {
        Ok(Some(pmod)) => pmod,
        Ok(None) => {
            info!("unknown type of recipient for {cmd} {imei}");
            return cmdresult(
                &Some(imei),
                "Type of the terminal is unknown".to_string(),
            );
        }
        Err(e) => {
            warn!("pmodmap lookup for {imei} failed: {e}");
            return cmdresult(&Some(imei), "Terminal type lookup failed".to_string());
        }
    };
    let Some(module) = proto::module_for_pmod(&state.modules, &pmod) else {
        return cmdresult(
            &Some(imei),
            format!("Terminal protocol {pmod} is not enabled"),
        );
    };
    let kwargs: HashMap<String, String> = msg
        .iter()
        .filter(|(key, _)| key.as_str() != "type" && key.as_str() != "imei")
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect();
    let packet = match module.command_packet(cmd, &kwargs) {
        Ok(packet) => packet,
        Err(e) => {
            info!("could not make packet for {cmd} {imei}: {e}");
            return cmdresult(&Some(imei), format!("{cmd} not accepted: {e}"));
        }
    };
    let resp = Resp {
        imei: Some(imei.clone()),
        when: now(),
        packet,
    };
    if let Err(e) = state.push.lock().await.send(resp.packed()).await {
        warn!("command push failed: {e}");
        return cmdresult(&Some(imei), "Could not reach the collector".to_string());
    }
    cmdresult(&Some(imei.clone()), format!("{cmd} sent to {imei}"))
}
