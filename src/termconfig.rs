//! Termconfig component
//!
//! Answers the binary-protocol messages whose reply cannot be derived
//! from the request alone: STATUS wants the upload interval, SETUP
//! wants the full terminal configuration, POSITION_UPLOAD_INTERVAL
//! wants the configured interval. Replies are built from the
//! per-IMEI configuration section (falling back to `[termconfig]`)
//! and pushed to the collector with the original event time.

use tracing::{debug, error, warn};

use crate::bus::{topic, Bcast, PushClient, Resp, SubClient};
use crate::config::Config;
use crate::error::Result;
use crate::proto::zx303::{self, Msg, SetupArgs};
use crate::proto::Respond;

const DEFAULT_STATUS_INTERVAL_MINUTES: i64 = 25;
const DEFAULT_UPLOAD_INTERVAL_SECONDS: i64 = 0x0300;

pub async fn run(conf: &Config) -> Result<()> {
    let mut zsub = SubClient::new(conf.collector.publishurl.clone());
    for proto in [
        "ZX:STATUS",
        "ZX:SETUP",
        "ZX:POSITION_UPLOAD_INTERVAL",
    ] {
        zsub.subscribe(&topic(proto, true, None)).await;
    }
    let mut zpush = PushClient::new(conf.collector.listenurl.clone());

    loop {
        let buffer = zsub.recv().await;
        let bcast = match Bcast::decode(&buffer) {
            Ok(bcast) => bcast,
            Err(e) => {
                warn!("undecodable broadcast: {e}");
                continue;
            }
        };
        let msg = zx303::parse_message(&bcast.packet, bcast.is_incoming);
        debug!("IMEI {:?} from {:?}: {msg:?}", bcast.imei, bcast.peeraddr);
        if msg.respond() != Respond::External {
            error!("{msg:?} does not expect an externally provided response");
        }
        let section = conf.term_section(bcast.imei.as_deref());
        let packet = match &msg {
            Msg::Status(_) => {
                let interval = section
                    .get("statusintervalminutes")
                    .and_then(|v| v.as_int())
                    .unwrap_or(DEFAULT_STATUS_INTERVAL_MINUTES);
                zx303::status_response(interval as u8)
            }
            Msg::PositionUploadInterval { .. } => {
                let interval = section
                    .get("uploadintervalseconds")
                    .and_then(|v| v.as_int())
                    .unwrap_or(DEFAULT_UPLOAD_INTERVAL_SECONDS);
                zx303::upload_interval_response(interval as u16)
            }
            Msg::Plain { proto } if *proto == zx303::SETUP => {
                zx303::setup_response(&SetupArgs::from_conf(section))
            }
            other => {
                warn!("no external response defined for {other:?}");
                continue;
            }
        };
        let resp = Resp {
            imei: bcast.imei.clone(),
            when: bcast.when, // the event time, not the send time
            packet,
        };
        debug!("response: {resp:?}");
        if let Err(e) = zpush.send(resp.packed()).await {
            warn!("response for IMEI {:?} not delivered: {e}", bcast.imei);
        }
    }
}
