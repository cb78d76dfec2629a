//! Rectifier component
//!
//! Subscribes to every location-bearing protocol id the enabled
//! modules expose, turns messages into protocol-agnostic reports, and
//! resolves cell/Wi-Fi hints into coordinates through the lookaside
//! backend. Hints whose origin kind expects an external answer also
//! get a position reply pushed back to the collector, tagged with the
//! original event time.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::bus::{topic, Bcast, PubServer, PushClient, Rept, Resp, SubClient};
use crate::config::Config;
use crate::error::Result;
use crate::lookaside::{self, Lookaside};
use crate::proto::report::{CoordReport, Report};
use crate::proto::{self, ProtoModule, Respond};

pub struct Rectifier {
    zsub: SubClient,
    zpush: PushClient,
    zpub: PubServer,
    modules: Vec<&'static dyn ProtoModule>,
    backend: Box<dyn Lookaside>,
}

impl Rectifier {
    pub async fn bind(conf: &Config, backend: Box<dyn Lookaside>) -> Result<Self> {
        let modules = proto::enabled_modules(&conf.common.protocols)?;
        let mut zsub = SubClient::new(conf.collector.publishurl.clone());
        for (proto_id, _) in proto::exposed_protos(&modules) {
            zsub.subscribe(&topic(&proto_id, true, None)).await;
        }
        let zpush = PushClient::new(conf.collector.listenurl.clone());
        let zpub = PubServer::bind(&conf.rectifier.publishurl).await?;
        Ok(Self {
            zsub,
            zpush,
            zpub,
            modules,
            backend,
        })
    }

    pub fn publish_addr(&self) -> SocketAddr {
        self.zpub.local_addr()
    }

    pub async fn serve(mut self) -> Result<()> {
        loop {
            let buffer = self.zsub.recv().await;
            if let Err(e) = self.process(&buffer).await {
                warn!("broadcast not rectified: {e}");
            }
        }
    }

    async fn process(&mut self, buffer: &[u8]) -> Result<()> {
        let bcast = Bcast::decode(buffer)?;
        let Some(pmod) = proto::module_for_proto(&self.modules, &bcast.proto) else {
            debug!("no module for proto {}", bcast.proto);
            return Ok(());
        };
        let msg = pmod.parse_message(&bcast.packet, bcast.is_incoming);
        debug!("IMEI {:?} from {:?}: {msg:?}", bcast.imei, bcast.peeraddr);
        match msg.rectified() {
            Some(report @ (Report::Coord(_) | Report::Status(_))) => {
                self.publish_report(bcast.imei.as_deref(), &report);
            }
            Some(Report::Approximate(hint)) => {
                let estimate = self
                    .backend
                    .lookup(hint.mcc, hint.mnc, &hint.gsm_cells, &hint.wifi_aps)
                    .await;
                let (lat, lon, accuracy) = match estimate {
                    Ok(estimate) => estimate,
                    Err(e) => {
                        // no reply; the device is free to retry
                        warn!("lookup for IMEI {:?} failed: {e}", bcast.imei);
                        return Ok(());
                    }
                };
                // only message kinds declared as externally answered
                // get a reply pushed back to the terminal
                if msg.respond() == Respond::External {
                    if let Some(packet) = pmod.hint_response(&bcast.packet, lat, lon) {
                        let resp = Resp {
                            imei: bcast.imei.clone(),
                            // not the current time but the original
                            when: bcast.when,
                            packet,
                        };
                        debug!("response for lat={lat}, lon={lon}: {resp:?}");
                        if let Err(e) = self.zpush.send(resp.packed()).await {
                            warn!("response for IMEI {:?} not delivered: {e}", bcast.imei);
                        }
                    }
                }
                let report = Report::Coord(CoordReport {
                    devtime: hint.devtime,
                    battery_percentage: hint.battery_percentage,
                    accuracy: (accuracy > 0.0).then_some(accuracy),
                    altitude: None,
                    speed: None,
                    direction: None,
                    latitude: lat,
                    longitude: lon,
                });
                self.publish_report(bcast.imei.as_deref(), &report);
            }
            None => debug!("nothing to rectify in {}", bcast.proto),
        }
        Ok(())
    }

    fn publish_report(&self, imei: Option<&str>, report: &Report) {
        self.zpub.publish(
            Rept {
                imei: imei.map(str::to_string),
                payload: report.to_json(),
            }
            .packed(),
        );
    }
}

/// Run the rectifier with the configured lookaside backend.
pub async fn run(conf: &Config) -> Result<()> {
    let backend = lookaside::backend_from_config(conf).await?;
    Rectifier::bind(conf, backend).await?.serve().await
}
