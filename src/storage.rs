//! Storage component
//!
//! Subscribes to the collector's raw channel and the rectifier's
//! rectified channel, appending both into the SQLite event store.
//! Raw events also refresh the per-IMEI protocol module map that the
//! operator command path uses for disconnected devices.

use tracing::{debug, warn};

use crate::bus::{Bcast, Rept, SubClient};
use crate::config::Config;
use crate::error::Result;
use crate::evstore::EvStore;
use crate::proto::{self, report::Report};

pub async fn run(conf: &Config) -> Result<()> {
    let modules = proto::enabled_modules(&conf.common.protocols)?;
    let store = EvStore::open(&conf.storage.dbfn).await?;
    let mut raw = SubClient::new(conf.collector.publishurl.clone());
    raw.subscribe(b"").await;
    let mut rectified = SubClient::new(conf.rectifier.publishurl.clone());
    rectified.subscribe(b"").await;

    loop {
        tokio::select! {
            buffer = raw.recv() => {
                if let Err(e) = handle_bcast(conf, &modules, &store, &buffer).await {
                    warn!("raw event not stored: {e}");
                }
            }
            buffer = rectified.recv() => {
                if let Err(e) = handle_rept(&store, &buffer).await {
                    warn!("report not stored: {e}");
                }
            }
        }
    }
}

async fn handle_bcast(
    conf: &Config,
    modules: &[&'static dyn proto::ProtoModule],
    store: &EvStore,
    buffer: &[u8],
) -> Result<()> {
    let bcast = Bcast::decode(buffer)?;
    debug!(
        "{} {} for IMEI {:?}: {}",
        if bcast.is_incoming { "I" } else { "O" },
        bcast.proto,
        bcast.imei,
        hex::encode(&bcast.packet)
    );
    if conf.storage.events {
        store.stow(&bcast, &bcast.proto).await?;
    }
    if bcast.is_incoming {
        if let (Some(imei), Some(pmod)) = (
            bcast.imei.as_deref(),
            proto::module_for_proto(modules, &bcast.proto),
        ) {
            store.stowpmod(imei, pmod.name()).await?;
        }
    }
    Ok(())
}

async fn handle_rept(store: &EvStore, buffer: &[u8]) -> Result<()> {
    let rept = Rept::decode(buffer)?;
    match serde_json::from_str::<Report>(&rept.payload) {
        Ok(Report::Coord(report)) => {
            store.stowloc(rept.imei.as_deref(), &report).await?;
        }
        Ok(_) => {} // status and approximate reports are not persisted
        Err(e) => warn!("unparseable rectified payload for {:?}: {e}", rept.imei),
    }
    Ok(())
}
