//! Pluggable geolocation lookup backends
//!
//! The rectifier resolves cell/Wi-Fi hints through one of these.

pub mod googlemaps;
pub mod opencellid;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{LocSrvError, Result};
use crate::proto::report::{GsmCell, WifiAp};

/// Geolocation estimate: latitude, longitude, accuracy in meters
/// (0 when the backend has no accuracy notion).
pub type Estimate = (f64, f64, f64);

#[async_trait]
pub trait Lookaside: Send + Sync {
    async fn lookup(
        &self,
        mcc: u16,
        mnc: u16,
        gsm_cells: &[GsmCell],
        wifi_aps: &[WifiAp],
    ) -> Result<Estimate>;

    /// Release whatever the backend holds.
    async fn shut(&self) {}
}

/// Instantiate the backend named in `[rectifier] lookaside`.
pub async fn backend_from_config(conf: &Config) -> Result<Box<dyn Lookaside>> {
    match conf.rectifier.lookaside.as_str() {
        "opencellid" => Ok(Box::new(
            opencellid::OpenCellId::open(&conf.opencellid.dbfn).await?,
        )),
        "googlemaps" => Ok(Box::new(googlemaps::GoogleMaps::init(
            &conf.googlemaps.accesstoken,
        )?)),
        other => Err(LocSrvError::config(format!(
            "unknown lookaside backend {other:?}"
        ))),
    }
}
