//! Local OpenCellID lookup backend
//!
//! Estimates a position as the inverse-RSSI-weighted average of the
//! coordinates of the observed cells that are present in the local
//! cell-tower database (populated by the `ocid_download` subcommand).
//! Wi-Fi observations are ignored; this backend is cells-only.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::{Estimate, Lookaside};
use crate::error::{LocSrvError, Result};
use crate::proto::report::{GsmCell, WifiAp};

pub struct OpenCellId {
    pool: SqlitePool,
}

impl OpenCellId {
    pub async fn open(dbfn: &str) -> Result<Self> {
        if dbfn.is_empty() {
            return Err(LocSrvError::config("[opencellid] dbfn is not set"));
        }
        let options = SqliteConnectOptions::new()
            .filename(dbfn)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Lookaside for OpenCellId {
    async fn lookup(
        &self,
        mcc: u16,
        _mnc: u16,
        gsm_cells: &[GsmCell],
        _wifi_aps: &[WifiAp],
    ) -> Result<Estimate> {
        // (lat, lon, range, signal) for every observed cell we know
        let mut matched: Vec<(f64, f64, f64, i32)> = Vec::new();
        for cell in gsm_cells {
            let row = sqlx::query(
                "select lat, lon, range from cells
                    where mcc = ? and area = ? and cell = ?",
            )
            .bind(mcc)
            .bind(cell.area)
            .bind(cell.cell)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                matched.push((
                    row.get::<f64, _>("lat"),
                    row.get::<f64, _>("lon"),
                    row.try_get::<f64, _>("range").unwrap_or(0.0),
                    // a zero signal would blow up the weighting
                    if cell.rssi == 0 { -1 } else { cell.rssi },
                ));
            }
        }
        if matched.is_empty() {
            return Err(LocSrvError::lookup("no location data found in opencellid"));
        }
        let sumsig: f64 = matched.iter().map(|(_, _, _, sig)| 1.0 / f64::from(*sig)).sum();
        let mut avlat = 0.0;
        let mut avlon = 0.0;
        let mut avrange = 0.0;
        for (lat, lon, range, sig) in &matched {
            let nsig = 1.0 / f64::from(*sig) / sumsig;
            avlat += lat * nsig;
            avlon += lon * nsig;
            avrange += range * nsig;
        }
        debug!(
            "{} of {} observed cells matched, estimate {avlat} {avlon}",
            matched.len(),
            gsm_cells.len()
        );
        Ok((avlat, avlon, avrange))
    }
}
