//! SQLite event store
//!
//! Three append-only tables: raw `events`, rectified `reports`, and
//! `pmodmap` remembering which protocol module an IMEI was last seen
//! speaking. The storage component owns the only writing handle; the
//! websocket gateway opens the same file read-only for backlog and
//! pmodmap queries. Inserts go through `INSERT OR IGNORE` over
//! natural-key unique indexes so duplicate bus deliveries are
//! harmless.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::bus::Bcast;
use crate::error::Result;
use crate::proto::report::CoordReport;

/// pmodmap entries older than this are not trusted for routing.
const PMOD_TTL_SECONDS: f64 = 3600.0;

const SCHEMA: &[&str] = &[
    "create table if not exists events (
        tstamp real not null,
        imei text,
        peeraddr text not null,
        is_incoming int not null default TRUE,
        proto text not null,
        packet blob
    )",
    "create unique index if not exists events_natural
        on events (tstamp, imei, proto, packet)",
    "create table if not exists reports (
        imei text,
        devtime text not null,
        accuracy real,
        latitude real,
        longitude real,
        remainder text
    )",
    "create unique index if not exists reports_natural
        on reports (imei, devtime, latitude, longitude)",
    "create table if not exists pmodmap (
        imei text not null unique,
        pmod text not null,
        tstamp real not null default (strftime('%s'))
    )",
];

#[derive(Clone)]
pub struct EvStore {
    pool: SqlitePool,
}

impl EvStore {
    /// Open (creating if needed) the store for writing, WAL mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        info!("event store open at {}", path.as_ref().display());
        Ok(Self { pool })
    }

    /// Open the store read-only (backlog queries from the gateway).
    pub async fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Append one raw event.
    pub async fn stow(&self, bcast: &Bcast, proto: &str) -> Result<()> {
        let peeraddr = bcast
            .peeraddr
            .map(|a| a.to_string())
            .unwrap_or_default();
        sqlx::query(
            "insert or ignore into events
                (tstamp, imei, peeraddr, proto, packet, is_incoming)
                values (?, ?, ?, ?, ?, ?)",
        )
        .bind(bcast.when)
        .bind(bcast.imei.as_deref())
        .bind(peeraddr)
        .bind(proto)
        .bind(bcast.packet.as_slice())
        .bind(bcast.is_incoming)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one rectified location report. The structured columns
    /// get their own fields; everything else rides in the JSON
    /// remainder for forward compatibility.
    pub async fn stowloc(&self, imei: Option<&str>, report: &CoordReport) -> Result<()> {
        let mut remainder = Map::new();
        if let Some(v) = report.battery_percentage {
            remainder.insert("battery_percentage".to_string(), json!(v));
        }
        if let Some(v) = report.altitude {
            remainder.insert("altitude".to_string(), json!(v));
        }
        if let Some(v) = report.speed {
            remainder.insert("speed".to_string(), json!(v));
        }
        if let Some(v) = report.direction {
            remainder.insert("direction".to_string(), json!(v));
        }
        sqlx::query(
            "insert or ignore into reports
                (imei, devtime, accuracy, latitude, longitude, remainder)
                values (?, ?, ?, ?, ?, ?)",
        )
        .bind(imei)
        .bind(report.devtime.as_str())
        .bind(report.accuracy)
        .bind(report.latitude)
        .bind(report.longitude)
        .bind(Value::Object(remainder).to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remember the protocol module an IMEI was last seen speaking.
    pub async fn stowpmod(&self, imei: &str, pmod: &str) -> Result<()> {
        sqlx::query(
            "insert or replace into pmodmap (imei, pmod, tstamp)
                values (?, ?, strftime('%s'))",
        )
        .bind(imei)
        .bind(pmod)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Last `backlog` reports for an IMEI, oldest first, each merged
    /// with its remainder fields.
    pub async fn fetch(&self, imei: &str, backlog: u32) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            "select imei, devtime, accuracy, latitude, longitude, remainder
                from reports where imei = ?
                order by devtime desc limit ?",
        )
        .bind(imei)
        .bind(backlog)
        .fetch_all(&self.pool)
        .await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let mut entry = Map::new();
            entry.insert("imei".to_string(), json!(row.get::<String, _>("imei")));
            entry.insert("devtime".to_string(), json!(row.get::<String, _>("devtime")));
            if let Some(accuracy) = row.get::<Option<f64>, _>("accuracy") {
                entry.insert("accuracy".to_string(), json!(accuracy));
            }
            entry.insert("latitude".to_string(), json!(row.get::<f64, _>("latitude")));
            entry.insert("longitude".to_string(), json!(row.get::<f64, _>("longitude")));
            let remainder: String = row.get("remainder");
            if let Ok(Value::Object(extra)) = serde_json::from_str(&remainder) {
                entry.extend(extra);
            }
            result.push(Value::Object(entry));
        }
        Ok(result)
    }

    /// Protocol module for an IMEI, if seen within the last hour.
    pub async fn fetchpmod(&self, imei: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "select pmod from pmodmap where imei = ?
                and tstamp > strftime('%s') - ?",
        )
        .bind(imei)
        .bind(PMOD_TTL_SECONDS)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("pmod")))
    }
}
