//! OpenCellID downloader
//!
//! Fetches the cell-tower CSV export (gzipped), and repopulates the
//! `cells` table of the local lookup database in one transaction.
//! Getting no rows rolls everything back so a broken download never
//! empties a working database.

use std::io::Read;

use flate2::read::GzDecoder;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{LocSrvError, Result};

const RURL: &str = "https://opencellid.org/ocid/downloads";

const SCHEMA: &str = r#"create table if not exists cells (
  "radio" text,
  "mcc" int,
  "net" int,
  "area" int,
  "cell" int,
  "unit" int,
  "lon" int,
  "lat" int,
  "range" int,
  "samples" int,
  "changeable" int,
  "created" int,
  "updated" int,
  "averageSignal" int
)"#;
const DBINDEX: &str = "create index if not exists cell_idx on cells (area, cell)";

fn download_url(conf: &Config) -> Result<(String, String)> {
    if let Some(url) = &conf.opencellid.downloadurl {
        return Ok((url.clone(), "<unspecified>".to_string()));
    }
    let token_path = conf
        .opencellid
        .downloadtoken
        .as_ref()
        .ok_or_else(|| LocSrvError::config("opencellid access token not configured"))?;
    let token = std::fs::read_to_string(token_path)
        .map_err(|e| LocSrvError::config(format!("cannot read {token_path}: {e}")))?
        .trim()
        .to_string();
    let mcc = conf
        .opencellid
        .downloadmcc
        .clone()
        .ok_or_else(|| LocSrvError::config("[opencellid] downloadmcc is not set"))?;
    let (dltype, fname) = if mcc == "full" {
        ("full", "cell_towers".to_string())
    } else {
        ("mcc", mcc.clone())
    };
    Ok((
        format!("{RURL}?token={token}&type={dltype}&file={fname}.csv.gz"),
        mcc,
    ))
}

pub async fn run(conf: &Config) -> Result<()> {
    let (url, mcc) = download_url(conf)?;
    let dbfn = &conf.opencellid.dbfn;
    if dbfn.is_empty() {
        return Err(LocSrvError::config("[opencellid] dbfn is not set"));
    }

    let response = reqwest::get(&url).await?;
    debug!("requested {url}, result {}", response.status());
    if !response.status().is_success() {
        return Err(LocSrvError::lookup(format!(
            "error getting the cell database: {}",
            response.status()
        )));
    }
    let compressed = response.bytes().await?;
    let mut csv_data = Vec::new();
    GzDecoder::new(&compressed[..])
        .read_to_end(&mut csv_data)
        .map_err(|e| LocSrvError::lookup(format!("gunzip failed: {e}")))?;

    let options = SqliteConnectOptions::new()
        .filename(dbfn)
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    sqlx::query(SCHEMA).execute(&pool).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("delete from cells").execute(&mut *tx).await?;
    let mut count: u64 = 0;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(&csv_data[..]);
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("skipping malformed CSV record: {e}");
                continue;
            }
        };
        if record.len() != 14 {
            warn!("skipping CSV record with {} fields", record.len());
            continue;
        }
        let mut insert = sqlx::query(
            "insert into cells values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        for field in record.iter() {
            insert = insert.bind(field.to_string());
        }
        insert.execute(&mut *tx).await?;
        count += 1;
    }
    if count < 1 {
        tx.rollback().await?;
        warn!("did not get any data for MCC {mcc}, rollback");
    } else {
        sqlx::query(DBINDEX).execute(&mut *tx).await?;
        tx.commit().await?;
        info!("repopulated {dbfn} with {count} records for MCC {mcc}");
    }
    Ok(())
}
