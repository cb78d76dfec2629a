//! Shared plumbing for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use locsrv::config::{
    CollectorConfig, CommonConfig, Config, GoogleMapsConfig, OpenCellIdConfig, RectifierConfig,
    StorageConfig, WsGatewayConfig,
};

/// Configuration with every endpoint on an ephemeral loopback port.
pub fn test_config() -> Config {
    Config {
        common: CommonConfig {
            protocols: vec!["zx303".to_string(), "beesure".to_string()],
        },
        collector: CollectorConfig {
            port: 0,
            publishurl: "127.0.0.1:0".to_string(),
            listenurl: "127.0.0.1:0".to_string(),
        },
        storage: StorageConfig {
            dbfn: ":memory:".to_string(),
            events: true,
        },
        rectifier: RectifierConfig {
            lookaside: "opencellid".to_string(),
            publishurl: "127.0.0.1:0".to_string(),
        },
        opencellid: OpenCellIdConfig::default(),
        googlemaps: GoogleMapsConfig::default(),
        wsgateway: WsGatewayConfig {
            port: 0,
            htmlfile: None,
        },
        termconfig: Default::default(),
        terminals: HashMap::new(),
    }
}

/// Await a future with the common test deadline.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out after 5s")
}

/// Give bus handshakes a moment to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

/// The canonical zx303 LOGIN frame for IMEI 3590001234567890.
pub const ZX_LOGIN_FRAME: &[u8] = &[
    0x78, 0x78, 0x0d, 0x01, 0x35, 0x90, 0x00, 0x12, 0x34, 0x56, 0x78, 0x90, 0x00, 0x00, 0x09,
    0x85, 0x05, 0x0d, 0x0a,
];

pub const ZX_LOGIN_ACK: &[u8] = &[0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0x0d, 0x0a];

/// A ZX:WIFI_POSITIONING packet (unframed): two APs, three cells of
/// MCC 262 / MNC 3 around Waren an der Müritz.
pub fn zx_wifi_positioning_packet() -> Vec<u8> {
    let mut payload = vec![0x23, 0x05, 0x17, 0x10, 0x31, 0x00];
    payload.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 68]);
    payload.extend_from_slice(&[0xde, 0xf0, 0x12, 0x34, 0x56, 0x78, 81]);
    payload.push(3);
    payload.extend_from_slice(&262u16.to_be_bytes());
    payload.push(3);
    for (cell, sig) in [(16594u16, 71u8), (36243, 82), (17012, 94)] {
        payload.extend_from_slice(&24420u16.to_be_bytes());
        payload.extend_from_slice(&cell.to_be_bytes());
        payload.push(sig);
    }
    let mut packet = vec![2, 0x69]; // length byte counts the APs here
    packet.extend_from_slice(&payload);
    packet
}

/// Populate an OpenCellID fixture holding the three cells the
/// positioning packet above observes.
pub async fn opencellid_fixture(dir: &std::path::Path) -> String {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    let dbfn = dir.join("ocid.sqlite").to_string_lossy().into_owned();
    let options = SqliteConnectOptions::new()
        .filename(&dbfn)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .unwrap();
    sqlx::query(
        "create table cells (
            radio text, mcc int, net int, area int, cell int, unit int,
            lon real, lat real, range int, samples int, changeable int,
            created int, updated int, averageSignal int
        )",
    )
    .execute(&pool)
    .await
    .unwrap();
    for (cell, lon, lat, range) in [
        (16594, 12.670, 53.5225, 2000),
        (36243, 12.740, 53.5280, 1500),
        (17012, 12.700, 53.5238, 1000),
    ] {
        sqlx::query(
            "insert into cells values ('GSM', 262, 3, 24420, ?, 0, ?, ?, ?, 10, 1, 0, 0, 0)",
        )
        .bind(cell)
        .bind(lon)
        .bind(lat)
        .bind(range)
        .execute(&pool)
        .await
        .unwrap();
    }
    pool.close().await;
    dbfn
}
