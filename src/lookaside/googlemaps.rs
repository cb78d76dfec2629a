//! Google Geolocation API lookup backend
//!
//! Sends the observed cells and access points to the geolocation
//! endpoint over HTTPS. The access token is read from a file so the
//! configuration itself stays free of secrets.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{Estimate, Lookaside};
use crate::error::{LocSrvError, Result};
use crate::proto::report::{GsmCell, WifiAp};

const ENDPOINT: &str = "https://www.googleapis.com/geolocation/v1/geolocate";

pub struct GoogleMaps {
    client: reqwest::Client,
    token: String,
    endpoint: String,
}

impl GoogleMaps {
    pub fn init(token_path: &str) -> Result<Self> {
        if token_path.is_empty() {
            return Err(LocSrvError::config("[googlemaps] accesstoken is not set"));
        }
        let token = std::fs::read_to_string(token_path)
            .map_err(|e| LocSrvError::config(format!("cannot read {token_path}: {e}")))?
            .trim()
            .to_string();
        Ok(Self {
            client: reqwest::Client::new(),
            token,
            endpoint: ENDPOINT.to_string(),
        })
    }
}

#[async_trait]
impl Lookaside for GoogleMaps {
    async fn lookup(
        &self,
        mcc: u16,
        mnc: u16,
        gsm_cells: &[GsmCell],
        wifi_aps: &[WifiAp],
    ) -> Result<Estimate> {
        let body = json!({
            "homeMobileCountryCode": mcc,
            "homeMobileNetworkCode": mnc,
            "radioType": "gsm",
            "considerIp": false,
            "cellTowers": gsm_cells.iter().map(|cell| json!({
                "locationAreaCode": cell.area,
                "cellId": cell.cell,
                "signalStrength": cell.rssi,
            })).collect::<Vec<_>>(),
            "wifiAccessPoints": wifi_aps.iter().map(|ap| json!({
                "macAddress": ap.mac,
                "signalStrength": ap.rssi,
            })).collect::<Vec<_>>(),
        });
        let response = self
            .client
            .post(format!("{}?key={}", self.endpoint, self.token))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LocSrvError::lookup(format!(
                "geolocation request failed with {}",
                response.status()
            )));
        }
        let result: serde_json::Value = response.json().await?;
        debug!("geolocation result: {result}");
        let location = result
            .get("location")
            .ok_or_else(|| LocSrvError::lookup(format!("no location in {result}")))?;
        let lat = location.get("lat").and_then(|v| v.as_f64());
        let lng = location.get("lng").and_then(|v| v.as_f64());
        let accuracy = result.get("accuracy").and_then(|v| v.as_f64()).unwrap_or(0.0);
        match (lat, lng) {
            (Some(lat), Some(lng)) => Ok((lat, lng, accuracy)),
            _ => Err(LocSrvError::lookup(format!("malformed location in {result}"))),
        }
    }
}
