//! Protocol-agnostic rectified reports
//!
//! Parsers turn location-bearing messages into one of these; the
//! rectifier resolves `Hint` into `Coord` via a geolocation lookup.
//! Serialized as the JSON payload of a `Rept` envelope, tagged with
//! `type`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Report {
    /// An actual position, straight from GPS or rectified from hints.
    #[serde(rename = "location")]
    Coord(CoordReport),
    /// Cell/Wi-Fi observations that still need a geolocation lookup.
    /// Internal to the pipeline, never forwarded to browser clients.
    #[serde(rename = "approximate_location")]
    Approximate(HintReport),
    /// Terminal status without position.
    #[serde(rename = "status")]
    Status(StatusReport),
}

impl Report {
    pub fn to_json(&self) -> String {
        // the report types serialize infallibly
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordReport {
    pub devtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percentage: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub battery_percentage: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintReport {
    pub devtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percentage: Option<i32>,
    pub mcc: u16,
    pub mnc: u16,
    pub gsm_cells: Vec<GsmCell>,
    pub wifi_aps: Vec<WifiAp>,
}

/// One observed GSM cell: location area, cell id, signal strength
/// (negative dBm-style number, stronger is closer to zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GsmCell {
    pub area: u16,
    pub cell: u16,
    pub rssi: i32,
}

/// One observed Wi-Fi access point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiAp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    pub mac: String,
    pub rssi: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coord_report_json_shape() {
        let report = Report::Coord(CoordReport {
            devtime: "2023-05-17 10:31:00+00:00".to_string(),
            battery_percentage: Some(85),
            accuracy: None,
            altitude: None,
            speed: Some(0.0),
            direction: Some(310.0),
            latitude: 53.5236,
            longitude: 12.7,
        });
        let json = report.to_json();
        assert!(json.contains(r#""type":"location""#));
        assert!(json.contains(r#""latitude":53.5236"#));
        // unset optionals stay out of the payload
        assert!(!json.contains("accuracy"));
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn hint_report_roundtrip() {
        let report = Report::Approximate(HintReport {
            devtime: "2023-05-17 10:31:00".to_string(),
            battery_percentage: None,
            mcc: 262,
            mnc: 3,
            gsm_cells: vec![GsmCell { area: 24420, cell: 16594, rssi: -81 }],
            wifi_aps: vec![WifiAp {
                ssid: None,
                mac: "12:34:56:78:9A:BC".to_string(),
                rssi: -68,
            }],
        });
        let back: Report = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(back, report);
    }
}
