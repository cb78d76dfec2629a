//! Configuration management
//!
//! Configuration comes from one TOML file merged with `LOCSRV_*`
//! environment overrides via Figment. Terminal-configuration sections
//! (the `[termconfig]` table and the optional per-IMEI tables) are
//! free-form maps whose values are either a scalar or a list of values
//! of one type; mixed-type lists are rejected at load time.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{LocSrvError, Result};

/// Default TCP port devices connect to.
pub const DEFAULT_PORT: u16 = 4303;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub common: CommonConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rectifier: RectifierConfig,
    #[serde(default)]
    pub opencellid: OpenCellIdConfig,
    #[serde(default)]
    pub googlemaps: GoogleMapsConfig,
    #[serde(default)]
    pub wsgateway: WsGatewayConfig,
    /// Default terminal configuration, overridable per IMEI.
    #[serde(default)]
    pub termconfig: TermSection,
    /// Any other table is a per-IMEI terminal configuration.
    #[serde(flatten)]
    pub terminals: HashMap<String, TermSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommonConfig {
    /// Names of the enabled protocol modules, probe order.
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Device-facing TCP port.
    pub port: u16,
    /// Publish-channel bind endpoint (raw event broadcasts).
    pub publishurl: String,
    /// Pull-channel bind endpoint (responses towards devices).
    pub listenurl: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            publishurl: "127.0.0.1:5301".to_string(),
            listenurl: "127.0.0.1:5302".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite event store path.
    pub dbfn: String,
    /// Whether raw events are persisted (reports always are).
    pub events: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dbfn: "locsrv.sqlite".to_string(),
            events: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RectifierConfig {
    /// Lookaside backend name: "opencellid" or "googlemaps".
    pub lookaside: String,
    /// Publish-channel bind endpoint for rectified reports.
    pub publishurl: String,
}

impl Default for RectifierConfig {
    fn default() -> Self {
        Self {
            lookaside: "opencellid".to_string(),
            publishurl: "127.0.0.1:5303".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpenCellIdConfig {
    /// Local cell-tower database path.
    pub dbfn: String,
    /// Full download URL; overrides token+mcc when set.
    pub downloadurl: Option<String>,
    /// Path to a file holding the opencellid access token.
    pub downloadtoken: Option<String>,
    /// MCC to download, or "full".
    pub downloadmcc: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GoogleMapsConfig {
    /// Path to a file holding the geolocation API token.
    pub accesstoken: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsGatewayConfig {
    /// Browser-facing HTTP/WebSocket port.
    pub port: u16,
    /// HTML file served on plain GET /.
    pub htmlfile: Option<String>,
}

impl Default for WsGatewayConfig {
    fn default() -> Self {
        Self {
            port: 5049,
            htmlfile: None,
        }
    }
}

/// One terminal-configuration section: option name to scalar or
/// homogeneously-typed list.
pub type TermSection = BTreeMap<String, ConfValue>;

/// A configuration value: scalar or homogeneous list. Mixed-type
/// lists fail deserialization.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfValue {
    Int(i64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
}

impl ConfValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            ConfValue::IntList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            ConfValue::StrList(v) => Some(v),
            _ => None,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file plus
    /// `LOCSRV_*` environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LOCSRV_").split("__"))
            .extract()?;
        if config.common.protocols.is_empty() {
            return Err(LocSrvError::config("no protocol modules configured"));
        }
        Ok(config)
    }

    /// Terminal configuration for an IMEI: the per-IMEI section when
    /// present, the `[termconfig]` defaults otherwise.
    pub fn term_section(&self, imei: Option<&str>) -> &TermSection {
        imei.and_then(|imei| self.terminals.get(imei))
            .unwrap_or(&self.termconfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(toml: &str) -> Result<Config> {
        let dir = tempfile::tempdir().expect("scratch dir");
        let path = dir.path().join("locsrv.toml");
        std::fs::write(&path, toml).expect("write config");
        Config::from_file(&path)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let conf = load(
            r#"
            [common]
            protocols = ["zx303", "beesure"]
            "#,
        )
        .unwrap();
        assert_eq!(conf.collector.port, DEFAULT_PORT);
        assert_eq!(conf.rectifier.lookaside, "opencellid");
        assert!(conf.storage.events);
        assert!(conf.termconfig.is_empty());
    }

    #[test]
    fn per_imei_section_overrides_termconfig() {
        let conf = load(
            r#"
            [common]
            protocols = ["zx303"]

            [termconfig]
            statusintervalminutes = 25
            phonenumbers = ["", "", ""]

            ["8613001234567890"]
            statusintervalminutes = 10
            "#,
        )
        .unwrap();
        let dflt = conf.term_section(None);
        assert_eq!(dflt["statusintervalminutes"].as_int(), Some(25));
        let dev = conf.term_section(Some("8613001234567890"));
        assert_eq!(dev["statusintervalminutes"].as_int(), Some(10));
        // replacement, not merge
        assert!(dev.get("phonenumbers").is_none());
        let other = conf.term_section(Some("000"));
        assert_eq!(other["statusintervalminutes"].as_int(), Some(25));
    }

    #[test]
    fn mixed_type_list_is_rejected() {
        let result = load(
            r#"
            [common]
            protocols = ["zx303"]

            [termconfig]
            alarms = [0, "07:00", 0]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_protocols_is_fatal() {
        let result = load(
            r#"
            [common]
            protocols = []
            "#,
        );
        assert!(matches!(result, Err(LocSrvError::Config(_))));
    }
}
