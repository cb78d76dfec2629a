//! Protocol "beesure" used by some watch trackers ("BS").
//!
//! Frames are ASCII-framed: `"[" vendor(2) "*" imei(10) "*" dlen(4 hex)
//! "*" payload "]"` with a 20-byte header. The payload is a
//! comma-separated field list whose first token is the command verb,
//! except TK which carries escaped binary audio. Some devices put
//! non-UTF-8 bytes in SSID fields, so only the verb is decoded as
//! ASCII and the rest goes through a tolerant 8-bit decoding.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::bytes::Regex;

use super::report::{CoordReport, GsmCell, HintReport, Report, WifiAp};
use super::{CommandError, Deframed, Respond};
use crate::error::{LocSrvError, Result};

pub const PROTO_PREFIX: &str = "BS:";
/// Theoretical max frame 65536 + 21 framing bytes.
pub const MAXBUFFER: usize = 65557;

const HEADER_LEN: usize = 20;

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[(\w\w)\*(\d{10})\*([0-9a-fA-F]{4})\*").expect("frame regex compiles")
    })
}

/// Start of the next frame in the buffer: (offset, vendor, imei,
/// payload length), or None when no header is present.
fn framestart(buffer: &[u8]) -> Option<(usize, String, String, usize)> {
    let caps = frame_re().captures(buffer)?;
    let whole = caps.get(0)?;
    let vendor = String::from_utf8_lossy(&caps[1]).into_owned();
    let imei = String::from_utf8_lossy(&caps[2]).into_owned();
    let datalen = usize::from_str_radix(&String::from_utf8_lossy(&caps[3]), 16).ok()?;
    Some((whole.start(), vendor, imei, datalen))
}

#[derive(Debug, Default)]
pub struct Stream {
    buffer: Vec<u8>,
    imei: Option<String>,
    datalen: usize,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }
}

impl super::Stream for Stream {
    fn recv(&mut self, segment: &[u8]) -> Vec<Deframed> {
        self.buffer.extend_from_slice(segment);
        let mut msgs = Vec::new();
        if self.buffer.len() > MAXBUFFER {
            msgs.push(Deframed::Error(format!(
                "More than {MAXBUFFER} bytes of unparseable data, dropping"
            )));
            self.buffer.clear();
            self.datalen = 0;
            return msgs;
        }
        loop {
            if self.datalen == 0 {
                // have not seen the next packet header yet
                let Some((toskip, _, imei, datalen)) = framestart(&self.buffer) else {
                    break;
                };
                if toskip > 0 {
                    msgs.push(Deframed::Error(format!(
                        "Skipping {toskip} bytes of undecodable data \"{}\"",
                        String::from_utf8_lossy(&self.buffer[..toskip.min(64)])
                    )));
                    self.buffer.drain(..toskip);
                }
                if let Some(known) = &self.imei {
                    if *known != imei {
                        msgs.push(Deframed::Error(format!(
                            "Packet's imei {imei} mismatches previous value {known}, old value kept"
                        )));
                    }
                } else {
                    self.imei = Some(imei);
                }
                self.datalen = datalen;
            }
            if self.buffer.len() < self.datalen + HEADER_LEN + 1 {
                break; // incomplete packet
            }
            if self.buffer[self.datalen + HEADER_LEN] == b']' {
                msgs.push(Deframed::Packet(
                    self.buffer[..self.datalen + HEADER_LEN + 1].to_vec(),
                ));
            } else {
                msgs.push(Deframed::Error(format!(
                    "Packet does not end with ']' at {}: {}",
                    self.datalen + HEADER_LEN,
                    String::from_utf8_lossy(&self.buffer[..self.buffer.len().min(64)])
                )));
            }
            self.buffer.drain(..self.datalen + HEADER_LEN + 1);
            self.datalen = 0;
        }
        msgs
    }

    fn close(&mut self) -> Vec<u8> {
        self.imei = None;
        self.datalen = 0;
        std::mem::take(&mut self.buffer)
    }
}

pub fn probe_buffer(buffer: &[u8]) -> bool {
    frame_re().is_match(buffer)
}

/// Rewrite the frame header with the connection's IMEI. The payload
/// must itself be a well-formed frame (as produced by the packet
/// constructors, which stamp a placeholder IMEI).
pub fn enframe(buffer: &[u8], imei: Option<&str>) -> Result<Vec<u8>> {
    let imei = imei.ok_or_else(|| LocSrvError::protocol("beesure enframe needs an IMEI"))?;
    if imei.len() != 10 {
        return Err(LocSrvError::protocol(format!(
            "beesure IMEI must be 10 digits, got {imei:?}"
        )));
    }
    match framestart(buffer) {
        Some((0, vendor, _, dlen)) => {
            let mut out = format!("[{vendor}*{imei}*{dlen:04X}*").into_bytes();
            out.extend_from_slice(&buffer[HEADER_LEN..]);
            Ok(out)
        }
        _ => Err(LocSrvError::protocol(
            "payload to enframe does not start with a frame header",
        )),
    }
}

/// Tolerant 8-bit decoding for field data (some SSIDs are not UTF-8).
fn decode_8bit(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn verb_of(packet: &[u8]) -> String {
    let inner = packet
        .get(HEADER_LEN..packet.len().saturating_sub(1))
        .unwrap_or(b"");
    let verb = inner.split(|&b| b == b',').next().unwrap_or(b"");
    String::from_utf8_lossy(verb).into_owned()
}

pub fn proto_of_message(packet: &[u8]) -> String {
    format!("{PROTO_PREFIX}{}", verb_of(packet))
}

pub fn imei_from_packet(packet: &[u8]) -> Option<String> {
    match framestart(packet) {
        Some((0, _, imei, _)) if !imei.is_empty() => Some(imei),
        _ => None,
    }
}

/// The protocol has no hibernation notice.
pub fn is_goodbye_packet(_packet: &[u8]) -> bool {
    false
}

/// A location fix or hint carried by UD/UD2/AL.
#[derive(Debug, Clone, PartialEq)]
pub struct LocData {
    pub devtime: Option<NaiveDateTime>,
    pub gps_valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub direction: f64,
    pub altitude: f64,
    pub num_of_sats: i32,
    pub gsm_strength_percentage: i32,
    pub battery_percentage: i32,
    pub pedometer: i64,
    pub tumbling_times: i64,
    pub device_status: u32,
    pub mcc: u16,
    pub mnc: u16,
    pub gsm_cells: Vec<GsmCell>,
    pub wifi_aps: Vec<WifiAp>,
    pub positioning_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// UD, UD2 or AL.
    Location { verb: String, data: LocData },
    /// Link keepalive with optional step/tumbling/battery fields.
    Lk {
        step: Option<String>,
        tumbling_number: Option<String>,
        battery_percentage: Option<String>,
    },
    /// Voice message; escaped binary AMR audio.
    Tk { amr_data: Vec<u8> },
    /// A verb we know but do not decode further.
    Plain { verb: String },
    Unknown { verb: String, payload: Vec<u8> },
}

impl Msg {
    pub fn respond(&self) -> Respond {
        match self {
            Msg::Location { verb, .. } if verb == "AL" => Respond::Inline,
            Msg::Location { .. } => Respond::None,
            Msg::Lk { .. } | Msg::Tk { .. } => Respond::Inline,
            Msg::Plain { verb } if verb == "TKQ" || verb == "TKQ2" => Respond::Inline,
            _ => Respond::None,
        }
    }

    pub fn rectified(&self) -> Option<Report> {
        let Msg::Location { data, .. } = self else {
            return None;
        };
        let devtime = data
            .devtime
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        if data.gps_valid {
            Some(Report::Coord(CoordReport {
                devtime,
                battery_percentage: Some(data.battery_percentage),
                accuracy: Some(data.positioning_accuracy),
                altitude: Some(data.altitude),
                speed: Some(data.speed),
                direction: Some(data.direction),
                latitude: data.latitude,
                longitude: data.longitude,
            }))
        } else {
            Some(Report::Approximate(HintReport {
                devtime,
                battery_percentage: Some(data.battery_percentage),
                mcc: data.mcc,
                mnc: data.mnc,
                gsm_cells: data.gsm_cells.clone(),
                wifi_aps: data.wifi_aps.clone(),
            }))
        }
    }
}

/// Verbs with an inline response, and what the response payload is.
fn inline_payload(verb: &str) -> Option<String> {
    match verb {
        "LK" | "AL" | "TKQ" | "TKQ2" => Some(verb.to_string()),
        "TK" => Some("TK,1".to_string()), // 1 means "received fine"
        _ => None,
    }
}

/// Build a packed frame with the placeholder IMEI; `enframe` stamps
/// the real one.
fn packed(payload: &str) -> Vec<u8> {
    format!("[LT*0000000000*{:04X}*{payload}]", payload.len()).into_bytes()
}

pub fn inline_response(packet: &[u8]) -> Option<Vec<u8>> {
    inline_payload(&verb_of(packet)).map(|payload| packed(&payload))
}

/// This protocol's hints never get an externally supplied answer.
pub fn hint_response(_packet: &[u8], _lat: f64, _lon: f64) -> Option<Vec<u8>> {
    None
}

fn unescape_tk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'}' {
            match iter.peek() {
                Some(b'*') => {
                    out.push(b'*');
                    iter.next();
                }
                Some(b',') => {
                    out.push(b',');
                    iter.next();
                }
                Some(b'[') => {
                    out.push(b'[');
                    iter.next();
                }
                Some(b']') => {
                    out.push(b']');
                    iter.next();
                }
                Some(b'}') => {
                    out.push(b'}');
                    iter.next();
                }
                _ => out.push(b),
            }
        } else {
            out.push(b);
        }
    }
    out
}

fn decode_location(verb: &str, fields: &[String]) -> Option<Msg> {
    if fields.len() < 20 {
        return None;
    }
    let date = &fields[0];
    let time = &fields[1];
    let gps_valid = fields[2] == "A";
    let lat: f64 = fields[3].parse().ok()?;
    let nors: f64 = if fields[4] == "N" { 1.0 } else { -1.0 };
    let lon: f64 = fields[5].parse().ok()?;
    let eorw: f64 = if fields[6] == "E" { 1.0 } else { -1.0 };
    let ncells: usize = fields[16].parse().ok()?;
    let rest = &fields[20..];
    if rest.len() < ncells * 3 + 1 {
        return None;
    }
    let mut gsm_cells = Vec::with_capacity(ncells);
    for triple in rest[..ncells * 3].chunks_exact(3) {
        gsm_cells.push(GsmCell {
            area: triple[0].parse().ok()?,
            cell: triple[1].parse().ok()?,
            rssi: triple[2].parse().ok()?,
        });
    }
    let rest = &rest[ncells * 3..];
    let nwifi: usize = rest[0].parse().ok()?;
    if rest.len() < 1 + nwifi * 3 + 1 {
        return None;
    }
    let mut wifi_aps = Vec::with_capacity(nwifi);
    for triple in rest[1..1 + nwifi * 3].chunks_exact(3) {
        wifi_aps.push(WifiAp {
            ssid: Some(triple[0].clone()),
            mac: triple[1].clone(),
            rssi: triple[2].parse().ok()?,
        });
    }
    let accuracy: f64 = rest[1 + nwifi * 3].parse().ok()?;
    Some(Msg::Location {
        verb: verb.to_string(),
        data: LocData {
            devtime: NaiveDateTime::parse_from_str(
                &format!("{date}{time}"),
                "%d%m%y%H%M%S",
            )
            .ok(),
            gps_valid,
            latitude: lat * nors,
            longitude: lon * eorw,
            speed: fields[7].parse().ok()?,
            direction: fields[8].parse().ok()?,
            altitude: fields[9].parse().ok()?,
            num_of_sats: fields[10].parse().ok()?,
            gsm_strength_percentage: fields[11].parse().ok()?,
            battery_percentage: fields[12].parse().ok()?,
            pedometer: fields[13].parse().ok()?,
            tumbling_times: fields[14].parse().ok()?,
            device_status: u32::from_str_radix(&fields[15], 16).ok()?,
            mcc: fields[18].parse().ok()?,
            mnc: fields[19].parse().ok()?,
            gsm_cells,
            wifi_aps,
            positioning_accuracy: accuracy,
        },
    })
}

const KNOWN_VERBS: &[&str] = &[
    "AL", "CONFIG", "CR", "FLOWER", "ICCID", "LK", "MESSAGE", "PHB", "PHB2", "POWEROFF",
    "RESET", "SOS", "SOS1", "SOS2", "SOS3", "TK", "TKQ", "TKQ2", "UD", "UD2",
];

/// Decode one deframed packet (the full bracketed frame). Never fails
/// at the protocol level.
pub fn parse_message(packet: &[u8], is_incoming: bool) -> Msg {
    let Some(inner) = packet.get(HEADER_LEN..packet.len().saturating_sub(1)) else {
        return Msg::Unknown {
            verb: String::new(),
            payload: packet.to_vec(),
        };
    };
    let mut split = inner.splitn(2, |&b| b == b',');
    let verb_bytes = split.next().unwrap_or(b"");
    let rest = split.next().unwrap_or(b"");
    let Ok(verb) = std::str::from_utf8(verb_bytes).map(str::to_string) else {
        return Msg::Unknown {
            verb: decode_8bit(verb_bytes),
            payload: rest.to_vec(),
        };
    };
    if !KNOWN_VERBS.contains(&verb.as_str()) {
        return Msg::Unknown {
            verb,
            payload: rest.to_vec(),
        };
    }
    if !is_incoming {
        return Msg::Plain { verb };
    }
    match verb.as_str() {
        "TK" => Msg::Tk {
            amr_data: unescape_tk(rest),
        },
        "UD" | "UD2" | "AL" => {
            let fields: Vec<String> = decode_8bit(rest)
                .split(',')
                .map(str::to_string)
                .collect();
            decode_location(&verb, &fields).unwrap_or(Msg::Unknown {
                verb,
                payload: rest.to_vec(),
            })
        }
        "LK" => {
            let fields: Vec<String> = if rest.is_empty() {
                Vec::new()
            } else {
                decode_8bit(rest).split(',').map(str::to_string).collect()
            };
            Msg::Lk {
                step: fields.first().cloned(),
                tumbling_number: fields.get(1).cloned(),
                battery_percentage: fields.get(2).cloned(),
            }
        }
        _ => Msg::Plain { verb },
    }
}

/// Commands the operator surface can construct.
const COMMANDS: &[&str] = &[
    "CR", "FLOWER", "MESSAGE", "PHB", "PHB2", "POWEROFF", "RESET", "SOS", "SOS1", "SOS2",
    "SOS3", "TKQ",
];

fn utf16be_hex(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 4);
    for unit in text.encode_utf16() {
        out.push_str(&format!("{unit:04x}"));
    }
    out
}

/// Resolve a command name (optionally `BS:`-prefixed, case-insensitive
/// unique prefix) and build the packed frame from `key=value`
/// parameters.
pub fn command_packet(
    cmd: &str,
    kwargs: &HashMap<String, String>,
) -> std::result::Result<Vec<u8>, CommandError> {
    let wanted = cmd
        .strip_prefix(PROTO_PREFIX)
        .unwrap_or(cmd)
        .to_ascii_uppercase();
    let matches: Vec<&&str> = COMMANDS
        .iter()
        .filter(|name| name.starts_with(&wanted))
        .collect();
    let name = match matches.as_slice() {
        [] => return Err(CommandError::Unknown(cmd.to_string())),
        [single] => **single,
        many => match many.iter().find(|name| ***name == wanted) {
            Some(exact) => **exact,
            None => {
                return Err(CommandError::Ambiguous(
                    many.iter().map(|name| name.to_string()).collect(),
                ))
            }
        },
    };
    let payload = match name {
        "CR" | "POWEROFF" | "RESET" | "TKQ" => name.to_string(),
        "FLOWER" => {
            let number = kwargs.get("number").map_or("1", String::as_str);
            number
                .parse::<i64>()
                .map_err(|_| CommandError::BadValue(format!("number: {number:?}")))?;
            format!("FLOWER,{number}")
        }
        "MESSAGE" => {
            let message = kwargs.get("message").map_or("", String::as_str);
            format!("MESSAGE,{}", utf16be_hex(message))
        }
        "SOS" => {
            let numbers = kwargs.get("phonenumbers").map_or("", String::as_str);
            let parts: Vec<&str> = numbers.split(',').collect();
            if parts.len() != 3 {
                return Err(CommandError::BadValue(
                    "phonenumbers needs exactly three comma-separated values".to_string(),
                ));
            }
            format!("SOS,{}", parts.join(","))
        }
        "SOS1" | "SOS2" | "SOS3" => {
            let number = kwargs.get("phonenumber").map_or("", String::as_str);
            format!("{name},{number}")
        }
        "PHB" | "PHB2" => {
            // entries are name:number pairs, at most five
            let entries = kwargs.get("entries").map_or("", String::as_str);
            let pairs: Vec<(&str, &str)> = entries
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|pair| {
                    pair.split_once(':').ok_or_else(|| {
                        CommandError::BadValue(format!("entry without ':': {pair:?}"))
                    })
                })
                .collect::<std::result::Result<_, _>>()?;
            if pairs.len() > 5 {
                return Err(CommandError::BadValue(
                    "phonebook holds at most five entries".to_string(),
                ));
            }
            let encoded: Vec<String> = pairs
                .iter()
                .map(|(phone_name, number)| format!("{number},{}", utf16be_hex(phone_name)))
                .collect();
            if encoded.is_empty() {
                name.to_string()
            } else {
                format!("{name},{}", encoded.join(","))
            }
        }
        _ => return Err(CommandError::Unknown(cmd.to_string())),
    };
    Ok(packed(&payload))
}

pub fn exposed_protos() -> Vec<(String, bool)> {
    ["UD", "UD2", "AL"]
        .iter()
        .map(|verb| (format!("{PROTO_PREFIX}{verb}"), false))
        .collect()
}
