//! Protocol of the zx303 "ZhongXun Topin Locator" GPS+GPRS watch
//! trackers ("ZX").
//!
//! Wire frame: `"xx" | length(1) | proto(1) | payload | "\r\n"`. There
//! is no authentication and no integrity check, and the length byte is
//! unreliable: the two Wi-Fi positioning kinds use it as the access
//! point count, STATUS counts payload+2 where everything else counts
//! payload+4, and framing bytes can legitimately appear inside binary
//! payloads. The deframer below exists to survive all of that.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use tracing::warn;

use super::report::{CoordReport, GsmCell, HintReport, Report, StatusReport, WifiAp};
use super::{CommandError, Deframed, Respond};
use crate::config::TermSection;

pub const PROTO_PREFIX: &str = "ZX:";
pub const MAXBUFFER: usize = 4096;

pub const LOGIN: u8 = 0x01;
pub const SUPERVISION: u8 = 0x05;
pub const HEARTBEAT: u8 = 0x08;
pub const GPS_POSITIONING: u8 = 0x10;
pub const GPS_OFFLINE_POSITIONING: u8 = 0x11;
pub const STATUS: u8 = 0x13;
pub const HIBERNATION: u8 = 0x14;
pub const RESET: u8 = 0x15;
pub const WHITELIST_TOTAL: u8 = 0x16;
pub const WIFI_OFFLINE_POSITIONING: u8 = 0x17;
pub const TIME: u8 = 0x30;
pub const PROHIBIT_LBS: u8 = 0x33;
pub const MOM_PHONE: u8 = 0x43;
pub const STOP_UPLOAD: u8 = 0x44;
pub const STOP_ALARM: u8 = 0x56;
pub const SETUP: u8 = 0x57;
pub const SYNCHRONOUS_WHITELIST: u8 = 0x58;
pub const RESTORE_PASSWORD: u8 = 0x67;
pub const WIFI_POSITIONING: u8 = 0x69;
pub const MANUAL_POSITIONING: u8 = 0x80;
pub const BATTERY_CHARGE: u8 = 0x81;
pub const CHARGER_CONNECTED: u8 = 0x82;
pub const CHARGER_DISCONNECTED: u8 = 0x83;
pub const VIBRATION_RECEIVED: u8 = 0x94;
pub const POSITION_UPLOAD_INTERVAL: u8 = 0x98;
pub const SOS_ALARM: u8 = 0x99;

struct Kind {
    proto: u8,
    name: &'static str,
    respond: Respond,
}

const KINDS: &[Kind] = &[
    Kind { proto: LOGIN, name: "LOGIN", respond: Respond::Inline },
    Kind { proto: SUPERVISION, name: "SUPERVISION", respond: Respond::None },
    Kind { proto: HEARTBEAT, name: "HEARTBEAT", respond: Respond::Inline },
    Kind { proto: GPS_POSITIONING, name: "GPS_POSITIONING", respond: Respond::Inline },
    Kind { proto: GPS_OFFLINE_POSITIONING, name: "GPS_OFFLINE_POSITIONING", respond: Respond::Inline },
    Kind { proto: STATUS, name: "STATUS", respond: Respond::External },
    Kind { proto: HIBERNATION, name: "HIBERNATION", respond: Respond::None },
    Kind { proto: RESET, name: "RESET", respond: Respond::None },
    Kind { proto: WHITELIST_TOTAL, name: "WHITELIST_TOTAL", respond: Respond::None },
    Kind { proto: WIFI_OFFLINE_POSITIONING, name: "WIFI_OFFLINE_POSITIONING", respond: Respond::Inline },
    Kind { proto: TIME, name: "TIME", respond: Respond::Inline },
    Kind { proto: PROHIBIT_LBS, name: "PROHIBIT_LBS", respond: Respond::None },
    Kind { proto: MOM_PHONE, name: "MOM_PHONE", respond: Respond::None },
    Kind { proto: STOP_UPLOAD, name: "STOP_UPLOAD", respond: Respond::None },
    Kind { proto: STOP_ALARM, name: "STOP_ALARM", respond: Respond::None },
    Kind { proto: SETUP, name: "SETUP", respond: Respond::External },
    Kind { proto: SYNCHRONOUS_WHITELIST, name: "SYNCHRONOUS_WHITELIST", respond: Respond::None },
    Kind { proto: RESTORE_PASSWORD, name: "RESTORE_PASSWORD", respond: Respond::None },
    Kind { proto: WIFI_POSITIONING, name: "WIFI_POSITIONING", respond: Respond::External },
    Kind { proto: MANUAL_POSITIONING, name: "MANUAL_POSITIONING", respond: Respond::None },
    Kind { proto: BATTERY_CHARGE, name: "BATTERY_CHARGE", respond: Respond::None },
    Kind { proto: CHARGER_CONNECTED, name: "CHARGER_CONNECTED", respond: Respond::None },
    Kind { proto: CHARGER_DISCONNECTED, name: "CHARGER_DISCONNECTED", respond: Respond::None },
    Kind { proto: VIBRATION_RECEIVED, name: "VIBRATION_RECEIVED", respond: Respond::None },
    Kind { proto: POSITION_UPLOAD_INTERVAL, name: "POSITION_UPLOAD_INTERVAL", respond: Respond::External },
    Kind { proto: SOS_ALARM, name: "SOS_ALARM", respond: Respond::None },
];

fn kind_of(proto: u8) -> Option<&'static Kind> {
    KINDS.iter().find(|k| k.proto == proto)
}

pub fn kind_name(proto: u8) -> &'static str {
    kind_of(proto).map_or("UNKNOWN", |k| k.name)
}

/// A decoded GPS fix.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub dtime: [u8; 6],
    pub devtime: Option<DateTime<Utc>>,
    pub gps_data_length: u8,
    pub nb_sat: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: u8,
    pub heading: u16,
    pub valid: bool,
}

/// Decoded cell/Wi-Fi observations from the Wi-Fi positioning kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct WifiObs {
    pub dtime: [u8; 6],
    pub devtime: Option<DateTime<Utc>>,
    pub wifi_aps: Vec<WifiAp>,
    pub mcc: u16,
    pub mnc: u8,
    pub gsm_cells: Vec<GsmCell>,
}

/// Decoded terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    pub batt: u8,
    pub ver: u8,
    pub timezone: u8,
    pub intvl: u8,
    pub signal: Option<u8>,
}

/// One message of the binary protocol, decoded as far as the kind
/// allows. Anything undecodable lands in `Unknown` with the raw
/// bytes kept.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Login { imei: String, ver: u8 },
    GpsPositioning { proto: u8, fix: GpsFix },
    WifiPositioning { proto: u8, obs: WifiObs },
    Status(StatusInfo),
    PositionUploadInterval { interval: u16 },
    /// A kind we know but carry no decoded fields for.
    Plain { proto: u8 },
    Unknown { proto: u16, payload: Vec<u8> },
}

impl Msg {
    pub fn respond(&self) -> Respond {
        match self.proto_byte().and_then(kind_of) {
            Some(kind) => kind.respond,
            None => Respond::None,
        }
    }

    fn proto_byte(&self) -> Option<u8> {
        match self {
            Msg::Login { .. } => Some(LOGIN),
            Msg::GpsPositioning { proto, .. } | Msg::WifiPositioning { proto, .. } => Some(*proto),
            Msg::Status(_) => Some(STATUS),
            Msg::PositionUploadInterval { .. } => Some(POSITION_UPLOAD_INTERVAL),
            Msg::Plain { proto } => Some(*proto),
            Msg::Unknown { .. } => None,
        }
    }

    /// Protocol-agnostic report, for the kinds that carry one.
    pub fn rectified(&self) -> Option<Report> {
        match self {
            Msg::GpsPositioning { fix, .. } if fix.valid => Some(Report::Coord(CoordReport {
                devtime: devtime_string(fix.devtime),
                battery_percentage: None,
                accuracy: None,
                altitude: None,
                speed: Some(f64::from(fix.speed)),
                direction: Some(f64::from(fix.heading)),
                latitude: fix.latitude,
                longitude: fix.longitude,
            })),
            Msg::WifiPositioning { obs, .. } => Some(Report::Approximate(HintReport {
                devtime: devtime_string(obs.devtime),
                battery_percentage: None,
                mcc: obs.mcc,
                mnc: u16::from(obs.mnc),
                gsm_cells: obs.gsm_cells.clone(),
                wifi_aps: obs.wifi_aps.clone(),
            })),
            Msg::Status(info) => Some(Report::Status(StatusReport {
                battery_percentage: i32::from(info.batt),
            })),
            _ => None,
        }
    }
}

fn devtime_string(devtime: Option<DateTime<Utc>>) -> String {
    match devtime {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S+00:00").to_string(),
        None => String::new(),
    }
}

/// Deframer for the `"xx" .. "\r\n"` stream.
#[derive(Debug, Default)]
pub struct Stream {
    buffer: Vec<u8>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_at(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() || from > haystack.len() - needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
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
            return msgs;
        }
        loop {
            let Some(start) = find_at(&self.buffer, b"xx", 0) else {
                // no marker at all: drop the junk now, keeping a
                // trailing 'x' that may be half of a split marker
                let keep = usize::from(self.buffer.last() == Some(&b'x'));
                let dropped = self.buffer.len().saturating_sub(keep);
                if dropped > 0 {
                    msgs.push(Deframed::Error(format!(
                        "Skipping {dropped} bytes of undecodable data \"{}\"",
                        hex::encode(&self.buffer[..dropped.min(64)])
                    )));
                    self.buffer.drain(..dropped);
                }
                break;
            };
            if start > 0 {
                msgs.push(Deframed::Error(format!(
                    "Skipping {start} bytes of undecodable data \"{}\"",
                    hex::encode(&self.buffer[..start.min(64)])
                )));
                self.buffer.drain(..start);
            }
            if self.buffer.len() < 6 {
                break; // shortest frame is "xx" + length + proto + CRLF
            }
            // Where "\r\n" should be if the length byte counted
            // payload+1. It understates for the Wi-Fi kinds, so search
            // onward from just before that point; never earlier, or a
            // payload byte pair that happens to be CRLF would split
            // the frame.
            let expected_end = self.buffer[2] as usize + 3;
            let search_from = expected_end.saturating_sub(3).max(4);
            let Some(end) = find_at(&self.buffer, b"\r\n", search_from) else {
                break; // incomplete frame, wait for more bytes
            };
            msgs.push(Deframed::Packet(self.buffer[2..end].to_vec()));
            self.buffer.drain(..end + 2);
        }
        msgs
    }

    fn close(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

pub fn probe_buffer(buffer: &[u8]) -> bool {
    find_at(buffer, b"xx", 0).is_some()
}

pub fn enframe(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(b"xx");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn proto_of_message(packet: &[u8]) -> String {
    let name = packet.get(1).map_or("UNKNOWN", |&p| kind_name(p));
    format!("{PROTO_PREFIX}{name}")
}

pub fn is_goodbye_packet(packet: &[u8]) -> bool {
    packet.get(1) == Some(&HIBERNATION)
}

pub fn imei_from_packet(packet: &[u8]) -> Option<String> {
    if packet.get(1) == Some(&LOGIN) && packet.len() >= 10 {
        return Some(hex::encode(&packet[2..10]));
    }
    None
}

/// Decode one deframed packet (`length | proto | payload`). Never
/// fails: undecodable input comes back as `Msg::Unknown`.
pub fn parse_message(packet: &[u8], is_incoming: bool) -> Msg {
    if packet.len() < 2 {
        return Msg::Unknown {
            proto: 0x100, // impossible on the wire
            payload: packet.to_vec(),
        };
    }
    let length = packet[0];
    let proto = packet[1];
    let payload = &packet[2..];
    check_length_convention(length, proto, payload.len());
    if kind_of(proto).is_none() {
        return Msg::Unknown {
            proto: u16::from(proto),
            payload: payload.to_vec(),
        };
    }
    if !is_incoming {
        // Responses carry no terminal-originated data worth decoding.
        return Msg::Plain { proto };
    }
    let decoded = match proto {
        LOGIN => decode_login(payload),
        GPS_POSITIONING | GPS_OFFLINE_POSITIONING => decode_gps(proto, payload),
        WIFI_POSITIONING | WIFI_OFFLINE_POSITIONING => decode_wifi(proto, length, payload),
        STATUS => decode_status(payload),
        POSITION_UPLOAD_INTERVAL => decode_upload_interval(payload),
        _ => Some(Msg::Plain { proto }),
    };
    decoded.unwrap_or_else(|| Msg::Unknown {
        proto: u16::from(proto),
        payload: payload.to_vec(),
    })
}

/// The length byte normally counts payload+4, STATUS counts payload+2,
/// and the Wi-Fi kinds use it as the AP count. The origin of the
/// STATUS special case is undocumented device firmware; both relations
/// are accepted and anything else is warned about and parsed anyway.
fn check_length_convention(length: u8, proto: u8, payload_len: usize) {
    if proto == WIFI_POSITIONING || proto == WIFI_OFFLINE_POSITIONING {
        return;
    }
    let adjust = if proto == STATUS { 2 } else { 4 };
    if length > 1 && payload_len + adjust != length as usize {
        warn!(
            "With proto {} length is {} but payload length is {}+{}",
            proto, length, payload_len, adjust
        );
    }
}

fn decode_login(payload: &[u8]) -> Option<Msg> {
    if payload.len() < 9 {
        return None;
    }
    Some(Msg::Login {
        imei: hex::encode(&payload[..8]),
        ver: *payload.last().unwrap(),
    })
}

fn raw_dtime(payload: &[u8]) -> [u8; 6] {
    let mut dtime = [0u8; 6];
    dtime.copy_from_slice(&payload[..6]);
    dtime
}

fn binary_devtime(dtime: [u8; 6]) -> Option<DateTime<Utc>> {
    if dtime == [0u8; 6] {
        return None;
    }
    Utc.with_ymd_and_hms(
        2000 + i32::from(dtime[0]),
        u32::from(dtime[1]),
        u32::from(dtime[2]),
        u32::from(dtime[3]),
        u32::from(dtime[4]),
        u32::from(dtime[5]),
    )
    .single()
}

fn bcd_devtime(dtime: [u8; 6]) -> Option<DateTime<Utc>> {
    // each byte carries two decimal digits, printed as hex
    let mut fields = [0u32; 6];
    for (field, byte) in fields.iter_mut().zip(dtime) {
        let hi = u32::from(byte >> 4);
        let lo = u32::from(byte & 0x0f);
        if hi > 9 || lo > 9 {
            return None;
        }
        *field = hi * 10 + lo;
    }
    Utc.with_ymd_and_hms(
        2000 + fields[0] as i32,
        fields[1],
        fields[2],
        fields[3],
        fields[4],
        fields[5],
    )
    .single()
}

const COORD_SCALE: f64 = 1.0 / (30000.0 * 60.0);

fn decode_gps(proto: u8, payload: &[u8]) -> Option<Msg> {
    if payload.len() < 18 {
        return None;
    }
    let dtime = raw_dtime(payload);
    let lat = u32::from_be_bytes(payload[7..11].try_into().ok()?);
    let lon = u32::from_be_bytes(payload[11..15].try_into().ok()?);
    let speed = payload[15];
    let flags = u16::from_be_bytes([payload[16], payload[17]]);
    let valid = flags & 0b0001_0000_0000_0000 != 0; // bit 3
    let flip_lon = flags & 0b0000_1000_0000_0000 != 0; // bit 4
    // bit 5 set means latitude positive: inverted polarity vs longitude
    let flip_lat = flags & 0b0000_0100_0000_0000 == 0;
    let heading = flags & 0b0000_0011_1111_1111;
    Some(Msg::GpsPositioning {
        proto,
        fix: GpsFix {
            dtime,
            devtime: binary_devtime(dtime),
            gps_data_length: payload[6] >> 4,
            nb_sat: payload[6] & 0x0f,
            latitude: f64::from(lat) * COORD_SCALE * if flip_lat { -1.0 } else { 1.0 },
            longitude: f64::from(lon) * COORD_SCALE * if flip_lon { -1.0 } else { 1.0 },
            speed,
            heading,
            valid,
        },
    })
}

fn decode_wifi(proto: u8, length: u8, payload: &[u8]) -> Option<Msg> {
    // here the length byte is the number of access point records
    let naps = length as usize;
    if payload.len() < 6 + naps * 7 + 4 {
        return None;
    }
    let dtime = raw_dtime(payload);
    let mut wifi_aps = Vec::with_capacity(naps);
    for chunk in payload[6..6 + naps * 7].chunks_exact(7) {
        let mac = chunk[..6]
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        wifi_aps.push(WifiAp {
            ssid: None,
            mac,
            rssi: -i32::from(chunk[6]),
        });
    }
    let gsm = &payload[6 + naps * 7..];
    let ncells = gsm[0] as usize;
    let mcc = u16::from_be_bytes([gsm[1], gsm[2]]);
    let mnc = gsm[3];
    if gsm.len() < 4 + ncells * 5 {
        return None;
    }
    let mut gsm_cells = Vec::with_capacity(ncells);
    for chunk in gsm[4..4 + ncells * 5].chunks_exact(5) {
        gsm_cells.push(GsmCell {
            area: u16::from_be_bytes([chunk[0], chunk[1]]),
            cell: u16::from_be_bytes([chunk[2], chunk[3]]),
            rssi: -i32::from(chunk[4]),
        });
    }
    Some(Msg::WifiPositioning {
        proto,
        obs: WifiObs {
            dtime,
            devtime: bcd_devtime(dtime),
            wifi_aps,
            mcc,
            mnc,
            gsm_cells,
        },
    })
}

fn decode_status(payload: &[u8]) -> Option<Msg> {
    match payload.len() {
        5 => Some(Msg::Status(StatusInfo {
            batt: payload[0],
            ver: payload[1],
            timezone: payload[2],
            intvl: payload[3],
            signal: Some(payload[4]),
        })),
        4 => Some(Msg::Status(StatusInfo {
            batt: payload[0],
            ver: payload[1],
            timezone: payload[2],
            intvl: payload[3],
            signal: None,
        })),
        _ => None,
    }
}

fn decode_upload_interval(payload: &[u8]) -> Option<Msg> {
    if payload.len() < 2 {
        return None;
    }
    Some(Msg::PositionUploadInterval {
        interval: u16::from_be_bytes([payload[0], payload[1]]),
    })
}

/// Build an outgoing packet in the terminal's acknowledgement shape:
/// the length byte counts proto + payload + the trailing serial and a
/// checksum the wire never carries, and the serial is the fixed
/// `00 01`.
fn make_packet(proto: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push((payload.len() + 5) as u8);
    out.push(proto);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0x00, 0x01]);
    out
}

/// TIME is its own thing: length is the payload size (7) and no
/// serial trails it.
fn time_response(now: DateTime<Utc>) -> Vec<u8> {
    use chrono::Datelike;
    let mut out = Vec::with_capacity(9);
    out.push(7);
    out.push(TIME);
    out.extend_from_slice(&(now.year() as u16).to_be_bytes());
    out.push(now.month() as u8);
    out.push(now.day() as u8);
    out.push(now.hour() as u8);
    out.push(now.minute() as u8);
    out.push(now.second() as u8);
    out
}

/// Reply computable from the request alone, or None when the reply
/// needs external data (or no reply is expected).
pub fn inline_response(packet: &[u8]) -> Option<Vec<u8>> {
    let proto = *packet.get(1)?;
    match proto {
        LOGIN => Some(make_packet(LOGIN, b"")),
        HEARTBEAT => Some(make_packet(HEARTBEAT, b"")),
        GPS_POSITIONING | GPS_OFFLINE_POSITIONING | WIFI_OFFLINE_POSITIONING => {
            if packet.len() < 8 {
                return None;
            }
            Some(make_packet(proto, &packet[2..8]))
        }
        TIME => Some(time_response(Utc::now())),
        _ => None,
    }
}

/// Position reply for a hint message the rectifier resolved.
pub fn hint_response(packet: &[u8], lat: f64, lon: f64) -> Option<Vec<u8>> {
    if packet.get(1) == Some(&WIFI_POSITIONING) {
        return Some(wifi_positioning_response(lat, lon));
    }
    None
}

pub fn wifi_positioning_response(lat: f64, lon: f64) -> Vec<u8> {
    let payload = format!("{},{}", fmt_coord(lat), fmt_coord(lon));
    make_packet(WIFI_POSITIONING, payload.as_bytes())
}

/// Sign plus eight significant digits, zero-padded to a minimum of
/// ten characters, the way the terminal firmware expects coordinates.
fn fmt_coord(value: f64) -> String {
    let magnitude = value.abs();
    let int_digits = if magnitude < 1.0 {
        0
    } else {
        magnitude.log10().floor() as i32 + 1
    };
    let decimals = (8 - int_digits.max(1)).max(0) as usize
        + usize::from(int_digits == 0);
    let body = format!("{:+.decimals$}", value, decimals = decimals);
    if body.len() >= 10 {
        body
    } else {
        let (sign, digits) = body.split_at(1);
        format!("{sign}{digits:0>9}")
    }
}

pub fn status_response(upload_interval_minutes: u8) -> Vec<u8> {
    make_packet(STATUS, &[upload_interval_minutes])
}

pub fn upload_interval_response(interval: u16) -> Vec<u8> {
    make_packet(POSITION_UPLOAD_INTERVAL, &interval.to_be_bytes())
}

/// Everything SETUP can configure, with firmware defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupArgs {
    pub upload_interval_seconds: u16,
    pub binary_switch: u8,
    pub alarms: [u32; 3],
    pub dnd_time_switch: u8,
    pub dnd_times: [u32; 3],
    pub gps_time_switch: u8,
    pub gps_time_start: u16,
    pub gps_time_stop: u16,
    pub phone_numbers: [String; 3],
}

impl Default for SetupArgs {
    fn default() -> Self {
        Self {
            upload_interval_seconds: 0x0300,
            binary_switch: 0b0011_0001,
            alarms: [0; 3],
            dnd_time_switch: 0,
            dnd_times: [0; 3],
            gps_time_switch: 0,
            gps_time_start: 0,
            gps_time_stop: 0,
            phone_numbers: [String::new(), String::new(), String::new()],
        }
    }
}

impl SetupArgs {
    /// Apply the recognized option names of a terminal-config section.
    pub fn from_conf(conf: &TermSection) -> Self {
        fn int3(conf: &TermSection, key: &str) -> Option<[u32; 3]> {
            let list = conf.get(key)?.as_int_list()?;
            if list.len() != 3 {
                return None;
            }
            Some([list[0] as u32, list[1] as u32, list[2] as u32])
        }
        let mut args = SetupArgs::default();
        if let Some(v) = conf.get("uploadintervalseconds").and_then(|v| v.as_int()) {
            args.upload_interval_seconds = v as u16;
        }
        if let Some(v) = conf.get("binaryswitch").and_then(|v| v.as_int()) {
            args.binary_switch = v as u8;
        }
        if let Some(v) = int3(conf, "alarms") {
            args.alarms = v;
        }
        if let Some(v) = conf.get("dndtimeswitch").and_then(|v| v.as_int()) {
            args.dnd_time_switch = v as u8;
        }
        if let Some(v) = int3(conf, "dndtimes") {
            args.dnd_times = v;
        }
        if let Some(v) = conf.get("gpstimeswitch").and_then(|v| v.as_int()) {
            args.gps_time_switch = v as u8;
        }
        if let Some(v) = conf.get("gpstimestart").and_then(|v| v.as_int()) {
            args.gps_time_start = v as u16;
        }
        if let Some(v) = conf.get("gpstimestop").and_then(|v| v.as_int()) {
            args.gps_time_stop = v as u16;
        }
        if let Some(list) = conf.get("phonenumbers").and_then(|v| v.as_str_list()) {
            if list.len() == 3 {
                args.phone_numbers =
                    [list[0].clone(), list[1].clone(), list[2].clone()];
            }
        }
        args
    }

    fn encode(&self) -> Vec<u8> {
        fn pack3b(out: &mut Vec<u8>, value: u32) {
            out.extend_from_slice(&value.to_be_bytes()[1..]);
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.upload_interval_seconds.to_be_bytes());
        payload.push(self.binary_switch);
        for alarm in self.alarms {
            pack3b(&mut payload, alarm);
        }
        payload.push(self.dnd_time_switch);
        for dnd in self.dnd_times {
            pack3b(&mut payload, dnd);
        }
        payload.push(self.gps_time_switch);
        payload.extend_from_slice(&self.gps_time_start.to_be_bytes());
        payload.extend_from_slice(&self.gps_time_stop.to_be_bytes());
        payload.extend_from_slice(
            self.phone_numbers
                .iter()
                .map(String::as_bytes)
                .collect::<Vec<_>>()
                .join(&b";"[..])
                .as_slice(),
        );
        payload
    }
}

pub fn setup_response(args: &SetupArgs) -> Vec<u8> {
    make_packet(SETUP, &args.encode())
}

/// Command kinds the operator surface can construct.
const COMMANDS: &[&str] = &[
    "MANUAL_POSITIONING",
    "POSITION_UPLOAD_INTERVAL",
    "PROHIBIT_LBS",
    "RESET",
    "SETUP",
    "STATUS",
    "STOP_UPLOAD",
    "SUPERVISION",
    "TIME",
    "WHITELIST_TOTAL",
    "WIFI_POSITIONING",
];

fn parse_intx(value: &str) -> Result<i64, CommandError> {
    let value = value.trim();
    let parsed = if let Some(hexpart) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        i64::from_str_radix(hexpart, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| CommandError::BadValue(format!("not an integer: {value:?}")))
}

fn kwarg_int(kwargs: &HashMap<String, String>, key: &str, dflt: i64) -> Result<i64, CommandError> {
    match kwargs.get(key) {
        Some(value) => parse_intx(value),
        None => Ok(dflt),
    }
}

/// Resolve a command name (optionally `ZX:`-prefixed, case-insensitive
/// unique prefix) and build the outgoing packet from `key=value`
/// parameters.
pub fn command_packet(
    cmd: &str,
    kwargs: &HashMap<String, String>,
) -> Result<Vec<u8>, CommandError> {
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
    match name {
        "RESET" => Ok(make_packet(RESET, b"")),
        "STOP_UPLOAD" => Ok(make_packet(STOP_UPLOAD, b"")),
        "MANUAL_POSITIONING" => Ok(make_packet(MANUAL_POSITIONING, b"")),
        "TIME" => Ok(time_response(Utc::now())),
        "SUPERVISION" => Ok(make_packet(
            SUPERVISION,
            &[kwarg_int(kwargs, "status", 0)? as u8],
        )),
        "WHITELIST_TOTAL" => Ok(make_packet(
            WHITELIST_TOTAL,
            &[kwarg_int(kwargs, "number", 3)? as u8],
        )),
        "PROHIBIT_LBS" => Ok(make_packet(
            PROHIBIT_LBS,
            &[kwarg_int(kwargs, "status", 1)? as u8],
        )),
        "STATUS" => Ok(status_response(kwarg_int(kwargs, "upload_interval", 25)? as u8)),
        "POSITION_UPLOAD_INTERVAL" => Ok(upload_interval_response(
            kwarg_int(kwargs, "interval", 0x0300)? as u16,
        )),
        "WIFI_POSITIONING" => {
            let lat = kwargs
                .get("latitude")
                .map(|v| v.parse::<f64>())
                .transpose()
                .map_err(|e| CommandError::BadValue(format!("latitude: {e}")))?;
            let lon = kwargs
                .get("longitude")
                .map(|v| v.parse::<f64>())
                .transpose()
                .map_err(|e| CommandError::BadValue(format!("longitude: {e}")))?;
            match (lat, lon) {
                (Some(lat), Some(lon)) => Ok(wifi_positioning_response(lat, lon)),
                _ => Ok(make_packet(WIFI_POSITIONING, b"")),
            }
        }
        "SETUP" => {
            let mut args = SetupArgs::default();
            if let Some(v) = kwargs.get("uploadintervalseconds") {
                args.upload_interval_seconds = parse_intx(v)? as u16;
            }
            if let Some(v) = kwargs.get("binaryswitch") {
                args.binary_switch = parse_intx(v)? as u8;
            }
            if let Some(v) = kwargs.get("alarms") {
                args.alarms = parse_int3(v)?;
            }
            if let Some(v) = kwargs.get("dndtimeswitch") {
                args.dnd_time_switch = parse_intx(v)? as u8;
            }
            if let Some(v) = kwargs.get("dndtimes") {
                args.dnd_times = parse_int3(v)?;
            }
            if let Some(v) = kwargs.get("gpstimeswitch") {
                args.gps_time_switch = parse_intx(v)? as u8;
            }
            if let Some(v) = kwargs.get("gpstimestart") {
                args.gps_time_start = parse_intx(v)? as u16;
            }
            if let Some(v) = kwargs.get("gpstimestop") {
                args.gps_time_stop = parse_intx(v)? as u16;
            }
            if let Some(v) = kwargs.get("phonenumbers") {
                let parts: Vec<&str> = v.split(',').collect();
                if parts.len() != 3 {
                    return Err(CommandError::BadValue(
                        "phonenumbers needs exactly three comma-separated values".to_string(),
                    ));
                }
                args.phone_numbers =
                    [parts[0].to_string(), parts[1].to_string(), parts[2].to_string()];
            }
            Ok(setup_response(&args))
        }
        _ => Err(CommandError::Unknown(cmd.to_string())),
    }
}

fn parse_int3(value: &str) -> Result<[u32; 3], CommandError> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return Err(CommandError::BadValue(format!(
            "expected three comma-separated integers, got {value:?}"
        )));
    }
    Ok([
        parse_intx(parts[0])? as u32,
        parse_intx(parts[1])? as u32,
        parse_intx(parts[2])? as u32,
    ])
}

/// Protocol ids downstream consumers may want, with the flag telling
/// whether an externally computed answer is expected.
pub fn exposed_protos() -> Vec<(String, bool)> {
    [
        GPS_POSITIONING,
        GPS_OFFLINE_POSITIONING,
        WIFI_POSITIONING,
        WIFI_OFFLINE_POSITIONING,
        STATUS,
    ]
    .iter()
    .map(|&proto| {
        let kind = kind_of(proto).expect("exposed kinds are in the table");
        (
            format!("{PROTO_PREFIX}{}", kind.name),
            matches!(kind.respond, Respond::External),
        )
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::{Stream as ZxStream, *};
    use crate::proto::Stream;

    const LOGIN_FRAME: &[u8] = &[
        0x78, 0x78, 0x0d, 0x01, 0x35, 0x90, 0x00, 0x12, 0x34, 0x56, 0x78, 0x90, 0x00, 0x00,
        0x09, 0x85, 0x05, 0x0d, 0x0a,
    ];

    #[test]
    fn deframes_login_and_parses_imei() {
        let mut stream = ZxStream::new();
        let msgs = stream.recv(LOGIN_FRAME);
        assert_eq!(msgs.len(), 1);
        let Deframed::Packet(packet) = &msgs[0] else {
            panic!("expected a packet, got {msgs:?}");
        };
        assert_eq!(packet[0], 0x0d);
        assert_eq!(packet[1], LOGIN);
        assert_eq!(
            imei_from_packet(packet).as_deref(),
            Some("3590001234567890")
        );
        assert_eq!(proto_of_message(packet), "ZX:LOGIN");
        match parse_message(packet, true) {
            Msg::Login { imei, ver } => {
                assert_eq!(imei, "3590001234567890");
                assert_eq!(ver, 0x05);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn login_ack_bytes() {
        let packet = LOGIN_FRAME;
        let resp = inline_response(&packet[2..packet.len() - 2]).unwrap();
        assert_eq!(enframe(&resp), &[0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0x0d, 0x0a]);
    }

    #[test]
    fn time_response_shape() {
        let resp = inline_response(&[0x01, TIME]).unwrap();
        assert_eq!(resp.len(), 9);
        assert_eq!(resp[0], 7);
        assert_eq!(resp[1], TIME);
        let year = u16::from_be_bytes([resp[2], resp[3]]);
        assert!((2024..2100).contains(&year));
        assert!((1..=12).contains(&resp[4]));
        let framed = enframe(&resp);
        assert_eq!(&framed[..2], b"xx");
        assert_eq!(&framed[framed.len() - 2..], b"\r\n");
    }

    #[test]
    fn gps_ack_echoes_device_timestamp() {
        // 22-03-04 05:06:07, invalid fix, zero coordinates
        let mut packet = vec![0x15, GPS_POSITIONING, 22, 3, 4, 5, 6, 7, 0x76];
        packet.extend_from_slice(&[0; 11]);
        let resp = inline_response(&packet).unwrap();
        assert_eq!(resp[1], GPS_POSITIONING);
        assert_eq!(&resp[2..8], &[22, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn gps_coordinate_flags() {
        let lat = (53.5236_f64 * 30000.0 * 60.0) as u32;
        let lon = (12.7_f64 * 30000.0 * 60.0) as u32;
        let mut payload = vec![23, 5, 17, 10, 31, 0, 0x76];
        payload.extend_from_slice(&lat.to_be_bytes());
        payload.extend_from_slice(&lon.to_be_bytes());
        payload.push(0); // speed
        // valid, bit5 set -> latitude positive, heading 310
        let flags: u16 = 0b0001_0100_0000_0000 | 310;
        payload.extend_from_slice(&flags.to_be_bytes());
        let mut packet = vec![(payload.len() + 4) as u8, GPS_POSITIONING];
        packet.extend_from_slice(&payload);
        match parse_message(&packet, true) {
            Msg::GpsPositioning { fix, .. } => {
                assert!(fix.valid);
                assert!((fix.latitude - 53.5236).abs() < 1e-4);
                assert!((fix.longitude - 12.7).abs() < 1e-4);
                assert_eq!(fix.heading, 310);
                let report = Msg::GpsPositioning { proto: GPS_POSITIONING, fix }.rectified();
                assert!(matches!(report, Some(Report::Coord(_))));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
        // bit 5 clear flips latitude negative
        let flags: u16 = 0b0001_0000_0000_0000;
        let n = packet.len();
        packet[n - 2..].copy_from_slice(&flags.to_be_bytes());
        match parse_message(&packet, true) {
            Msg::GpsPositioning { fix, .. } => assert!(fix.latitude < 0.0),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    fn wifi_positioning_packet() -> Vec<u8> {
        // two APs, three cells, mcc 262 mnc 3
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
        let mut packet = vec![2, WIFI_POSITIONING]; // length = number of APs
        packet.extend_from_slice(&payload);
        packet
    }

    #[test]
    fn wifi_positioning_parses_into_hint() {
        let packet = wifi_positioning_packet();
        let msg = parse_message(&packet, true);
        let Some(Report::Approximate(hint)) = msg.rectified() else {
            panic!("expected a hint report from {msg:?}");
        };
        assert_eq!(hint.mcc, 262);
        assert_eq!(hint.mnc, 3);
        assert_eq!(hint.gsm_cells.len(), 3);
        assert_eq!(hint.gsm_cells[0], GsmCell { area: 24420, cell: 16594, rssi: -71 });
        assert_eq!(hint.wifi_aps.len(), 2);
        assert_eq!(hint.wifi_aps[0].mac, "12:34:56:78:9A:BC");
        assert_eq!(hint.devtime, "2023-05-17 10:31:00+00:00");
        assert_eq!(msg.respond(), Respond::External);
        // inline response must not exist; the rectifier answers this
        assert!(inline_response(&packet).is_none());
    }

    #[test]
    fn wifi_offline_positioning_echo() {
        let mut packet = wifi_positioning_packet();
        packet[1] = WIFI_OFFLINE_POSITIONING;
        let resp = inline_response(&packet).unwrap();
        assert_eq!(&resp[2..8], &packet[2..8]);
    }

    #[test]
    fn coordinate_format_is_sign_plus_eight_significant() {
        assert_eq!(fmt_coord(53.5236), "+53.523600");
        assert_eq!(fmt_coord(12.7), "+12.700000");
        assert_eq!(fmt_coord(-7.3), "-7.3000000");
        assert_eq!(fmt_coord(0.5), "+0.50000000");
        let resp = wifi_positioning_response(53.5236, 12.7);
        assert_eq!(&resp[2..resp.len() - 2], b"+53.523600,+12.700000");
    }

    #[test]
    fn status_both_lengths_accepted() {
        let long = [7u8, STATUS, 90, 2, 1, 25, 4];
        match parse_message(&long, true) {
            Msg::Status(info) => assert_eq!(info.signal, Some(4)),
            other => panic!("unexpected parse: {other:?}"),
        }
        let short = [6u8, STATUS, 90, 2, 1, 25];
        match parse_message(&short, true) {
            Msg::Status(info) => {
                assert_eq!(info.batt, 90);
                assert_eq!(info.signal, None);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_proto_keeps_raw_bytes() {
        let packet = [5u8, 0xEE, 1, 2, 3];
        match parse_message(&packet, true) {
            Msg::Unknown { proto, payload } => {
                assert_eq!(proto, 0xEE);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
        assert_eq!(proto_of_message(&packet), "ZX:UNKNOWN");
    }

    #[test]
    fn deframer_skips_leading_junk() {
        let mut stream = ZxStream::new();
        let mut input = b"garbage".to_vec();
        input.extend_from_slice(LOGIN_FRAME);
        let msgs = stream.recv(&input);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], Deframed::Error(_)));
        assert!(matches!(msgs[1], Deframed::Packet(_)));
    }

    #[test]
    fn deframer_is_partition_independent() {
        let mut wire = Vec::new();
        wire.extend_from_slice(LOGIN_FRAME);
        wire.extend_from_slice(&enframe(&[0x01, TIME]));
        wire.extend_from_slice(&enframe(&wifi_positioning_packet()));

        let mut whole = ZxStream::new();
        let all_at_once: Vec<Vec<u8>> = whole
            .recv(&wire)
            .into_iter()
            .filter_map(|m| match m {
                Deframed::Packet(p) => Some(p),
                Deframed::Error(_) => None,
            })
            .collect();
        assert_eq!(all_at_once.len(), 3);

        for chunk in [1usize, 2, 3, 7] {
            let mut stream = ZxStream::new();
            let mut got = Vec::new();
            for segment in wire.chunks(chunk) {
                for msg in stream.recv(segment) {
                    if let Deframed::Packet(p) = msg {
                        got.push(p);
                    }
                }
            }
            assert_eq!(got, all_at_once, "chunk size {chunk}");
        }
    }

    #[test]
    fn deframer_drops_oversize_buffer_and_recovers() {
        let mut stream = ZxStream::new();
        // a frame start with no end in sight accumulates...
        let mut start = b"xx".to_vec();
        start.extend(std::iter::repeat(0x41u8).take(MAXBUFFER - 2));
        assert!(stream.recv(&start).is_empty());
        // ...until the cap, then everything is dropped
        let msgs = stream.recv(&[0x41u8; 64]);
        assert!(matches!(msgs.as_slice(), [Deframed::Error(_)]));
        // still in business afterwards
        let msgs = stream.recv(LOGIN_FRAME);
        assert!(matches!(msgs.as_slice(), [Deframed::Packet(_)]));
    }

    #[test]
    fn junk_without_marker_is_discarded_immediately() {
        let mut stream = ZxStream::new();
        let msgs = stream.recv(b"AAAAAAAA");
        assert!(matches!(msgs.as_slice(), [Deframed::Error(_)]));
        // a marker split across segments still assembles
        let msgs = stream.recv(b"junkx");
        assert!(matches!(msgs.as_slice(), [Deframed::Error(_)]));
        let msgs = stream.recv(b"x\x01\x30\r\n");
        assert!(
            matches!(msgs.as_slice(), [Deframed::Packet(p)] if p == &[0x01, 0x30]),
            "got {msgs:?}"
        );
    }

    #[test]
    fn setup_response_layout() {
        let packet = setup_response(&SetupArgs::default());
        assert_eq!(packet[1], SETUP);
        let payload = &packet[2..packet.len() - 2];
        assert_eq!(&payload[..2], &0x0300u16.to_be_bytes());
        assert_eq!(payload[2], 0b0011_0001);
        // 3 alarms * 3 + dnd switch + 3 dnd * 3 + gps switch + 2 + 2
        // + "" ; "" ; "" phone numbers
        assert_eq!(payload.len(), 2 + 1 + 9 + 1 + 9 + 1 + 2 + 2 + 2);
    }

    #[test]
    fn command_prefix_resolution() {
        let kwargs = HashMap::new();
        assert!(command_packet("RES", &kwargs).is_ok()); // RESET, unique
        assert!(matches!(
            command_packet("ST", &kwargs),
            Err(CommandError::Ambiguous(_))
        ));
        assert!(command_packet("STATUS", &kwargs).is_ok()); // exact beats prefix
        assert!(matches!(
            command_packet("NOPE", &kwargs),
            Err(CommandError::Unknown(_))
        ));
        let kwargs = HashMap::from([("interval".to_string(), "0x0200".to_string())]);
        let packet = command_packet("POSITION_UP", &kwargs).unwrap();
        assert_eq!(&packet[2..4], &0x0200u16.to_be_bytes());
    }

    #[test]
    fn exposed_protos_flags() {
        let exposed = exposed_protos();
        assert!(exposed.contains(&("ZX:WIFI_POSITIONING".to_string(), true)));
        assert!(exposed.contains(&("ZX:GPS_POSITIONING".to_string(), false)));
        assert!(exposed.contains(&("ZX:STATUS".to_string(), true)));
    }

    #[test]
    fn goodbye_is_hibernation() {
        assert!(is_goodbye_packet(&[0x05, HIBERNATION]));
        assert!(!is_goodbye_packet(&[0x05, HEARTBEAT]));
    }
}
