//! Internal bus envelopes
//!
//! Fixed-layout messages exchanged between the components. The layout
//! is byte-exact with the original deployment so that topic filtering
//! works as a plain prefix match on the serialized form: a `Bcast`
//! starts with `is_incoming | proto | imei`, which is exactly what
//! [`topic`] builds, and a `Rept` starts with the IMEI that [`rtopic`]
//! builds.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{LocSrvError, Result};

/// The sixteen ASCII zeros standing for "IMEI unknown".
const NO_IMEI: &[u8; 16] = b"0000000000000000";

/// Wall-clock seconds since the epoch, as carried in envelopes.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn pack_fixed16(value: Option<&str>, dflt: &[u8; 16]) -> [u8; 16] {
    let mut out = *dflt;
    if let Some(value) = value {
        out = [0u8; 16];
        let bytes = value.as_bytes();
        let n = bytes.len().min(16);
        out[..n].copy_from_slice(&bytes[..n]);
    }
    out
}

fn unpack_imei(field: &[u8]) -> Option<String> {
    if field == NO_IMEI {
        return None;
    }
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Some(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// 18 bytes: IPv6(-mapped) address + big-endian port.
fn pack_peer(peeraddr: Option<SocketAddr>) -> [u8; 18] {
    let mut out = [0u8; 18];
    if let Some(addr) = peeraddr {
        let v6 = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        out[..16].copy_from_slice(&v6.octets());
        out[16..].copy_from_slice(&addr.port().to_be_bytes());
    }
    out
}

fn unpack_peer(buf: &[u8]) -> Option<SocketAddr> {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[..16]);
    let v6 = Ipv6Addr::from(octets);
    let port = u16::from_be_bytes([buf[16], buf[17]]);
    if v6 == Ipv6Addr::UNSPECIFIED && port == 0 {
        return None;
    }
    match v6.to_ipv4_mapped() {
        Some(v4) => Some(SocketAddr::new(IpAddr::V4(v4), port)),
        None => Some(SocketAddr::new(IpAddr::V6(v6), port)),
    }
}

/// Subscription topic for a protocol id on a raw-event channel.
pub fn topic(proto: &str, is_incoming: bool, imei: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(33);
    out.push(u8::from(is_incoming));
    out.extend_from_slice(&pack_fixed16(Some(proto), NO_IMEI));
    if let Some(imei) = imei {
        out.extend_from_slice(&pack_fixed16(Some(imei), NO_IMEI));
    }
    out
}

/// Subscription topic for an IMEI on the rectified-report channel.
pub fn rtopic(imei: &str) -> Vec<u8> {
    pack_fixed16(Some(imei), NO_IMEI).to_vec()
}

/// Broadcast of a raw packet that went over a device socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Bcast {
    pub is_incoming: bool,
    pub proto: String,
    pub imei: Option<String>,
    pub when: f64,
    pub peeraddr: Option<SocketAddr>,
    pub packet: Vec<u8>,
}

impl Bcast {
    pub fn packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(59 + self.packet.len());
        out.push(u8::from(self.is_incoming));
        out.extend_from_slice(&pack_fixed16(Some(self.proto.as_str()), NO_IMEI));
        out.extend_from_slice(&pack_fixed16(self.imei.as_deref(), NO_IMEI));
        out.extend_from_slice(&self.when.to_be_bytes());
        out.extend_from_slice(&pack_peer(self.peeraddr));
        out.extend_from_slice(&self.packet);
        out
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < 59 {
            return Err(LocSrvError::bus(format!(
                "Bcast too short: {} bytes",
                buffer.len()
            )));
        }
        let proto_end = buffer[1..17].iter().position(|&b| b == 0).unwrap_or(16);
        let mut when = [0u8; 8];
        when.copy_from_slice(&buffer[33..41]);
        Ok(Bcast {
            is_incoming: buffer[0] != 0,
            proto: String::from_utf8_lossy(&buffer[1..1 + proto_end]).into_owned(),
            imei: unpack_imei(&buffer[17..33]),
            when: f64::from_be_bytes(when),
            peeraddr: unpack_peer(&buffer[41..59]),
            packet: buffer[59..].to_vec(),
        })
    }
}

/// Response to be framed and sent to the terminal with the given IMEI.
/// `when` is the time of the event the response answers, not the time
/// of sending.
#[derive(Debug, Clone, PartialEq)]
pub struct Resp {
    pub imei: Option<String>,
    pub when: f64,
    pub packet: Vec<u8>,
}

impl Resp {
    pub fn packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.packet.len());
        out.extend_from_slice(&pack_fixed16(self.imei.as_deref(), NO_IMEI));
        out.extend_from_slice(&self.when.to_be_bytes());
        out.extend_from_slice(&self.packet);
        out
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < 24 {
            return Err(LocSrvError::bus(format!(
                "Resp too short: {} bytes",
                buffer.len()
            )));
        }
        let mut when = [0u8; 8];
        when.copy_from_slice(&buffer[16..24]);
        Ok(Resp {
            imei: unpack_imei(&buffer[..16]),
            when: f64::from_be_bytes(when),
            packet: buffer[24..].to_vec(),
        })
    }
}

/// Rectified, protocol-agnostic report: IMEI plus a JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Rept {
    pub imei: Option<String>,
    pub payload: String,
}

impl Rept {
    pub fn packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        out.extend_from_slice(&pack_fixed16(self.imei.as_deref(), NO_IMEI));
        out.extend_from_slice(self.payload.as_bytes());
        out
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < 16 {
            return Err(LocSrvError::bus(format!(
                "Rept too short: {} bytes",
                buffer.len()
            )));
        }
        Ok(Rept {
            imei: unpack_imei(&buffer[..16]),
            payload: String::from_utf8_lossy(&buffer[16..]).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcast_roundtrip() {
        let msg = Bcast {
            is_incoming: true,
            proto: "ZX:LOGIN".to_string(),
            imei: Some("3590001234567890".to_string()),
            when: 1700000000.25,
            peeraddr: Some("192.0.2.7:40123".parse().unwrap()),
            packet: vec![0x0d, 0x01, 0x35, 0x90],
        };
        let decoded = Bcast::decode(&msg.packed()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn bcast_without_imei_or_peer() {
        let msg = Bcast {
            is_incoming: false,
            proto: "UNKNOWN".to_string(),
            imei: None,
            when: 0.0,
            peeraddr: None,
            packet: b"junk".to_vec(),
        };
        let packed = msg.packed();
        assert_eq!(&packed[17..33], b"0000000000000000");
        let decoded = Bcast::decode(&packed).unwrap();
        assert_eq!(decoded.imei, None);
        assert_eq!(decoded.peeraddr, None);
    }

    #[test]
    fn topic_is_a_bcast_prefix() {
        let msg = Bcast {
            is_incoming: true,
            proto: "ZX:WIFI_POSITIONING".to_string(),
            imei: Some("3590001234567890".to_string()),
            when: 1.5,
            peeraddr: None,
            packet: vec![],
        };
        let packed = msg.packed();
        // proto longer than 16 chars is truncated the same way on both
        // sides, so the filter still matches
        let t = topic("ZX:WIFI_POSITIONING", true, None);
        assert!(packed.starts_with(&t));
        let t = topic("ZX:WIFI_POSITIONING", true, Some("3590001234567890"));
        assert!(packed.starts_with(&t));
        let t = topic("ZX:STATUS", true, None);
        assert!(!packed.starts_with(&t));
    }

    #[test]
    fn resp_and_rept_roundtrip() {
        let resp = Resp {
            imei: Some("0123456789".to_string()),
            when: 1700000001.0,
            packet: vec![1, 2, 3],
        };
        assert_eq!(Resp::decode(&resp.packed()).unwrap(), resp);

        let rept = Rept {
            imei: Some("0123456789".to_string()),
            payload: r#"{"type":"status","battery_percentage":90}"#.to_string(),
        };
        let packed = rept.packed();
        assert!(packed.starts_with(&rtopic("0123456789")));
        assert_eq!(Rept::decode(&packed).unwrap(), rept);
    }

    #[test]
    fn ipv4_peer_is_v6_mapped() {
        let packed = pack_peer(Some("10.1.2.3:4303".parse().unwrap()));
        assert_eq!(&packed[10..12], &[0xff, 0xff]);
        let back = unpack_peer(&packed).unwrap();
        assert_eq!(back, "10.1.2.3:4303".parse().unwrap());
    }
}
