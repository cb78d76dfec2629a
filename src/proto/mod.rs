//! Protocol modules and their uniform contract
//!
//! The collector and every downstream consumer speak to the wire
//! protocols exclusively through [`ProtoModule`], so they stay
//! protocol-agnostic. Message kinds are explicit tagged unions
//! (`zx303::Msg`, `beesure::Msg`, [`AnyMsg`]) with per-module match
//! tables; nothing is discovered at runtime.

pub mod beesure;
pub mod report;
pub mod zx303;

use std::collections::HashMap;
use std::fmt;

use self::report::Report;

use crate::error::Result;

/// What kind of answer a message expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Respond {
    /// Incoming only, no response needed.
    None,
    /// Bidirectional, answered by `inline_response`.
    Inline,
    /// Bidirectional, answered by an external responder
    /// (termconfig or rectifier).
    External,
}

/// One deframing step result: a complete packet, or a description of
/// a framing violation encountered on the way.
#[derive(Debug, Clone, PartialEq)]
pub enum Deframed {
    Packet(Vec<u8>),
    Error(String),
}

/// Stateful deframer over one TCP connection.
pub trait Stream: Send {
    /// Absorb a segment, return completed frames in order intermixed
    /// with framing-violation messages.
    fn recv(&mut self, segment: &[u8]) -> Vec<Deframed>;
    /// Return the unparsed remainder and reset.
    fn close(&mut self) -> Vec<u8>;
}

/// Failure modes of the operator command surface.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    Unknown(String),
    Ambiguous(Vec<String>),
    BadValue(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Unknown(cmd) => write!(f, "unknown command {cmd:?}"),
            CommandError::Ambiguous(names) => {
                write!(f, "prefix does not select a single command: {names:?}")
            }
            CommandError::BadValue(why) => write!(f, "bad parameter: {why}"),
        }
    }
}

impl std::error::Error for CommandError {}

/// A message of either protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyMsg {
    Zx303(zx303::Msg),
    Beesure(beesure::Msg),
}

impl AnyMsg {
    pub fn respond(&self) -> Respond {
        match self {
            AnyMsg::Zx303(msg) => msg.respond(),
            AnyMsg::Beesure(msg) => msg.respond(),
        }
    }

    pub fn rectified(&self) -> Option<Report> {
        match self {
            AnyMsg::Zx303(msg) => msg.rectified(),
            AnyMsg::Beesure(msg) => msg.rectified(),
        }
    }
}

/// The uniform surface of a wire-protocol implementation.
pub trait ProtoModule: Send + Sync {
    /// Module name as used in configuration ("zx303", "beesure").
    fn name(&self) -> &'static str;

    /// Topic prefix of this module's protocol ids ("ZX:", "BS:").
    fn proto_prefix(&self) -> &'static str;

    /// Does this byte slice contain a framing signature of this
    /// protocol? Used once per connection to bind it to a module.
    fn probe_buffer(&self, buffer: &[u8]) -> bool;

    /// Fresh deframer for one connection.
    fn stream(&self) -> Box<dyn Stream>;

    /// Add wire framing around an encoded payload.
    fn enframe(&self, payload: &[u8], imei: Option<&str>) -> Result<Vec<u8>>;

    /// Decode a packet; protocol-level garbage comes back as the
    /// module's UNKNOWN kind, never as an error.
    fn parse_message(&self, packet: &[u8], is_incoming: bool) -> AnyMsg;

    /// Reply that is a pure function of the request, unframed.
    fn inline_response(&self, packet: &[u8]) -> Option<Vec<u8>>;

    /// Does this packet announce that the device will drop the socket?
    fn is_goodbye_packet(&self, packet: &[u8]) -> bool;

    /// IMEI carried by a login frame.
    fn imei_from_packet(&self, packet: &[u8]) -> Option<String>;

    /// `"<pmod>:<CMD>"` identifier used as topic prefix.
    fn proto_of_message(&self, packet: &[u8]) -> String;

    /// Does this protocol id belong to this module?
    fn proto_handled(&self, proto: &str) -> bool {
        proto.starts_with(self.proto_prefix())
    }

    /// Protocol ids downstream consumers should subscribe to, and
    /// whether each expects an externally supplied answer.
    fn exposed_protos(&self) -> Vec<(String, bool)>;

    /// Position reply for a hint message the rectifier resolved, or
    /// None when this kind does not take one.
    fn hint_response(&self, packet: &[u8], lat: f64, lon: f64) -> Option<Vec<u8>>;

    /// Build an outgoing packet from an operator command name
    /// (case-insensitive unique prefix) and `key=value` parameters.
    fn command_packet(
        &self,
        cmd: &str,
        kwargs: &HashMap<String, String>,
    ) -> std::result::Result<Vec<u8>, CommandError>;
}

struct Zx303Module;

impl ProtoModule for Zx303Module {
    fn name(&self) -> &'static str {
        "zx303"
    }

    fn proto_prefix(&self) -> &'static str {
        zx303::PROTO_PREFIX
    }

    fn probe_buffer(&self, buffer: &[u8]) -> bool {
        zx303::probe_buffer(buffer)
    }

    fn stream(&self) -> Box<dyn Stream> {
        Box::new(zx303::Stream::new())
    }

    fn enframe(&self, payload: &[u8], _imei: Option<&str>) -> Result<Vec<u8>> {
        Ok(zx303::enframe(payload))
    }

    fn parse_message(&self, packet: &[u8], is_incoming: bool) -> AnyMsg {
        AnyMsg::Zx303(zx303::parse_message(packet, is_incoming))
    }

    fn inline_response(&self, packet: &[u8]) -> Option<Vec<u8>> {
        zx303::inline_response(packet)
    }

    fn is_goodbye_packet(&self, packet: &[u8]) -> bool {
        zx303::is_goodbye_packet(packet)
    }

    fn imei_from_packet(&self, packet: &[u8]) -> Option<String> {
        zx303::imei_from_packet(packet)
    }

    fn proto_of_message(&self, packet: &[u8]) -> String {
        zx303::proto_of_message(packet)
    }

    fn exposed_protos(&self) -> Vec<(String, bool)> {
        zx303::exposed_protos()
    }

    fn hint_response(&self, packet: &[u8], lat: f64, lon: f64) -> Option<Vec<u8>> {
        zx303::hint_response(packet, lat, lon)
    }

    fn command_packet(
        &self,
        cmd: &str,
        kwargs: &HashMap<String, String>,
    ) -> std::result::Result<Vec<u8>, CommandError> {
        zx303::command_packet(cmd, kwargs)
    }
}

struct BeesureModule;

impl ProtoModule for BeesureModule {
    fn name(&self) -> &'static str {
        "beesure"
    }

    fn proto_prefix(&self) -> &'static str {
        beesure::PROTO_PREFIX
    }

    fn probe_buffer(&self, buffer: &[u8]) -> bool {
        beesure::probe_buffer(buffer)
    }

    fn stream(&self) -> Box<dyn Stream> {
        Box::new(beesure::Stream::new())
    }

    fn enframe(&self, payload: &[u8], imei: Option<&str>) -> Result<Vec<u8>> {
        beesure::enframe(payload, imei)
    }

    fn parse_message(&self, packet: &[u8], is_incoming: bool) -> AnyMsg {
        AnyMsg::Beesure(beesure::parse_message(packet, is_incoming))
    }

    fn inline_response(&self, packet: &[u8]) -> Option<Vec<u8>> {
        beesure::inline_response(packet)
    }

    fn is_goodbye_packet(&self, packet: &[u8]) -> bool {
        beesure::is_goodbye_packet(packet)
    }

    fn imei_from_packet(&self, packet: &[u8]) -> Option<String> {
        beesure::imei_from_packet(packet)
    }

    fn proto_of_message(&self, packet: &[u8]) -> String {
        beesure::proto_of_message(packet)
    }

    fn exposed_protos(&self) -> Vec<(String, bool)> {
        beesure::exposed_protos()
    }

    fn hint_response(&self, packet: &[u8], lat: f64, lon: f64) -> Option<Vec<u8>> {
        beesure::hint_response(packet, lat, lon)
    }

    fn command_packet(
        &self,
        cmd: &str,
        kwargs: &HashMap<String, String>,
    ) -> std::result::Result<Vec<u8>, CommandError> {
        beesure::command_packet(cmd, kwargs)
    }
}

static ZX303: Zx303Module = Zx303Module;
static BEESURE: BeesureModule = BeesureModule;

/// Look a module up by its configuration name.
pub fn module_by_name(name: &str) -> Option<&'static dyn ProtoModule> {
    match name {
        "zx303" => Some(&ZX303),
        "beesure" => Some(&BEESURE),
        _ => None,
    }
}

/// Resolve the configured module list, in probe order.
pub fn enabled_modules(names: &[String]) -> Result<Vec<&'static dyn ProtoModule>> {
    names
        .iter()
        .map(|name| {
            module_by_name(name).ok_or_else(|| {
                crate::error::LocSrvError::config(format!("unknown protocol module {name:?}"))
            })
        })
        .collect()
}

/// First module whose framing signature appears in the segment.
pub fn probe(
    modules: &[&'static dyn ProtoModule],
    segment: &[u8],
) -> Option<&'static dyn ProtoModule> {
    modules.iter().copied().find(|m| m.probe_buffer(segment))
}

/// Module owning a `"<pmod>:<CMD>"` identifier.
pub fn module_for_proto(
    modules: &[&'static dyn ProtoModule],
    proto: &str,
) -> Option<&'static dyn ProtoModule> {
    modules.iter().copied().find(|m| m.proto_handled(proto))
}

/// Module recorded under a pmodmap name.
pub fn module_for_pmod(
    modules: &[&'static dyn ProtoModule],
    pmod: &str,
) -> Option<&'static dyn ProtoModule> {
    modules.iter().copied().find(|m| m.name() == pmod)
}

/// All protocol ids the enabled modules expose, with the
/// external-answer flag.
pub fn exposed_protos(modules: &[&'static dyn ProtoModule]) -> Vec<(String, bool)> {
    modules.iter().flat_map(|m| m.exposed_protos()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_configured_names() {
        let names = vec!["zx303".to_string(), "beesure".to_string()];
        let modules = enabled_modules(&names).unwrap();
        assert_eq!(modules.len(), 2);
        assert!(enabled_modules(&["gt06".to_string()]).is_err());
    }

    #[test]
    fn probe_picks_the_right_module() {
        let names = vec!["zx303".to_string(), "beesure".to_string()];
        let modules = enabled_modules(&names).unwrap();
        let zx = probe(&modules, b"xx\x01\x30\r\n").unwrap();
        assert_eq!(zx.name(), "zx303");
        let bs = probe(&modules, b"[SG*0123456789*0002*LK]").unwrap();
        assert_eq!(bs.name(), "beesure");
        assert!(probe(&modules, b"GET / HTTP/1.1").is_none());
    }

    #[test]
    fn proto_handled_by_prefix() {
        let modules = enabled_modules(&["zx303".to_string(), "beesure".to_string()]).unwrap();
        let owner = module_for_proto(&modules, "ZX:WIFI_POSITIONING").unwrap();
        assert_eq!(owner.name(), "zx303");
        let owner = module_for_proto(&modules, "BS:UD").unwrap();
        assert_eq!(owner.name(), "beesure");
        assert!(module_for_proto(&modules, "XY:NOPE").is_none());
    }
}
