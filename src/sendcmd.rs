//! Operator command line: push a command packet to a terminal
//!
//! `locsrv send <imei> <cmd> [key=value ...]` resolves the command name
//! against the enabled protocol modules by unique case-insensitive
//! prefix and pushes the packet to the collector's pull endpoint. The
//! collector delivers it if the terminal is connected, or drops it
//! with a log line if not.

use std::collections::HashMap;

use tracing::debug;

use crate::bus::{now, PushClient, Resp};
use crate::config::Config;
use crate::error::{LocSrvError, Result};
use crate::proto::{self, CommandError, ProtoModule};

/// Parse `key=value` arguments.
pub fn parse_kwargs(args: &[String]) -> Result<HashMap<String, String>> {
    let mut kwargs = HashMap::new();
    for arg in args {
        let (key, value) = arg.split_once('=').ok_or_else(|| {
            LocSrvError::command(format!("argument {arg:?} is not of the form key=value"))
        })?;
        kwargs.insert(key.to_string(), value.to_string());
    }
    Ok(kwargs)
}

/// Resolve a command against the enabled modules. A `ZX:`/`BS:`
/// prefix pins the module; otherwise the first module that knows the
/// name wins.
pub fn build_command(
    modules: &[&'static dyn ProtoModule],
    cmd: &str,
    kwargs: &HashMap<String, String>,
) -> Result<Vec<u8>> {
    if let Some(module) = modules
        .iter()
        .find(|module| cmd.starts_with(module.proto_prefix()))
    {
        return module
            .command_packet(cmd, kwargs)
            .map_err(|e| LocSrvError::command(e.to_string()));
    }
    let mut last_err = CommandError::Unknown(cmd.to_string());
    for module in modules {
        match module.command_packet(cmd, kwargs) {
            Ok(packet) => return Ok(packet),
            Err(CommandError::Unknown(_)) => {}
            Err(e) => last_err = e,
        }
    }
    Err(LocSrvError::command(last_err.to_string()))
}

pub async fn run(conf: &Config, imei: &str, cmd: &str, args: &[String]) -> Result<()> {
    let modules = proto::enabled_modules(&conf.common.protocols)?;
    let kwargs = parse_kwargs(args)?;
    let packet = build_command(&modules, cmd, &kwargs)?;
    let resp = Resp {
        imei: Some(imei.to_string()),
        when: now(),
        packet,
    };
    debug!("response: {resp:?}");
    let mut zpush = PushClient::new(conf.collector.listenurl.clone());
    zpush.send(resp.packed()).await?;
    Ok(())
}
