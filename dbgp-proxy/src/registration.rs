// Copyright (C) 2024  dbgp-proxy contributors
//
// This file is part of dbgp-proxy.
//
// dbgp-proxy is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The IDE control channel: `proxyinit` / `proxystop` / anything else.
//!
//! IDEs are not required to frame their command line per §4.1, so this
//! reads one chunk rather than running the full codec on the inbound side;
//! replies are framed normally.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;

use ii_logging::macros::*;

use crate::framing::DbgpCodec;
use crate::metrics::Metrics;
use crate::registry::{IdeEndpoint, Registry, RegistryEntry};

pub const E_NO_ERROR: u32 = 0;
pub const E_PARSE_ERROR: u32 = 1;
pub const E_INVALID_OPTIONS: u32 = 3;
pub const E_UNIMPLEMENTED_COMMAND: u32 = 4;

/// One pass over `-p`/`-k`/`-m`. The option grammar is three flags with
/// mandatory arguments, not worth a full getopt crate for.
#[derive(Debug, Default)]
struct Options {
    port: Option<u16>,
    idekey: Option<String>,
    multi: Option<String>,
}

fn parse_options(rest: &str) -> Options {
    let mut opts = Options::default();
    let mut tokens = rest.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-p" => opts.port = tokens.next().and_then(|v| v.parse().ok()),
            "-k" => opts.idekey = tokens.next().map(str::to_string),
            "-m" => opts.multi = tokens.next().map(str::to_string),
            _ => {}
        }
    }
    opts
}

#[derive(Debug)]
enum Command {
    ProxyInit(Options),
    ProxyStop(Options),
    Unknown(String),
    Unparsable,
}

fn parse_command(line: &str) -> Command {
    let trimmed = line.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if trimmed.is_empty() {
        return Command::Unparsable;
    }
    let (cmd, rest) = match trimmed.split_once(' ') {
        Some((cmd, rest)) => (cmd, rest),
        None => (trimmed, ""),
    };
    match cmd {
        "proxyinit" => Command::ProxyInit(parse_options(rest)),
        "proxystop" => Command::ProxyStop(parse_options(rest)),
        other => Command::Unknown(other.to_string()),
    }
}

fn xml_declaration() -> &'static str {
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"
}

fn proxyinit_success(idekey: &str, address: &str, port: u16) -> String {
    format!(
        "{}<proxyinit success=\"1\" idekey=\"{idekey}\" address=\"{address}\" port=\"{port}\"/>",
        xml_declaration()
    )
}

fn proxystop_success(idekey: &str) -> String {
    format!(
        "{}<proxystop success=\"1\" idekey=\"{idekey}\"/>",
        xml_declaration()
    )
}

fn command_error(cmd: &str, code: u32, message: &str) -> String {
    format!(
        "{}<{cmd} success=\"0\"><error id=\"{code}\"><message>{message}</message></error></{cmd}>",
        xml_declaration()
    )
}

/// Handle one IDE control connection end to end: read a command, reply,
/// close. `engine_addr` is the proxy's engine-side listen address, echoed
/// in a successful `proxyinit` reply's `address`/`port` attributes (not
/// anything the IDE supplied).
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Registry,
    metrics: Arc<Metrics>,
    engine_addr: SocketAddr,
) {
    let mut buf = vec![0u8; 1024];
    let n = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => {
            debug!("registration read error from {}: {}", peer, e);
            return;
        }
    };

    let reply = if n == 0 {
        command_error("proxyerror", E_PARSE_ERROR, "Empty command.")
    } else {
        let line = String::from_utf8_lossy(&buf[..n]).into_owned();
        match parse_command(&line) {
            Command::ProxyInit(opts) => {
                let reply = handle_proxyinit(opts, peer, &registry, engine_addr);
                if reply.contains("success=\"1\"") {
                    metrics.inc_registrations_succeeded();
                } else {
                    metrics.inc_registrations_failed();
                }
                reply
            }
            Command::ProxyStop(opts) => handle_proxystop(opts, &registry),
            Command::Unknown(cmd) => {
                metrics.inc_registrations_failed();
                command_error(
                    "proxyerror",
                    E_UNIMPLEMENTED_COMMAND,
                    &format!("Unknown command [{cmd}]"),
                )
            }
            Command::Unparsable => {
                metrics.inc_registrations_failed();
                command_error("proxyerror", E_PARSE_ERROR, "Could not parse command.")
            }
        }
    };

    write_reply(&mut stream, &reply).await;
}

fn handle_proxyinit(
    opts: Options,
    peer: SocketAddr,
    registry: &Registry,
    engine_addr: SocketAddr,
) -> String {
    let idekey = match opts.idekey {
        Some(k) => k,
        None => {
            return command_error(
                "proxyinit",
                E_INVALID_OPTIONS,
                "No IDE key defined for proxy.",
            )
        }
    };
    let port = match opts.port {
        Some(p) => p,
        None => {
            return command_error("proxyinit", E_INVALID_OPTIONS, "No port defined for IDE.")
        }
    };

    let entry = RegistryEntry {
        ide: IdeEndpoint {
            host: peer.ip(),
            port,
        },
        multi: opts.multi,
    };

    if registry.insert_if_absent(idekey.clone(), entry) {
        proxyinit_success(&idekey, &engine_addr.ip().to_string(), engine_addr.port())
    } else {
        command_error(
            "proxyinit",
            E_INVALID_OPTIONS,
            "IDE Key already exists.",
        )
    }
}

fn handle_proxystop(opts: Options, registry: &Registry) -> String {
    let idekey = match opts.idekey {
        Some(k) => k,
        None => {
            return command_error(
                "proxystop",
                E_INVALID_OPTIONS,
                "No IDE key defined for proxy.",
            )
        }
    };
    registry.remove(&idekey);
    proxystop_success(&idekey)
}

async fn write_reply(stream: &mut TcpStream, body: &str) {
    let mut codec = DbgpCodec::new();
    let mut out = bytes::BytesMut::new();
    if let Err(e) = Encoder::<&str>::encode(&mut codec, body, &mut out) {
        error!("failed to encode registration reply: {}", e);
        return;
    }
    if let Err(e) = stream.write_all(&out).await {
        debug!("failed to write registration reply: {}", e);
    }
}
