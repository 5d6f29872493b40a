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

//! CLI surface and the config derived from it. Argument parsing is an
//! external collaborator to the core per the spec; this module is the only
//! place that knows about `structopt`.

use std::net::SocketAddr;
use std::time::Duration;

use structopt::StructOpt;

use crate::error::Error;

#[derive(Debug, StructOpt)]
#[structopt(name = "dbgp-proxy", about = "DBGp rendezvous proxy")]
pub struct Args {
    /// IDE-side listen address
    #[structopt(long, short = "i", default_value = "127.0.0.1:9001")]
    pub ide: SocketAddr,

    /// Engine-side listen address
    #[structopt(long, short = "d", default_value = "127.0.0.1:9000")]
    pub dbg: SocketAddr,

    /// Log level filter: CRITICAL, ERROR, WARN, INFO, DEBUG, TRACE.
    /// `RUST_LOG`, when set and non-empty, takes precedence.
    #[structopt(long, short = "l", default_value = "INFO")]
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ide_addr: SocketAddr,
    pub engine_addr: SocketAddr,
    pub log_level: ii_logging::Level,
    pub init_packet_timeout: Duration,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, Error> {
        let log_level = ii_logging::parse_level(&args.log_level)
            .ok_or_else(|| Error::Config(format!("unknown log level {:?}", args.log_level)))?;

        Ok(Self {
            ide_addr: args.ide,
            engine_addr: args.dbg,
            log_level,
            init_packet_timeout: Duration::from_secs(30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_log_level() {
        let args = Args {
            ide: "127.0.0.1:9001".parse().unwrap(),
            dbg: "127.0.0.1:9000".parse().unwrap(),
            log_level: "LOUD".to_string(),
        };
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn accepts_known_log_level() {
        let args = Args {
            ide: "127.0.0.1:9001".parse().unwrap(),
            dbg: "127.0.0.1:9000".parse().unwrap(),
            log_level: "debug".to_string(),
        };
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.log_level, ii_logging::Level::Debug);
    }
}
