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

//! DBGp rendezvous proxy core: registration, session handshake, and
//! bidirectional forwarding. CLI entry point lives in `main.rs`; everything
//! here is reusable by tests and by the binary alike.

pub mod config;
pub mod error;
pub mod framing;
pub mod registration;
pub mod registry;
pub mod session;
pub mod xmlinit;

#[cfg_attr(not(feature = "prometheus_metrics"), path = "dummy_metrics.rs")]
#[cfg_attr(feature = "prometheus_metrics", path = "metrics.rs")]
pub mod metrics;

pub use error::{Error, Result};
