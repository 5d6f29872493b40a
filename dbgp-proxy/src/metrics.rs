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

//! Prometheus counters, compiled in only with the `prometheus_metrics`
//! feature; see `dummy_metrics.rs` for the no-op twin kept at the same
//! path so call sites never need to branch on the feature.

use prometheus::{register_int_counter, IntCounter};

pub struct Metrics {
    registrations_succeeded: IntCounter,
    registrations_failed: IntCounter,
    sessions_established: IntCounter,
    sessions_failed_dial: IntCounter,
    sessions_closed: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            registrations_succeeded: register_int_counter!(
                "dbgp_proxy_registrations_succeeded_total",
                "Number of successful proxyinit registrations"
            )
            .expect("metric registration failed"),
            registrations_failed: register_int_counter!(
                "dbgp_proxy_registrations_failed_total",
                "Number of rejected or unparsable registration commands"
            )
            .expect("metric registration failed"),
            sessions_established: register_int_counter!(
                "dbgp_proxy_sessions_established_total",
                "Number of engine sessions successfully handed off to an IDE"
            )
            .expect("metric registration failed"),
            sessions_failed_dial: register_int_counter!(
                "dbgp_proxy_sessions_failed_dial_total",
                "Number of sessions where dialing the registered IDE failed"
            )
            .expect("metric registration failed"),
            sessions_closed: register_int_counter!(
                "dbgp_proxy_sessions_closed_total",
                "Number of forwarding sessions that have closed"
            )
            .expect("metric registration failed"),
        }
    }

    pub fn inc_registrations_succeeded(&self) {
        self.registrations_succeeded.inc();
    }

    pub fn inc_registrations_failed(&self) {
        self.registrations_failed.inc();
    }

    pub fn inc_sessions_established(&self) {
        self.sessions_established.inc();
    }

    pub fn inc_sessions_failed_dial(&self) {
        self.sessions_failed_dial.inc();
    }

    pub fn inc_sessions_closed(&self) {
        self.sessions_closed.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
