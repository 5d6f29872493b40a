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

//! No-op twin of `metrics.rs`, compiled in when the `prometheus_metrics`
//! feature is disabled so call sites never need to branch on it.

#[derive(Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn inc_registrations_succeeded(&self) {}

    pub fn inc_registrations_failed(&self) {}

    pub fn inc_sessions_established(&self) {}

    pub fn inc_sessions_failed_dial(&self) {}

    pub fn inc_sessions_closed(&self) {}
}
