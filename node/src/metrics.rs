// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Instrumentation emitted through the `metrics` facade: recording through
// `metrics::counter!`/`gauge!` and leaving the concrete exporter
// (Prometheus, etc.) an external collaborator.

pub const ADMISSION_INFLIGHT: &str = "node_admission_inflight";
pub const CLUSTERS_ACTIVE: &str = "node_clusters_active";
pub const ROLLCALL_OVERLOADED_TOTAL: &str = "node_rollcall_overloaded_total";

pub fn record_rollcall_overloaded(enabled: bool) {
    if enabled {
        metrics::counter!(ROLLCALL_OVERLOADED_TOTAL).increment(1);
    }
}

pub fn set_admission_inflight(enabled: bool, value: i64) {
    if enabled {
        metrics::gauge!(ADMISSION_INFLIGHT).set(value as f64);
    }
}

pub fn set_clusters_active(enabled: bool, value: i64) {
    if enabled {
        metrics::gauge!(CLUSTERS_ACTIVE).set(value as f64);
    }
}
