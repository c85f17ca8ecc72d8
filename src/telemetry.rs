//! Prometheus metrics for the synchronization engine
//!
//! Registered on the default registry so `/metrics` can `gather()` them.

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

lazy_static! {
    pub static ref DEPTH_EVENTS: IntCounterVec =
        register_int_counter_vec!(
            "depth_sync_events_total",
            "Depth updates received from the stream",
            &["symbol"]
        )
        .expect("depth_sync_events_total registers once");

    pub static ref APPLIED_UPDATES: IntCounterVec =
        register_int_counter_vec!(
            "depth_sync_applied_updates_total",
            "Depth updates folded into the local book",
            &["symbol"]
        )
        .expect("depth_sync_applied_updates_total registers once");

    pub static ref MALFORMED_EVENTS: IntCounterVec =
        register_int_counter_vec!(
            "depth_sync_malformed_events_total",
            "Depth updates dropped because they could not be parsed or validated",
            &["symbol"]
        )
        .expect("depth_sync_malformed_events_total registers once");

    pub static ref RESYNCS: IntCounterVec =
        register_int_counter_vec!(
            "depth_sync_resyncs_total",
            "Full resynchronizations by cause",
            &["symbol", "reason"]
        )
        .expect("depth_sync_resyncs_total registers once");

    pub static ref SNAPSHOT_FAILURES: IntCounterVec =
        register_int_counter_vec!(
            "depth_sync_snapshot_failures_total",
            "Failed REST snapshot requests",
            &["symbol"]
        )
        .expect("depth_sync_snapshot_failures_total registers once");

    pub static ref BUFFERED_EVENTS: IntGaugeVec =
        register_int_gauge_vec!(
            "depth_sync_buffered_events",
            "Depth updates currently retained by the update buffer",
            &["symbol"]
        )
        .expect("depth_sync_buffered_events registers once");
}
