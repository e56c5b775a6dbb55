//! Metric recording over the `metrics` facade.
//!
//! The exporter is installed by the binary; the library only records.
//! Labels: `key` is the tenant name of the server key the client
//! connected with, `type` the query name, `hit` how the reply was
//! produced, `code` the wire error code.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::dispatch::HitType;

pub const REQUESTS_TOTAL: &str = "liteproxy_requests_total";
pub const QUERY_DURATION_SECONDS: &str = "liteproxy_query_duration_seconds";
pub const LS_ERRORS_TOTAL: &str = "liteproxy_ls_errors_total";
pub const ACTIVE_CONNECTIONS: &str = "liteproxy_active_connections";
pub const CACHE_ENTRIES: &str = "liteproxy_cache_entries";
pub const TIP_SEQNO: &str = "liteproxy_masterchain_tip_seqno";

/// Registers metric descriptions with the installed recorder. Safe to
/// call more than once.
pub fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Messages received, by server key and query type");
    describe_histogram!(
        QUERY_DURATION_SECONDS,
        "Query handling latency, by server key, query type and hit class"
    );
    describe_counter!(LS_ERRORS_TOTAL, "Error replies, by server key, query type and code");
    describe_gauge!(ACTIVE_CONNECTIONS, "Currently open client connections");
    describe_gauge!(CACHE_ENTRIES, "Entries per cache table");
    describe_gauge!(TIP_SEQNO, "Last seen masterchain seqno");
}

pub fn record_request(key: &str, query: &'static str) {
    counter!(REQUESTS_TOTAL, "key" => key.to_owned(), "type" => query).increment(1);
}

pub fn record_query(key: &str, query: &'static str, hit: HitType, elapsed: Duration) {
    histogram!(
        QUERY_DURATION_SECONDS,
        "key" => key.to_owned(),
        "type" => query,
        "hit" => hit.as_str(),
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_ls_error(key: &str, query: &'static str, code: i32) {
    counter!(
        LS_ERRORS_TOTAL,
        "key" => key.to_owned(),
        "type" => query,
        "code" => code.to_string(),
    )
    .increment(1);
}

pub fn connection_opened() {
    gauge!(ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn connection_closed() {
    gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
}

pub fn set_cache_entries(table: &'static str, entries: usize) {
    gauge!(CACHE_ENTRIES, "table" => table).set(entries as f64);
}

pub fn set_tip_seqno(seqno: u32) {
    gauge!(TIP_SEQNO).set(f64::from(seqno));
}
