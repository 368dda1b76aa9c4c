//! # Sluice Metrics
//!
//! Observability plumbing for the sluice dispatch core.
//!
//! ## Features
//!
//! - **Reporter**: the narrow interface the server reports dropped
//!   transactions and recovered panics through
//! - **Metrics facade**: counters and histograms recorded through the
//!   `metrics` crate, exported by whatever recorder the process installs
//! - **Structured logging**: text and JSON subscribers for `tracing`

use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub mod tracing_setup;

/// Global metrics instance.
static METRICS: OnceCell<DnsMetrics> = OnceCell::new();

/// Gets or initializes the global metrics instance.
pub fn metrics() -> &'static DnsMetrics {
    METRICS.get_or_init(DnsMetrics::new)
}

/// Sink for the outcomes the dispatch core accounts for itself.
///
/// Plugins report the responses they produce on their own; the core only
/// reports what it answers on their behalf (dropped transactions) and
/// recovered panics.
pub trait Reporter: Send + Sync {
    /// Reports a transaction the core answered without a plugin chain.
    fn report_dropped(&self, server: &str, qtype: &str, rcode: &str, size: usize);

    /// Reports a panic recovered while serving a request.
    fn report_panic(&self, server: &str);
}

/// Reporter forwarding to the global [`DnsMetrics`] instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalReporter;

impl Reporter for GlobalReporter {
    fn report_dropped(&self, server: &str, qtype: &str, rcode: &str, size: usize) {
        metrics().record_dropped(server, qtype, rcode, size);
    }

    fn report_panic(&self, server: &str) {
        metrics().record_panic(server);
    }
}

/// DNS server metrics.
pub struct DnsMetrics {
    /// Server start time.
    start_time: Instant,

    /// Total queries received.
    queries_total: AtomicU64,

    /// Transactions answered by the core itself.
    dropped_total: AtomicU64,

    /// Panics recovered during dispatch.
    panics_total: AtomicU64,
}

impl DnsMetrics {
    /// Creates a new metrics instance.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            queries_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            panics_total: AtomicU64::new(0),
        }
    }

    /// Returns the server uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    // =========================================================================
    // Query metrics
    // =========================================================================

    /// Records a received query.
    pub fn record_query(&self, protocol: &str) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        counter!("dns_requests_total", "protocol" => protocol.to_string()).increment(1);
    }

    /// Records query latency.
    pub fn record_latency(&self, protocol: &str, duration: Duration) {
        histogram!("dns_request_duration_seconds", "protocol" => protocol.to_string())
            .record(duration.as_secs_f64());
    }

    /// Returns the number of queries received.
    pub fn queries(&self) -> u64 {
        self.queries_total.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Dispatch metrics
    // =========================================================================

    /// Records a transaction answered by the core without a plugin chain.
    pub fn record_dropped(&self, server: &str, qtype: &str, rcode: &str, size: usize) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
        counter!(
            "dns_responses_total",
            "server" => server.to_string(),
            "zone" => "dropped",
            "rcode" => rcode.to_string()
        )
        .increment(1);
        counter!("dns_requests_dropped_total", "server" => server.to_string(), "type" => qtype.to_string())
            .increment(1);
        histogram!("dns_response_size_bytes", "server" => server.to_string(), "zone" => "dropped")
            .record(size as f64);
    }

    /// Returns the number of dropped transactions.
    pub fn dropped(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Records a recovered panic.
    pub fn record_panic(&self, server: &str) {
        self.panics_total.fetch_add(1, Ordering::Relaxed);
        counter!("dns_panics_total", "server" => server.to_string()).increment(1);
    }

    /// Returns the number of recovered panics.
    pub fn panics(&self) -> u64 {
        self.panics_total.load(Ordering::Relaxed)
    }
}

impl Default for DnsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Query timing helper.
pub struct QueryTimer {
    start: Instant,
    protocol: &'static str,
}

impl QueryTimer {
    /// Starts a new query timer.
    pub fn start(protocol: &'static str) -> Self {
        metrics().record_query(protocol);
        Self {
            start: Instant::now(),
            protocol,
        }
    }

    /// Returns the elapsed duration.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finishes timing and records the latency.
    pub fn finish(self) {
        metrics().record_latency(self.protocol, self.elapsed());
    }
}
