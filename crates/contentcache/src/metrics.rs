use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// Error kinds tracked by the per-kind counter, mirroring
/// [`contentcache_core::CacheError::kind`].
pub const ERROR_KINDS: [&str; 6] = [
    "permission_denied",
    "source_missing",
    "integrity_fault",
    "storage_failure",
    "processing_error",
    "config_invalid",
];

/// Monotonic counters and histograms for one cache instance.
///
/// Each instance carries its own registry so a process can host several
/// caches without shared state; `render` produces the standard text
/// exposition format.
pub struct MetricsRecorder {
    registry: Registry,
    total_requests: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    bloom_filter_hits: IntCounter,
    dedupe_hits: IntCounter,
    evictions: IntCounter,
    errors: IntCounterVec,
    memory_usage_bytes: IntGauge,
    disk_usage_bytes: IntGauge,
    entry_count: IntGauge,
    request_seconds: Histogram,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let total_requests = IntCounter::with_opts(Opts::new(
            "cache_requests_total",
            "Total number of cache requests",
        ))
        .expect("metric opts");
        let cache_hits = IntCounter::with_opts(Opts::new(
            "cache_hits_total",
            "Requests served from cache",
        ))
        .expect("metric opts");
        let cache_misses = IntCounter::with_opts(Opts::new(
            "cache_misses_total",
            "Requests that required processing",
        ))
        .expect("metric opts");
        let bloom_filter_hits = IntCounter::with_opts(Opts::new(
            "cache_bloom_filter_hits_total",
            "Requests rejected early by the negative-existence filter",
        ))
        .expect("metric opts");
        let dedupe_hits = IntCounter::with_opts(Opts::new(
            "cache_dedupe_hits_total",
            "Misses resolved by reusing content with the same hash",
        ))
        .expect("metric opts");
        let evictions = IntCounter::with_opts(Opts::new(
            "cache_evictions_total",
            "Entries evicted from the memory tier",
        ))
        .expect("metric opts");
        let errors = IntCounterVec::new(
            Opts::new("cache_errors_total", "Errors surfaced to callers by kind"),
            &["kind"],
        )
        .expect("metric opts");
        let memory_usage_bytes = IntGauge::with_opts(Opts::new(
            "cache_memory_usage_bytes",
            "Bytes held by the memory tier",
        ))
        .expect("metric opts");
        let disk_usage_bytes = IntGauge::with_opts(Opts::new(
            "cache_disk_usage_bytes",
            "Compressed bytes held on disk by the blob store",
        ))
        .expect("metric opts");
        let entry_count = IntGauge::with_opts(Opts::new(
            "cache_entries",
            "Entries in the metadata store",
        ))
        .expect("metric opts");
        let request_seconds = Histogram::with_opts(HistogramOpts::new(
            "cache_request_duration_seconds",
            "End-to-end get() latency",
        ))
        .expect("metric opts");

        for collector in [
            Box::new(total_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(bloom_filter_hits.clone()),
            Box::new(dedupe_hits.clone()),
            Box::new(evictions.clone()),
            Box::new(errors.clone()),
            Box::new(memory_usage_bytes.clone()),
            Box::new(disk_usage_bytes.clone()),
            Box::new(entry_count.clone()),
            Box::new(request_seconds.clone()),
        ] {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            total_requests,
            cache_hits,
            cache_misses,
            bloom_filter_hits,
            dedupe_hits,
            evictions,
            errors,
            memory_usage_bytes,
            disk_usage_bytes,
            entry_count,
            request_seconds,
        }
    }

    /// Count one finished request and its latency; errors count as misses.
    pub fn observe_request(&self, started: Instant, cache_hit: bool) {
        self.total_requests.inc();
        if cache_hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
        self.request_seconds.observe(started.elapsed().as_secs_f64());
    }

    pub fn record_bloom_hit(&self) {
        self.bloom_filter_hits.inc();
    }

    pub fn record_dedupe_hit(&self) {
        self.dedupe_hits.inc();
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.inc_by(count);
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn set_memory_usage(&self, bytes: u64) {
        self.memory_usage_bytes.set(bytes as i64);
    }

    pub fn set_disk_usage(&self, bytes: u64) {
        self.disk_usage_bytes.set(bytes as i64);
    }

    pub fn set_entry_count(&self, count: u64) {
        self.entry_count.set(count as i64);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.get()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.get()
    }

    pub fn bloom_filter_hits(&self) -> u64 {
        self.bloom_filter_hits.get()
    }

    pub fn dedupe_hits(&self) -> u64 {
        self.dedupe_hits.get()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests.get();
        if total == 0 {
            0.0
        } else {
            self.cache_hits.get() as f64 / total as f64
        }
    }

    /// Counts of surfaced errors, omitting kinds that never occurred.
    pub fn error_counts(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for kind in ERROR_KINDS {
            let count = self.errors.with_label_values(&[kind]).get();
            if count > 0 {
                counts.insert(kind.to_string(), count);
            }
        }
        counts
    }

    /// Standard Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut output = String::new();
        if let Err(e) = encoder.encode_utf8(&self.registry.gather(), &mut output) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        output
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time statistics surfaced by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bloom_filter_hits: u64,
    pub dedupe_hits: u64,
    pub hit_rate: f64,
    pub memory_usage_mb: f64,
    pub memory_entries: u64,
    /// Measured compressed bytes in the blob store.
    pub disk_usage_bytes: u64,
    /// Summed source-file sizes tracked by the metadata store.
    pub content_bytes: u64,
    pub entry_count: u64,
    pub unique_hashes: u64,
    pub duplicate_groups: u64,
    pub errors: HashMap<String, u64>,
}
