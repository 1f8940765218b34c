//! Runtime counters, drained and reset after every input file.
//!
//! Each pipeline component owns its own counter block and exposes
//! `drain()`, which snapshots the values and zeroes them. The driver
//! emits the snapshots as structured log events; a remote collector
//! would consume the same snapshots.

use serde::Serialize;

/// One named counter value at emission time.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: &'static str,
    pub unit: &'static str,
    pub value: f64,
}

impl Metric {
    fn count(name: &'static str, value: u64) -> Self {
        Metric {
            name,
            unit: "count",
            value: value as f64,
        }
    }

    fn with_unit(name: &'static str, unit: &'static str, value: f64) -> Self {
        Metric { name, unit, value }
    }
}

/// Counters owned by the framed record reader.
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    pub invalid_path_length: u64,
    pub invalid_data_length: u64,
    pub inflate_failures: u64,
    pub parse_failures: u64,
    /// Bytes skipped while scanning for a record separator.
    pub corrupt_data: u64,
}

impl ReaderMetrics {
    pub fn drain(&mut self) -> Vec<Metric> {
        let out = vec![
            Metric::count("Invalid Path Length", self.invalid_path_length),
            Metric::count("Invalid Data Length", self.invalid_data_length),
            Metric::count("Inflate Failures", self.inflate_failures),
            Metric::count("Parse Failures", self.parse_failures),
            Metric::with_unit("Corrupt Data", "B", self.corrupt_data as f64),
        ];
        *self = Self::default();
        out
    }
}

/// Counters owned by the histogram cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub connection_errors: u64,
    pub http_errors: u64,
    pub invalid_histograms: u64,
    pub invalid_revisions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl CacheMetrics {
    pub fn drain(&mut self) -> Vec<Metric> {
        let out = vec![
            Metric::count("Connection Errors", self.connection_errors),
            Metric::count("HTTP Errors", self.http_errors),
            Metric::count("Invalid Histograms", self.invalid_histograms),
            Metric::count("Invalid Revisions", self.invalid_revisions),
            Metric::count("Cache Hits", self.cache_hits),
            Metric::count("Cache Misses", self.cache_misses),
        ];
        *self = Self::default();
        out
    }
}

/// Counters owned by the dimension schema.
#[derive(Debug, Default)]
pub struct SchemaMetrics {
    pub invalid_string_dimension: u64,
    pub invalid_numeric_dimension: u64,
}

impl SchemaMetrics {
    pub fn drain(&mut self) -> Vec<Metric> {
        let out = vec![
            Metric::count("Invalid String Dimension", self.invalid_string_dimension),
            Metric::count("Invalid Numeric Dimension", self.invalid_numeric_dimension),
        ];
        *self = Self::default();
        out
    }
}

/// Driver-level counters covering a whole input file.
#[derive(Debug, Default)]
pub struct ConvertMetrics {
    pub records_processed: u64,
    pub records_discarded: u64,
    pub data_in: u64,
    pub data_out: u64,
    pub processing_time: f64,
    pub throughput: f64,
    pub exceptions: u64,
}

impl ConvertMetrics {
    pub fn drain(&mut self) -> Vec<Metric> {
        let out = vec![
            Metric::count("Records Processed", self.records_processed),
            Metric::count("Records Discarded", self.records_discarded),
            Metric::with_unit("Data In", "B", self.data_in as f64),
            Metric::with_unit("Data Out", "B", self.data_out as f64),
            Metric::with_unit("Processing Time", "s", self.processing_time),
            Metric::with_unit("Throughput", "MiB/s", self.throughput),
            Metric::count("Exceptions", self.exceptions),
        ];
        *self = Self::default();
        out
    }
}

/// Emit one component's drained counters as a structured log event.
pub fn emit(component: &str, source: &str, metrics: &[Metric]) {
    match serde_json::to_string(metrics) {
        Ok(json) => tracing::info!(target: "metrics", component, source, %json),
        Err(e) => tracing::warn!(component, error = %e, "failed to serialize metrics"),
    }
}
