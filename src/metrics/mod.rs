//! Metrics recorder for requests, tool executions and resource reads.
//!
//! Writers update per-key accumulators in a sharded map; `snapshot` copies
//! them into a serializable summary.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key under which requests for unregistered methods are counted.
pub const UNKNOWN_METHOD: &str = "unknown";

#[derive(Debug, Default, Clone)]
struct MethodAccumulator {
    count: u64,
    errors: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

#[derive(Debug, Default, Clone)]
struct ExecutionAccumulator {
    count: u64,
    errors: u64,
    cache_hits: u64,
    total: Duration,
}

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    methods: DashMap<String, MethodAccumulator>,
    tools: DashMap<String, ExecutionAccumulator>,
    resources: DashMap<String, ExecutionAccumulator>,
    /// Total requests processed
    requests_total: AtomicU64,
    /// Requests that produced an error
    requests_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// SSE replies that could not be delivered
    sse_delivery_failures: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record one dispatched request for `method`.
    pub fn record_request(&self, method: &str, elapsed: Duration, error: Option<&str>) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if error.is_some() {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut acc = self.methods.entry(method.to_string()).or_default();
        acc.count += 1;
        acc.total += elapsed;
        acc.min = Some(acc.min.map_or(elapsed, |m| m.min(elapsed)));
        acc.max = acc.max.max(elapsed);
        if error.is_some() {
            acc.errors += 1;
        }
    }

    /// Record one tool execution, whatever its outcome.
    pub fn record_tool_execution(&self, tool: &str, elapsed: Duration, error: Option<&str>) {
        let mut acc = self.tools.entry(tool.to_string()).or_default();
        acc.count += 1;
        acc.total += elapsed;
        if error.is_some() {
            acc.errors += 1;
        }
    }

    /// Record one resource read and whether it was served from cache.
    pub fn record_resource_read(
        &self,
        uri: &str,
        elapsed: Duration,
        error: Option<&str>,
        cache_hit: bool,
    ) {
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let mut acc = self.resources.entry(uri.to_string()).or_default();
        acc.count += 1;
        acc.total += elapsed;
        if error.is_some() {
            acc.errors += 1;
        }
        if cache_hit {
            acc.cache_hits += 1;
        }
    }

    /// Count a reply that could not be handed to its SSE client.
    pub fn record_sse_delivery_failure(&self) {
        self.sse_delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;

        let methods = self
            .methods
            .iter()
            .map(|e| {
                let acc = e.value();
                (
                    e.key().clone(),
                    MethodStats {
                        count: acc.count,
                        errors: acc.errors,
                        total_ms: millis(acc.total),
                        min_ms: acc.min.map(millis).unwrap_or(0.0),
                        max_ms: millis(acc.max),
                        avg_ms: average(acc.total, acc.count),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_requests: self.requests_total.load(Ordering::Relaxed),
            total_errors: self.requests_failed.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate: ratio(cache_hits, lookups),
            sse_delivery_failures: self.sse_delivery_failures.load(Ordering::Relaxed),
            methods,
            tools: collect_execution(&self.tools),
            resources: collect_execution(&self.resources),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP mcp_engine_requests_total Total number of requests
# TYPE mcp_engine_requests_total counter
mcp_engine_requests_total {}

# HELP mcp_engine_requests_failed Requests that returned an error
# TYPE mcp_engine_requests_failed counter
mcp_engine_requests_failed {}

# HELP mcp_engine_cache_hits Resource reads served from cache
# TYPE mcp_engine_cache_hits counter
mcp_engine_cache_hits {}

# HELP mcp_engine_cache_misses Resource reads that missed the cache
# TYPE mcp_engine_cache_misses counter
mcp_engine_cache_misses {}

# HELP mcp_engine_sse_delivery_failures SSE replies that could not be delivered
# TYPE mcp_engine_sse_delivery_failures counter
mcp_engine_sse_delivery_failures {}
"#,
            s.total_requests, s.total_errors, s.cache_hits, s.cache_misses, s.sse_delivery_failures
        );

        out.push_str("\n# HELP mcp_engine_method_calls_total Calls per JSON-RPC method\n");
        out.push_str("# TYPE mcp_engine_method_calls_total counter\n");
        for (method, stats) in &s.methods {
            out.push_str(&format!(
                "mcp_engine_method_calls_total{{method=\"{}\"}} {}\n",
                escape_label(method),
                stats.count
            ));
        }

        out.push_str("\n# HELP mcp_engine_tool_calls_total Executions per tool\n");
        out.push_str("# TYPE mcp_engine_tool_calls_total counter\n");
        for (tool, stats) in &s.tools {
            out.push_str(&format!(
                "mcp_engine_tool_calls_total{{tool=\"{}\"}} {}\n",
                escape_label(tool),
                stats.count
            ));
            out.push_str(&format!(
                "mcp_engine_tool_errors_total{{tool=\"{}\"}} {}\n",
                escape_label(tool),
                stats.errors
            ));
        }

        out.push_str("\n# HELP mcp_engine_resource_reads_total Reads per resource\n");
        out.push_str("# TYPE mcp_engine_resource_reads_total counter\n");
        for (uri, stats) in &s.resources {
            out.push_str(&format!(
                "mcp_engine_resource_reads_total{{uri=\"{}\"}} {}\n",
                escape_label(uri),
                stats.count
            ));
        }

        out
    }
}

fn collect_execution(map: &DashMap<String, ExecutionAccumulator>) -> BTreeMap<String, ExecutionStats> {
    map.iter()
        .map(|e| {
            let acc = e.value();
            (
                e.key().clone(),
                ExecutionStats {
                    count: acc.count,
                    errors: acc.errors,
                    cache_hits: acc.cache_hits,
                    total_ms: millis(acc.total),
                    avg_ms: average(acc.total, acc.count),
                    error_rate: ratio(acc.errors, acc.count),
                },
            )
        })
        .collect()
}

/// Escape a Prometheus label value.
fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn average(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        millis(total) / count as f64
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub sse_delivery_failures: u64,
    pub methods: BTreeMap<String, MethodStats>,
    pub tools: BTreeMap<String, ExecutionStats>,
    pub resources: BTreeMap<String, ExecutionStats>,
}

/// Per-method latency summary.
#[derive(Debug, Clone, Serialize)]
pub struct MethodStats {
    pub count: u64,
    pub errors: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

/// Per-tool or per-resource summary.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub count: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub cache_hits: u64,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub error_rate: f64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        let metrics = Metrics::new();
        metrics.record_request("ping", Duration::from_millis(2), None);
        metrics.record_request("ping", Duration::from_millis(6), None);
        metrics.record_request("tools/call", Duration::from_millis(1), Some("boom"));

        let s = metrics.snapshot();
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.total_errors, 1);

        let ping = &s.methods["ping"];
        assert_eq!(ping.count, 2);
        assert!((ping.min_ms - 2.0).abs() < 0.01);
        assert!((ping.max_ms - 6.0).abs() < 0.01);
        assert!((ping.avg_ms - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_record_tool_execution() {
        let metrics = Metrics::new();
        metrics.record_tool_execution("calculator", Duration::from_millis(1), None);
        metrics.record_tool_execution("calculator", Duration::from_millis(1), Some("division by zero"));

        let calc = &metrics.snapshot().tools["calculator"];
        assert_eq!(calc.count, 2);
        assert_eq!(calc.errors, 1);
        assert!((calc.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_resource_read_cache_hits() {
        let metrics = Metrics::new();
        metrics.record_resource_read("config://server/options", Duration::from_millis(3), None, false);
        metrics.record_resource_read("config://server/options", Duration::ZERO, None, true);
        metrics.record_resource_read("config://server/options", Duration::ZERO, None, true);

        let s = metrics.snapshot();
        assert_eq!(s.cache_hits, 2);
        assert_eq!(s.cache_misses, 1);
        assert!((s.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.resources["config://server/options"].cache_hits, 2);
    }

    #[test]
    fn test_empty_snapshot() {
        let s = Metrics::new().snapshot();
        assert_eq!(s.total_requests, 0);
        assert_eq!(s.cache_hit_rate, 0.0);
        assert!(s.methods.is_empty());
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_request("ping", Duration::from_millis(1), None);
        metrics.record_tool_execution("calculator", Duration::from_millis(1), None);
        metrics.record_sse_delivery_failure();

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE mcp_engine_requests_total counter"));
        assert!(output.contains("mcp_engine_requests_total 1"));
        assert!(output.contains("mcp_engine_sse_delivery_failures 1"));
        assert!(output.contains("mcp_engine_method_calls_total{method=\"ping\"} 1"));
        assert!(output.contains("mcp_engine_tool_calls_total{tool=\"calculator\"} 1"));
    }

    #[test]
    fn test_prometheus_escapes_label_values() {
        let metrics = Metrics::new();
        metrics.record_tool_execution("a\"b", Duration::ZERO, None);
        metrics.record_resource_read("file://x\\y\nz", Duration::ZERO, None, false);

        let output = metrics.to_prometheus();
        assert!(output.contains(r#"mcp_engine_tool_calls_total{tool="a\"b"} 1"#));
        assert!(output.contains(r#"mcp_engine_resource_reads_total{uri="file://x\\y\nz"} 1"#));
        assert!(output
            .lines()
            .all(|l| l.is_empty() || l.starts_with('#') || l.starts_with("mcp_engine_")));
    }

    #[test]
    fn test_escape_label() {
        assert_eq!(escape_label("plain/name"), "plain/name");
        assert_eq!(escape_label("q\"s\\n\nl"), r#"q\"s\\n\nl"#);
    }

    #[test]
    fn test_concurrent_writers() {
        let metrics = Metrics::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        metrics.record_request("ping", Duration::from_micros(10), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let s = metrics.snapshot();
        assert_eq!(s.total_requests, 1000);
        assert_eq!(s.methods["ping"].count, 1000);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
