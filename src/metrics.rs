//! Prometheus metrics for Basalt

use crate::protocol::{ArithOp, Command, StoreMode};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use tracing::error;

/// Global metrics instance
pub struct Metrics {
    pub registry: Registry,

    // Command counters
    pub cmd_get: IntCounter,
    pub cmd_set: IntCounter,
    pub cmd_add: IntCounter,
    pub cmd_replace: IntCounter,
    pub cmd_append: IntCounter,
    pub cmd_prepend: IntCounter,
    pub cmd_delete: IntCounter,
    pub cmd_incr: IntCounter,
    pub cmd_decr: IntCounter,

    // Connection metrics
    pub active_connections: IntGauge,
    pub total_connections: IntCounter,
    pub rejected_connections: IntCounter,

    // Bytes counters
    pub bytes_read: IntCounter,
    pub bytes_written: IntCounter,

    // Latency histograms
    pub cmd_latency: Histogram,

    // Error counters
    pub protocol_errors: IntCounter,
    pub storage_errors: IntCounter,
    pub command_panics: IntCounter,

    /// Times a connection stopped reading because its output queue was full
    pub backpressure_events: IntCounter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let cmd_get = IntCounter::new("basalt_cmd_get_total", "Total GET commands").unwrap();
        let cmd_set = IntCounter::new("basalt_cmd_set_total", "Total SET commands").unwrap();
        let cmd_add = IntCounter::new("basalt_cmd_add_total", "Total ADD commands").unwrap();
        let cmd_replace =
            IntCounter::new("basalt_cmd_replace_total", "Total REPLACE commands").unwrap();
        let cmd_append =
            IntCounter::new("basalt_cmd_append_total", "Total APPEND commands").unwrap();
        let cmd_prepend =
            IntCounter::new("basalt_cmd_prepend_total", "Total PREPEND commands").unwrap();
        let cmd_delete =
            IntCounter::new("basalt_cmd_delete_total", "Total DELETE commands").unwrap();
        let cmd_incr = IntCounter::new("basalt_cmd_incr_total", "Total INCR commands").unwrap();
        let cmd_decr = IntCounter::new("basalt_cmd_decr_total", "Total DECR commands").unwrap();

        let active_connections =
            IntGauge::new("basalt_active_connections", "Current active connections").unwrap();
        let total_connections =
            IntCounter::new("basalt_connections_total", "Total connections accepted").unwrap();
        let rejected_connections = IntCounter::new(
            "basalt_rejected_connections_total",
            "Total connections rejected",
        )
        .unwrap();

        let bytes_read = IntCounter::new("basalt_bytes_read_total", "Total bytes read").unwrap();
        let bytes_written =
            IntCounter::new("basalt_bytes_written_total", "Total bytes written").unwrap();

        let cmd_latency = Histogram::with_opts(
            HistogramOpts::new("basalt_cmd_latency_seconds", "Command latency in seconds")
                .buckets(vec![
                    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
                ]),
        )
        .unwrap();

        let protocol_errors =
            IntCounter::new("basalt_protocol_errors_total", "Total protocol errors").unwrap();
        let storage_errors =
            IntCounter::new("basalt_storage_errors_total", "Total failed commands").unwrap();
        let command_panics = IntCounter::new(
            "basalt_command_panics_total",
            "Commands aborted by a panic",
        )
        .unwrap();
        let backpressure_events = IntCounter::new(
            "basalt_backpressure_events_total",
            "Times a connection paused reading on a full output queue",
        )
        .unwrap();

        // Register all metrics
        for counter in [
            &cmd_get,
            &cmd_set,
            &cmd_add,
            &cmd_replace,
            &cmd_append,
            &cmd_prepend,
            &cmd_delete,
            &cmd_incr,
            &cmd_decr,
            &total_connections,
            &rejected_connections,
            &bytes_read,
            &bytes_written,
            &protocol_errors,
            &storage_errors,
            &command_panics,
            &backpressure_events,
        ] {
            registry.register(Box::new(counter.clone())).unwrap();
        }
        registry
            .register(Box::new(active_connections.clone()))
            .unwrap();
        registry.register(Box::new(cmd_latency.clone())).unwrap();

        Self {
            registry,
            cmd_get,
            cmd_set,
            cmd_add,
            cmd_replace,
            cmd_append,
            cmd_prepend,
            cmd_delete,
            cmd_incr,
            cmd_decr,
            active_connections,
            total_connections,
            rejected_connections,
            bytes_read,
            bytes_written,
            cmd_latency,
            protocol_errors,
            storage_errors,
            command_panics,
            backpressure_events,
        }
    }

    /// Count one execution of `command`
    pub fn record_command(&self, command: &Command) {
        let counter = match command {
            Command::Get { .. } => &self.cmd_get,
            Command::Store { mode, .. } => match mode {
                StoreMode::Set => &self.cmd_set,
                StoreMode::Add => &self.cmd_add,
                StoreMode::Replace => &self.cmd_replace,
                StoreMode::Append => &self.cmd_append,
                StoreMode::Prepend => &self.cmd_prepend,
            },
            Command::Delete { .. } => &self.cmd_delete,
            Command::Arithmetic { op: ArithOp::Incr, .. } => &self.cmd_incr,
            Command::Arithmetic { op: ArithOp::Decr, .. } => &self.cmd_decr,
            Command::Version | Command::Quit => return,
        };
        counter.inc();
    }

    /// Get Prometheus formatted metrics
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
