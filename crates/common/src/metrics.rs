use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    node_rows_in: CounterVec,
    node_rows_out: CounterVec,
    node_batches_in: CounterVec,
    node_batches_out: CounterVec,
    node_finished: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_node_input(&self, kind: &str, label: &str, rows: u64, batches: u64) {
        let labels = [kind, label];
        self.inner
            .node_rows_in
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .node_batches_in
            .with_label_values(&labels)
            .inc_by(batches as f64);
    }

    pub fn record_node_output(&self, kind: &str, label: &str, rows: u64, batches: u64) {
        let labels = [kind, label];
        self.inner
            .node_rows_out
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .node_batches_out
            .with_label_values(&labels)
            .inc_by(batches as f64);
    }

    pub fn record_node_finished(&self, kind: &str, label: &str, status: &str) {
        self.inner
            .node_finished
            .with_label_values(&[kind, label, status])
            .inc();
    }

    /// Render all registered metrics in the prometheus text format.
    pub fn render_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder
            .encode(&self.inner.registry.gather(), &mut buf)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let node_labels = ["kind", "label"];
        let node_rows_in = CounterVec::new(
            Opts::new("brook_node_rows_in", "Rows received by a node"),
            &node_labels,
        )
        .expect("metric opts are static");
        let node_rows_out = CounterVec::new(
            Opts::new("brook_node_rows_out", "Rows pushed by a node"),
            &node_labels,
        )
        .expect("metric opts are static");
        let node_batches_in = CounterVec::new(
            Opts::new("brook_node_batches_in", "Batches received by a node"),
            &node_labels,
        )
        .expect("metric opts are static");
        let node_batches_out = CounterVec::new(
            Opts::new("brook_node_batches_out", "Batches pushed by a node"),
            &node_labels,
        )
        .expect("metric opts are static");
        let node_finished = CounterVec::new(
            Opts::new("brook_node_finished", "Node completions by status"),
            &["kind", "label", "status"],
        )
        .expect("metric opts are static");

        for c in [
            &node_rows_in,
            &node_rows_out,
            &node_batches_in,
            &node_batches_out,
            &node_finished,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("metric registered once");
        }

        Self {
            registry,
            node_rows_in,
            node_rows_out,
            node_batches_in,
            node_batches_out,
            node_finished,
        }
    }
}

/// Global registry shared by plans that do not supply their own.
pub fn global_metrics() -> &'static MetricsRegistry {
    static METRICS: OnceLock<MetricsRegistry> = OnceLock::new();
    METRICS.get_or_init(MetricsRegistry::new)
}
