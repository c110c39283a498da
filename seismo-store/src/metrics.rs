//! Prometheus metrics: admission rejections by category, write/query
//! latency, and ingest queue depth. `gather()` is the unmodified
//! text-exposition encoder the teacher's metrics endpoint uses.

use std::sync::LazyLock;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, TextEncoder, register_counter_vec, register_gauge,
    register_histogram,
};

use crate::admission::RejectReason;

pub fn observe_admission_rejection(reason: RejectReason) {
    static COUNTER: LazyLock<CounterVec> = LazyLock::new(|| {
        register_counter_vec!(
            "seismo_admission_rejections_total",
            "Packets rejected by the admission filter, by reason",
            &["reason"]
        )
        .unwrap()
    });
    let label: &'static str = reason.into();
    COUNTER.with_label_values(&[label]).inc();
}

pub fn observe_write_latency(latency: Duration) {
    static HISTOGRAM: LazyLock<Histogram> = LazyLock::new(|| {
        register_histogram!(
            "seismo_write_latency_seconds",
            "Time to insert one packet into its data table",
            vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000]
        )
        .unwrap()
    });
    HISTOGRAM.observe(latency.as_secs_f64());
}

pub fn observe_query_latency(latency: Duration) {
    static HISTOGRAM: LazyLock<Histogram> = LazyLock::new(|| {
        register_histogram!(
            "seismo_query_latency_seconds",
            "Time to serve a stream-query request",
            vec![0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000]
        )
        .unwrap()
    });
    HISTOGRAM.observe(latency.as_secs_f64());
}

/// Depth of the ingest pipeline's producer queue, sampled by whichever
/// thread owns the feed driver's callback loop (§5).
pub fn set_producer_queue_depth(depth: usize) {
    static GAUGE: LazyLock<Gauge> = LazyLock::new(|| {
        register_gauge!(
            "seismo_producer_queue_depth",
            "Number of packets queued ahead of the shallow-dedup stage"
        )
        .unwrap()
    });
    GAUGE.set(depth as f64);
}

pub fn gather() -> Bytes {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = BytesMut::new().writer();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    buffer.into_inner().freeze()
}
