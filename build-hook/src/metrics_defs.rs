//! Metrics definitions for the build hook receiver.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with route, status.",
};

pub const EVENTS_RECEIVED: MetricDef = MetricDef {
    name: "build_event.received",
    metric_type: MetricType::Counter,
    description: "Number of build-success events accepted for projection",
};

pub const DECODE_FAILURES: MetricDef = MetricDef {
    name: "build_event.decode_failure",
    metric_type: MetricType::Counter,
    description: "Number of request bodies that could not be decoded and were replaced by an empty event",
};

pub const STORE_WRITES: MetricDef = MetricDef {
    name: "store.write",
    metric_type: MetricType::Counter,
    description: "Number of successful key/value writes",
};

pub const STORE_WRITE_FAILURES: MetricDef = MetricDef {
    name: "store.write_failure",
    metric_type: MetricType::Counter,
    description: "Number of key/value writes that failed and aborted a projection",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    EVENTS_RECEIVED,
    DECODE_FAILURES,
    STORE_WRITES,
    STORE_WRITE_FAILURES,
];
