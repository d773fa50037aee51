//! OTel-native metrics instruments.
//!
//! All instruments are lazily initialized and feature-gated behind `otel`.
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("unistore"));

// ============================================================================
// Write Path
// ============================================================================

/// Writes committed per batch transaction.
pub static RV_BATCH_SIZE: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("unistore.rv.batch.size")
        .with_description("Writes committed per resource version batch")
        .build()
});

/// Total write events handled, by outcome.
pub static WRITE_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("unistore.write.total")
        .with_description("Total write events handled")
        .build()
});

/// Duration of a write from submission to commit.
pub static WRITE_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("unistore.write.duration")
        .with_description("Write event duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Watch
// ============================================================================

/// Events dropped by the in-process notifier.
pub static WATCH_DROPPED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("unistore.watch.dropped.total")
        .with_description("Watch events dropped under backpressure")
        .build()
});

// ============================================================================
// Background Loops
// ============================================================================

/// Prune requests rejected because the debounce buffer was full.
pub static PRUNER_BUFFER_FULL_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("unistore.pruner.buffer_full.total")
        .with_description("Prune requests dropped on a full buffer")
        .build()
});

/// History rows removed by garbage collection.
pub static GC_DELETED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("unistore.gc.deleted.total")
        .with_description("History rows deleted by garbage collection")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create group and resource labels for a bucket.
pub fn bucket_attrs(group: &str, resource: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("group", group.to_string()),
        KeyValue::new("resource", resource.to_string()),
    ]
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Create a notifier label.
pub fn notifier_attr(notifier: &str) -> KeyValue {
    KeyValue::new("notifier", notifier.to_string())
}
