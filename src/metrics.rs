//! Prometheus metrics for transport negotiation
//!
//! Counters live behind `LazyLock` statics and register against a crate-local
//! registry so the embedding server can merge or scrape them as it prefers.

use prometheus::{register_counter_vec_with_registry, CounterVec, Registry};

/// Crate metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Negotiation operation outcomes, labeled (operation, status, reason)
pub static SERVICE_OPERATION_COUNTER: std::sync::LazyLock<CounterVec> =
    std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "rtc_service_operations_total",
            "Transport negotiation operations by outcome",
            &["operation", "status", "reason"],
            REGISTRY.clone()
        )
        .expect("Failed to register SERVICE_OPERATION_COUNTER")
    });

/// Record a failed negotiation sub-operation
pub(crate) fn count_error(operation: &str, reason: &str) {
    SERVICE_OPERATION_COUNTER
        .with_label_values(&[operation, "error", reason])
        .inc();
}
