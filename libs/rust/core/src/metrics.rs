//! Prometheus metrics for the coordination substrate. Registered against the
//! default registry and scraped via the `/metrics` route.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub static LIFECYCLE_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pipeline_lifecycle_events_total",
        "Lifecycle events observed by the completion tracker",
        &["status"]
    )
    .unwrap()
});

pub static BARRIER_FIRED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pipeline_barrier_fired_total",
        "Completion barriers fired (once per fingerprint)"
    )
    .unwrap()
});

pub static STALE_FINGERPRINTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pipeline_stale_fingerprints_total",
        "Fingerprints reported incomplete after the stale timeout"
    )
    .unwrap()
});

pub static PROMOTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pipeline_promotions_total",
        "Promotion records written to the registry"
    )
    .unwrap()
});

pub static DLQ_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pipeline_dlq_messages_total",
        "Messages routed to a dead-letter topic",
        &["topic"]
    )
    .unwrap()
});

pub static DLQ_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pipeline_dlq_dropped_total",
        "Messages dropped because the DLQ publish itself failed"
    )
    .unwrap()
});

pub static PREDICT_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pipeline_predict_outcomes_total",
        "Predict requests by terminal status",
        &["status"]
    )
    .unwrap()
});

pub static IN_FLIGHT_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pipeline_in_flight_requests",
        "Requests currently executing inference"
    )
    .unwrap()
});

pub static MODEL_GENERATION: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pipeline_model_generation",
        "Generation of the active model handle (0 = none loaded)"
    )
    .unwrap()
});
