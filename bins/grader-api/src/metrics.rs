// Prometheus metrics for the grader API

use grader_common::{redis::queue_name, GradingEvent, PluginKind};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntGaugeVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Grading requests queued (counter with plugin label)
    pub static ref REQUESTS_SUBMITTED: CounterVec = CounterVec::new(
        Opts::new("grader_requests_submitted_total", "Total number of grading requests queued"),
        &["plugin"]
    )
    .expect("metric can be created");

    pub static ref REQUESTS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("grader_requests_rejected_total", "Total grading requests rejected before queueing"),
        &["reason"]
    )
    .expect("metric can be created");

    // Criteria settled by workers (graded or failed)
    pub static ref CRITERIA_SETTLED: CounterVec = CounterVec::new(
        Opts::new("grader_criteria_settled_total", "Total criteria settled by workers"),
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref CRITERION_SCORE: Histogram = Histogram::with_opts(
        HistogramOpts::new("grader_criterion_score", "Score of graded criteria")
            .buckets(vec![0.0, 25.0, 50.0, 75.0, 90.0, 100.0])
    )
    .expect("metric can be created");

    // Judge stage callbacks received
    pub static ref JUDGE_CALLBACKS: CounterVec = CounterVec::new(
        Opts::new("grader_judge_callbacks_total", "Total judge progress callbacks"),
        &["stage", "status"]
    )
    .expect("metric can be created");

    // Result and progress lookups
    pub static ref STATUS_LOOKUPS: CounterVec = CounterVec::new(
        Opts::new("grader_status_lookups_total", "Total result and progress lookups"),
        &["kind", "status"]
    )
    .expect("metric can be created");

    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("grader_queue_depth", "Current queue depth per plugin"),
        &["plugin"]
    )
    .expect("metric can be created");
}

/// Initialize metrics registry
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(REQUESTS_SUBMITTED.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(REQUESTS_REJECTED.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(CRITERIA_SETTLED.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(CRITERION_SCORE.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(JUDGE_CALLBACKS.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(STATUS_LOOKUPS.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(QUEUE_DEPTH.clone()))
        .expect("collector can be registered");
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request_submitted(plugin: &PluginKind) {
    REQUESTS_SUBMITTED.with_label_values(&[plugin.as_str()]).inc();
}

pub fn record_request_rejected(reason: &str) {
    REQUESTS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_callback(stage: &str, status: &str) {
    JUDGE_CALLBACKS.with_label_values(&[stage, status]).inc();
}

pub fn record_lookup(kind: &str, status: &str) {
    STATUS_LOOKUPS.with_label_values(&[kind, status]).inc();
}

/// Record a worker's per-criterion event
pub fn record_event(event: &GradingEvent) {
    match event {
        GradingEvent::CriterionGraded { grade, .. } => {
            CRITERIA_SETTLED.with_label_values(&["graded"]).inc();
            CRITERION_SCORE.observe(grade.score);
        }
        GradingEvent::CriterionFailed { .. } => {
            CRITERIA_SETTLED.with_label_values(&["failed"]).inc();
        }
    }
}

/// Update queue depth for every plugin
pub async fn update_queue_depths(redis_conn: &mut redis::aio::ConnectionManager) {
    use redis::AsyncCommands;

    for plugin in PluginKind::all_variants() {
        if let Ok(depth) = redis_conn.llen::<_, i64>(queue_name(plugin)).await {
            QUEUE_DEPTH.with_label_values(&[plugin.as_str()]).set(depth);
        }
    }
}
