use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static LOGINS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static QUERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static GATE_DENIALS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static GENERATION_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn logins_total() -> &'static IntCounterVec {
    LOGINS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("askdb_logins_total", "Login attempts by outcome."),
                &["outcome"],
            )
            .expect("create askdb_logins_total"),
        )
    })
}

fn queries_total() -> &'static IntCounterVec {
    QUERIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "askdb_queries_total",
                    "Query pipeline requests by outcome.",
                ),
                &["outcome"],
            )
            .expect("create askdb_queries_total"),
        )
    })
}

fn gate_denials_total() -> &'static IntCounter {
    GATE_DENIALS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "askdb_gate_denials_total",
                "Requests denied by the capability gate pre-screen.",
            )
            .expect("create askdb_gate_denials_total"),
        )
    })
}

fn generation_duration_seconds() -> &'static HistogramVec {
    GENERATION_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "askdb_generation_duration_seconds",
                    "Text generation call duration in seconds.",
                )
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
                &["stage"],
            )
            .expect("create askdb_generation_duration_seconds"),
        )
    })
}

pub fn observe_login(outcome: &str) {
    logins_total().with_label_values(&[outcome]).inc();
}

pub fn observe_query(outcome: &str) {
    queries_total().with_label_values(&[outcome]).inc();
}

pub fn inc_gate_denial() {
    gate_denials_total().inc();
}

pub fn observe_generation(stage: &str, duration: Duration) {
    generation_duration_seconds()
        .with_label_values(&[stage])
        .observe(duration.as_secs_f64());
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = logins_total();
    let _ = queries_total();
    let _ = gate_denials_total();
    let _ = generation_duration_seconds();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
