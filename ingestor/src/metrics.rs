use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref POLLS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_polls_total",
        "Total live poll cycles started"
    ))
    .unwrap();
    pub static ref POLL_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_poll_failures_total",
            "Live poll cycles that failed, by error kind"
        ),
        &["kind"]
    )
    .unwrap();
    pub static ref DEVICE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_device_failures_total",
            "Device readings that could not be forwarded, by error kind"
        ),
        &["kind"]
    )
    .unwrap();
    pub static ref POINTS_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_points_written_total",
        "Total points written to the store"
    ))
    .unwrap();
    pub static ref DUPLICATES_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_duplicates_skipped_total",
        "Live readings skipped because the point already existed"
    ))
    .unwrap();
    pub static ref BACKFILL_PAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_backfill_pages_total",
        "History pages fetched by backfill runs"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total transient database failures"
    ))
    .unwrap();
    pub static ref UPSTREAM_LATENCY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "ingestor_upstream_latency_seconds",
            "Time taken by device cloud requests"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["endpoint"]
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLL_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POINTS_WRITTEN_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DUPLICATES_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BACKFILL_PAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPSTREAM_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
