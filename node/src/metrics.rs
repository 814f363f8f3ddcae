//! # Prometheus Metrics
//!
//! Operational metrics for the ledger node, scraped at `/metrics` on the
//! metrics address. Everything lives in a dedicated [`Registry`] under the
//! `deedchain` prefix.
//!
//! Tier health is owned by the orchestrator; the gauges here mirror its
//! latest snapshot and are refreshed on every scrape.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use deedchain::{Orchestrator, RestoreSource, TierHealth};

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Blocks appended since start.
    pub appends_total: IntCounter,
    /// Appends refused or rolled back.
    pub append_failures_total: IntCounter,
    /// Blocks in the chain, genesis included.
    pub chain_height: IntGauge,
    /// Mining plus local snapshot write.
    pub append_latency_seconds: Histogram,
    /// 1 while a tier's last write failed.
    pub tier_degraded: IntGaugeVec,
    /// Failed writes per tier since start.
    pub tier_failures: IntGaugeVec,
    /// 1 for the source the running chain was restored from.
    pub restore_source: IntGaugeVec,
}

fn register<C>(registry: &Registry, collector: C) -> prometheus::Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl NodeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("deedchain".into()), None)?;

        let appends_total = register(
            &registry,
            IntCounter::new("appends_total", "Blocks appended since start")?,
        )?;
        let append_failures_total = register(
            &registry,
            IntCounter::new("append_failures_total", "Appends that failed")?,
        )?;
        let chain_height = register(
            &registry,
            IntGauge::new("chain_height", "Number of blocks in the chain")?,
        )?;
        let append_latency_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "append_latency_seconds",
                    "Time to mine a block and write the local snapshot",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            )?,
        )?;
        let tier_degraded = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("tier_degraded", "1 when the tier's last write failed"),
                &["tier"],
            )?,
        )?;
        let tier_failures = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("tier_failures", "Failed writes per tier since start"),
                &["tier"],
            )?,
        )?;
        let restore_source = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("restore_source", "Source the running chain was restored from"),
                &["source"],
            )?,
        )?;

        Ok(Self {
            registry,
            appends_total,
            append_failures_total,
            chain_height,
            append_latency_seconds,
            tier_degraded,
            tier_failures,
            restore_source,
        })
    }

    pub fn record_restore(&self, source: &RestoreSource, blocks: usize) {
        self.restore_source.with_label_values(&[source.label()]).set(1);
        self.chain_height.set(blocks as i64);
    }

    pub fn observe_health(&self, health: &[TierHealth]) {
        for tier in health {
            let label = [tier.tier.as_str()];
            self.tier_degraded
                .with_label_values(&label)
                .set(i64::from(tier.degraded));
            self.tier_failures
                .with_label_values(&label)
                .set(i64::try_from(tier.total_failures).unwrap_or(i64::MAX));
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// State for the metrics router.
#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Arc<NodeMetrics>,
    pub orchestrator: Orchestrator,
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    state.metrics.observe_health(&state.orchestrator.health());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

pub fn metrics_router(state: MetricsState) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(state)
}
