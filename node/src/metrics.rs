//! # Prometheus Metrics
//!
//! Operational metrics for the hosted vault, scraped at `/metrics` on the
//! metrics port. Counters follow the drained event stream; gauges are
//! refreshed from the vault summary.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] under the
//! `meridian` prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use meridian_engine::events::{EventRecord, VaultEvent};
use meridian_engine::vault::VaultSummary;

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub deposits_total: IntCounter,
    pub withdrawals_total: IntCounter,
    pub crosschain_applied_total: IntCounter,
    pub strategy_failures_total: IntCounter,
    pub rebalances_total: IntCounter,
    pub slippage_rejections_total: IntCounter,
    pub total_assets: IntGauge,
    pub total_shares: IntGauge,
    pub share_price_micros: IntGauge,
    pub idle_assets: IntGauge,
    pub crosschain_duplicates: IntGauge,
    pub outbound_unconfirmed: IntGauge,
    /// Wall time of API requests that enter the vault, in seconds.
    pub request_latency_seconds: Histogram,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> prometheus::Result<C> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("meridian".into()), None)?;
        let counter = |name: &str, help: &str| register(&registry, IntCounter::new(name, help)?);
        let gauge = |name: &str, help: &str| register(&registry, IntGauge::new(name, help)?);

        Ok(Self {
            deposits_total: counter("deposits_total", "Deposits and mints, local and cross-chain")?,
            withdrawals_total: counter("withdrawals_total", "Withdrawals, redemptions and emergency exits")?,
            crosschain_applied_total: counter(
                "crosschain_applied_total",
                "Inbound cross-chain messages applied",
            )?,
            strategy_failures_total: counter(
                "strategy_failures_total",
                "Strategy calls that failed and were skipped",
            )?,
            rebalances_total: counter("rebalances_total", "Completed rebalances")?,
            slippage_rejections_total: counter(
                "slippage_rejections_total",
                "Withdrawals rejected by slippage protection",
            )?,
            total_assets: gauge("total_assets", "Idle plus invested assets")?,
            total_shares: gauge("total_shares", "Outstanding vault shares")?,
            share_price_micros: gauge("share_price_micros", "Assets per whole share, in millionths")?,
            idle_assets: gauge("idle_assets", "Assets held by the vault itself")?,
            crosschain_duplicates: gauge(
                "crosschain_duplicates",
                "Redelivered inbound messages ignored since start",
            )?,
            outbound_unconfirmed: gauge(
                "outbound_unconfirmed",
                "Outbound messages not yet confirmed by the destination",
            )?,
            request_latency_seconds: register(
                &registry,
                Histogram::with_opts(
                    HistogramOpts::new("request_latency_seconds", "Vault operation latency in seconds")
                        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
                )?,
            )?,
            registry,
        })
    }

    /// Counts one drained event.
    pub fn observe_event(&self, record: &EventRecord) {
        match &record.event {
            VaultEvent::Deposit { .. } => self.deposits_total.inc(),
            VaultEvent::Withdraw { .. } | VaultEvent::EmergencyWithdraw { .. } => {
                self.withdrawals_total.inc()
            }
            VaultEvent::CrossChainDepositCompleted { .. }
            | VaultEvent::CrossChainWithdrawCompleted { .. }
            | VaultEvent::CrossChainSyncReceived { .. } => self.crosschain_applied_total.inc(),
            VaultEvent::Rebalanced { .. } => self.rebalances_total.inc(),
            VaultEvent::SlippageProtectionTriggered { .. } => self.slippage_rejections_total.inc(),
            _ => {}
        }
    }

    pub fn observe_summary(&self, summary: &VaultSummary) {
        self.total_assets.set(gauge_value(summary.total_assets));
        self.total_shares.set(gauge_value(summary.total_supply));
        self.share_price_micros.set(gauge_value(summary.share_price_micros));
        self.idle_assets.set(gauge_value(summary.idle));
        self.crosschain_duplicates.set(gauge_value(summary.inbound_duplicates));
        self.outbound_unconfirmed
            .set(gauge_value(summary.outbound_unconfirmed as u64));
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
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
