//! # Prometheus Metrics
//!
//! Transaction counters for the host. All metrics live in a dedicated
//! [`prometheus::Registry`] with the `coinvault` prefix.

use coinvault_escrow::TransactionResult;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric handles for one host process.
#[derive(Clone)]
pub struct HostMetrics {
    registry: Registry,
    /// Transactions by kind and final status.
    pub transactions_total: IntCounterVec,
    /// Value moved through the ledger by non-rejected transactions.
    pub escrow_value_total: IntCounter,
    /// Wall time of one coordinator call.
    pub transaction_latency_seconds: Histogram,
    /// Identity lock entries currently tracked.
    pub tracked_identity_locks: IntGauge,
}

impl HostMetrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("coinvault".into()), None)?;

        let transactions_total = IntCounterVec::new(
            Opts::new("transactions_total", "Transactions by kind and final status"),
            &["kind", "status"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let escrow_value_total = IntCounter::new(
            "escrow_value_total",
            "Base units moved through the ledger by committed or rolled back transactions",
        )?;
        registry.register(Box::new(escrow_value_total.clone()))?;

        let transaction_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("transaction_latency_seconds", "Coordinator call latency in seconds")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(transaction_latency_seconds.clone()))?;

        let tracked_identity_locks =
            IntGauge::new("tracked_identity_locks", "Identity lock entries currently tracked")?;
        registry.register(Box::new(tracked_identity_locks.clone()))?;

        Ok(Self {
            registry,
            transactions_total,
            escrow_value_total,
            transaction_latency_seconds,
            tracked_identity_locks,
        })
    }

    /// Records one finished transaction.
    pub fn observe(&self, result: &TransactionResult, elapsed: Duration) {
        self.transactions_total
            .with_label_values(&[result.kind.as_str(), result.status.as_str()])
            .inc();
        if result.money_safe {
            self.escrow_value_total.inc_by(result.escrowed_value);
        }
        self.transaction_latency_seconds.observe(elapsed.as_secs_f64());
    }

    /// Encodes all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
