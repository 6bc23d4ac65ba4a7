//! Prometheus metrics exposed over the ambient HTTP surface's `/metrics`
//! route (C13).

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub payments_total: IntCounterVec,
    pub open_withdrawals: IntGauge,
    pub open_cashouts: IntGauge,
    pub pending_tan_challenges: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let payments_total = IntCounterVec::new(
            Opts::new("bank_payments_total", "Completed payments by kind"),
            &["kind"],
        )
        .expect("metric definition must be valid");
        registry
            .register(Box::new(payments_total.clone()))
            .expect("metric registration must not be called twice");

        let open_withdrawals = IntGauge::new(
            "bank_open_withdrawals",
            "Withdrawals in pending or selected state",
        )
        .expect("metric definition must be valid");
        registry
            .register(Box::new(open_withdrawals.clone()))
            .expect("metric registration must not be called twice");

        let open_cashouts = IntGauge::new(
            "bank_open_cashouts",
            "Cashouts not yet confirmed or aborted",
        )
        .expect("metric definition must be valid");
        registry
            .register(Box::new(open_cashouts.clone()))
            .expect("metric registration must not be called twice");

        let pending_tan_challenges = IntGauge::new(
            "bank_pending_tan_challenges",
            "TAN challenges awaiting confirmation",
        )
        .expect("metric definition must be valid");
        registry
            .register(Box::new(pending_tan_challenges.clone()))
            .expect("metric registration must not be called twice");

        Self {
            registry,
            payments_total,
            open_withdrawals,
            open_cashouts,
            pending_tan_challenges,
        }
    }

    pub fn record_payment(&self, kind: &str) {
        self.payments_total.with_label_values(&[kind]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Refreshes the queue-depth gauges from the database. Called periodically
/// by the ambient HTTP surface before rendering `/metrics`.
pub async fn refresh_gauges(metrics: &Metrics, pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    let open_withdrawals: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM withdrawal_operations WHERE NOT aborted AND NOT confirmation_done",
    )
    .fetch_one(pool)
    .await?;
    metrics.open_withdrawals.set(open_withdrawals);

    let open_cashouts: i64 =
        sqlx::query_scalar("SELECT count(*) FROM cashout_operations WHERE NOT aborted AND local_transaction IS NULL")
            .fetch_one(pool)
            .await?;
    metrics.open_cashouts.set(open_cashouts);

    let pending_tan: i64 =
        sqlx::query_scalar("SELECT count(*) FROM tan_challenges WHERE confirmation IS NULL")
            .fetch_one(pool)
            .await?;
    metrics.pending_tan_challenges.set(pending_tan);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_panicking() {
        let metrics = Metrics::new();
        metrics.record_payment("cashin");
        assert_eq!(metrics.payments_total.with_label_values(&["cashin"]).get(), 1);
    }
}
