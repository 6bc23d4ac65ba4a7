//! Garbage collector (C12): four independent, idempotently re-runnable
//! cleanup steps, run as a daemon-lifetime task on a fixed interval.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct GcThresholds {
    pub abort_after: Duration,
    pub clean_after: Duration,
    pub delete_after: Duration,
}

impl Default for GcThresholds {
    fn default() -> Self {
        Self {
            abort_after: Duration::hours(1),
            clean_after: Duration::days(7),
            delete_after: Duration::days(365),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GcReport {
    pub withdrawals_aborted: u64,
    pub rows_cleaned: u64,
    pub transactions_deleted: u64,
    pub customers_deleted: u64,
}

/// Runs all four cleanup steps once and returns counts removed per step.
pub async fn run_once(
    pool: &PgPool,
    thresholds: &GcThresholds,
    now: DateTime<Utc>,
) -> Result<GcReport, sqlx::Error> {
    let mut report = GcReport::default();

    let abort_cutoff = now - thresholds.abort_after;
    let result = sqlx::query(
        "UPDATE withdrawal_operations SET aborted = TRUE WHERE NOT aborted AND NOT confirmation_done AND creation_time < $1",
    )
    .bind(abort_cutoff)
    .execute(pool)
    .await?;
    report.withdrawals_aborted = result.rows_affected();

    let clean_cutoff = now - thresholds.clean_after;
    let result = sqlx::query(
        "DELETE FROM withdrawal_operations WHERE aborted AND creation_time < $1",
    )
    .bind(clean_cutoff)
    .execute(pool)
    .await?;
    report.rows_cleaned += result.rows_affected();
    let result = sqlx::query("DELETE FROM tan_challenges WHERE expiration < $1")
        .bind(clean_cutoff)
        .execute(pool)
        .await?;
    report.rows_cleaned += result.rows_affected();
    let result = sqlx::query("DELETE FROM bearer_tokens WHERE expiration < $1")
        .bind(clean_cutoff)
        .execute(pool)
        .await?;
    report.rows_cleaned += result.rows_affected();

    let delete_cutoff = now - thresholds.delete_after;
    let result = sqlx::query("DELETE FROM bank_transactions WHERE created_at < $1")
        .bind(delete_cutoff)
        .execute(pool)
        .await?;
    report.transactions_deleted = result.rows_affected();

    let result = sqlx::query(
        r#"DELETE FROM customers c
           WHERE c.deleted_at IS NOT NULL
             AND NOT EXISTS (
                 SELECT 1 FROM accounts a
                 JOIN bank_transactions t ON t.account_id = a.id
                 WHERE a.customer_id = c.id
             )"#,
    )
    .execute(pool)
    .await?;
    report.customers_deleted = result.rows_affected();

    Ok(report)
}

/// Runs [`run_once`] on a fixed interval until `shutdown` fires.
pub async fn run(
    pool: PgPool,
    thresholds: GcThresholds,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("garbage collector shutting down");
                return;
            }
            _ = ticker.tick() => {
                match run_once(&pool, &thresholds, Utc::now()).await {
                    Ok(report) => info!(
                        withdrawals_aborted = report.withdrawals_aborted,
                        rows_cleaned = report.rows_cleaned,
                        transactions_deleted = report.transactions_deleted,
                        customers_deleted = report.customers_deleted,
                        "garbage collection pass complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "garbage collection pass failed"),
                }
            }
        }
    }
}
