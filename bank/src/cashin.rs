//! Cashin (C9): reacts to an adapter-recorded fiat credit bearing a reserve
//! public key, converts it, and posts a regional credit to the exchange.
//!
//! Modeled as application code co-committed with the triggering insert,
//! rather than a database trigger on `talerable_incoming_transactions`,
//! per the §9 coupling design note.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use crate::accounts::{self, ADMIN_LOGIN};
use crate::amount::{self, Amount, AmountFault, ConversionConfig, Converted};
use crate::exchange;
use crate::ledger::LedgerError;
use crate::stats::{self, PaymentKind};

#[derive(Debug, Error)]
pub enum CashinError {
    #[error("no conversion configuration for cashin")]
    NoConfig,
    #[error("no exchange account configured to receive cashin credits")]
    NoAccount,
    #[error("insufficient balance on the source account")]
    BalanceInsufficient,
    #[error("amount arithmetic fault: {0}")]
    Amount(#[from] AmountFault),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Records one fiat-side incoming transaction bearing `reserve_pub`, then
/// immediately processes it. Returns `Ok(true)` if it was converted and
/// posted, `Ok(false)` if it was too small and bounced.
pub async fn record_and_process(
    pool: &PgPool,
    cfg: Option<&ConversionConfig>,
    exchange_payto: &str,
    reserve_pub: &[u8],
    fiat_amount: Amount,
    now: DateTime<Utc>,
) -> Result<bool, CashinError> {
    let cfg = cfg.ok_or(CashinError::NoConfig)?;

    let mut tx = pool.begin().await?;
    let incoming_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO talerable_incoming_transactions (reserve_pub, amount_val, amount_frac, created_at)
           VALUES ($1, $2, $3, $4) RETURNING id"#,
    )
    .bind(reserve_pub)
    .bind(fiat_amount.val as i64)
    .bind(fiat_amount.frac as i32)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    match amount::to(fiat_amount, cfg)? {
        Converted::TooSmall => {
            sqlx::query(
                r#"INSERT INTO bounced_fiat_transactions (incoming_id, amount_val, amount_frac, created_at)
                   VALUES ($1, $2, $3, $4)"#,
            )
            .bind(incoming_id)
            .bind(fiat_amount.val as i64)
            .bind(fiat_amount.frac as i32)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE talerable_incoming_transactions SET bounced = TRUE, processed = TRUE WHERE id = $1",
            )
            .bind(incoming_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(false)
        }
        Converted::Ok(regional_amount) => {
            let exchange = accounts::get_account_by_payto(pool, exchange_payto)
                .await
                .map_err(|_| CashinError::NoAccount)?;
            let admin = accounts::get_account_by_login(pool, ADMIN_LOGIN)
                .await
                .map_err(|_| CashinError::NoAccount)?;
            let subject = format!("Cashin {}", hex::encode(reserve_pub));

            sqlx::query(
                "UPDATE talerable_incoming_transactions SET processed = TRUE WHERE id = $1",
            )
            .bind(incoming_id)
            .execute(&mut *tx)
            .await?;

            exchange::register_incoming_in_tx(
                &mut tx,
                admin.id,
                exchange.id,
                regional_amount,
                &subject,
                reserve_pub,
                &admin.payto,
                &exchange.payto,
                now,
            )
            .await
            .map_err(|e| match e {
                LedgerError::DebtCeilingExceeded => CashinError::BalanceInsufficient,
                other => CashinError::Ledger(other),
            })?;

            stats::record(
                &mut tx,
                PaymentKind::Cashin,
                regional_amount,
                Some(fiat_amount),
                now,
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        }
    }
}
