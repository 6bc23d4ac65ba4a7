//! Cashout pipeline (C8): converts, debits the customer against the admin
//! account, and hands the fiat adapter a payout request.
//!
//! The source couples this to the adapter with a database trigger; per the
//! design note in §9 this implementation keeps the link in application code,
//! inserting `initiated_outgoing_transactions` in the same transaction as
//! the debit instead.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::accounts::{self, AccountError, ADMIN_LOGIN};
use crate::amount::{self, Amount, AmountFault, ConversionConfig, Converted};
use crate::ledger::{self, LedgerError};
use crate::stats::{self, PaymentKind};

#[derive(Debug, Error)]
pub enum CashoutError {
    #[error("unknown account")]
    UnknownAccount,
    #[error("exchange accounts cannot cash out")]
    AccountIsExchange,
    #[error("no cashout destination configured for this account")]
    NoCashoutPayto,
    #[error("declared credit amount does not match the configured conversion")]
    BadConversion,
    #[error("a TAN confirmation is required")]
    TanRequired,
    #[error("insufficient balance")]
    BalanceInsufficient,
    #[error("request_uid reused with different parameters")]
    RequestUidReuse,
    #[error("amount arithmetic fault: {0}")]
    Amount(#[from] AmountFault),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<AccountError> for CashoutError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::UnknownAccount => CashoutError::UnknownAccount,
            AccountError::Database(err) => CashoutError::Database(err),
            _ => CashoutError::UnknownAccount,
        }
    }
}

pub struct NewCashout<'a> {
    pub login: &'a str,
    pub request_uid: &'a [u8],
    pub debit_amount: Amount,
    pub credit_amount: Amount,
    pub subject: &'a str,
    pub has_tan_channel: bool,
    pub is_2fa: bool,
}

pub async fn create(
    pool: &PgPool,
    cfg: &ConversionConfig,
    new: NewCashout<'_>,
    now: DateTime<Utc>,
) -> Result<i64, CashoutError> {
    match amount::to(new.debit_amount, cfg)? {
        Converted::Ok(expected) if expected == new.credit_amount => {}
        _ => return Err(CashoutError::BadConversion),
    }

    let account = accounts::get_account_by_login(pool, new.login)
        .await
        .map_err(|_| CashoutError::UnknownAccount)?;
    let customer = accounts::get_customer_by_login(pool, new.login)
        .await
        .map_err(|_| CashoutError::UnknownAccount)?;
    if account.is_taler_exchange {
        return Err(CashoutError::AccountIsExchange);
    }
    if customer.cashout_payto.is_none() {
        return Err(CashoutError::NoCashoutPayto);
    }
    if new.has_tan_channel && !new.is_2fa {
        return Err(CashoutError::TanRequired);
    }

    if let Some(existing) = find_by_request_uid(pool, new.request_uid).await? {
        if existing.1 == new.debit_amount && existing.2 == new.credit_amount {
            return Ok(existing.0);
        }
        return Err(CashoutError::RequestUidReuse);
    }

    let admin = accounts::get_account_by_login(pool, ADMIN_LOGIN).await?;

    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;
    ledger::transfer(&mut tx, account.id, admin.id, new.debit_amount)
        .await
        .map_err(map_balance)?;

    let debit_row: i64 = insert_pair(&mut tx, &account, &admin, new.debit_amount, new.subject, now).await?;

    let cashout_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO cashout_operations
               (request_uid, amount_debit_val, amount_debit_frac, amount_credit_val,
                amount_credit_frac, subject, creation_time, debit_account_id, local_transaction)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
           RETURNING id"#,
    )
    .bind(new.request_uid)
    .bind(new.debit_amount.val as i64)
    .bind(new.debit_amount.frac as i32)
    .bind(new.credit_amount.val as i64)
    .bind(new.credit_amount.frac as i32)
    .bind(new.subject)
    .bind(now)
    .bind(account.id)
    .bind(debit_row)
    .fetch_one(&mut *tx)
    .await?;

    let cashout_payto = customer.cashout_payto.as_deref().unwrap();
    let adapter_request_uid = format!("cashout-{cashout_id}");
    sqlx::query(
        r#"INSERT INTO initiated_outgoing_transactions
               (cashout_id, amount_val, amount_frac, credit_payto, request_uid, created_at)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(cashout_id)
    .bind(new.credit_amount.val as i64)
    .bind(new.credit_amount.frac as i32)
    .bind(cashout_payto)
    .bind(&adapter_request_uid)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    stats::record(
        &mut tx,
        PaymentKind::Cashout,
        new.debit_amount,
        Some(new.credit_amount),
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(cashout_id)
}

fn map_balance(e: LedgerError) -> CashoutError {
    match e {
        LedgerError::DebtCeilingExceeded => CashoutError::BalanceInsufficient,
        other => CashoutError::Ledger(other),
    }
}

async fn insert_pair(
    tx: &mut Transaction<'_, Postgres>,
    debtor: &crate::db::models::AccountRow,
    creditor: &crate::db::models::AccountRow,
    amount: Amount,
    subject: &str,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let debit_row: i64 = sqlx::query_scalar(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name, created_at)
           VALUES ($1, $2, 'debit', $3, $4, $5, $6, $6, $7, $7, $8)
           RETURNING id"#,
    )
    .bind(debtor.id)
    .bind(creditor.id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(&debtor.payto)
    .bind(&creditor.payto)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name, created_at)
           VALUES ($1, $2, 'credit', $3, $4, $5, $6, $6, $7, $7, $8)"#,
    )
    .bind(creditor.id)
    .bind(debtor.id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(&debtor.payto)
    .bind(&creditor.payto)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(debit_row)
}

async fn find_by_request_uid(
    pool: &PgPool,
    request_uid: &[u8],
) -> Result<Option<(i64, Amount, Amount)>, sqlx::Error> {
    let row: Option<(i64, i64, i32, i64, i32)> = sqlx::query_as(
        r#"SELECT id, amount_debit_val, amount_debit_frac, amount_credit_val, amount_credit_frac
           FROM cashout_operations WHERE request_uid = $1"#,
    )
    .bind(request_uid)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id, dv, df, cv, cf)| {
        (
            id,
            Amount::new(dv as u64, df as u32).unwrap_or(Amount::ZERO),
            Amount::new(cv as u64, cf as u32).unwrap_or(Amount::ZERO),
        )
    }))
}

/// Aborts a cashout, permitted any time before `local_transaction` is set
/// (§9 open question, resolved toward "permitted until the debit posts" —
/// once the debit is posted there is nothing left to cancel without a
/// reversing transfer, which is out of scope here).
pub async fn abort(pool: &PgPool, id: i64) -> Result<(), CashoutError> {
    let row: Option<(Option<i64>, bool)> =
        sqlx::query_as("SELECT local_transaction, aborted FROM cashout_operations WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    let (local_transaction, aborted) = row.ok_or(CashoutError::UnknownAccount)?;
    if aborted {
        return Ok(());
    }
    if local_transaction.is_some() {
        return Err(CashoutError::RequestUidReuse);
    }
    sqlx::query("UPDATE cashout_operations SET aborted = TRUE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
