//! Exchange transfer gateway (C7): outgoing WTID-keyed transfers and
//! incoming reserve-pub-keyed registrations, each wrapping a ledger post.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::accounts::{self, AccountError};
use crate::amount::Amount;
use crate::ledger::{self, LedgerError};
use crate::stats::{self, PaymentKind};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("unknown exchange account")]
    UnknownExchange,
    #[error("account is not flagged as an exchange")]
    NotAnExchange,
    #[error("unknown creditor account")]
    UnknownCreditor,
    #[error("unknown debtor account")]
    UnknownDebtor,
    #[error("both parties are exchange accounts")]
    BothPartyAreExchange,
    #[error("request_uid reused with a different wtid or payload")]
    ReserveUidReuse,
    #[error("reserve public key already registered")]
    ReservePubReuse,
    #[error("insufficient balance")]
    BalanceInsufficient,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<AccountError> for ExchangeError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::UnknownAccount => ExchangeError::UnknownCreditor,
            AccountError::Database(err) => ExchangeError::Database(err),
            _ => ExchangeError::UnknownCreditor,
        }
    }
}

fn map_balance(e: LedgerError) -> ExchangeError {
    match e {
        LedgerError::DebtCeilingExceeded => ExchangeError::BalanceInsufficient,
        other => ExchangeError::Ledger(other),
    }
}

/// Outgoing transfer: `login`'s account (the exchange) debits to `credit_payto`.
/// Idempotent on `request_uid`: a replay with the same `wtid` and amount
/// returns the original `(row, creation_time)`; a replay with a different
/// `wtid` is a conflict.
#[allow(clippy::too_many_arguments)]
pub async fn transfer(
    pool: &PgPool,
    login: &str,
    request_uid: &[u8],
    wtid: &[u8],
    subject: &str,
    amount: Amount,
    exchange_base_url: &str,
    credit_payto: &str,
    now: DateTime<Utc>,
) -> Result<(i64, DateTime<Utc>), ExchangeError> {
    let exchange = accounts::get_account_by_login(pool, login)
        .await
        .map_err(|_| ExchangeError::UnknownExchange)?;
    if !exchange.is_taler_exchange {
        return Err(ExchangeError::NotAnExchange);
    }
    let creditor = accounts::get_account_by_payto(pool, credit_payto)
        .await
        .map_err(|_| ExchangeError::UnknownCreditor)?;
    if creditor.is_taler_exchange {
        return Err(ExchangeError::BothPartyAreExchange);
    }

    if let Some(existing) = find_outgoing_by_request_uid(pool, request_uid).await? {
        if existing.0 == wtid {
            return Ok((existing.1, existing.2));
        }
        return Err(ExchangeError::ReserveUidReuse);
    }

    let mut tx = pool.begin().await?;
    ledger::transfer(&mut tx, exchange.id, creditor.id, amount)
        .await
        .map_err(map_balance)?;

    let debit_row: i64 = sqlx::query_scalar(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name, created_at)
           VALUES ($1, $2, 'debit', $3, $4, $5, $6, $7, $8, $9, $10)
           RETURNING id"#,
    )
    .bind(exchange.id)
    .bind(creditor.id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(&exchange.payto)
    .bind(login)
    .bind(credit_payto)
    .bind(credit_payto)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    let credit_row: i64 = sqlx::query_scalar(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name, created_at)
           VALUES ($1, $2, 'credit', $3, $4, $5, $6, $7, $8, $9, $10)
           RETURNING id"#,
    )
    .bind(creditor.id)
    .bind(exchange.id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(&exchange.payto)
    .bind(login)
    .bind(credit_payto)
    .bind(credit_payto)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"INSERT INTO exchange_outgoing_transactions
               (request_uid, wtid, exchange_base_url, debit_row, created_at)
           VALUES ($1, $2, $3, $4, $5)"#,
    )
    .bind(request_uid)
    .bind(wtid)
    .bind(exchange_base_url)
    .bind(debit_row)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    ledger::notify_transfer(&mut tx, "outgoing_tx", exchange.id, creditor.id, debit_row, credit_row).await?;

    stats::record(&mut tx, PaymentKind::TalerOut, amount, None, now).await?;

    tx.commit().await?;
    Ok((debit_row, now))
}

async fn find_outgoing_by_request_uid(
    pool: &PgPool,
    request_uid: &[u8],
) -> Result<Option<(Vec<u8>, i64, DateTime<Utc>)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT wtid, debit_row, created_at FROM exchange_outgoing_transactions WHERE request_uid = $1",
    )
    .bind(request_uid)
    .fetch_optional(pool)
    .await
}

/// Incoming reserve registration: `debtor_login` credits the exchange
/// identified by `exchange_payto`, keyed by `reserve_pub`.
pub async fn add_incoming(
    pool: &PgPool,
    exchange_payto: &str,
    debtor_login: &str,
    reserve_pub: &[u8],
    subject: &str,
    amount: Amount,
    now: DateTime<Utc>,
) -> Result<i64, ExchangeError> {
    let exchange = accounts::get_account_by_payto(pool, exchange_payto)
        .await
        .map_err(|_| ExchangeError::UnknownExchange)?;
    if !exchange.is_taler_exchange {
        return Err(ExchangeError::NotAnExchange);
    }
    let debtor = accounts::get_account_by_login(pool, debtor_login)
        .await
        .map_err(|_| ExchangeError::UnknownDebtor)?;
    if debtor.is_taler_exchange {
        return Err(ExchangeError::BothPartyAreExchange);
    }

    let reuse: Option<(i64,)> =
        sqlx::query_as("SELECT credit_row FROM exchange_incoming_transactions WHERE reserve_pub = $1")
            .bind(reserve_pub)
            .fetch_optional(pool)
            .await?;
    if reuse.is_some() {
        return Err(ExchangeError::ReservePubReuse);
    }

    register_incoming(
        pool,
        debtor.id,
        exchange.id,
        amount,
        subject,
        reserve_pub,
        &debtor.payto,
        &exchange.payto,
        now,
    )
    .await
    .map_err(map_balance)
}

/// Shared core of confirming a withdrawal and servicing `addIncoming`:
/// posts a ledger transfer from `debtor_id` to `creditor_id` and registers
/// the resulting credit row under `reserve_pub`, all in one transaction
/// opened and committed here.
#[allow(clippy::too_many_arguments)]
pub async fn register_incoming(
    pool: &PgPool,
    debtor_id: i64,
    creditor_id: i64,
    amount: Amount,
    subject: &str,
    reserve_pub: &[u8],
    debtor_payto: &str,
    creditor_payto: &str,
    now: DateTime<Utc>,
) -> Result<i64, LedgerError> {
    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;
    let debit_row = register_incoming_in_tx(
        &mut tx,
        debtor_id,
        creditor_id,
        amount,
        subject,
        reserve_pub,
        debtor_payto,
        creditor_payto,
        now,
    )
    .await?;
    tx.commit().await?;
    Ok(debit_row)
}

/// Same as [`register_incoming`] but runs inside a transaction the caller
/// already holds open, so it can be co-committed with whatever produced the
/// credit (e.g. cashin's triggering fiat-incoming insert, per §4.5/§9).
#[allow(clippy::too_many_arguments)]
pub async fn register_incoming_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    debtor_id: i64,
    creditor_id: i64,
    amount: Amount,
    subject: &str,
    reserve_pub: &[u8],
    debtor_payto: &str,
    creditor_payto: &str,
    now: DateTime<Utc>,
) -> Result<i64, LedgerError> {
    ledger::transfer(tx, debtor_id, creditor_id, amount).await?;

    let debit_row: i64 = sqlx::query_scalar(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name)
           VALUES ($1, $2, 'debit', $3, $4, $5, $6, $6, $7, $7)
           RETURNING id"#,
    )
    .bind(debtor_id)
    .bind(creditor_id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(debtor_payto)
    .bind(creditor_payto)
    .fetch_one(&mut **tx)
    .await?;

    let credit_row: i64 = sqlx::query_scalar(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name)
           VALUES ($1, $2, 'credit', $3, $4, $5, $6, $6, $7, $7)
           RETURNING id"#,
    )
    .bind(creditor_id)
    .bind(debtor_id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(debtor_payto)
    .bind(creditor_payto)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO exchange_incoming_transactions (reserve_pub, credit_row) VALUES ($1, $2)",
    )
    .bind(reserve_pub)
    .bind(credit_row)
    .execute(&mut **tx)
    .await?;

    ledger::notify_transfer(tx, "bank_tx", debtor_id, creditor_id, debit_row, credit_row).await?;

    stats::record(tx, PaymentKind::TalerIn, amount, None, now).await?;

    Ok(debit_row)
}
