//! Wallet-initiated withdrawal state machine (C6).
//!
//! `pending -> selected -> confirmed`, or `pending|selected -> aborted`.
//! Confirmation performs the actual ledger transfer and registers the
//! resulting credit as an incoming reserve via [`crate::exchange`].

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::accounts::{self, AccountError};
use crate::amount::Amount;
use crate::db::models::WithdrawalRow;
use crate::exchange::{self, ExchangeError};
use crate::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error("unknown account")]
    UnknownAccount,
    #[error("exchange accounts cannot create withdrawals")]
    AccountIsExchange,
    #[error("insufficient balance")]
    BalanceInsufficient,
    #[error("unknown withdrawal operation")]
    UnknownOperation,
    #[error("already selected with a different exchange or reserve")]
    AlreadySelected,
    #[error("reserve public key already in use")]
    RequestPubReuse,
    #[error("selected account is not a known exchange")]
    AccountIsNotExchange,
    #[error("operation has not been selected yet")]
    NotSelected,
    #[error("operation was already confirmed")]
    AlreadyConfirmed,
    #[error("operation was already aborted")]
    AlreadyAborted,
    #[error("a TAN confirmation is required")]
    TanRequired,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<AccountError> for WithdrawalError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::UnknownAccount => WithdrawalError::UnknownAccount,
            AccountError::Database(err) => WithdrawalError::Database(err),
            _ => WithdrawalError::UnknownAccount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Pending,
    Selected,
    Confirmed,
    Aborted,
}

pub fn status_of(row: &WithdrawalRow) -> WithdrawalStatus {
    if row.aborted {
        WithdrawalStatus::Aborted
    } else if row.confirmation_done {
        WithdrawalStatus::Confirmed
    } else if row.selection_done {
        WithdrawalStatus::Selected
    } else {
        WithdrawalStatus::Pending
    }
}

pub async fn create(
    pool: &PgPool,
    login: &str,
    uuid: Uuid,
    amount: Amount,
    subject: &str,
    now: DateTime<Utc>,
) -> Result<(), WithdrawalError> {
    let account = accounts::get_account_by_login(pool, login).await?;
    if account.is_taler_exchange {
        return Err(WithdrawalError::AccountIsExchange);
    }
    let balance = Amount::new(account.balance_val as u64, account.balance_frac as u32)
        .map_err(LedgerError::from)?;
    let max_debt = Amount::new(account.max_debt_val as u64, account.max_debt_frac as u32)
        .map_err(LedgerError::from)?;
    if account.has_debt {
        let new_debt = balance.checked_add(amount).map_err(LedgerError::from)?;
        if new_debt > max_debt {
            return Err(WithdrawalError::BalanceInsufficient);
        }
    } else if balance < amount {
        let (deficit, _) = amount.checked_sub(balance);
        if deficit > max_debt {
            return Err(WithdrawalError::BalanceInsufficient);
        }
    }

    sqlx::query(
        r#"INSERT INTO withdrawal_operations
               (uuid, wallet_account_id, amount_val, amount_frac, subject, creation_time)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(uuid)
    .bind(account.id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &PgPool, uuid: Uuid) -> Result<WithdrawalRow, WithdrawalError> {
    sqlx::query_as::<_, WithdrawalRow>("SELECT * FROM withdrawal_operations WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(pool)
        .await?
        .ok_or(WithdrawalError::UnknownOperation)
}

pub async fn set_details(
    pool: &PgPool,
    uuid: Uuid,
    exchange_payto: &str,
    reserve_pub: &[u8],
) -> Result<(), WithdrawalError> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, WithdrawalRow>(
        "SELECT * FROM withdrawal_operations WHERE uuid = $1 FOR UPDATE",
    )
    .bind(uuid)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(WithdrawalError::UnknownOperation)?;

    if row.aborted {
        return Err(WithdrawalError::AlreadyAborted);
    }
    if row.selection_done {
        if row.selected_exchange_payto.as_deref() == Some(exchange_payto)
            && row.reserve_pub.as_deref() == Some(reserve_pub)
        {
            return Ok(());
        }
        return Err(WithdrawalError::AlreadySelected);
    }

    let exchange = accounts::get_account_by_payto(pool, exchange_payto)
        .await
        .map_err(|_| WithdrawalError::AccountIsNotExchange)?;
    if !exchange.is_taler_exchange {
        return Err(WithdrawalError::AccountIsNotExchange);
    }

    let reuse: Option<(i64,)> = sqlx::query_as(
        r#"SELECT 1::bigint FROM exchange_incoming_transactions WHERE reserve_pub = $1
           UNION ALL
           SELECT 1::bigint FROM withdrawal_operations WHERE reserve_pub = $1 AND uuid <> $2"#,
    )
    .bind(reserve_pub)
    .bind(uuid)
    .fetch_optional(&mut *tx)
    .await?;
    if reuse.is_some() {
        return Err(WithdrawalError::RequestPubReuse);
    }

    sqlx::query(
        r#"UPDATE withdrawal_operations
           SET selection_done = TRUE, selected_exchange_payto = $1, reserve_pub = $2
           WHERE uuid = $3"#,
    )
    .bind(exchange_payto)
    .bind(reserve_pub)
    .bind(uuid)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn abort(pool: &PgPool, uuid: Uuid) -> Result<(), WithdrawalError> {
    let row = get(pool, uuid).await?;
    if row.confirmation_done {
        return Err(WithdrawalError::AlreadyConfirmed);
    }
    if row.aborted {
        return Ok(());
    }
    sqlx::query("UPDATE withdrawal_operations SET aborted = TRUE WHERE uuid = $1")
        .bind(uuid)
        .execute(pool)
        .await?;
    Ok(())
}

/// Confirms a selected withdrawal: debits the exchange, credits the wallet,
/// and registers the resulting credit as an incoming reserve. A confirmed
/// withdrawal replayed here is silently a no-op (§9 open question, resolved
/// toward idempotent replay: no second ledger post, no error).
pub async fn confirm(
    pool: &PgPool,
    uuid: Uuid,
    now: DateTime<Utc>,
    has_tan_channel: bool,
    is_2fa: bool,
) -> Result<(), WithdrawalError> {
    let row = get(pool, uuid).await?;
    if row.confirmation_done {
        return Ok(());
    }
    if row.aborted {
        return Err(WithdrawalError::AlreadyAborted);
    }
    if !row.selection_done {
        return Err(WithdrawalError::NotSelected);
    }
    if has_tan_channel && !is_2fa {
        return Err(WithdrawalError::TanRequired);
    }

    let exchange_payto = row
        .selected_exchange_payto
        .as_deref()
        .ok_or(WithdrawalError::NotSelected)?;
    let exchange = accounts::get_account_by_payto(pool, exchange_payto).await?;
    let reserve_pub = row.reserve_pub.clone().ok_or(WithdrawalError::NotSelected)?;
    let wallet = accounts::get_account_by_id(pool, row.wallet_account_id).await?;
    let amount = Amount::new(row.amount_val as u64, row.amount_frac as u32).map_err(LedgerError::from)?;

    let subject = format!("Taler withdrawal {}", hex::encode(&reserve_pub));
    let txn_id = exchange::register_incoming(
        pool,
        wallet.id,
        exchange.id,
        amount,
        &subject,
        &reserve_pub,
        &wallet.payto,
        &exchange.payto,
        now,
    )
    .await?;

    sqlx::query(
        "UPDATE withdrawal_operations SET confirmation_done = TRUE, credit_row = $1 WHERE uuid = $2",
    )
    .bind(txn_id)
    .bind(uuid)
    .execute(pool)
    .await?;
    let _ = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(selection_done: bool, aborted: bool, confirmation_done: bool) -> WithdrawalRow {
        WithdrawalRow {
            uuid: Uuid::nil(),
            wallet_account_id: 1,
            amount_val: 0,
            amount_frac: 0,
            selection_done,
            aborted,
            confirmation_done,
            selected_exchange_payto: None,
            reserve_pub: None,
            subject: String::new(),
            credit_row: None,
            creation_time: Utc::now(),
        }
    }

    #[test]
    fn status_of_follows_precedence_aborted_then_confirmed_then_selected() {
        assert_eq!(status_of(&row(false, false, false)), WithdrawalStatus::Pending);
        assert_eq!(status_of(&row(true, false, false)), WithdrawalStatus::Selected);
        assert_eq!(status_of(&row(true, false, true)), WithdrawalStatus::Confirmed);
        assert_eq!(status_of(&row(true, true, false)), WithdrawalStatus::Aborted);
    }
}
