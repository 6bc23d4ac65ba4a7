//! Customer + account registry (C3).
//!
//! One customer owns exactly one account, created together. Reconfiguration
//! goes through a whitelisted-column builder (§9's "dynamic SQL for partial
//! updates" design note) so construction is infallible and only the
//! execution can fail.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;

use crate::amount::Amount;
use crate::db::models::{AccountRow, CustomerRow};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("login already in use")]
    LoginReuse,
    #[error("payto already in use")]
    PayToReuse,
    #[error("unknown account")]
    UnknownAccount,
    #[error("account has a non-zero balance")]
    BalanceNotZero,
    #[error("a TAN confirmation is required for this operation")]
    TanRequired,
    #[error("only an admin may change the debt limit")]
    NonAdminDebtLimit,
    #[error("only an admin may change the cashout destination")]
    NonAdminCashout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Reserved login whose account sources bonuses/admin credits and sinks
/// cashout debits.
pub const ADMIN_LOGIN: &str = "admin";

pub struct NewCustomer<'a> {
    pub login: &'a str,
    pub password_hash: &'a str,
    pub name: &'a str,
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub cashout_payto: Option<&'a str>,
    pub tan_channel: Option<&'a str>,
    pub max_debt: Amount,
}

/// Creates a customer and its 1:1 account in one transaction.
pub async fn create_customer(
    pool: &PgPool,
    new: NewCustomer<'_>,
) -> Result<(i64, i64), AccountError> {
    let mut tx = pool.begin().await?;

    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM customers WHERE login = $1")
        .bind(new.login)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        return Err(AccountError::LoginReuse);
    }

    let customer_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO customers (login, password_hash, name, email, phone, cashout_payto, tan_channel)
           VALUES ($1, $2, $3, $4, $5, $6, $7::tan_enum) RETURNING id"#,
    )
    .bind(new.login)
    .bind(new.password_hash)
    .bind(new.name)
    .bind(new.email)
    .bind(new.phone)
    .bind(new.cashout_payto)
    .bind(new.tan_channel)
    .fetch_one(&mut *tx)
    .await?;

    let payto = format!("payto://internal/{login}", login = new.login);
    let payto_taken: Option<(i64,)> = sqlx::query_as("SELECT id FROM accounts WHERE payto = $1")
        .bind(&payto)
        .fetch_optional(&mut *tx)
        .await?;
    if payto_taken.is_some() {
        return Err(AccountError::PayToReuse);
    }

    let account_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO accounts (customer_id, payto, max_debt_val, max_debt_frac)
           VALUES ($1, $2, $3, $4) RETURNING id"#,
    )
    .bind(customer_id)
    .bind(&payto)
    .bind(new.max_debt.val as i64)
    .bind(new.max_debt.frac as i32)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok((customer_id, account_id))
}

pub async fn get_account_by_login(
    pool: &PgPool,
    login: &str,
) -> Result<AccountRow, AccountError> {
    sqlx::query_as::<_, AccountRow>(
        r#"SELECT a.* FROM accounts a JOIN customers c ON c.id = a.customer_id
           WHERE c.login = $1 AND c.deleted_at IS NULL"#,
    )
    .bind(login)
    .fetch_optional(pool)
    .await?
    .ok_or(AccountError::UnknownAccount)
}

pub async fn get_account_by_payto(
    pool: &PgPool,
    payto: &str,
) -> Result<AccountRow, AccountError> {
    sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE payto = $1")
        .bind(payto)
        .fetch_optional(pool)
        .await?
        .ok_or(AccountError::UnknownAccount)
}

pub async fn get_account_by_id(pool: &PgPool, id: i64) -> Result<AccountRow, AccountError> {
    sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AccountError::UnknownAccount)
}

pub async fn get_customer_by_login(
    pool: &PgPool,
    login: &str,
) -> Result<CustomerRow, AccountError> {
    sqlx::query_as::<_, CustomerRow>("SELECT * FROM customers WHERE login = $1")
        .bind(login)
        .fetch_optional(pool)
        .await?
        .ok_or(AccountError::UnknownAccount)
}

pub async fn list_public_accounts(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<AccountRow>, AccountError> {
    let rows = sqlx::query_as::<_, AccountRow>(
        "SELECT * FROM accounts WHERE is_public = TRUE ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Whitelisted columns a [`ReconfigurePatch`] may touch, matching §9's
/// closed-enumeration builder design note.
#[derive(Debug, Clone)]
pub enum AccountField {
    Name(String),
    Email(Option<String>),
    Phone(Option<String>),
    CashoutPayto(Option<String>),
    TanChannel(Option<String>),
    IsPublic(bool),
    MaxDebt(Amount),
}

/// Applies a whitelisted set of column changes to one account/customer pair.
/// Construction of the patch is infallible; only `apply` can fail.
#[derive(Debug, Clone, Default)]
pub struct ReconfigurePatch {
    fields: Vec<AccountField>,
}

impl ReconfigurePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, field: AccountField) -> Self {
        self.fields.push(field);
        self
    }

    pub async fn apply(self, pool: &PgPool, login: &str) -> Result<(), AccountError> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let mut tx = pool.begin().await?;
        let customer_id: i64 = sqlx::query_scalar("SELECT id FROM customers WHERE login = $1")
            .bind(login)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AccountError::UnknownAccount)?;

        let mut customer_cols: Vec<(&'static str, CustomerPatchValue)> = Vec::new();
        let mut account_cols: Vec<(&'static str, AccountPatchValue)> = Vec::new();

        for field in &self.fields {
            match field {
                AccountField::Name(v) => {
                    customer_cols.push(("name", CustomerPatchValue::Text(v.clone())))
                }
                AccountField::Email(v) => {
                    customer_cols.push(("email", CustomerPatchValue::OptText(v.clone())))
                }
                AccountField::Phone(v) => {
                    customer_cols.push(("phone", CustomerPatchValue::OptText(v.clone())))
                }
                AccountField::CashoutPayto(v) => {
                    customer_cols.push(("cashout_payto", CustomerPatchValue::OptText(v.clone())))
                }
                AccountField::TanChannel(v) => {
                    customer_cols.push(("tan_channel", CustomerPatchValue::OptText(v.clone())))
                }
                AccountField::IsPublic(v) => {
                    account_cols.push(("is_public", AccountPatchValue::Bool(*v)))
                }
                AccountField::MaxDebt(v) => {
                    account_cols.push(("max_debt", AccountPatchValue::Amount(*v)))
                }
            }
        }

        if !customer_cols.is_empty() {
            apply_customer_patch(&mut tx, customer_id, &customer_cols).await?;
        }
        if !account_cols.is_empty() {
            apply_account_patch(&mut tx, customer_id, &account_cols).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

enum CustomerPatchValue {
    Text(String),
    OptText(Option<String>),
}

enum AccountPatchValue {
    Bool(bool),
    Amount(Amount),
}

async fn apply_customer_patch(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    customer_id: i64,
    cols: &[(&'static str, CustomerPatchValue)],
) -> Result<(), AccountError> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE customers SET ");
    let mut first = true;
    for (col, val) in cols {
        if !first {
            qb.push(", ");
        }
        first = false;
        qb.push(format!("{col} = "));
        match val {
            CustomerPatchValue::Text(v) => {
                qb.push_bind(v.clone());
            }
            CustomerPatchValue::OptText(v) => {
                qb.push_bind(v.clone());
            }
        }
    }
    qb.push(" WHERE id = ");
    qb.push_bind(customer_id);
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

async fn apply_account_patch(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    customer_id: i64,
    cols: &[(&'static str, AccountPatchValue)],
) -> Result<(), AccountError> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE accounts SET ");
    let mut first = true;
    for (col, val) in cols {
        if !first {
            qb.push(", ");
        }
        first = false;
        match val {
            AccountPatchValue::Bool(v) => {
                qb.push(format!("{col} = "));
                qb.push_bind(*v);
            }
            AccountPatchValue::Amount(v) => {
                qb.push(format!("{col}_val = "));
                qb.push_bind(v.val as i64);
                qb.push(format!(", {col}_frac = "));
                qb.push_bind(v.frac as i32);
            }
        }
    }
    qb.push(" WHERE customer_id = ");
    qb.push_bind(customer_id);
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

/// Soft-deletes a customer: requires a zero balance and, when a TAN channel
/// is configured, that `confirmed` already holds (checked by the caller via
/// [`crate::tan`] before invoking this).
pub async fn soft_delete_customer(
    pool: &PgPool,
    login: &str,
    now: DateTime<Utc>,
) -> Result<(), AccountError> {
    let account = get_account_by_login(pool, login).await?;
    if account.balance_val != 0 || account.balance_frac != 0 {
        return Err(AccountError::BalanceNotZero);
    }
    sqlx::query("UPDATE customers SET deleted_at = $1 WHERE login = $2")
        .bind(now)
        .bind(login)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconfigure_patch_builds_without_touching_db() {
        let patch = ReconfigurePatch::new()
            .push(AccountField::Name("Alice".into()))
            .push(AccountField::MaxDebt(Amount::new(100, 0).unwrap()));
        assert_eq!(patch.fields.len(), 2);
    }
}
