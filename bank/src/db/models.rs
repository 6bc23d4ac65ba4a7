//! Row shapes returned by the DAO functions in each component module.
//!
//! Amounts are read back as separate `*_val`/`*_frac` columns and assembled
//! into [`crate::amount::Amount`] in the component module that owns the
//! query, the same way the teacher reads `amount::TEXT as amount` and parses
//! it — the row struct mirrors the wire shape, the component applies meaning.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct CustomerRow {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub cashout_payto: Option<String>,
    pub tan_channel: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: i64,
    pub customer_id: i64,
    pub payto: String,
    pub is_public: bool,
    pub is_taler_exchange: bool,
    pub balance_val: i64,
    pub balance_frac: i32,
    pub has_debt: bool,
    pub max_debt_val: i64,
    pub max_debt_frac: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: i64,
    pub account_id: i64,
    pub counterpart_id: i64,
    pub direction: String,
    pub amount_val: i64,
    pub amount_frac: i32,
    pub subject: String,
    pub debtor_payto: String,
    pub debtor_name: String,
    pub creditor_payto: String,
    pub creditor_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalRow {
    pub uuid: Uuid,
    pub wallet_account_id: i64,
    pub amount_val: i64,
    pub amount_frac: i32,
    pub selection_done: bool,
    pub aborted: bool,
    pub confirmation_done: bool,
    pub selected_exchange_payto: Option<String>,
    pub reserve_pub: Option<Vec<u8>>,
    pub subject: String,
    pub credit_row: Option<i64>,
    pub creation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CashoutRow {
    pub id: i64,
    pub request_uid: Vec<u8>,
    pub amount_debit_val: i64,
    pub amount_debit_frac: i32,
    pub amount_credit_val: i64,
    pub amount_credit_frac: i32,
    pub subject: String,
    pub creation_time: DateTime<Utc>,
    pub debit_account_id: i64,
    pub local_transaction: Option<i64>,
    pub aborted: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct TanChallengeRow {
    pub id: i64,
    pub body: String,
    pub op: String,
    pub code: String,
    pub creation: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub retransmission: Option<DateTime<Utc>>,
    pub confirmation: Option<DateTime<Utc>>,
    pub retry_counter: i32,
    pub customer_id: i64,
    pub override_channel: Option<String>,
    pub override_info: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ConversionConfigRow {
    pub direction: String,
    pub ratio_val: i64,
    pub ratio_frac: i32,
    pub fee_val: i64,
    pub fee_frac: i32,
    pub tiny_val: i64,
    pub tiny_frac: i32,
    pub min_val: i64,
    pub min_frac: i32,
    pub rounding_mode: String,
}
