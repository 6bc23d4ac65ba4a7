//! Customer-initiated manual transfer wrapper (C2's `bank_transaction`).
//!
//! Resolves the creditor by payto, rejects `admin` as creditor, gates on
//! 2FA when the debtor has a TAN channel configured, and posts the ledger
//! entry idempotently via [`ledger::post_transaction`]. When the creditor
//! is an exchange account the subject is parsed as a reserve public key and
//! the credit is registered via C7, or bounced in the same transaction per
//! §4.2/S5.

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::accounts::{self, AccountError, ADMIN_LOGIN};
use crate::amount::Amount;
use crate::ledger::{self, LedgerError, NewTransaction, ReserveAction};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unknown debtor account")]
    UnknownDebtor,
    #[error("unknown creditor account")]
    UnknownCreditor,
    #[error("admin cannot be credited by a manual transfer")]
    AdminCreditorRejected,
    #[error("a TAN confirmation is required")]
    TanRequired,
    #[error("insufficient balance")]
    BalanceInsufficient,
    #[error("request_uid reused with a different body")]
    RequestUidReuse,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<AccountError> for TransferError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::Database(err) => TransferError::Database(err),
            _ => TransferError::UnknownDebtor,
        }
    }
}

fn map_ledger(e: LedgerError) -> TransferError {
    match e {
        LedgerError::DebtCeilingExceeded => TransferError::BalanceInsufficient,
        LedgerError::RequestUidReuse => TransferError::RequestUidReuse,
        other => TransferError::Ledger(other),
    }
}

/// A reserve public key is a 32-byte value; a manual transfer to an
/// exchange carries it hex-encoded as the whole subject.
fn parse_reserve_pub(subject: &str) -> Option<Vec<u8>> {
    let bytes = hex::decode(subject.trim()).ok()?;
    (bytes.len() == 32).then_some(bytes)
}

/// Posts a manual transfer from `debtor_login` to the account identified by
/// `creditor_payto`. `request_uid` is optional: omitting it skips
/// idempotent replay detection entirely (a fresh one is minted per call).
#[allow(clippy::too_many_arguments)]
pub async fn bank_transaction(
    pool: &PgPool,
    debtor_login: &str,
    creditor_payto: &str,
    subject: &str,
    amount: Amount,
    request_uid: Option<&[u8]>,
    is_2fa: bool,
) -> Result<i64, TransferError> {
    let debtor = accounts::get_account_by_login(pool, debtor_login)
        .await
        .map_err(|_| TransferError::UnknownDebtor)?;
    let customer = accounts::get_customer_by_login(pool, debtor_login)
        .await
        .map_err(|_| TransferError::UnknownDebtor)?;
    let creditor = accounts::get_account_by_payto(pool, creditor_payto)
        .await
        .map_err(|_| TransferError::UnknownCreditor)?;
    let admin = accounts::get_account_by_login(pool, ADMIN_LOGIN).await?;

    if creditor.id == admin.id {
        return Err(TransferError::AdminCreditorRejected);
    }
    if customer.tan_channel.is_some() && !is_2fa {
        return Err(TransferError::TanRequired);
    }

    if creditor.is_taler_exchange && debtor.is_taler_exchange {
        tracing::info!(
            debtor = debtor_login,
            creditor = creditor_payto,
            "exchange-to-exchange manual transfer"
        );
    }
    let parsed_reserve_pub = (creditor.is_taler_exchange && !debtor.is_taler_exchange)
        .then(|| parse_reserve_pub(subject));
    let reserve_action = parsed_reserve_pub.as_ref().map(|parsed| match parsed {
        Some(reserve_pub) => ReserveAction::Register { reserve_pub },
        None => ReserveAction::MalformedSubject,
    });

    let new = NewTransaction {
        debtor_id: debtor.id,
        creditor_id: creditor.id,
        amount,
        subject,
        debtor_payto: &debtor.payto,
        debtor_name: &debtor.payto,
        creditor_payto: &creditor.payto,
        creditor_name: &creditor.payto,
    };

    let generated_uid;
    let request_uid: &[u8] = match request_uid {
        Some(uid) => uid,
        None => {
            generated_uid = Uuid::new_v4().into_bytes();
            &generated_uid
        }
    };

    ledger::post_transaction(pool, request_uid, &new, reserve_action.as_ref())
        .await
        .map_err(map_ledger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reserve_pub_requires_exactly_32_bytes() {
        let short = hex::encode([1u8; 16]);
        let exact = hex::encode([1u8; 32]);
        assert!(parse_reserve_pub(&short).is_none());
        assert_eq!(parse_reserve_pub(&exact), Some(vec![1u8; 32]));
    }

    #[test]
    fn parse_reserve_pub_rejects_non_hex_subject() {
        assert!(parse_reserve_pub("seed").is_none());
    }
}
