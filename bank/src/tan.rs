//! Two-factor confirmation gate (C5).
//!
//! A challenge is created for a pending operation's serialized `body`,
//! transmitted out-of-band, and confirmed by the customer submitting the
//! `code` back. `confirmation` is write-once; `retry_counter` only ever
//! decreases toward zero.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sqlx::PgPool;
use thiserror::Error;

use crate::db::models::TanChallengeRow;

#[derive(Debug, Error)]
pub enum TanError {
    #[error("unknown challenge")]
    UnknownChallenge,
    #[error("challenge has already been confirmed")]
    AlreadyConfirmed,
    #[error("challenge has expired")]
    Expired,
    #[error("incorrect code")]
    WrongCode,
    #[error("retry counter exhausted")]
    RetriesExhausted,
    #[error("retransmission was requested too soon")]
    RetransmissionTooSoon,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub const DEFAULT_VALIDITY: ChronoDuration = ChronoDuration::minutes(5);
pub const DEFAULT_RETRY_COUNTER: i32 = 3;
pub const MIN_RETRANSMISSION_INTERVAL: ChronoDuration = ChronoDuration::seconds(30);

/// Generates a six-digit numeric code the way one-time codes are normally
/// rendered to a customer: zero-padded, no separators.
pub fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

pub struct NewChallenge<'a> {
    pub customer_id: i64,
    pub op: &'a str,
    pub body: &'a str,
    pub override_channel: Option<&'a str>,
    pub override_info: Option<&'a str>,
}

/// Creates a challenge for `op` bound to a serialized `body` describing the
/// operation it gates, e.g. a withdrawal confirmation payload.
pub async fn create_challenge(
    pool: &PgPool,
    new: NewChallenge<'_>,
    now: DateTime<Utc>,
) -> Result<i64, TanError> {
    let code = generate_code();
    let id: i64 = sqlx::query_scalar(
        r#"INSERT INTO tan_challenges
               (body, op, code, creation, expiration, retry_counter, customer_id,
                override_channel, override_info)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8::tan_enum, $9)
           RETURNING id"#,
    )
    .bind(new.body)
    .bind(new.op)
    .bind(&code)
    .bind(now)
    .bind(now + DEFAULT_VALIDITY)
    .bind(DEFAULT_RETRY_COUNTER)
    .bind(new.customer_id)
    .bind(new.override_channel)
    .bind(new.override_info)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_challenge(pool: &PgPool, id: i64) -> Result<TanChallengeRow, TanError> {
    sqlx::query_as::<_, TanChallengeRow>("SELECT * FROM tan_challenges WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(TanError::UnknownChallenge)
}

/// Records that the code was (re)sent, throttled to at most one
/// retransmission per [`MIN_RETRANSMISSION_INTERVAL`].
pub async fn mark_sent(pool: &PgPool, id: i64, now: DateTime<Utc>) -> Result<(), TanError> {
    let challenge = get_challenge(pool, id).await?;
    if challenge.confirmation.is_some() {
        return Err(TanError::AlreadyConfirmed);
    }
    if let Some(last) = challenge.retransmission {
        if now - last < MIN_RETRANSMISSION_INTERVAL {
            return Err(TanError::RetransmissionTooSoon);
        }
    }
    sqlx::query("UPDATE tan_challenges SET retransmission = $1 WHERE id = $2")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Attempts to confirm `id` with `code`. Confirmation is write-once: a
/// second call on an already-confirmed challenge is rejected even if the
/// code is correct. Each wrong attempt decrements `retry_counter`.
pub async fn try_confirm(
    pool: &PgPool,
    id: i64,
    code: &str,
    now: DateTime<Utc>,
) -> Result<(), TanError> {
    let mut tx = pool.begin().await?;
    let challenge = sqlx::query_as::<_, TanChallengeRow>(
        "SELECT * FROM tan_challenges WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(TanError::UnknownChallenge)?;

    if challenge.confirmation.is_some() {
        return Err(TanError::AlreadyConfirmed);
    }
    if now > challenge.expiration {
        return Err(TanError::Expired);
    }
    if challenge.retry_counter <= 0 {
        return Err(TanError::RetriesExhausted);
    }
    if challenge.code != code {
        sqlx::query("UPDATE tan_challenges SET retry_counter = retry_counter - 1 WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Err(TanError::WrongCode);
    }

    sqlx::query("UPDATE tan_challenges SET confirmation = $1 WHERE id = $2")
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub fn is_confirmed(challenge: &TanChallengeRow) -> bool {
    challenge.confirmation.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
