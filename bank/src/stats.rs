//! Payment statistics aggregator (C11).
//!
//! Call [`record`] inside the same database transaction as the ledger post
//! it summarizes — it does not open its own transaction.

use chrono::{DateTime, Datelike, Timelike, Utc};
use sqlx::{Postgres, Transaction};

use crate::amount::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentKind {
    Cashin,
    Cashout,
    TalerIn,
    TalerOut,
}

const TIMEFRAMES: &[&str] = &["hour", "day", "month", "year"];

fn bucket_start(timeframe: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_nanosecond(0)
        .unwrap()
        .with_second(0)
        .unwrap()
        .with_minute(0)
        .unwrap();
    match timeframe {
        "hour" => truncated,
        "day" => truncated.with_hour(0).unwrap(),
        "month" => truncated.with_hour(0).unwrap().with_day(1).unwrap(),
        "year" => truncated
            .with_hour(0)
            .unwrap()
            .with_day(1)
            .unwrap()
            .with_month(1)
            .unwrap(),
        _ => unreachable!("closed set of timeframes"),
    }
}

/// Increments the counters for `kind` across all four timeframe buckets
/// containing `now`. `regional` is the amount posted to the ledger;
/// `fiat` is the fiat-side amount for cashin/cashout (ignored for taler
/// in/out, which have no fiat leg).
pub async fn record(
    tx: &mut Transaction<'_, Postgres>,
    kind: PaymentKind,
    regional: Amount,
    fiat: Option<Amount>,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let fiat = fiat.unwrap_or(Amount::ZERO);
    let (count_col, regional_val_col, regional_frac_col, fiat_cols) = match kind {
        PaymentKind::Cashin => (
            "cashin_count",
            "cashin_regional_val",
            "cashin_regional_frac",
            Some(("cashin_fiat_val", "cashin_fiat_frac")),
        ),
        PaymentKind::Cashout => (
            "cashout_count",
            "cashout_regional_val",
            "cashout_regional_frac",
            Some(("cashout_fiat_val", "cashout_fiat_frac")),
        ),
        PaymentKind::TalerIn => ("taler_in_count", "taler_in_val", "taler_in_frac", None),
        PaymentKind::TalerOut => ("taler_out_count", "taler_out_val", "taler_out_frac", None),
    };

    for timeframe in TIMEFRAMES {
        let start = bucket_start(timeframe, now);
        let sql = match fiat_cols {
            Some((fiat_val_col, fiat_frac_col)) => format!(
                r#"INSERT INTO payment_stats (timeframe, bucket_start, {count_col}, {regional_val_col}, {regional_frac_col}, {fiat_val_col}, {fiat_frac_col})
                   VALUES ($1::stat_timeframe_enum, $2, 1, $3, $4, $5, $6)
                   ON CONFLICT (timeframe, bucket_start) DO UPDATE SET
                       {count_col} = payment_stats.{count_col} + 1,
                       {regional_val_col} = payment_stats.{regional_val_col} + EXCLUDED.{regional_val_col},
                       {regional_frac_col} = payment_stats.{regional_frac_col} + EXCLUDED.{regional_frac_col},
                       {fiat_val_col} = payment_stats.{fiat_val_col} + EXCLUDED.{fiat_val_col},
                       {fiat_frac_col} = payment_stats.{fiat_frac_col} + EXCLUDED.{fiat_frac_col}"#
            ),
            None => format!(
                r#"INSERT INTO payment_stats (timeframe, bucket_start, {count_col}, {regional_val_col}, {regional_frac_col})
                   VALUES ($1::stat_timeframe_enum, $2, 1, $3, $4)
                   ON CONFLICT (timeframe, bucket_start) DO UPDATE SET
                       {count_col} = payment_stats.{count_col} + 1,
                       {regional_val_col} = payment_stats.{regional_val_col} + EXCLUDED.{regional_val_col},
                       {regional_frac_col} = payment_stats.{regional_frac_col} + EXCLUDED.{regional_frac_col}"#
            ),
        };
        let query = sqlx::query(&sql)
            .bind(timeframe)
            .bind(start)
            .bind(regional.val as i64)
            .bind(regional.frac as i32);
        let query = if fiat_cols.is_some() {
            query.bind(fiat.val as i64).bind(fiat.frac as i32)
        } else {
            query
        };
        query.execute(&mut **tx).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_start_truncates_to_timeframe_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 7, 31, 14, 37, 52).unwrap();
        assert_eq!(
            bucket_start("hour", now),
            Utc.with_ymd_and_hms(2026, 7, 31, 14, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_start("day", now),
            Utc.with_ymd_and_hms(2026, 7, 31, 0, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_start("month", now),
            Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_start("year", now),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
