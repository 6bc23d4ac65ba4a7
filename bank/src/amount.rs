//! Fixed-point currency amounts and the conversion sub-engine (C1).
//!
//! An [`Amount`] is a pair `(val, frac)` meaning `val + frac / FRACTION_BASE`
//! units of whatever currency the caller is tracking separately. All
//! arithmetic normalizes `frac` back into `[0, FRACTION_BASE)` and rejects
//! `val > MAX_VAL` as a fault rather than a domain error: overflow here means
//! a bug upstream, not a client mistake.

use std::cmp::Ordering;
use thiserror::Error;

/// Denominator of the fractional part: eight decimal digits of precision.
pub const FRACTION_BASE: u64 = 100_000_000;

/// Largest representable whole-unit value (2^52), matching the JS-safe-integer
/// ceiling the original wire format was built around.
pub const MAX_VAL: u64 = 1u64 << 52;

/// A normalized, non-negative fixed-point amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Amount {
    pub val: u64,
    pub frac: u32,
}

/// Arithmetic faults: invariant violations, never domain errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AmountFault {
    #[error("amount value overflows the 2^52 ceiling")]
    Overflow,
}

impl Amount {
    pub const ZERO: Amount = Amount { val: 0, frac: 0 };

    pub fn new(val: u64, frac: u32) -> Result<Self, AmountFault> {
        Self::normalize(val, frac as u64)
    }

    fn normalize(val: u64, frac: u64) -> Result<Self, AmountFault> {
        let carry = frac / FRACTION_BASE;
        let frac = (frac % FRACTION_BASE) as u32;
        let val = val.checked_add(carry).ok_or(AmountFault::Overflow)?;
        if val > MAX_VAL {
            return Err(AmountFault::Overflow);
        }
        Ok(Amount { val, frac })
    }

    /// `self + other`, normalized.
    pub fn checked_add(self, other: Amount) -> Result<Amount, AmountFault> {
        let val = self
            .val
            .checked_add(other.val)
            .ok_or(AmountFault::Overflow)?;
        Self::normalize(val, (self.frac as u64) + (other.frac as u64))
    }

    /// `self - other`. Returns `(diff, true)` when `self >= other`, else
    /// `(Amount::ZERO, false)` — the spec's two-valued subtraction so callers
    /// can distinguish "went negative" from "is actually zero".
    pub fn checked_sub(self, other: Amount) -> (Amount, bool) {
        if self < other {
            return (Amount::ZERO, false);
        }
        let units = self.to_units() - other.to_units();
        (Amount::from_units(units), true)
    }

    fn to_units(self) -> u128 {
        self.val as u128 * FRACTION_BASE as u128 + self.frac as u128
    }

    fn from_units(units: u128) -> Amount {
        let val = (units / FRACTION_BASE as u128) as u64;
        let frac = (units % FRACTION_BASE as u128) as u32;
        Amount { val, frac }
    }

    /// Multiply by a ratio, quantizing the result to `tiny` using `mode`.
    ///
    /// `ratio` is itself an `Amount` used purely as a fixed-point rational
    /// (`ratio.val + ratio.frac / FRACTION_BASE`), not as a currency value.
    pub fn checked_mul_ratio(
        self,
        ratio: Amount,
        tiny: Amount,
        mode: RoundingMode,
    ) -> Result<Amount, AmountFault> {
        let lhs = self.to_units();
        let rhs = ratio.to_units();
        let product = lhs.checked_mul(rhs).ok_or(AmountFault::Overflow)?;
        // product is scaled by FRACTION_BASE^2; bring back to one scale of
        // FRACTION_BASE (sub-1e-8 remainder is truncated — finer than any
        // representable Amount, so no precision is lost relative to the type).
        let scaled = product / FRACTION_BASE as u128;
        let tiny_units = tiny.to_units().max(1);
        let quantized = quantize(scaled, tiny_units, mode);
        if quantized > MAX_VAL as u128 * FRACTION_BASE as u128 {
            return Err(AmountFault::Overflow);
        }
        Ok(Amount::from_units(quantized))
    }

    /// Inverse of [`checked_mul_ratio`]: divide by `ratio`, quantized to
    /// `tiny`. When `mode == Zero`, one extra `tiny` is added back so that
    /// `from(to(amount)) >= amount` always holds (never short-change the
    /// customer due to truncation on the reverse leg).
    pub fn checked_div_ratio(
        self,
        ratio: Amount,
        tiny: Amount,
        mode: RoundingMode,
    ) -> Result<Amount, AmountFault> {
        let ratio_units = ratio.to_units();
        if ratio_units == 0 {
            return Err(AmountFault::Overflow);
        }
        let lhs = self.to_units().checked_mul(FRACTION_BASE as u128).ok_or(AmountFault::Overflow)?;
        let scaled = lhs / ratio_units;
        let tiny_units = tiny.to_units().max(1);
        let mut quantized = quantize(scaled, tiny_units, mode);
        if mode == RoundingMode::Zero && quantized < scaled {
            quantized = quantized.checked_add(tiny_units).ok_or(AmountFault::Overflow)?;
        }
        if quantized > MAX_VAL as u128 * FRACTION_BASE as u128 {
            return Err(AmountFault::Overflow);
        }
        Ok(Amount::from_units(quantized))
    }

    pub fn is_zero(self) -> bool {
        self.val == 0 && self.frac == 0
    }

    /// Render as `"val.frac"` with the fractional part left-padded and
    /// trailing zeros trimmed, e.g. `Amount::new(5, 0)` -> `"5"`.
    pub fn to_decimal_string(self) -> String {
        if self.frac == 0 {
            return self.val.to_string();
        }
        let frac_str = format!("{:08}", self.frac);
        let trimmed = frac_str.trim_end_matches('0');
        format!("{}.{}", self.val, trimmed)
    }
}

fn quantize(scaled: u128, tiny_units: u128, mode: RoundingMode) -> u128 {
    let q = scaled / tiny_units;
    let r = scaled % tiny_units;
    let rounded_q = match mode {
        RoundingMode::Zero => q,
        RoundingMode::Up => {
            if r > 0 {
                q + 1
            } else {
                q
            }
        }
        RoundingMode::Nearest => {
            if r * 2 >= tiny_units {
                q + 1
            } else {
                q
            }
        }
    };
    rounded_q * tiny_units
}

/// Rounding applied when quantizing a multiplied/divided amount to `tiny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[sqlx(type_name = "rounding_mode", rename_all = "lowercase")]
pub enum RoundingMode {
    Zero,
    Up,
    Nearest,
}

/// Which leg of the cash-in/cash-out pipeline a conversion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ConversionDirection {
    Cashin,
    Cashout,
}

impl ConversionDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversionDirection::Cashin => "cashin",
            ConversionDirection::Cashout => "cashout",
        }
    }
}

/// One direction's worth of conversion parameters, read from the
/// `conversion_config` table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionConfig {
    pub ratio: Amount,
    pub fee: Amount,
    pub tiny_amount: Amount,
    pub min_amount: Amount,
    pub rounding_mode: RoundingMode,
}

/// Outcome of a conversion: either a converted amount, or a signal that the
/// input was below the configured minimum for this direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Converted {
    Ok(Amount),
    TooSmall,
}

/// `to(amount, direction)`: forward conversion (e.g. fiat -> regional on
/// cash-in, regional -> fiat on cash-out).
pub fn to(amount: Amount, cfg: &ConversionConfig) -> Result<Converted, AmountFault> {
    if amount < cfg.min_amount {
        return Ok(Converted::TooSmall);
    }
    let converted = amount.checked_mul_ratio(cfg.ratio, cfg.tiny_amount, cfg.rounding_mode)?;
    let (after_fee, non_negative) = converted.checked_sub(cfg.fee);
    if !non_negative {
        return Ok(Converted::TooSmall);
    }
    Ok(Converted::Ok(after_fee))
}

/// `from(amount, direction)`: the inverse conversion, used to validate a
/// cashout's declared `credit_amount` against its `debit_amount`.
pub fn from(amount: Amount, cfg: &ConversionConfig) -> Result<Amount, AmountFault> {
    let with_fee = amount.checked_add(cfg.fee)?;
    with_fee.checked_div_ratio(cfg.ratio, cfg.tiny_amount, cfg.rounding_mode)
}

impl PartialOrd for ConversionConfig {
    fn partial_cmp(&self, _other: &Self) -> Option<Ordering> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(val: u64, frac: u32) -> Amount {
        Amount::new(val, frac).unwrap()
    }

    #[test]
    fn normalize_carries_fraction_overflow() {
        assert_eq!(Amount::new(1, 150_000_000).unwrap(), a(2, 50_000_000));
    }

    #[test]
    fn normalize_rejects_val_overflow() {
        assert_eq!(Amount::new(MAX_VAL + 1, 0), Err(AmountFault::Overflow));
    }

    #[test]
    fn add_is_commutative_and_normalizes() {
        let x = a(1, 60_000_000);
        let y = a(2, 70_000_000);
        assert_eq!(x.checked_add(y).unwrap(), a(4, 30_000_000));
        assert_eq!(y.checked_add(x).unwrap(), a(4, 30_000_000));
    }

    #[test]
    fn sub_below_zero_is_flagged_invalid() {
        let (diff, ok) = a(1, 0).checked_sub(a(2, 0));
        assert!(!ok);
        assert_eq!(diff, Amount::ZERO);
    }

    #[test]
    fn sub_exact_zero_is_valid() {
        let (diff, ok) = a(5, 0).checked_sub(a(5, 0));
        assert!(ok);
        assert_eq!(diff, Amount::ZERO);
    }

    #[test]
    fn mul_ratio_truncates_with_zero_mode() {
        let amount = a(10, 0);
        let ratio = a(0, 95_000_000); // 0.95
        let tiny = a(0, 1_000_000); // 0.01
        let result = amount
            .checked_mul_ratio(ratio, tiny, RoundingMode::Zero)
            .unwrap();
        assert_eq!(result, a(9, 50_000_000));
    }

    #[test]
    fn mul_ratio_rounds_up() {
        let amount = a(1, 0);
        let ratio = a(0, 33_333_333); // ~1/3
        let tiny = a(0, 1_000_000); // 0.01
        let result = amount
            .checked_mul_ratio(ratio, tiny, RoundingMode::Up)
            .unwrap();
        assert_eq!(result, a(0, 34_000_000));
    }

    #[test]
    fn div_ratio_zero_mode_never_undershoots() {
        let ratio = a(0, 95_000_000); // 0.95
        let tiny = a(0, 1_000_000);
        let converted = a(9, 50_000_000);
        let reverted = converted
            .checked_div_ratio(ratio, tiny, RoundingMode::Zero)
            .unwrap();
        assert!(reverted >= a(10, 0));
    }

    #[test]
    fn conversion_round_trip_with_zero_rounding_and_no_fee() {
        let cfg = ConversionConfig {
            ratio: a(0, 95_000_000),
            fee: Amount::ZERO,
            tiny_amount: a(0, 1_000_000),
            min_amount: a(1, 0),
            rounding_mode: RoundingMode::Zero,
        };
        let amount = a(10, 0);
        let converted = match to(amount, &cfg).unwrap() {
            Converted::Ok(v) => v,
            Converted::TooSmall => panic!("should not be too small"),
        };
        let reverted = from(converted, &cfg).unwrap();
        assert!(reverted >= amount);
    }

    #[test]
    fn conversion_below_minimum_is_too_small() {
        let cfg = ConversionConfig {
            ratio: a(1, 0),
            fee: Amount::ZERO,
            tiny_amount: a(0, 1_000_000),
            min_amount: a(5, 0),
            rounding_mode: RoundingMode::Zero,
        };
        assert_eq!(to(a(1, 0), &cfg).unwrap(), Converted::TooSmall);
    }

    #[test]
    fn conversion_fee_can_push_result_to_too_small() {
        let cfg = ConversionConfig {
            ratio: a(1, 0),
            fee: a(4, 0),
            tiny_amount: a(0, 1_000_000),
            min_amount: a(1, 0),
            rounding_mode: RoundingMode::Zero,
        };
        assert_eq!(to(a(2, 0), &cfg).unwrap(), Converted::TooSmall);
    }

    #[test]
    fn to_decimal_string_trims_trailing_zeros() {
        assert_eq!(a(5, 0).to_decimal_string(), "5");
        assert_eq!(a(5, 50_000_000).to_decimal_string(), "5.5");
        assert_eq!(a(0, 1_000_000).to_decimal_string(), "0.01");
    }
}
