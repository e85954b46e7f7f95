//! Kubernetes resource quantity parsing
//!
//! Parses the serialized quantity format used in resource lists
//! (`100m`, `256Mi`, `1.5G`, `2e3`) into integer values. Arithmetic is
//! exact: the mantissa is kept as an integer with a decimal scale, so
//! `0.1` CPU becomes exactly 100 milli-units. Results round up, matching
//! the API server's `Value()`/`MilliValue()` helpers.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// Longest mantissa accepted before precision can no longer be kept in an i128
const MAX_MANTISSA_DIGITS: usize = 30;

/// Errors produced while parsing a quantity string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix {suffix:?} in quantity {input:?}")]
    UnknownSuffix { input: String, suffix: String },

    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// A parsed quantity: `mantissa * 10^exponent * 2^binary_exponent`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedQuantity {
    mantissa: i128,
    exponent: i32,
    binary_exponent: u32,
}

impl ParsedQuantity {
    /// Integer value, rounded up (bytes, counts)
    pub fn value(&self) -> Result<i64, QuantityError> {
        self.scaled(0)
    }

    /// Value in thousandths, rounded up (CPU milli-units)
    pub fn milli_value(&self) -> Result<i64, QuantityError> {
        self.scaled(3)
    }

    fn scaled(&self, shift: i32) -> Result<i64, QuantityError> {
        let overflow = || QuantityError::OutOfRange(format!("{:?}", self));

        let base = 2i128
            .checked_pow(self.binary_exponent)
            .and_then(|factor| self.mantissa.checked_mul(factor))
            .ok_or_else(overflow)?;

        let exponent = self.exponent.checked_add(shift).ok_or_else(overflow)?;
        let scaled = if exponent >= 0 {
            10i128
                .checked_pow(exponent as u32)
                .and_then(|factor| base.checked_mul(factor))
                .ok_or_else(overflow)?
        } else {
            match 10i128.checked_pow(exponent.unsigned_abs()) {
                Some(divisor) => ceil_div(base, divisor),
                // Anything this small rounds up to one unit (or zero)
                None => base.signum().max(0),
            }
        };

        i64::try_from(scaled).map_err(|_| overflow())
    }
}

fn ceil_div(numerator: i128, divisor: i128) -> i128 {
    let quotient = numerator.div_euclid(divisor);
    if numerator.rem_euclid(divisor) == 0 {
        quotient
    } else {
        quotient + 1
    }
}

/// Parse a quantity string such as `250m`, `1Gi` or `1.5e3`
pub fn parse_quantity(input: &str) -> Result<ParsedQuantity, QuantityError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::Empty);
    }

    let number_end = trimmed
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(number_end);

    let (mantissa, fraction_digits) = parse_decimal(number)
        .ok_or_else(|| QuantityError::InvalidNumber(input.to_string()))?;
    let (suffix_exponent, binary_exponent) = parse_suffix(suffix).ok_or_else(|| {
        QuantityError::UnknownSuffix {
            input: input.to_string(),
            suffix: suffix.to_string(),
        }
    })?;

    let exponent = suffix_exponent
        .checked_sub(fraction_digits)
        .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;

    Ok(ParsedQuantity {
        mantissa,
        exponent,
        binary_exponent,
    })
}

/// Parse `[+-]digits[.digits]` into an integer mantissa and the number of fraction digits
fn parse_decimal(number: &str) -> Option<(i128, i32)> {
    let (negative, unsigned) = match number.as_bytes().first()? {
        b'-' => (true, &number[1..]),
        b'+' => (false, &number[1..]),
        _ => (false, number),
    };

    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (unsigned, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.contains('.') {
        return None;
    }

    let digits: String = whole.chars().chain(fraction.chars()).collect();
    let significant = digits.trim_start_matches('0');
    if significant.len() > MAX_MANTISSA_DIGITS {
        return None;
    }

    let magnitude: i128 = if significant.is_empty() {
        0
    } else {
        significant.parse().ok()?
    };
    let mantissa = if negative { -magnitude } else { magnitude };
    Some((mantissa, i32::try_from(fraction.len()).ok()?))
}

/// Map a suffix to `(decimal exponent, binary exponent)`
fn parse_suffix(suffix: &str) -> Option<(i32, u32)> {
    let table = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            return exponent.parse::<i32>().ok().map(|e| (e, 0));
        }
    };
    Some(table)
}

/// Integer value of an API quantity, rounded up
pub fn quantity_value(quantity: &Quantity) -> Result<i64, QuantityError> {
    parse_quantity(&quantity.0)?.value()
}

/// Milli-value of an API quantity, rounded up
pub fn quantity_milli_value(quantity: &Quantity) -> Result<i64, QuantityError> {
    parse_quantity(&quantity.0)?.milli_value()
}
