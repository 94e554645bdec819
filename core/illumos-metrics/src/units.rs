//! Conversions between human-readable sizes and byte counts.
//!
//! illumos tools print sizes with a one-letter ISO suffix: `2.5K`, `6.12G`, `959G`.
//! [`bytify`] turns such a string into a number of bytes, [`unbytify`] does the opposite.
//! The `_i` variants use a base of 1000 instead of 1024.
//!
//! ```
//! use illumos_metrics::units::{bytify, unbytify};
//!
//! assert_eq!(bytify("2K").unwrap(), 2048.0);
//! assert_eq!(unbytify(2048.0), "2.0Kb");
//! ```

use std::{num::ParseFloatError, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

/// Unit letters, from bytes to zettabytes. The position of a letter is its exponent.
const UNITS: [char; 8] = ['b', 'K', 'M', 'G', 'T', 'P', 'E', 'Z'];

/// Returned by [`unbytify`] when the value does not fit in the largest unit.
pub const UNKNOWN_SIZE: &str = "UNKNOWN";

static PLAIN_INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").unwrap());

// The optional `b`/`ib` suffix accepts what `unbytify` produces, e.g. "2.0Kb" or "2.0Kib".
static WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(-?[\d.]+)(\w)(?:i?[bB])?$").unwrap());

/// Multiplier between two consecutive units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// 1K = 1024 bytes.
    Binary,
    /// 1K = 1000 bytes.
    Decimal,
}

impl Base {
    pub fn multiplier(self) -> f64 {
        match self {
            Base::Binary => 1024.0,
            Base::Decimal => 1000.0,
        }
    }

    /// Inserted between the unit letter and the final `b` when formatting.
    fn infix(self) -> &'static str {
        match self {
            Base::Binary => "",
            Base::Decimal => "i",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BytifyError {
    #[error("invalid size string {0:?}, expected a number followed by an optional unit")]
    NoMatch(String),
    #[error("unknown unit {unit:?} in size string {input:?}")]
    UnknownUnit { input: String, unit: char },
    #[error("invalid number in size string {input:?}")]
    InvalidNumber {
        input: String,
        #[source]
        source: ParseFloatError,
    },
}

/// Converts a size like `5G` or `0.5P` to a number of bytes, with 1K = 1024.
///
/// The sentinel `-`, used by `zpool list` for absent values, is zero.
/// A bare integer is already a number of bytes.
pub fn bytify(size: &str) -> Result<f64, BytifyError> {
    bytify_with(size, Base::Binary)
}

/// Like [`bytify`], but with 1K = 1000.
pub fn bytify_i(size: &str) -> Result<f64, BytifyError> {
    bytify_with(size, Base::Decimal)
}

/// Formats a number of bytes with the largest suitable unit, with 1K = 1024.
pub fn unbytify(size: f64) -> String {
    unbytify_with(size, Base::Binary)
}

/// Like [`unbytify`], but with 1K = 1000. The unit is spelled `Kib`, `Mib`, ...
pub fn unbytify_i(size: f64) -> String {
    unbytify_with(size, Base::Decimal)
}

pub fn bytify_with(size: &str, base: Base) -> Result<f64, BytifyError> {
    if size == "-" {
        return Ok(0.0);
    }

    if PLAIN_INTEGER.is_match(size) {
        return size.parse().map_err(|source| BytifyError::InvalidNumber {
            input: size.to_owned(),
            source,
        });
    }

    let captures = WITH_UNIT
        .captures(size)
        .ok_or_else(|| BytifyError::NoMatch(size.to_owned()))?;

    // the regex guarantees that both groups are present and that the second one is a single char
    let (mantissa, unit) = (&captures[1], &captures[2]);
    let unit = unit.chars().next().unwrap_or_default();
    let exponent = UNITS
        .iter()
        .position(|u| u.eq_ignore_ascii_case(&unit))
        .ok_or_else(|| BytifyError::UnknownUnit {
            input: size.to_owned(),
            unit,
        })?;

    let mantissa: f64 = mantissa.parse().map_err(|source| BytifyError::InvalidNumber {
        input: size.to_owned(),
        source,
    })?;
    Ok(mantissa * base.multiplier().powi(exponent as i32))
}

pub fn unbytify_with(size: f64, base: Base) -> String {
    let multiplier = base.multiplier();
    if size.abs() < multiplier {
        return format!("{}b", size as i64);
    }

    for (exponent, unit) in UNITS.iter().enumerate() {
        let quotient = size / multiplier.powi(exponent as i32);
        if quotient.abs() < multiplier {
            return format!("{quotient:.1}{unit}{}b", base.infix());
        }
    }
    UNKNOWN_SIZE.to_owned()
}
