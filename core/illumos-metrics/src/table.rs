//! Parsing of whitespace-aligned command output, like `zpool list` or `fmstat`.
//!
//! The first line of such output is a header that names the columns. Each following line is
//! split on whitespace and zipped with the header, then each value is converted according to
//! the [`ColumnRules`] of the caller.
//!
//! Conversion is best-effort: a value that cannot be parsed becomes zero and the rest of the row
//! is kept. Command output drifts between releases, and losing one field is better than losing
//! the whole row.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{measurement::FieldValue, units};

/// Health states of a zpool, ordered by their ordinal.
pub const HEALTH_STATES: [&str; 5] = ["ONLINE", "DEGRADED", "SUSPENDED", "UNAVAIL", "FAULTED"];

/// Ordinal of a health state that is not in [`HEALTH_STATES`].
pub const UNKNOWN_HEALTH: i64 = 99;

/// Column names of a tabular output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header(Vec<String>);

impl Header {
    /// Lower-cases and splits a header line on whitespace.
    pub fn parse(line: &str) -> Self {
        Self(line.split_whitespace().map(str::to_lowercase).collect())
    }

    /// Like [`Header::parse`], but replaces `%` with `pc_`, so that `%w` becomes `pc_w`.
    pub fn parse_percent_prefixed(line: &str) -> Self {
        Self::parse(&line.replace('%', "pc_"))
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How to turn a raw column value into a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// A size like `3.62T`, converted to bytes with a base of 1024.
    Bytes,
    /// An integer with an optional trailing `%`.
    Percent,
    /// A float with an optional trailing `x`, like a dedup ratio.
    Ratio,
    /// A zpool health state, converted with [`health_ordinal`].
    Health,
    /// A plain float.
    Float,
    /// The column is not emitted.
    Skip,
}

/// Maps column names to conversions.
#[derive(Debug, Clone)]
pub struct ColumnRules {
    rules: FxHashMap<String, Conversion>,
    default: Conversion,
}

impl ColumnRules {
    /// Creates rules that apply `default` to every column.
    pub fn new(default: Conversion) -> Self {
        Self {
            rules: FxHashMap::default(),
            default,
        }
    }

    /// Applies `conversion` to the given columns.
    pub fn with(mut self, columns: &[&str], conversion: Conversion) -> Self {
        for col in columns {
            self.rules.insert((*col).to_owned(), conversion);
        }
        self
    }

    pub fn conversion_for(&self, column: &str) -> Conversion {
        self.rules.get(column).copied().unwrap_or(self.default)
    }
}

/// What to do with a row that does not have as many columns as the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowMode {
    /// Reject the row.
    #[default]
    Strict,
    /// Zip the row with the header, stopping at the shortest of the two.
    Truncate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("the row is empty")]
    Empty,
    #[error("the header has {expected} columns but the row has {found}")]
    ColumnCount { expected: usize, found: usize },
}

/// A parsed data line.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// The first column of the row, which identifies it: pool name, fmd module...
    pub key: String,
    /// The converted values, by column name. Skipped columns are absent.
    pub values: BTreeMap<String, FieldValue>,
}

/// Splits a data line on whitespace and converts its values according to `rules`.
///
/// Only the column count can make this fail. Values that cannot be converted are zero.
pub fn parse_row(line: &str, header: &Header, rules: &ColumnRules, mode: RowMode) -> Result<Row, RowError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(key) = tokens.first() else {
        return Err(RowError::Empty);
    };
    if mode == RowMode::Strict && tokens.len() != header.len() {
        return Err(RowError::ColumnCount {
            expected: header.len(),
            found: tokens.len(),
        });
    }

    let mut values = BTreeMap::new();
    for (column, raw) in header.columns().iter().zip(&tokens) {
        if let Some(value) = convert(column, raw, rules.conversion_for(column)) {
            values.insert(column.clone(), value);
        }
    }
    Ok(Row {
        key: (*key).to_owned(),
        values,
    })
}

/// Parses a whole output: the first non-blank line is the header, the others are rows.
///
/// Rows that cannot be parsed are logged and skipped.
pub fn parse_table(raw: &str, header_parser: fn(&str) -> Header, rules: &ColumnRules, mode: RowMode) -> Vec<Row> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next().map(header_parser) else {
        return Vec::new();
    };
    lines
        .filter_map(|line| match parse_row(line, &header, rules, mode) {
            Ok(row) => Some(row),
            Err(e) => {
                log::warn!("skipping row {line:?}: {e}");
                None
            }
        })
        .collect()
}

/// Converts a zpool health state to an integer, so that it can be alerted on.
///
/// `ONLINE` is 0, `FAULTED` is 4, anything unknown is [`UNKNOWN_HEALTH`].
pub fn health_ordinal(health: &str) -> i64 {
    HEALTH_STATES
        .iter()
        .position(|s| *s == health)
        .map_or(UNKNOWN_HEALTH, |i| i as i64)
}

fn convert(column: &str, raw: &str, conversion: Conversion) -> Option<FieldValue> {
    let value = match conversion {
        Conversion::Skip => return None,
        Conversion::Bytes => FieldValue::F64(units::bytify(raw).unwrap_or_else(|e| {
            log::debug!("column {column}: {e}");
            0.0
        })),
        Conversion::Percent => FieldValue::I64(lenient(column, raw.trim_end_matches('%'))),
        Conversion::Ratio => FieldValue::F64(lenient(column, raw.trim_end_matches('x'))),
        Conversion::Health => FieldValue::I64(health_ordinal(raw)),
        Conversion::Float => FieldValue::F64(lenient(column, raw)),
    };
    Some(value)
}

fn lenient<T: std::str::FromStr + Default>(column: &str, raw: &str) -> T {
    raw.parse().unwrap_or_else(|_| {
        log::debug!("column {column}: cannot parse {raw:?}, using the default value");
        T::default()
    })
}
