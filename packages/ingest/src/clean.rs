//! Raw cell value cleaning.
//!
//! Source spreadsheets mix plain numbers with currency, percentages,
//! thousands separators, accounting-style negatives, and a handful of
//! "no data" markers. [`clean_value`] turns any cell into either a number
//! or a reason the cell is missing.
//!
//! Text that cannot be parsed is treated as missing rather than as an
//! error. The [`MissingReason::Unparseable`] variant keeps those cells
//! countable so a load can report how many values were corrupted as
//! opposed to genuinely absent.

use serde::{Deserialize, Serialize};

/// Upper-cased cell contents that mean "no data".
const MISSING_SENTINELS: &[&str] = &["NA", "NULL", "NAN", "N/A", "NONE"];

/// Characters stripped before numeric parsing.
const FORMATTING_CHARS: &[char] = &['$', '€', '£', '¥', ',', '%'];

/// Why a cell produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    /// Empty or whitespace-only cell.
    Blank,
    /// An explicit "no data" marker such as `N/A`.
    Sentinel,
    /// Text that is not a number after formatting was stripped.
    Unparseable,
}

/// The outcome of cleaning one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CleanedValue {
    /// A finite numeric value.
    Value(f64),
    /// No usable value.
    Missing(MissingReason),
}

impl CleanedValue {
    /// Returns the numeric value, if any.
    #[must_use]
    pub const fn value(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            Self::Missing(_) => None,
        }
    }

    /// Returns `true` if the cell produced no value.
    #[must_use]
    pub const fn is_missing(self) -> bool {
        matches!(self, Self::Missing(_))
    }

    /// Splits into `(value, is_missing)`.
    #[must_use]
    pub const fn into_parts(self) -> (Option<f64>, bool) {
        (self.value(), self.is_missing())
    }
}

/// Cleans a raw cell into a numeric value or a missing marker.
///
/// `None` stands for a cell the reader could not supply at all (a short
/// row) and is treated like a blank cell.
#[must_use]
pub fn clean_value(cell: Option<&str>) -> CleanedValue {
    let Some(cell) = cell else {
        return CleanedValue::Missing(MissingReason::Blank);
    };

    let upper = cell.trim().to_uppercase();
    if upper.is_empty() {
        return CleanedValue::Missing(MissingReason::Blank);
    }
    if MISSING_SENTINELS.contains(&upper.as_str()) {
        return CleanedValue::Missing(MissingReason::Sentinel);
    }

    let mut stripped: String = upper
        .chars()
        .filter(|c| !c.is_whitespace() && !FORMATTING_CHARS.contains(c))
        .collect();

    if stripped.len() >= 2 && stripped.starts_with('(') && stripped.ends_with(')') {
        stripped = format!("-{}", &stripped[1..stripped.len() - 1]);
    }

    match stripped.parse::<f64>() {
        Ok(v) if v.is_finite() => CleanedValue::Value(v),
        _ => CleanedValue::Missing(MissingReason::Unparseable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(cell: &str) -> (Option<f64>, bool) {
        clean_value(Some(cell)).into_parts()
    }

    #[test]
    fn strips_currency_and_thousands() {
        assert_eq!(parts("$1,234.56"), (Some(1234.56), false));
    }

    #[test]
    fn parenthesized_value_is_negative() {
        assert_eq!(parts("(42)"), (Some(-42.0), false));
        assert_eq!(parts("($1,000)"), (Some(-1000.0), false));
    }

    #[test]
    fn strips_percent_sign() {
        assert_eq!(parts("12%"), (Some(12.0), false));
        assert_eq!(parts(" 7.5 % "), (Some(7.5), false));
    }

    #[test]
    fn sentinels_are_missing() {
        for cell in ["N/A", "na", "NULL", "NaN", "none", "  n/a  "] {
            assert_eq!(
                clean_value(Some(cell)),
                CleanedValue::Missing(MissingReason::Sentinel),
                "{cell}"
            );
        }
    }

    #[test]
    fn blank_cells_are_missing() {
        assert_eq!(parts(""), (None, true));
        assert_eq!(clean_value(Some("   ")), CleanedValue::Missing(MissingReason::Blank));
        assert_eq!(clean_value(None), CleanedValue::Missing(MissingReason::Blank));
    }

    #[test]
    fn text_degrades_to_missing_and_is_distinguishable() {
        assert_eq!(parts("suppressed"), (None, true));
        assert_eq!(
            clean_value(Some("12 (est.)")),
            CleanedValue::Missing(MissingReason::Unparseable)
        );
        assert_eq!(
            clean_value(Some("()")),
            CleanedValue::Missing(MissingReason::Unparseable)
        );
    }

    #[test]
    fn non_finite_values_are_unparseable() {
        assert_eq!(
            clean_value(Some("inf")),
            CleanedValue::Missing(MissingReason::Unparseable)
        );
        assert_eq!(
            clean_value(Some("-Infinity")),
            CleanedValue::Missing(MissingReason::Unparseable)
        );
    }

    #[test]
    fn plain_numbers_pass_through() {
        assert_eq!(parts("-3.25"), (Some(-3.25), false));
        assert_eq!(parts("1E3"), (Some(1000.0), false));
        assert_eq!(parts("0"), (Some(0.0), false));
    }
}
