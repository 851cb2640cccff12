//! County FIPS code utilities.
//!
//! County identifiers are five-digit FIPS codes: two digits of state FIPS
//! followed by three digits of county FIPS. Source spreadsheets frequently
//! drop the leading zero (`1001` for Autauga County, AL), so codes are
//! left-padded before use.

/// Width of a county FIPS code.
pub const COUNTY_FIPS_WIDTH: usize = 5;

/// Cell values that mean "no FIPS code" in source spreadsheets.
const EMPTY_MARKERS: &[&str] = &["", "NAN", "NULL"];

/// Normalizes a raw FIPS cell into a five-character county identifier.
///
/// Returns `None` for blank cells and the `NaN`/`NULL` markers that
/// spreadsheet exports leave behind.
#[must_use]
pub fn pad_fips(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if EMPTY_MARKERS.contains(&trimmed.to_ascii_uppercase().as_str()) {
        return None;
    }
    Some(format!("{trimmed:0>COUNTY_FIPS_WIDTH$}"))
}

/// Returns the two-digit state FIPS prefix of a county identifier.
///
/// Identifiers shorter than two characters are returned unchanged.
#[must_use]
pub fn state_code(county_id: &str) -> &str {
    county_id.get(..2).unwrap_or(county_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_codes() {
        assert_eq!(pad_fips("1001").as_deref(), Some("01001"));
        assert_eq!(pad_fips(" 6037 ").as_deref(), Some("06037"));
        assert_eq!(pad_fips("48201").as_deref(), Some("48201"));
    }

    #[test]
    fn rejects_empty_markers() {
        assert_eq!(pad_fips(""), None);
        assert_eq!(pad_fips("  "), None);
        assert_eq!(pad_fips("nan"), None);
        assert_eq!(pad_fips("NULL"), None);
    }

    #[test]
    fn state_code_is_first_two_digits() {
        assert_eq!(state_code("01001"), "01");
        assert_eq!(state_code("48201"), "48");
        assert_eq!(state_code("9"), "9");
    }
}
