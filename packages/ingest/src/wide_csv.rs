//! Wide, multi-header CSV reader.
//!
//! Layout of the source file:
//!
//! ```text
//! row 0:  FIPS, State, County, <metric path>, <metric path>, ...
//! row 1:  -,    -,     -,      <unit>,        <unit>,        ...
//! row 2:  -,    -,     -,      <year>,        <year>,        ...
//! row 3+: 1001, AL,    Autauga, 72.4,         $51,234,       ...
//! ```
//!
//! Each metric cell becomes one [`RawObservation`]. Observations are
//! emitted column by column so every metric's rows are contiguous.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use sustainability_models::county::{pad_fips, state_code};
use sustainability_models::{County, RawObservation};

use crate::clean::clean_value;
use crate::hierarchy::parse_metric_path;
use crate::{DataQualitySummary, IngestError};

/// Number of header rows preceding the data.
pub const HEADER_ROWS: usize = 3;

/// Number of leading identity columns (FIPS, state, county).
pub const IDENTITY_COLUMNS: usize = 3;

/// A fully parsed wide CSV.
#[derive(Debug, Clone, Default)]
pub struct WideTable {
    /// One entry per distinct county row, in file order.
    pub counties: Vec<County>,
    /// One entry per (county, distinct well-formed metric column).
    pub observations: Vec<RawObservation>,
    /// Cleaning and parsing tallies.
    pub quality: DataQualitySummary,
}

impl WideTable {
    /// Distinct metric paths present in the table.
    #[must_use]
    pub fn metric_paths(&self) -> BTreeSet<&str> {
        self.observations
            .iter()
            .map(|o| o.metric_path.as_str())
            .collect()
    }
}

/// Reads a wide CSV from disk.
///
/// # Errors
///
/// Returns [`IngestError`] if the file cannot be opened, is not valid CSV,
/// or has fewer than [`HEADER_ROWS`] rows.
pub fn read_wide_csv(path: &Path) -> Result<WideTable, IngestError> {
    log::info!("Reading wide CSV from {}", path.display());
    let file = std::fs::File::open(path)?;
    read_wide_csv_from(file)
}

/// Reads a wide CSV from any reader.
///
/// # Errors
///
/// Returns [`IngestError`] if the input is not valid CSV or has fewer than
/// [`HEADER_ROWS`] rows.
pub fn read_wide_csv_from<R: Read>(reader: R) -> Result<WideTable, IngestError> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let records = csv_reader
        .records()
        .collect::<Result<Vec<StringRecord>, csv::Error>>()?;

    if records.len() < HEADER_ROWS {
        return Err(IngestError::MissingHeaderRows {
            expected: HEADER_ROWS,
            found: records.len(),
        });
    }

    let (headers, data_rows) = records.split_at(HEADER_ROWS);
    let names = &headers[0];
    let units = &headers[1];
    let years = &headers[2];

    let mut table = WideTable::default();

    // Resolve which data rows carry a usable, first-seen county code.
    let mut seen = BTreeSet::new();
    let mut rows: Vec<(String, &StringRecord)> = Vec::with_capacity(data_rows.len());
    for row in data_rows {
        let Some(county_id) = row.get(0).and_then(pad_fips) else {
            table.quality.skipped_rows += 1;
            continue;
        };
        if !seen.insert(county_id.clone()) {
            log::warn!("Duplicate county row for {county_id}, keeping the first");
            table.quality.skipped_rows += 1;
            continue;
        }
        table.counties.push(County {
            state_code: state_code(&county_id).to_string(),
            state: row.get(1).unwrap_or_default().trim().to_string(),
            county_name: row.get(2).unwrap_or_default().trim().to_string(),
            county_id: county_id.clone(),
        });
        rows.push((county_id, row));
    }

    let mut seen_columns = BTreeSet::new();
    for (col, name) in names.iter().enumerate().skip(IDENTITY_COLUMNS) {
        let name = name.trim();
        if let Err(e) = parse_metric_path(name) {
            log::warn!("Skipping column {col}: {e}");
            table.quality.malformed_columns.push(name.to_string());
            continue;
        }
        if !seen_columns.insert(name) {
            log::warn!("Skipping column {col}: duplicate metric {name:?}, keeping the first");
            table.quality.duplicate_columns.push(name.to_string());
            continue;
        }

        let unit = header_meta(units.get(col));
        let year = header_meta(years.get(col));

        for (county_id, row) in &rows {
            let cleaned = clean_value(row.get(col));
            table.quality.record(cleaned);
            table.observations.push(
                RawObservation::new(county_id.as_str(), name, cleaned.value())
                    .with_metadata(unit.clone(), year.clone()),
            );
        }
    }

    log::info!(
        "Parsed {} counties and {} observations across {} metrics",
        table.counties.len(),
        table.observations.len(),
        table.metric_paths().len()
    );

    Ok(table)
}

/// Normalizes a unit/year header cell; blanks and `nan` become `None`.
fn header_meta(cell: Option<&str>) -> Option<String> {
    let trimmed = cell?.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
FIPS,State,County,PEOPLE_HEALTH_LengthOfLife_LifeExpectancy,Population,PRODUCTIVITY_EMPLOYMENT_UNEMPLOYMENTRATE
,,,Years,,Percent
,,,2022,,2023
1001,AL,Autauga,76.1,58000,2.9%
1003,AL,Baldwin,N/A,230000,3.1%
,,Unknown,1,2,3
06037,CA,Los Angeles,\"$1,234.56\",10000000,suppressed
1001,AL,Autauga again,1,1,1
";

    fn sample() -> WideTable {
        read_wide_csv_from(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn pads_fips_and_derives_state_code() {
        let table = sample();
        let ids: Vec<&str> = table.counties.iter().map(|c| c.county_id.as_str()).collect();
        assert_eq!(ids, ["01001", "01003", "06037"]);
        assert_eq!(table.counties[2].state_code, "06");
        assert_eq!(table.counties[2].county_name, "Los Angeles");
    }

    #[test]
    fn skips_blank_and_duplicate_county_rows() {
        assert_eq!(sample().quality.skipped_rows, 2);
    }

    #[test]
    fn malformed_columns_are_reported_not_loaded() {
        let table = sample();
        assert_eq!(table.quality.malformed_columns, ["Population"]);
        assert!(!table.metric_paths().contains("Population"));
        assert_eq!(table.metric_paths().len(), 2);
    }

    #[test]
    fn cells_are_cleaned_with_header_metadata() {
        let table = sample();
        let la = table
            .observations
            .iter()
            .find(|o| {
                o.county_id == "06037"
                    && o.metric_path == "PEOPLE_HEALTH_LengthOfLife_LifeExpectancy"
            })
            .unwrap();
        assert_eq!(la.raw_value, Some(1234.56));
        assert_eq!(la.unit.as_deref(), Some("Years"));
        assert_eq!(la.year.as_deref(), Some("2022"));

        let baldwin = table
            .observations
            .iter()
            .find(|o| {
                o.county_id == "01003"
                    && o.metric_path == "PEOPLE_HEALTH_LengthOfLife_LifeExpectancy"
            })
            .unwrap();
        assert!(baldwin.is_missing);
        assert_eq!(baldwin.raw_value, None);
    }

    #[test]
    fn quality_counts_unparseable_separately() {
        let q = sample().quality;
        assert_eq!(q.total_cells, 6);
        assert_eq!(q.valid_cells, 4);
        assert_eq!(q.sentinel_cells, 1);
        assert_eq!(q.unparseable_cells, 1);
    }

    #[test]
    fn repeated_metric_column_keeps_the_first() {
        let csv = "\
FIPS,State,County,PEOPLE_HEALTH_Life_A,PEOPLE_HEALTH_Life_B,PEOPLE_HEALTH_Life_A
,,,Years,Rate,Other
,,,2022,2022,2019
1001,AL,Autauga,1.5,2.5,9.9
1003,AL,Baldwin,3.5,4.5,8.8
";
        let table = read_wide_csv_from(csv.as_bytes()).unwrap();
        assert_eq!(table.quality.duplicate_columns, ["PEOPLE_HEALTH_Life_A"]);
        assert_eq!(table.quality.total_cells, 4);

        let autauga_a: Vec<&RawObservation> = table
            .observations
            .iter()
            .filter(|o| o.county_id == "01001" && o.metric_path == "PEOPLE_HEALTH_Life_A")
            .collect();
        assert_eq!(autauga_a.len(), 1);
        assert_eq!(autauga_a[0].raw_value, Some(1.5));
        assert_eq!(autauga_a[0].year.as_deref(), Some("2022"));
    }

    #[test]
    fn too_few_rows_is_an_error() {
        let err = read_wide_csv_from("FIPS,State,County\n,,\n".as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            IngestError::MissingHeaderRows {
                expected: 3,
                found: 2
            }
        ));
    }
}
