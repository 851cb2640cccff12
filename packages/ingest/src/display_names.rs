//! Human-readable names for metrics and measures.
//!
//! Loaded from an optional two-column CSV (`database_name,display_name`).
//! Names with no entry fall back to a prettified form of the raw name.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use sustainability_models::MetricIdentity;

use crate::IngestError;

#[derive(Debug, Deserialize)]
struct DisplayNameRow {
    database_name: String,
    display_name: String,
}

/// Lookup table from database names to display names.
#[derive(Debug, Clone, Default)]
pub struct DisplayNames {
    names: BTreeMap<String, String>,
}

impl DisplayNames {
    /// Loads display names from a CSV file.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] if the file cannot be read or a row does not
    /// have both columns.
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let file = std::fs::File::open(path)?;
        let names = Self::from_reader(file)?;
        log::info!("Loaded {} display name mappings", names.len());
        Ok(names)
    }

    /// Loads display names from any CSV reader with a header row.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] if a row does not have both columns.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, IngestError> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut names = BTreeMap::new();
        for row in csv_reader.deserialize::<DisplayNameRow>() {
            let row = row?;
            names.insert(row.database_name, row.display_name);
        }
        Ok(Self { names })
    }

    /// Number of explicit mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if no mappings are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Display name for a database name, or the name itself.
    #[must_use]
    pub fn get<'a>(&'a self, database_name: &'a str) -> &'a str {
        self.names
            .get(database_name)
            .map_or(database_name, String::as_str)
    }

    /// Display name for a leaf metric.
    ///
    /// Unmapped metrics render their leaf name with underscores turned
    /// into spaces and each word capitalized.
    #[must_use]
    pub fn metric_label(&self, identity: &MetricIdentity) -> String {
        self.names.get(&identity.metric_path).map_or_else(
            || {
                identity
                    .sub_metric_name
                    .split('_')
                    .filter(|w| !w.is_empty())
                    .map(crate::hierarchy::capitalize)
                    .collect::<Vec<_>>()
                    .join(" ")
            },
            Clone::clone,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::parse_metric_path;

    const CSV: &str = "\
database_name,display_name
People_Health, Health & Wellbeing
PEOPLE_HEALTH_LengthOfLife_LifeExpectancy,Life expectancy
";

    #[test]
    fn maps_known_names_and_falls_back() {
        let names = DisplayNames::from_reader(CSV.as_bytes()).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names.get("People_Health"), "Health & Wellbeing");
        assert_eq!(names.get("Place_Climate"), "Place_Climate");
    }

    #[test]
    fn metric_label_prefers_mapping() {
        let names = DisplayNames::from_reader(CSV.as_bytes()).unwrap();
        let id = parse_metric_path("PEOPLE_HEALTH_LengthOfLife_LifeExpectancy").unwrap();
        assert_eq!(names.metric_label(&id), "Life expectancy");
    }

    #[test]
    fn metric_label_prettifies_unmapped_leaf() {
        let names = DisplayNames::default();
        let id = parse_metric_path("PEOPLE_HEALTH_HEALTHRESOURCES_ACCESSTOCARE_UNINSURED")
            .unwrap();
        assert_eq!(names.metric_label(&id), "Accesstocare Uninsured");
    }
}
