//! Metric path parsing.
//!
//! Metric columns encode their position in the measurement hierarchy in
//! the column name itself, e.g. `PEOPLE_HEALTH_LengthOfLife_LifeExpectancy`:
//!
//! | segment | meaning        | casing            |
//! |---------|----------------|-------------------|
//! | 0       | top level      | title-cased       |
//! | 1       | sub-measure    | title-cased       |
//! | 2       | metric group   | verbatim          |
//! | 3..     | leaf metric    | verbatim, rejoined|
//!
//! The metric group keeps its original casing because the reverse-metric
//! allow-list and downstream measure names were built against it.

use sustainability_models::MetricIdentity;

/// Separator between path segments.
pub const PATH_DELIMITER: char = '_';

/// A metric path with fewer than two segments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed metric path {path:?}: {segments} segment(s), at least 2 required")]
pub struct MalformedMetricPath {
    /// The rejected path.
    pub path: String,
    /// How many segments it had.
    pub segments: usize,
}

/// Parses a metric path into its hierarchy position.
///
/// Segment content is not validated; only the segment count is.
///
/// # Errors
///
/// Returns [`MalformedMetricPath`] if the path has fewer than two
/// underscore-delimited segments.
pub fn parse_metric_path(path: &str) -> Result<MetricIdentity, MalformedMetricPath> {
    let parts: Vec<&str> = path.split(PATH_DELIMITER).collect();

    if parts.len() < 2 {
        return Err(MalformedMetricPath {
            path: path.to_string(),
            segments: parts.len(),
        });
    }

    let top_level = capitalize(parts[0]);
    let sub_measure = capitalize(parts[1]);

    let (metric_group, sub_metric_name) = match parts.len() {
        2 => (sub_measure.clone(), sub_measure.clone()),
        3 => (parts[2].to_string(), parts[2].to_string()),
        _ => (
            parts[2].to_string(),
            parts[3..].join(&PATH_DELIMITER.to_string()),
        ),
    };

    Ok(MetricIdentity {
        metric_path: path.to_string(),
        top_level,
        sub_measure,
        metric_group,
        sub_metric_name,
    })
}

/// Upper-cases the first character and lower-cases the rest
/// (`HEALTH` -> `Health`, `lengthOfLife` -> `Lengthoflife`).
#[must_use]
pub fn capitalize(segment: &str) -> String {
    let mut chars = segment.chars();
    chars.next().map_or_else(String::new, |first| {
        first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_segment_path() {
        let id = parse_metric_path("PEOPLE_HEALTH_LengthOfLife_LifeExpectancy").unwrap();
        assert_eq!(id.top_level, "People");
        assert_eq!(id.sub_measure, "Health");
        assert_eq!(id.metric_group, "LengthOfLife");
        assert_eq!(id.sub_metric_name, "LifeExpectancy");
        assert_eq!(id.metric_path, "PEOPLE_HEALTH_LengthOfLife_LifeExpectancy");
    }

    #[test]
    fn two_segment_path_is_its_own_leaf() {
        let id = parse_metric_path("people_population").unwrap();
        assert_eq!(id.top_level, "People");
        assert_eq!(id.sub_measure, "Population");
        assert_eq!(id.metric_group, "Population");
        assert_eq!(id.sub_metric_name, "Population");
        assert!(!id.is_nested());
    }

    #[test]
    fn three_segment_path_uses_group_as_leaf_name() {
        let id = parse_metric_path("PLACE_CLIMATEANDRESILIENCE_CO2ORCAPITA").unwrap();
        assert_eq!(id.top_level, "Place");
        assert_eq!(id.sub_measure, "Climateandresilience");
        assert_eq!(id.metric_group, "CO2ORCAPITA");
        assert_eq!(id.sub_metric_name, "CO2ORCAPITA");
    }

    #[test]
    fn trailing_segments_are_rejoined() {
        let id = parse_metric_path(
            "PEOPLE_HEALTH_HEALTHRESOURCES_ACCESSTOCARE_UNINSURED",
        )
        .unwrap();
        assert_eq!(id.metric_group, "HEALTHRESOURCES");
        assert_eq!(id.sub_metric_name, "ACCESSTOCARE_UNINSURED");
    }

    #[test]
    fn group_casing_is_preserved() {
        let id = parse_metric_path("Place_LandAirWater_AirQualityIndexPerPm2.5").unwrap();
        assert_eq!(id.sub_measure, "Landairwater");
        assert_eq!(id.metric_group, "AirQualityIndexPerPm2.5");
    }

    #[test]
    fn rejects_single_segment() {
        let err = parse_metric_path("Population").unwrap_err();
        assert_eq!(err.segments, 1);
        assert_eq!(err.path, "Population");
        assert!(parse_metric_path("").is_err());
    }

    #[test]
    fn tolerates_noisy_segments() {
        let id = parse_metric_path("People__%weird%").unwrap();
        assert_eq!(id.sub_measure, "");
        assert_eq!(id.metric_group, "%weird%");
    }

    #[test]
    fn capitalize_handles_empty_and_mixed_case() {
        assert_eq!(capitalize(""), "");
        assert_eq!(capitalize("pRODUCTIVITY"), "Productivity");
    }
}
