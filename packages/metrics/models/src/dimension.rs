//! The three top-level sustainability dimensions and their display names.
//!
//! Internally every aggregation keys on [`Dimension`], whose string form
//! (`People`, `Productivity`, `Place`) is stable across releases. The
//! user-facing names changed between dashboard versions, so rendering goes
//! through a [`NamingScheme`] instead of comparing label strings.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A top-level sustainability dimension.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum Dimension {
    /// Social outcomes: health, education, community, wealth.
    People,
    /// Economic outcomes: employment, business, government.
    Productivity,
    /// Environmental outcomes: climate, land, air, water.
    Place,
}

impl Dimension {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::People, Self::Productivity, Self::Place]
    }

    /// Maps a parsed top-level label onto a dimension.
    ///
    /// Accepts the labels of every [`NamingScheme`] plus `Prosperity`,
    /// which one dashboard revision used for the economic dimension.
    /// Matching is case-insensitive. Returns `None` for anything else.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "people" | "society" => Some(Self::People),
            "productivity" | "prosperity" | "economy" => Some(Self::Productivity),
            "place" | "environment" => Some(Self::Place),
            _ => None,
        }
    }

    /// Returns the user-facing name of this dimension under `scheme`.
    #[must_use]
    pub const fn display_name(self, scheme: NamingScheme) -> &'static str {
        match (scheme, self) {
            (NamingScheme::V1, Self::People) => "People",
            (NamingScheme::V1, Self::Productivity) => "Productivity",
            (NamingScheme::V1, Self::Place) => "Place",
            (NamingScheme::V2, Self::People) => "Society",
            (NamingScheme::V2, Self::Productivity) => "Economy",
            (NamingScheme::V2, Self::Place) => "Environment",
        }
    }
}

/// Versioned table of user-facing dimension names.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum NamingScheme {
    /// People / Productivity / Place.
    V1,
    /// Society / Economy / Environment.
    #[default]
    V2,
}
