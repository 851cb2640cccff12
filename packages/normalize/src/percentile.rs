//! Percentile ranking.
//!
//! Uses the "rank" convention: a distinct value's percentile is the
//! percentage of the distribution at or below it, and tied values share the
//! average rank of their tied block. Given `left = #{v < x}` and
//! `right = #{v <= x}` over `n` values:
//!
//! ```text
//! p = (left + right + (left < right ? 1 : 0)) * 50 / n
//! ```
//!
//! A single-value distribution ranks its only value at 100. A score absent
//! from the distribution gets the percentage of values strictly below it.

/// A sorted distribution that can rank scores against itself.
#[derive(Debug, Clone, Default)]
pub struct PercentileRanker {
    sorted: Vec<f64>,
}

impl PercentileRanker {
    /// Builds a ranker from the valid values of a distribution.
    ///
    /// Non-finite values are dropped.
    #[must_use]
    pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        Self { sorted }
    }

    /// Number of values in the distribution.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Returns `true` if the distribution is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Percentile of `score` in `[0, 100]`, or `None` for an empty
    /// distribution.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rank(&self, score: f64) -> Option<f64> {
        if self.sorted.is_empty() || !score.is_finite() {
            return None;
        }
        let left = self.sorted.partition_point(|v| *v < score);
        let right = self.sorted.partition_point(|v| *v <= score);
        let hit = usize::from(left < right);
        Some((left + right + hit) as f64 * 50.0 / self.sorted.len() as f64)
    }

    /// Like [`rank`](Self::rank), inverted to `100 - p` when `reverse`.
    #[must_use]
    pub fn rank_directed(&self, score: f64, reverse: bool) -> Option<f64> {
        self.rank(score)
            .map(|p| if reverse { 100.0 - p } else { p })
    }
}

/// Percentile of `score` within `values`.
///
/// Convenience wrapper that sorts on every call; build a
/// [`PercentileRanker`] to rank many scores against one distribution.
#[must_use]
pub fn percentile_of_score(values: &[f64], score: f64) -> Option<f64> {
    PercentileRanker::new(values.iter().copied()).rank(score)
}
