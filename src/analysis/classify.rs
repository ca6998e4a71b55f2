//! Upgrade classification and rank-range statistics shared by every analysis.

use crate::models::{SeatKey, UpgradeType};
use serde::{Deserialize, Serialize};

/// Classify a move between two seats. College and course are compared independently.
pub fn classify_upgrade(origin: &SeatKey, destination: &SeatKey) -> UpgradeType {
    let college_changed = origin.college_id != destination.college_id;
    let course_changed = origin.course_id != destination.course_id;
    match (college_changed, course_changed) {
        (false, false) => UpgradeType::None,
        (true, false) => UpgradeType::College,
        (false, true) => UpgradeType::Course,
        (true, true) => UpgradeType::Combo,
    }
}

/// Min / max / median of the ranks taking one path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankRange {
    pub min: u32,
    pub max: u32,
    pub median: f64,
}

impl RankRange {
    /// `None` for an empty slice. Sorts in place.
    pub fn from_ranks(ranks: &mut [u32]) -> Option<Self> {
        if ranks.is_empty() {
            return None;
        }
        ranks.sort_unstable();
        let n = ranks.len();
        let median = if n % 2 == 1 {
            ranks[n / 2] as f64
        } else {
            (ranks[n / 2 - 1] as f64 + ranks[n / 2] as f64) / 2.0
        };
        Some(Self {
            min: ranks[0],
            max: ranks[n - 1],
            median,
        })
    }
}

/// `numerator / denominator`, or 0 for an empty population.
pub(crate) fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_upgrade() {
        let ax = SeatKey::new("A", "X");
        assert_eq!(classify_upgrade(&ax, &SeatKey::new("A", "X")), UpgradeType::None);
        assert_eq!(classify_upgrade(&ax, &SeatKey::new("B", "X")), UpgradeType::College);
        assert_eq!(classify_upgrade(&ax, &SeatKey::new("A", "Y")), UpgradeType::Course);
        assert_eq!(classify_upgrade(&ax, &SeatKey::new("B", "Y")), UpgradeType::Combo);
    }

    #[test]
    fn test_rank_range_median() {
        let mut odd = vec![30, 10, 20];
        let range = RankRange::from_ranks(&mut odd).unwrap();
        assert_eq!((range.min, range.max), (10, 30));
        assert_eq!(range.median, 20.0);

        let mut even = vec![40, 10, 20, 30];
        assert_eq!(RankRange::from_ranks(&mut even).unwrap().median, 25.0);

        assert!(RankRange::from_ranks(&mut []).is_none());
    }

    #[test]
    fn test_ratio_handles_empty_population() {
        assert_eq!(ratio(3, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
