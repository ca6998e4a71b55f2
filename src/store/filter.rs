//! Allocation query filter shared by every store implementation.

use crate::models::{AllocationRecord, Round, SeatKey};

/// Conjunction of optional predicates over allocation rows.
///
/// `ranks` is an IN-list; an empty list matches nothing. `allotted_only` keeps rows that
/// carry a seat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationFilter {
    pub year: Option<u16>,
    pub source_id: Option<String>,
    pub level_id: Option<String>,
    pub category: Option<String>,
    pub quota: Option<String>,
    pub round: Option<Round>,
    pub college_id: Option<String>,
    pub course_id: Option<String>,
    pub rank: Option<u32>,
    pub rank_range: Option<(u32, u32)>,
    pub ranks: Option<Vec<u32>>,
    pub allotted_only: bool,
}

impl AllocationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn year(mut self, year: u16) -> Self {
        self.year = Some(year);
        self
    }

    pub fn category(mut self, category: Option<&str>) -> Self {
        self.category = category.map(str::to_string);
        self
    }

    pub fn quota(mut self, quota: Option<&str>) -> Self {
        self.quota = quota.map(str::to_string);
        self
    }

    pub fn round(mut self, round: Round) -> Self {
        self.round = Some(round);
        self
    }

    pub fn seat(mut self, seat: &SeatKey) -> Self {
        self.college_id = Some(seat.college_id.clone());
        self.course_id = Some(seat.course_id.clone());
        self
    }

    pub fn rank(mut self, rank: u32) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn rank_range(mut self, start: u32, end: u32) -> Self {
        self.rank_range = Some((start, end));
        self
    }

    pub fn ranks(mut self, ranks: Vec<u32>) -> Self {
        self.ranks = Some(ranks);
        self
    }

    pub fn allotted_only(mut self) -> Self {
        self.allotted_only = true;
        self
    }

    /// Evaluate the filter against one record (in-memory stores).
    pub fn matches(&self, record: &AllocationRecord) -> bool {
        fn eq_opt(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }

        if self.year.is_some_and(|y| y != record.year) {
            return false;
        }
        if self.round.is_some_and(|r| r != record.round) {
            return false;
        }
        if !eq_opt(&self.source_id, &record.source_id)
            || !eq_opt(&self.level_id, &record.level_id)
            || !eq_opt(&self.category, &record.category)
            || !eq_opt(&self.quota, &record.quota)
        {
            return false;
        }
        if self.college_id.is_some() && self.college_id.as_deref() != record.college_id() {
            return false;
        }
        if self.course_id.is_some() && self.course_id.as_deref() != record.course_id() {
            return false;
        }
        if self.rank.is_some_and(|r| r != record.rank) {
            return false;
        }
        if let Some((lo, hi)) = self.rank_range {
            if record.rank < lo || record.rank > hi {
                return false;
            }
        }
        if let Some(ranks) = &self.ranks {
            if !ranks.contains(&record.rank) {
                return false;
            }
        }
        if self.allotted_only && !record.is_allotted() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AllocationStatus, UpgradeType, VerificationStatus};

    fn record(rank: u32, round: u16, seat: Option<(&str, &str)>) -> AllocationRecord {
        AllocationRecord {
            rank,
            year: 2024,
            category: "GENERAL".into(),
            quota: "STATE".into(),
            round: Round::new(round).unwrap(),
            source_id: "KEA".into(),
            level_id: "UG".into(),
            seat: seat.map(|(c, k)| SeatKey::new(c, k)),
            allocation_status: if seat.is_some() {
                AllocationStatus::Allotted
            } else {
                AllocationStatus::NotAllotted
            },
            is_upgrade: false,
            previous_seat: None,
            upgrade_type: UpgradeType::None,
            data_source: "test".into(),
            verification_status: VerificationStatus::Verified,
            college_name: None,
            course_name: None,
            state: None,
        }
    }

    #[test]
    fn test_partition_filter_matches() {
        let filter = AllocationFilter {
            source_id: Some("KEA".into()),
            level_id: Some("UG".into()),
            ..AllocationFilter::new()
        }
        .year(2024)
        .round(Round::new(1).unwrap());
        assert!(filter.matches(&record(10, 1, Some(("A", "X")))));
        assert!(!filter.matches(&record(10, 2, Some(("A", "X")))));
        assert!(!filter.clone().year(2023).matches(&record(10, 1, Some(("A", "X")))));
    }

    #[test]
    fn test_seat_and_allotted_filters() {
        let filter = AllocationFilter::new()
            .seat(&SeatKey::new("A", "X"))
            .allotted_only();
        assert!(filter.matches(&record(1, 1, Some(("A", "X")))));
        assert!(!filter.matches(&record(1, 1, Some(("A", "Y")))));
        assert!(!filter.matches(&record(1, 1, None)));
        assert!(AllocationFilter::new().matches(&record(1, 1, None)));
    }

    #[test]
    fn test_rank_filters() {
        let r = record(250, 1, Some(("A", "X")));
        assert!(AllocationFilter::new().rank_range(1, 500).matches(&r));
        assert!(!AllocationFilter::new().rank_range(251, 500).matches(&r));
        assert!(AllocationFilter::new().ranks(vec![3, 250]).matches(&r));
        assert!(!AllocationFilter::new().ranks(vec![]).matches(&r));
        assert!(!AllocationFilter::new().rank(249).matches(&r));
    }
}
