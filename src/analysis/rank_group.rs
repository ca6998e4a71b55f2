//! Rank-Group Comparator
//!
//! Which seats a rank band could reach, compared across two years (same round) or two
//! rounds (same year).

use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{Round, SeatKey};
use crate::store::{AllocationFilter, SeatAggregate};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

const COLLEGE_SWING: i64 = 5;
const CLOSING_RANK_SWING: f64 = 500.0;
const EASIER_RATIO: f64 = 1.5;
const HARDER_RATIO: f64 = 0.67;

/// Inclusive rank band inside one category/quota of a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankBand {
    pub rank_start: u32,
    pub rank_end: u32,
    pub category: String,
    pub quota: String,
    pub source_id: String,
    pub level_id: String,
}

impl RankBand {
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.rank_start == 0 {
            return Err(AnalysisError::invalid("rank_start", "rank bounds must be >= 1"));
        }
        if self.rank_end < self.rank_start {
            return Err(AnalysisError::invalid(
                "rank_end",
                format!("band [{}, {}] is inverted", self.rank_start, self.rank_end),
            ));
        }
        for (field, value) in [
            ("category", &self.category),
            ("quota", &self.quota),
            ("source_id", &self.source_id),
            ("level_id", &self.level_id),
        ] {
            if value.trim().is_empty() {
                return Err(AnalysisError::invalid(field, "must be non-empty"));
            }
        }
        Ok(())
    }

    pub fn filter(&self, year: u16, round: Round) -> AllocationFilter {
        AllocationFilter {
            year: Some(year),
            source_id: Some(self.source_id.clone()),
            level_id: Some(self.level_id.clone()),
            category: Some(self.category.clone()),
            quota: Some(self.quota.clone()),
            round: Some(round),
            rank_range: Some((self.rank_start, self.rank_end)),
            allotted_only: true,
            ..AllocationFilter::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearComparisonRequest {
    #[serde(flatten)]
    pub band: RankBand,
    pub year1: u16,
    pub year2: u16,
    pub round: Round,
}

impl YearComparisonRequest {
    pub fn validate(&self) -> AnalysisResult<()> {
        self.band.validate()?;
        if self.year1 == self.year2 {
            return Err(AnalysisError::invalid("year2", "compared years must differ"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundComparisonRequest {
    #[serde(flatten)]
    pub band: RankBand,
    pub year: u16,
    pub round1: Round,
    pub round2: Round,
}

impl RoundComparisonRequest {
    pub fn validate(&self) -> AnalysisResult<()> {
        self.band.validate()?;
        if self.round1 == self.round2 {
            return Err(AnalysisError::invalid("round2", "compared rounds must differ"));
        }
        Ok(())
    }
}

/// A seat reached by the band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankGroupCollege {
    pub seat: SeatKey,
    /// Best (lowest) rank admitted from the band
    pub closing_rank: u32,
    pub max_rank: u32,
    pub total_students: u64,
}

impl From<SeatAggregate> for RankGroupCollege {
    fn from(agg: SeatAggregate) -> Self {
        Self {
            seat: agg.seat,
            closing_rank: agg.min_rank,
            max_rank: agg.max_rank,
            total_students: agg.student_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankGroupSide {
    pub year: u16,
    pub round: Round,
    pub college_count: usize,
    /// 0 for an empty side
    pub avg_closing_rank: f64,
    pub colleges: Vec<RankGroupCollege>,
}

impl RankGroupSide {
    pub fn new(year: u16, round: Round, aggregates: Vec<SeatAggregate>) -> Self {
        let mut colleges: Vec<RankGroupCollege> =
            aggregates.into_iter().map(RankGroupCollege::from).collect();
        colleges.sort_by(|a, b| a.seat.cmp(&b.seat));
        let avg_closing_rank = if colleges.is_empty() {
            0.0
        } else {
            colleges.iter().map(|c| c.closing_rank as f64).mean()
        };
        Self {
            year,
            round,
            college_count: colleges.len(),
            avg_closing_rank,
            colleges,
        }
    }
}

/// A seat reachable on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentCollege {
    pub seat: SeatKey,
    pub closing_rank_before: u32,
    pub closing_rank_after: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeatSetDiff {
    /// Second side only
    pub new_colleges: Vec<RankGroupCollege>,
    /// First side only
    pub lost_colleges: Vec<RankGroupCollege>,
    pub consistent_colleges: Vec<ConsistentCollege>,
}

/// Set difference of two sides by seat; every list is sorted by seat.
pub fn diff_sides(first: &RankGroupSide, second: &RankGroupSide) -> SeatSetDiff {
    let before: BTreeMap<&SeatKey, &RankGroupCollege> =
        first.colleges.iter().map(|c| (&c.seat, c)).collect();
    let after: BTreeMap<&SeatKey, &RankGroupCollege> =
        second.colleges.iter().map(|c| (&c.seat, c)).collect();

    let mut diff = SeatSetDiff::default();
    for (seat, college) in &after {
        match before.get(seat) {
            Some(prior) => diff.consistent_colleges.push(ConsistentCollege {
                seat: (*seat).clone(),
                closing_rank_before: prior.closing_rank,
                closing_rank_after: college.closing_rank,
            }),
            None => diff.new_colleges.push((*college).clone()),
        }
    }
    diff.lost_colleges = before
        .iter()
        .filter(|(seat, _)| !after.contains_key(*seat))
        .map(|(_, college)| (*college).clone())
        .collect();
    diff
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    Easier,
    Harder,
    Similar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearVerdict {
    pub difficulty: Difficulty,
    pub college_diff: i64,
    /// Second year's average closing rank minus the first's
    pub rank_diff: f64,
    pub new_to_lost_ratio: f64,
    pub justification: String,
}

/// First matching rule wins: large swings in both college count and closing rank, then
/// the new/lost ratio, else similar.
pub fn year_verdict(
    first: &RankGroupSide,
    second: &RankGroupSide,
    diff: &SeatSetDiff,
) -> YearVerdict {
    let college_diff = second.college_count as i64 - first.college_count as i64;
    let rank_diff = second.avg_closing_rank - first.avg_closing_rank;
    let new = diff.new_colleges.len();
    let lost = diff.lost_colleges.len();
    let ratio = new as f64 / lost.max(1) as f64;

    let (difficulty, justification) = if college_diff >= COLLEGE_SWING
        && rank_diff < -CLOSING_RANK_SWING
    {
        (
            Difficulty::Easier,
            format!(
                "{} more colleges reachable and closing ranks {:.0} lower on average",
                college_diff, -rank_diff
            ),
        )
    } else if college_diff <= -COLLEGE_SWING && rank_diff > CLOSING_RANK_SWING {
        (
            Difficulty::Harder,
            format!(
                "{} fewer colleges reachable and closing ranks {:.0} higher on average",
                -college_diff, rank_diff
            ),
        )
    } else if ratio >= EASIER_RATIO {
        (
            Difficulty::Easier,
            format!("{} new colleges against {} lost (ratio {:.2})", new, lost, ratio),
        )
    } else if ratio <= HARDER_RATIO {
        (
            Difficulty::Harder,
            format!("only {} new colleges against {} lost (ratio {:.2})", new, lost, ratio),
        )
    } else {
        (
            Difficulty::Similar,
            format!(
                "college count changed by {} and closing ranks by {:.0}; new/lost ratio {:.2}",
                college_diff, rank_diff, ratio
            ),
        )
    };

    YearVerdict {
        difficulty,
        college_diff,
        rank_diff,
        new_to_lost_ratio: ratio,
        justification,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearComparison {
    pub band: RankBand,
    pub year1: RankGroupSide,
    pub year2: RankGroupSide,
    #[serde(flatten)]
    pub diff: SeatSetDiff,
    pub verdict: YearVerdict,
}

pub fn build_year_comparison(
    request: &YearComparisonRequest,
    first: Vec<SeatAggregate>,
    second: Vec<SeatAggregate>,
) -> YearComparison {
    let year1 = RankGroupSide::new(request.year1, request.round, first);
    let year2 = RankGroupSide::new(request.year2, request.round, second);
    let diff = diff_sides(&year1, &year2);
    let verdict = year_verdict(&year1, &year2, &diff);
    YearComparison {
        band: request.band.clone(),
        year1,
        year2,
        diff,
        verdict,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundComparison {
    pub band: RankBand,
    pub round1: RankGroupSide,
    pub round2: RankGroupSide,
    #[serde(flatten)]
    pub diff: SeatSetDiff,
    /// Seats opening up in the later side
    pub upgrade_opportunities: usize,
    pub degradation_count: usize,
}

pub fn build_round_comparison(
    request: &RoundComparisonRequest,
    first: Vec<SeatAggregate>,
    second: Vec<SeatAggregate>,
) -> RoundComparison {
    let round1 = RankGroupSide::new(request.year, request.round1, first);
    let round2 = RankGroupSide::new(request.year, request.round2, second);
    let diff = diff_sides(&round1, &round2);
    RoundComparison {
        band: request.band.clone(),
        upgrade_opportunities: diff.new_colleges.len(),
        degradation_count: diff.lost_colleges.len(),
        round1,
        round2,
        diff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn band() -> RankBand {
        RankBand {
            rank_start: 1,
            rank_end: 500,
            category: "GENERAL".into(),
            quota: "STATE".into(),
            source_id: "KEA".into(),
            level_id: "UG".into(),
        }
    }

    fn agg(college: usize, closing_rank: u32) -> SeatAggregate {
        SeatAggregate {
            seat: SeatKey::new(format!("C{:03}", college), "MBBS"),
            student_count: 3,
            min_rank: closing_rank,
            max_rank: closing_rank + 40,
        }
    }

    fn years_request() -> YearComparisonRequest {
        YearComparisonRequest {
            band: band(),
            year1: 2023,
            year2: 2024,
            round: Round::new(1).unwrap(),
        }
    }

    #[test]
    fn test_ratio_rule_when_rank_shift_is_small() {
        // 40 colleges at 250 → 36 kept + 12 new = 48 colleges at 190.
        let first: Vec<_> = (1..=40).map(|c| agg(c, 250)).collect();
        let second: Vec<_> = (5..=52).map(|c| agg(c, 190)).collect();

        let report = build_year_comparison(&years_request(), first, second);
        assert_eq!(report.year1.college_count, 40);
        assert_eq!(report.year2.college_count, 48);
        assert_eq!(report.year1.avg_closing_rank, 250.0);
        assert_eq!(report.year2.avg_closing_rank, 190.0);
        assert_eq!(report.diff.new_colleges.len(), 12);
        assert_eq!(report.diff.lost_colleges.len(), 4);
        assert_eq!(report.verdict.college_diff, 8);
        assert_eq!(report.verdict.rank_diff, -60.0);
        assert_eq!(report.verdict.new_to_lost_ratio, 3.0);
        assert_eq!(report.verdict.difficulty, Difficulty::Easier);
        assert!(report.verdict.justification.contains("12 new"));
    }

    #[test]
    fn test_large_swings_decide_first() {
        let first: Vec<_> = (1..=10).map(|c| agg(c, 2_000)).collect();
        let second: Vec<_> = (1..=16).map(|c| agg(c, 1_000)).collect();
        let report = build_year_comparison(&years_request(), first, second);
        assert_eq!(report.verdict.difficulty, Difficulty::Easier);
        assert!(report.verdict.justification.contains("6 more colleges"));

        let first: Vec<_> = (1..=16).map(|c| agg(c, 1_000)).collect();
        let second: Vec<_> = (1..=10).map(|c| agg(c, 2_000)).collect();
        let report = build_year_comparison(&years_request(), first, second);
        assert_eq!(report.verdict.difficulty, Difficulty::Harder);
    }

    #[test]
    fn test_similar_and_harder_by_ratio() {
        let first: Vec<_> = (1..=10).map(|c| agg(c, 300)).collect();
        let second: Vec<_> = (2..=11).map(|c| agg(c, 300)).collect();
        let report = build_year_comparison(&years_request(), first, second);
        assert_eq!(report.verdict.difficulty, Difficulty::Similar);

        let first: Vec<_> = (1..=10).map(|c| agg(c, 300)).collect();
        let second: Vec<_> = (4..=10).map(|c| agg(c, 300)).collect();
        let report = build_year_comparison(&years_request(), first, second);
        assert_eq!(report.verdict.new_to_lost_ratio, 0.0);
        assert_eq!(report.verdict.difficulty, Difficulty::Harder);
    }

    #[test]
    fn test_set_algebra() {
        let first: Vec<_> = [1, 2, 3, 5, 8].into_iter().map(|c| agg(c, 100)).collect();
        let second: Vec<_> = [2, 3, 4, 8, 9].into_iter().map(|c| agg(c, 120)).collect();
        let set = |v: &[SeatAggregate]| v.iter().map(|a| a.seat.clone()).collect::<BTreeSet<_>>();
        let (s1, s2) = (set(&first), set(&second));

        let report = build_year_comparison(&years_request(), first, second);
        let consistent: BTreeSet<_> = report
            .diff
            .consistent_colleges
            .iter()
            .map(|c| c.seat.clone())
            .collect();
        let new: BTreeSet<_> = report.diff.new_colleges.iter().map(|c| c.seat.clone()).collect();
        let lost: BTreeSet<_> = report.diff.lost_colleges.iter().map(|c| c.seat.clone()).collect();

        assert_eq!(consistent, s1.intersection(&s2).cloned().collect());
        assert_eq!(new.union(&consistent).cloned().collect::<BTreeSet<_>>(), s2);
        assert_eq!(lost.union(&consistent).cloned().collect::<BTreeSet<_>>(), s1);
        assert_eq!(report.diff.consistent_colleges[0].closing_rank_before, 100);
        assert_eq!(report.diff.consistent_colleges[0].closing_rank_after, 120);
    }

    #[test]
    fn test_round_comparison_counts() {
        let request = RoundComparisonRequest {
            band: band(),
            year: 2024,
            round1: Round::new(1).unwrap(),
            round2: Round::new(2).unwrap(),
        };
        let first: Vec<_> = [1, 2, 3].into_iter().map(|c| agg(c, 100)).collect();
        let second: Vec<_> = [2, 3, 4, 5].into_iter().map(|c| agg(c, 100)).collect();
        let report = build_round_comparison(&request, first, second);
        assert_eq!(report.upgrade_opportunities, 2);
        assert_eq!(report.degradation_count, 1);
    }

    #[test]
    fn test_empty_sides() {
        let report = build_year_comparison(&years_request(), vec![], vec![]);
        assert_eq!(report.year1.avg_closing_rank, 0.0);
        assert_eq!(report.verdict.difficulty, Difficulty::Harder);
    }

    #[test]
    fn test_validation() {
        let mut req = years_request();
        req.year2 = req.year1;
        assert!(matches!(
            req.validate(),
            Err(AnalysisError::InvalidFilter { field: "year2", .. })
        ));

        let mut req = years_request();
        req.band.rank_start = 600;
        assert!(matches!(
            req.validate(),
            Err(AnalysisError::InvalidFilter { field: "rank_end", .. })
        ));

        let mut req = years_request();
        req.band.rank_start = 0;
        assert!(req.validate().is_err());
    }
}
