//! Stability Scorer
//!
//! How well a college+course keeps the ranks it admits between two early rounds, averaged
//! over a short window of years.

use super::classify::ratio;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{AllocationRecord, RankIdentity, Round, SeatKey};
use crate::store::AllocationFilter;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;

/// Yearly scores may drift by this many points and still count as steady.
const TREND_DEAD_BAND: f64 = 5.0;

/// Widest window a single request may fan out over.
pub const MAX_LOOKBACK_YEARS: u16 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityRequest {
    pub year: u16,
    /// Prior years scored alongside `year`; `stability.lookback_years` when unset
    #[serde(default)]
    pub lookback_years: Option<u16>,
    pub source_id: String,
    pub level_id: String,
    pub college_id: String,
    pub course_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub quota: Option<String>,
}

impl StabilityRequest {
    pub fn validate(&self) -> AnalysisResult<()> {
        for (field, value) in [
            ("source_id", &self.source_id),
            ("level_id", &self.level_id),
            ("college_id", &self.college_id),
            ("course_id", &self.course_id),
        ] {
            if value.trim().is_empty() {
                return Err(AnalysisError::invalid(field, "must be non-empty"));
            }
        }
        if self.lookback_years.is_some_and(|n| n > MAX_LOOKBACK_YEARS) {
            return Err(AnalysisError::invalid(
                "lookback_years",
                format!("at most {} prior years", MAX_LOOKBACK_YEARS),
            ));
        }
        Ok(())
    }

    pub fn seat(&self) -> SeatKey {
        SeatKey::new(self.college_id.clone(), self.course_id.clone())
    }

    /// Oldest to newest, ending at `year`.
    pub fn years(&self, default_lookback: u16) -> Vec<u16> {
        let lookback = self
            .lookback_years
            .unwrap_or(default_lookback)
            .min(MAX_LOOKBACK_YEARS);
        (self.year.saturating_sub(lookback)..=self.year).collect()
    }

    fn base_filter(&self, year: u16, round: Round) -> AllocationFilter {
        AllocationFilter {
            year: Some(year),
            source_id: Some(self.source_id.clone()),
            level_id: Some(self.level_id.clone()),
            category: self.category.clone(),
            quota: self.quota.clone(),
            round: Some(round),
            ..AllocationFilter::default()
        }
    }

    /// Ranks holding the seat in `round` of `year`.
    pub fn occupants_filter(&self, year: u16, round: Round) -> AllocationFilter {
        self.base_filter(year, round).seat(&self.seat()).allotted_only()
    }

    /// Every `round` record of `year` for the given ranks, seated or not.
    pub fn followup_filter(&self, year: u16, round: Round, ranks: Vec<u32>) -> AllocationFilter {
        self.base_filter(year, round).ranks(ranks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StabilityClass {
    Terminal,
    Aspirational,
    SteppingStone,
}

impl StabilityClass {
    pub fn from_score(score: f64) -> Self {
        if score >= 70.0 {
            StabilityClass::Terminal
        } else if score >= 40.0 {
            StabilityClass::Aspirational
        } else {
            StabilityClass::SteppingStone
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendDirection {
    Improving,
    Declining,
    Steady,
    Insufficient,
}

impl TrendDirection {
    pub fn from_scores(scores: &[f64]) -> Self {
        match (scores.first(), scores.last()) {
            (Some(first), Some(last)) if scores.len() >= 2 => {
                let delta = last - first;
                if delta > TREND_DEAD_BAND {
                    TrendDirection::Improving
                } else if delta < -TREND_DEAD_BAND {
                    TrendDirection::Declining
                } else {
                    TrendDirection::Steady
                }
            }
            _ => TrendDirection::Insufficient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlyStability {
    pub year: u16,
    pub population: usize,
    pub retained: usize,
    pub score: f64,
    pub retention_rate: f64,
    pub outflow_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityMetrics {
    pub seat: SeatKey,
    pub year: u16,
    pub from_round: Round,
    pub to_round: Round,
    pub stability_score: f64,
    /// `None` when no year in the window had a population
    pub classification: Option<StabilityClass>,
    pub retention_rate: f64,
    pub inflow_rate: f64,
    pub outflow_rate: f64,
    pub yearly_trend: Vec<YearlyStability>,
    pub trend_direction: TrendDirection,
}

/// Retention of one year's `from_round` occupants into `to_round`.
///
/// A rank with no `to_round` record never left and counts as retained. Returns `None`
/// for a year with no occupants.
pub fn score_year(
    year: u16,
    seat: &SeatKey,
    occupants: &[AllocationRecord],
    followups: &[AllocationRecord],
) -> Option<YearlyStability> {
    let cohort: Vec<&AllocationRecord> = occupants
        .iter()
        .filter(|r| r.year == year && r.seat.as_ref() == Some(seat))
        .collect();
    if cohort.is_empty() {
        return None;
    }

    let next: HashMap<RankIdentity, &AllocationRecord> =
        followups.iter().map(|r| (r.identity(), r)).collect();
    let retained = cohort
        .iter()
        .filter(|r| match next.get(&r.identity()) {
            None => true,
            Some(later) => later.seat.as_ref() == Some(seat),
        })
        .count();

    let score = retained as f64 * 100.0 / cohort.len() as f64;
    Some(YearlyStability {
        year,
        population: cohort.len(),
        retained,
        score,
        retention_rate: score,
        outflow_rate: 100.0 - score,
    })
}

/// Share of the requested year's `to_round` occupants that arrived by upgrade.
pub fn inflow_rate(to_round_occupants: &[AllocationRecord]) -> f64 {
    let arrived = to_round_occupants
        .iter()
        .filter(|r| r.is_upgrade && r.previous_seat.is_some())
        .count();
    ratio(arrived, to_round_occupants.len()) * 100.0
}

pub fn build_metrics(
    request: &StabilityRequest,
    from_round: Round,
    to_round: Round,
    mut yearly: Vec<YearlyStability>,
    inflow_rate: f64,
) -> StabilityMetrics {
    yearly.sort_by_key(|y| y.year);
    let scores: Vec<f64> = yearly.iter().map(|y| y.score).collect();

    let (stability_score, classification, outflow_rate) = if scores.is_empty() {
        (0.0, None, 0.0)
    } else {
        let mean = scores.iter().mean();
        (mean, Some(StabilityClass::from_score(mean)), 100.0 - mean)
    };

    StabilityMetrics {
        seat: request.seat(),
        year: request.year,
        from_round,
        to_round,
        stability_score,
        classification,
        retention_rate: stability_score,
        inflow_rate,
        outflow_rate,
        trend_direction: TrendDirection::from_scores(&scores),
        yearly_trend: yearly,
    }
}
