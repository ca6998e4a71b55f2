//! Journey Reconstructor
//!
//! Folds one rank's per-round allocation rows into a continuous journey: rounds played,
//! upgrades taken, and where the rank finally ended up.

use super::classify::classify_upgrade;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{AllocationRecord, AllocationStatus, Round, SeatKey, UpgradeType};
use crate::store::AllocationFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Key of one rank's journey.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JourneyRequest {
    pub rank: u32,
    pub year: u16,
    pub category: String,
    pub quota: String,
    pub source_id: String,
    pub level_id: String,
}

impl JourneyRequest {
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.rank == 0 {
            return Err(AnalysisError::invalid("rank", "rank must be >= 1"));
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

    pub fn filter(&self) -> AllocationFilter {
        AllocationFilter {
            year: Some(self.year),
            source_id: Some(self.source_id.clone()),
            level_id: Some(self.level_id.clone()),
            category: Some(self.category.clone()),
            quota: Some(self.quota.clone()),
            rank: Some(self.rank),
            ..AllocationFilter::default()
        }
    }
}

/// One round of a journey as recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyStep {
    pub round: Round,
    pub seat: Option<SeatKey>,
    pub status: AllocationStatus,
    pub is_upgrade: bool,
    pub upgrade_type: UpgradeType,
}

/// Edge between two consecutive occupied seats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyTransition {
    pub from_round: Option<Round>,
    pub to_round: Round,
    pub from: Option<SeatKey>,
    pub to: SeatKey,
    pub upgrade_type: UpgradeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankJourney {
    pub rank: u32,
    pub year: u16,
    pub category: String,
    pub quota: String,
    pub source_id: String,
    pub level_id: String,
    pub total_rounds_participated: usize,
    pub total_upgrades: usize,
    pub final_round: Round,
    pub final_college_id: Option<String>,
    pub final_course_id: Option<String>,
    pub final_status: AllocationStatus,
    pub upgrade_types: BTreeSet<UpgradeType>,
    /// Distinct colleges in visiting order
    pub all_colleges: Vec<String>,
    pub rounds: Vec<JourneyStep>,
    pub transitions: Vec<JourneyTransition>,
    /// Rounds whose back-reference disagrees with the previous round's seat
    pub continuity_breaks: usize,
}

impl RankJourney {
    /// A rank that never held a seat in any round.
    pub fn never_admitted(&self) -> bool {
        self.final_college_id.is_none() && self.rounds.iter().all(|s| s.seat.is_none())
    }
}

/// Fold the rank's records into a journey. `Ok(None)` when there are no records.
pub fn reconstruct_journey(
    request: &JourneyRequest,
    mut records: Vec<AllocationRecord>,
) -> AnalysisResult<Option<RankJourney>> {
    records.retain(|r| {
        r.rank == request.rank
            && r.year == request.year
            && r.category == request.category
            && r.quota == request.quota
            && r.source_id == request.source_id
            && r.level_id == request.level_id
    });
    if records.is_empty() {
        return Ok(None);
    }
    records.sort_by_key(|r| r.round);

    if let Some(w) = records.windows(2).find(|w| w[0].round == w[1].round) {
        return Err(AnalysisError::InconsistentData(format!(
            "rank {} has two records in {}",
            request.rank, w[0].round
        )));
    }

    let mut current_seat: Option<SeatKey> = None;
    let mut current_round: Option<Round> = None;
    let mut total_upgrades = 0usize;
    let mut upgrade_types = BTreeSet::new();
    let mut all_colleges: Vec<String> = Vec::new();
    let mut transitions = Vec::new();
    let mut steps = Vec::with_capacity(records.len());
    let mut continuity_breaks = 0usize;

    for record in &records {
        if current_round.is_some() {
            let backref_mismatch = record
                .previous_seat
                .as_ref()
                .is_some_and(|prev| current_seat.as_ref() != Some(prev));
            let unflagged_move = !record.is_upgrade
                && matches!((&current_seat, &record.seat), (Some(a), Some(b)) if a != b);
            if backref_mismatch || unflagged_move {
                continuity_breaks += 1;
                warn!(
                    rank = request.rank,
                    round = %record.round,
                    "allocation back-reference does not match previous round"
                );
            }
        }

        if record.is_upgrade {
            total_upgrades += 1;
            let from = record.previous_seat.clone().or_else(|| current_seat.clone());
            let upgrade_type = match (&from, &record.seat) {
                (Some(a), Some(b)) if record.upgrade_type == UpgradeType::None => {
                    classify_upgrade(a, b)
                }
                _ => record.upgrade_type,
            };
            upgrade_types.insert(upgrade_type);
            if let Some(to) = &record.seat {
                transitions.push(JourneyTransition {
                    from_round: current_round,
                    to_round: record.round,
                    from,
                    to: to.clone(),
                    upgrade_type,
                });
            }
        }

        if let Some(seat) = &record.seat {
            if !all_colleges.contains(&seat.college_id) {
                all_colleges.push(seat.college_id.clone());
            }
        }

        steps.push(JourneyStep {
            round: record.round,
            seat: record.seat.clone(),
            status: record.allocation_status,
            is_upgrade: record.is_upgrade,
            upgrade_type: record.upgrade_type,
        });
        current_seat = record.seat.clone();
        current_round = Some(record.round);
    }

    let Some(last) = records.last() else {
        return Ok(None);
    };
    // Nothing after the last round: a held seat is by definition frozen.
    let final_status = if last.seat.is_some() {
        AllocationStatus::Freeze
    } else {
        last.allocation_status
    };

    Ok(Some(RankJourney {
        rank: request.rank,
        year: request.year,
        category: request.category.clone(),
        quota: request.quota.clone(),
        source_id: request.source_id.clone(),
        level_id: request.level_id.clone(),
        total_rounds_participated: steps.len(),
        total_upgrades,
        final_round: last.round,
        final_college_id: last.college_id().map(str::to_string),
        final_course_id: last.course_id().map(str::to_string),
        final_status,
        upgrade_types,
        all_colleges,
        rounds: steps,
        transitions,
        continuity_breaks,
    }))
}
