//! Probability Matrix Builder
//!
//! Empirical next-round destinations for ranks starting from one seat.

use super::classify::{classify_upgrade, ratio, RankRange};
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{AllocationRecord, RankIdentity, Round, SeatKey, UpgradeType};
use crate::store::AllocationFilter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityRequest {
    pub year: u16,
    pub source_id: String,
    pub level_id: String,
    pub category: String,
    pub quota: String,
    pub round: Round,
    pub college_id: String,
    pub course_id: String,
    /// Defaults to the round after `round`
    #[serde(default)]
    pub to_round: Option<Round>,
}

impl ProbabilityRequest {
    pub fn validate(&self) -> AnalysisResult<()> {
        for (field, value) in [
            ("source_id", &self.source_id),
            ("level_id", &self.level_id),
            ("category", &self.category),
            ("quota", &self.quota),
            ("college_id", &self.college_id),
            ("course_id", &self.course_id),
        ] {
            if value.trim().is_empty() {
                return Err(AnalysisError::invalid(field, "must be non-empty"));
            }
        }
        self.resolve_to_round().map(|_| ())
    }

    pub fn resolve_to_round(&self) -> AnalysisResult<Round> {
        match self.to_round {
            Some(to) if to > self.round => Ok(to),
            Some(to) => Err(AnalysisError::invalid(
                "to_round",
                format!("{} must come after {}", to, self.round),
            )),
            None => self.round.next().ok_or_else(|| {
                AnalysisError::invalid("round", format!("{} has no following round", self.round))
            }),
        }
    }

    pub fn origin(&self) -> SeatKey {
        SeatKey::new(self.college_id.clone(), self.course_id.clone())
    }

    fn base_filter(&self, round: Round) -> AllocationFilter {
        AllocationFilter {
            year: Some(self.year),
            source_id: Some(self.source_id.clone()),
            level_id: Some(self.level_id.clone()),
            category: Some(self.category.clone()),
            quota: Some(self.quota.clone()),
            round: Some(round),
            ..AllocationFilter::default()
        }
    }

    pub fn origin_filter(&self) -> AllocationFilter {
        self.base_filter(self.round).seat(&self.origin()).allotted_only()
    }

    pub fn next_round_filter(&self, to_round: Round, ranks: Vec<u32>) -> AllocationFilter {
        self.base_filter(to_round).ranks(ranks)
    }
}

/// Where an origin rank ended up. `Exited` covers withdrawn and unallotted rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Destination {
    Seat(SeatKey),
    Exited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationProbability {
    pub destination: Destination,
    pub upgrade_type: UpgradeType,
    pub count: usize,
    pub probability: f64,
    pub rank_range: RankRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeProbabilityMatrix {
    pub origin: SeatKey,
    pub year: u16,
    pub from_round: Round,
    pub to_round: Round,
    pub probabilities: Vec<DestinationProbability>,
    pub freeze_probability: f64,
    pub freeze_count: usize,
    pub total_sample_size: usize,
}

/// Tally where each origin occupant went. A missing next-round record is a freeze.
pub fn build_matrix(
    origin: &SeatKey,
    year: u16,
    from_round: Round,
    to_round: Round,
    occupants: &[AllocationRecord],
    next_records: &[AllocationRecord],
) -> UpgradeProbabilityMatrix {
    let cohort: Vec<&AllocationRecord> = occupants
        .iter()
        .filter(|r| r.seat.as_ref() == Some(origin))
        .collect();
    let next: HashMap<RankIdentity, &AllocationRecord> =
        next_records.iter().map(|r| (r.identity(), r)).collect();

    let mut freeze_count = 0usize;
    let mut moves: BTreeMap<Destination, Vec<u32>> = BTreeMap::new();
    for record in &cohort {
        let destination = match next.get(&record.identity()).map(|n| n.seat.as_ref()) {
            None => None,
            Some(Some(seat)) if seat == origin => None,
            Some(Some(seat)) => Some(Destination::Seat(seat.clone())),
            Some(None) => Some(Destination::Exited),
        };
        match destination {
            None => freeze_count += 1,
            Some(dest) => moves.entry(dest).or_default().push(record.rank),
        }
    }

    let population = cohort.len();
    let mut probabilities: Vec<DestinationProbability> = moves
        .into_iter()
        .filter_map(|(destination, mut ranks)| {
            let count = ranks.len();
            let upgrade_type = match &destination {
                Destination::Seat(seat) => classify_upgrade(origin, seat),
                Destination::Exited => UpgradeType::None,
            };
            Some(DestinationProbability {
                rank_range: RankRange::from_ranks(&mut ranks)?,
                destination,
                upgrade_type,
                count,
                probability: ratio(count, population),
            })
        })
        .collect();
    // Probability is count / population, so count order is probability order.
    probabilities.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.destination.cmp(&b.destination))
    });

    UpgradeProbabilityMatrix {
        origin: origin.clone(),
        year,
        from_round,
        to_round,
        probabilities,
        freeze_probability: ratio(freeze_count, population),
        freeze_count,
        total_sample_size: population,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::RecordBuilder;
    use crate::models::AllocationStatus;

    fn request() -> ProbabilityRequest {
        ProbabilityRequest {
            year: 2024,
            source_id: "KEA".into(),
            level_id: "UG".into(),
            category: "GENERAL".into(),
            quota: "STATE".into(),
            round: Round::new(1).unwrap(),
            college_id: "A".into(),
            course_id: "X".into(),
            to_round: None,
        }
    }

    fn r1() -> Round {
        Round::new(1).unwrap()
    }

    fn r2() -> Round {
        Round::new(2).unwrap()
    }

    #[test]
    fn test_distribution_sums_to_one() {
        let origin = SeatKey::new("A", "X");
        let occupants: Vec<_> = (1..=10)
            .map(|rank| RecordBuilder::new(rank, 1).seat("A", "X").build())
            .collect();
        let mut next = Vec::new();
        for rank in 1..=4 {
            next.push(RecordBuilder::new(rank, 2).seat("A", "X").previous("A", "X").build());
        }
        for rank in 5..=7 {
            next.push(
                RecordBuilder::new(rank, 2)
                    .seat("B", "X")
                    .upgraded_from("A", "X", UpgradeType::College)
                    .build(),
            );
        }
        next.push(
            RecordBuilder::new(8, 2)
                .seat("A", "Y")
                .upgraded_from("A", "X", UpgradeType::Course)
                .build(),
        );
        next.push(
            RecordBuilder::new(9, 2)
                .status(AllocationStatus::Withdrawn)
                .previous("A", "X")
                .build(),
        );
        // Rank 10 has no round-2 record.

        let matrix = build_matrix(&origin, 2024, r1(), r2(), &occupants, &next);
        assert_eq!(matrix.total_sample_size, 10);
        assert_eq!(matrix.freeze_count, 5);
        assert!((matrix.freeze_probability - 0.5).abs() < 1e-9);

        let total: f64 = matrix.probabilities.iter().map(|p| p.probability).sum();
        assert!((total + matrix.freeze_probability - 1.0).abs() < 1e-9);

        let top = &matrix.probabilities[0];
        assert_eq!(top.destination, Destination::Seat(SeatKey::new("B", "X")));
        assert_eq!(top.upgrade_type, UpgradeType::College);
        assert_eq!((top.rank_range.min, top.rank_range.max), (5, 7));
        assert_eq!(matrix.probabilities[1].upgrade_type, UpgradeType::Course);
        assert_eq!(matrix.probabilities[2].destination, Destination::Exited);
    }

    #[test]
    fn test_zero_sample() {
        let matrix = build_matrix(&SeatKey::new("A", "X"), 2024, r1(), r2(), &[], &[]);
        assert!(matrix.probabilities.is_empty());
        assert_eq!(matrix.freeze_probability, 0.0);
        assert_eq!(matrix.total_sample_size, 0);
    }

    #[test]
    fn test_to_round_resolution() {
        assert_eq!(request().resolve_to_round().unwrap(), r2());

        let mut mop_up = request();
        mop_up.round = Round::MOP_UP;
        assert!(matches!(
            mop_up.validate(),
            Err(AnalysisError::InvalidFilter { field: "round", .. })
        ));

        let mut backwards = request();
        backwards.round = r2();
        backwards.to_round = Some(r1());
        assert!(backwards.validate().is_err());

        let mut to_mop_up = request();
        to_mop_up.to_round = Some(Round::MOP_UP);
        assert_eq!(to_mop_up.resolve_to_round().unwrap(), Round::MOP_UP);
    }

    #[test]
    fn test_destination_wire_format() {
        let seat = serde_json::to_value(Destination::Seat(SeatKey::new("B", "X"))).unwrap();
        assert_eq!(seat["kind"], "SEAT");
        assert_eq!(seat["college_id"], "B");
        let exited = serde_json::to_value(Destination::Exited).unwrap();
        assert_eq!(exited["kind"], "EXITED");
    }
}
