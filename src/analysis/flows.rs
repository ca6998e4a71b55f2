//! Migration Flow Aggregator
//!
//! Population flows between two rounds of one counselling partition. The population is
//! every rank holding a seat in `to_round`; each is matched to its `from_round` seat by
//! (rank, category, quota) identity and grouped by (origin, destination).

use super::classify::{classify_upgrade, ratio, RankRange};
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{AllocationRecord, RankIdentity, Round, SeatKey, UpgradeType};
use crate::store::AllocationFilter;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    pub year: u16,
    pub source_id: String,
    pub level_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub quota: Option<String>,
    pub from_round: Round,
    pub to_round: Round,
    /// Falls back to `flows.default_min_flow_count` when unset
    #[serde(default)]
    pub min_flow_count: Option<usize>,
    /// List freeze (same-seat) groups alongside real moves
    #[serde(default)]
    pub include_freezes: bool,
}

impl FlowRequest {
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.from_round >= self.to_round {
            return Err(AnalysisError::invalid(
                "from_round",
                format!("{} must precede {}", self.from_round, self.to_round),
            ));
        }
        if self.source_id.trim().is_empty() {
            return Err(AnalysisError::invalid("source_id", "must be non-empty"));
        }
        if self.level_id.trim().is_empty() {
            return Err(AnalysisError::invalid("level_id", "must be non-empty"));
        }
        Ok(())
    }

    /// Allotted rows of one side of the comparison.
    pub fn round_filter(&self, round: Round) -> AllocationFilter {
        AllocationFilter {
            year: Some(self.year),
            source_id: Some(self.source_id.clone()),
            level_id: Some(self.level_id.clone()),
            category: self.category.clone(),
            quota: self.quota.clone(),
            round: Some(round),
            allotted_only: true,
            ..AllocationFilter::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeFlow {
    pub origin: SeatKey,
    pub from_round: Round,
    pub destination: SeatKey,
    pub to_round: Round,
    pub student_count: u64,
    pub rank_range: RankRange,
    pub upgrade_type: UpgradeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    /// Ranks allotted in `to_round`
    pub total_students: usize,
    /// Distinct destination colleges
    pub unique_colleges: usize,
    pub upgrade_rate: f64,
    pub freeze_rate: f64,
    pub new_entrants: usize,
    pub movers: usize,
    pub freezers: usize,
}

/// One rank's move between the two rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentMigration {
    pub rank: u32,
    pub category: String,
    pub quota: String,
    pub from_round: Round,
    pub to_round: Round,
    pub origin: SeatKey,
    pub destination: SeatKey,
    pub upgrade_type: UpgradeType,
    pub origin_college_name: Option<String>,
    pub origin_course_name: Option<String>,
    pub origin_state: Option<String>,
    pub destination_college_name: Option<String>,
    pub destination_course_name: Option<String>,
    pub destination_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationFlowReport {
    pub year: u16,
    pub from_round: Round,
    pub to_round: Round,
    pub min_flow_count: usize,
    pub flows: Vec<UpgradeFlow>,
    pub summary: FlowSummary,
    /// Lowest-ranked individual moves, for drill-down
    pub sample: Vec<StudentMigration>,
}

#[derive(Default)]
struct FlowAccumulator {
    groups: HashMap<(SeatKey, SeatKey), Vec<u32>>,
    destination_colleges: HashSet<String>,
    population: usize,
    new_entrants: usize,
    freezers: usize,
}

impl FlowAccumulator {
    fn observe(mut self, origin: Option<&SeatKey>, destination: &SeatKey, rank: u32) -> Self {
        self.population += 1;
        self.destination_colleges
            .insert(destination.college_id.clone());
        match origin {
            None => self.new_entrants += 1,
            Some(origin) => {
                if origin == destination {
                    self.freezers += 1;
                }
                self.groups
                    .entry((origin.clone(), destination.clone()))
                    .or_default()
                    .push(rank);
            }
        }
        self
    }

    fn merge(mut self, other: Self) -> Self {
        self.population += other.population;
        self.new_entrants += other.new_entrants;
        self.freezers += other.freezers;
        self.destination_colleges.extend(other.destination_colleges);
        for (key, ranks) in other.groups {
            self.groups.entry(key).or_default().extend(ranks);
        }
        self
    }
}

fn origin_index(from_records: &[AllocationRecord]) -> HashMap<RankIdentity, &AllocationRecord> {
    from_records
        .iter()
        .filter(|r| r.seat.is_some())
        .map(|r| (r.identity(), r))
        .collect()
}

/// Group the `to_round` population by (origin, destination).
///
/// Rates always come from the full population; `min_flow_count` and `include_freezes` only
/// decide which groups are listed.
pub fn aggregate_flows(
    request: &FlowRequest,
    min_flow_count: usize,
    sample_cap: usize,
    from_records: &[AllocationRecord],
    to_records: &[AllocationRecord],
) -> MigrationFlowReport {
    let origins = origin_index(from_records);

    let acc = to_records
        .par_iter()
        .filter_map(|r| r.seat.as_ref().map(|seat| (r, seat)))
        .fold(FlowAccumulator::default, |acc, (record, destination)| {
            let origin = origins
                .get(&record.identity())
                .and_then(|o| o.seat.as_ref());
            acc.observe(origin, destination, record.rank)
        })
        .reduce(FlowAccumulator::default, FlowAccumulator::merge);

    let mut flows: Vec<UpgradeFlow> = acc
        .groups
        .into_iter()
        .filter_map(|((origin, destination), mut ranks)| {
            let upgrade_type = classify_upgrade(&origin, &destination);
            if ranks.len() < min_flow_count
                || (!upgrade_type.is_move() && !request.include_freezes)
            {
                return None;
            }
            let rank_range = RankRange::from_ranks(&mut ranks)?;
            Some(UpgradeFlow {
                origin,
                from_round: request.from_round,
                destination,
                to_round: request.to_round,
                student_count: ranks.len() as u64,
                rank_range,
                upgrade_type,
            })
        })
        .collect();
    flows.sort_by(|a, b| {
        b.student_count
            .cmp(&a.student_count)
            .then_with(|| a.origin.cmp(&b.origin))
            .then_with(|| a.destination.cmp(&b.destination))
    });

    let upgrade_rate = ratio(acc.population - acc.freezers, acc.population);
    let freeze_rate = if acc.population == 0 {
        0.0
    } else {
        1.0 - upgrade_rate
    };

    let mut sample = collect_migrations(request, from_records, to_records);
    sample.truncate(sample_cap);

    MigrationFlowReport {
        year: request.year,
        from_round: request.from_round,
        to_round: request.to_round,
        min_flow_count,
        flows,
        summary: FlowSummary {
            total_students: acc.population,
            unique_colleges: acc.destination_colleges.len(),
            upgrade_rate,
            freeze_rate,
            new_entrants: acc.new_entrants,
            movers: acc.population - acc.freezers - acc.new_entrants,
            freezers: acc.freezers,
        },
        sample,
    }
}

/// Every rank whose seat changed between the two rounds, sorted by (rank, category, quota).
pub fn collect_migrations(
    request: &FlowRequest,
    from_records: &[AllocationRecord],
    to_records: &[AllocationRecord],
) -> Vec<StudentMigration> {
    let origins = origin_index(from_records);
    let mut migrations: Vec<StudentMigration> = to_records
        .iter()
        .filter_map(|to| {
            let destination = to.seat.as_ref()?;
            let from = origins.get(&to.identity())?;
            let origin = from.seat.as_ref()?;
            let upgrade_type = classify_upgrade(origin, destination);
            if !upgrade_type.is_move() {
                return None;
            }
            Some(StudentMigration {
                rank: to.rank,
                category: to.category.clone(),
                quota: to.quota.clone(),
                from_round: request.from_round,
                to_round: request.to_round,
                origin: origin.clone(),
                destination: destination.clone(),
                upgrade_type,
                origin_college_name: from.college_name.clone(),
                origin_course_name: from.course_name.clone(),
                origin_state: from.state.clone(),
                destination_college_name: to.college_name.clone(),
                destination_course_name: to.course_name.clone(),
                destination_state: to.state.clone(),
            })
        })
        .collect();
    migrations.sort_by(|a, b| {
        (a.rank, &a.category, &a.quota).cmp(&(b.rank, &b.category, &b.quota))
    });
    migrations
}

/// Drill-down filters; seat and state filters match either side of the move.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationFilters {
    pub state: Option<String>,
    pub college_id: Option<String>,
    pub course_id: Option<String>,
    pub rank_min: Option<u32>,
    pub rank_max: Option<u32>,
    /// Case-insensitive substring of a college/course name or id
    pub text: Option<String>,
}

impl MigrationFilters {
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.rank_min == Some(0) {
            return Err(AnalysisError::invalid("rank_min", "rank bounds must be >= 1"));
        }
        if self.rank_max == Some(0) {
            return Err(AnalysisError::invalid("rank_max", "rank bounds must be >= 1"));
        }
        if let (Some(min), Some(max)) = (self.rank_min, self.rank_max) {
            if min > max {
                return Err(AnalysisError::invalid(
                    "rank_min",
                    format!("rank_min {} exceeds rank_max {}", min, max),
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, m: &StudentMigration) -> bool {
        if self.rank_min.is_some_and(|min| m.rank < min)
            || self.rank_max.is_some_and(|max| m.rank > max)
        {
            return false;
        }
        if let Some(college) = &self.college_id {
            if &m.origin.college_id != college && &m.destination.college_id != college {
                return false;
            }
        }
        if let Some(course) = &self.course_id {
            if &m.origin.course_id != course && &m.destination.course_id != course {
                return false;
            }
        }
        if let Some(state) = &self.state {
            let hit = [&m.origin_state, &m.destination_state]
                .into_iter()
                .flatten()
                .any(|s| s.eq_ignore_ascii_case(state));
            if !hit {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let ids = [
                &m.origin.college_id,
                &m.origin.course_id,
                &m.destination.college_id,
                &m.destination.course_id,
            ];
            let names = [
                &m.origin_college_name,
                &m.origin_course_name,
                &m.destination_college_name,
                &m.destination_course_name,
            ];
            let hit = ids
                .into_iter()
                .chain(names.into_iter().flatten())
                .any(|s| s.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches before paging
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Filter then slice `migrations`, which must already be in (rank, category, quota) order.
pub fn paginate_migrations(
    migrations: Vec<StudentMigration>,
    filters: &MigrationFilters,
    page: PageRequest,
    max_page_size: usize,
) -> AnalysisResult<Page<StudentMigration>> {
    if page.limit == 0 {
        return Err(AnalysisError::invalid("limit", "page limit must be >= 1"));
    }
    filters.validate()?;
    let limit = page.limit.min(max_page_size.max(1));

    let filtered: Vec<StudentMigration> = migrations
        .into_iter()
        .filter(|m| filters.matches(m))
        .collect();
    let total = filtered.len();
    let items = filtered.into_iter().skip(page.offset).take(limit).collect();

    Ok(Page {
        items,
        total,
        offset: page.offset,
        limit,
    })
}
