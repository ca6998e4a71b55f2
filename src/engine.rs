//! Migration engine
//!
//! Owns the store handle, query policy and journey cache, and exposes every analysis as an
//! async method. Sub-queries of one request run concurrently; any failure aborts the request.

use crate::analysis::flows::{self, collect_migrations, paginate_migrations};
use crate::analysis::journey::reconstruct_journey;
use crate::analysis::probability::build_matrix;
use crate::analysis::rank_group::{build_round_comparison, build_year_comparison};
use crate::analysis::stability::{self, build_metrics, YearlyStability};
use crate::analysis::{
    FlowRequest, JourneyRequest, MigrationFilters, MigrationFlowReport, Page, PageRequest,
    ProbabilityRequest, RankJourney, RoundComparison, RoundComparisonRequest, StabilityMetrics,
    StabilityRequest, StudentMigration, UpgradeProbabilityMatrix, YearComparison,
    YearComparisonRequest,
};
use crate::cache::{CacheStats, JourneyCache};
use crate::config::EngineConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{AllocationRecord, Round};
use crate::store::{AllocationFilter, AllocationStore, QueryPolicy, SeatAggregate};
use futures_util::future::try_join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub struct MigrationEngine {
    store: Arc<dyn AllocationStore>,
    policy: QueryPolicy,
    cache: JourneyCache,
    config: EngineConfig,
}

impl MigrationEngine {
    pub fn new(store: Arc<dyn AllocationStore>, config: EngineConfig) -> Self {
        Self {
            policy: QueryPolicy::from_config(&config.query),
            cache: JourneyCache::from_config(&config.cache),
            store,
            config,
        }
    }

    pub fn with_policy(mut self, policy: QueryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn select(
        &self,
        op: &'static str,
        filter: AllocationFilter,
    ) -> AnalysisResult<Vec<AllocationRecord>> {
        let store = &self.store;
        let filter = &filter;
        let rows = self
            .policy
            .run(op, || store.select_allocations(filter))
            .await?;
        Ok(rows)
    }

    async fn aggregate(
        &self,
        op: &'static str,
        filter: AllocationFilter,
    ) -> AnalysisResult<Vec<SeatAggregate>> {
        let store = &self.store;
        let filter = &filter;
        let rows = self
            .policy
            .run(op, || store.aggregate_seats(filter))
            .await?;
        Ok(rows)
    }

    /// One rank's journey; `Ok(None)` when the rank has no records.
    pub async fn journey(&self, request: &JourneyRequest) -> AnalysisResult<Option<RankJourney>> {
        request.validate()?;
        if let Some(hit) = self.cache.get(request) {
            debug!(rank = request.rank, "journey cache hit");
            return Ok(Some(hit));
        }

        let records = self.select("journey", request.filter()).await?;
        let journey = reconstruct_journey(request, records)?;
        if let Some(journey) = &journey {
            self.cache.insert(request.clone(), journey.clone());
        }
        Ok(journey)
    }

    async fn flow_sides(
        &self,
        request: &FlowRequest,
        rank_range: Option<(u32, u32)>,
    ) -> AnalysisResult<(Vec<AllocationRecord>, Vec<AllocationRecord>)> {
        let mut from_filter = request.round_filter(request.from_round);
        let mut to_filter = request.round_filter(request.to_round);
        from_filter.rank_range = rank_range;
        to_filter.rank_range = rank_range;
        tokio::try_join!(
            self.select("flows.from_round", from_filter),
            self.select("flows.to_round", to_filter),
        )
    }

    pub async fn flows(&self, request: &FlowRequest) -> AnalysisResult<MigrationFlowReport> {
        request.validate()?;
        let min_flow_count = request
            .min_flow_count
            .unwrap_or(self.config.flows.default_min_flow_count);

        let started = Instant::now();
        let (from_records, to_records) = self.flow_sides(request, None).await?;
        let report = flows::aggregate_flows(
            request,
            min_flow_count,
            self.config.flows.sample_cap,
            &from_records,
            &to_records,
        );

        info!(
            year = request.year,
            from_round = %request.from_round,
            to_round = %request.to_round,
            population = report.summary.total_students,
            flows = report.flows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "migration flows aggregated"
        );
        Ok(report)
    }

    /// Paged individual moves behind a flow report.
    pub async fn student_migrations(
        &self,
        request: &FlowRequest,
        filters: &MigrationFilters,
        page: PageRequest,
    ) -> AnalysisResult<Page<StudentMigration>> {
        request.validate()?;
        filters.validate()?;
        if page.limit == 0 {
            return Err(AnalysisError::invalid("limit", "page limit must be >= 1"));
        }

        // Rank bounds narrow both sides at the store; identity matching needs both.
        let rank_range = match (filters.rank_min, filters.rank_max) {
            (None, None) => None,
            (min, max) => Some((min.unwrap_or(1), max.unwrap_or(u32::MAX))),
        };
        let (from_records, to_records) = self.flow_sides(request, rank_range).await?;
        let migrations = collect_migrations(request, &from_records, &to_records);
        paginate_migrations(migrations, filters, page, self.config.flows.max_page_size)
    }

    fn stability_rounds(&self) -> AnalysisResult<(Round, Round)> {
        let from = Round::from_db(self.config.stability.from_round as i64).ok_or_else(|| {
            AnalysisError::invalid("stability.from_round", "not a valid round number")
        })?;
        let to = Round::from_db(self.config.stability.to_round as i64).ok_or_else(|| {
            AnalysisError::invalid("stability.to_round", "not a valid round number")
        })?;
        if from >= to {
            return Err(AnalysisError::invalid(
                "stability.from_round",
                format!("{} must precede {}", from, to),
            ));
        }
        Ok((from, to))
    }

    async fn stability_year(
        &self,
        request: &StabilityRequest,
        year: u16,
        from: Round,
        to: Round,
    ) -> AnalysisResult<Option<YearlyStability>> {
        let occupants = self
            .select("stability.occupants", request.occupants_filter(year, from))
            .await?;
        if occupants.is_empty() {
            return Ok(None);
        }
        let mut ranks: Vec<u32> = occupants.iter().map(|r| r.rank).collect();
        ranks.sort_unstable();
        ranks.dedup();
        let followups = self
            .select("stability.followups", request.followup_filter(year, to, ranks))
            .await?;
        Ok(stability::score_year(
            year,
            &request.seat(),
            &occupants,
            &followups,
        ))
    }

    pub async fn stability(&self, request: &StabilityRequest) -> AnalysisResult<StabilityMetrics> {
        request.validate()?;
        let (from, to) = self.stability_rounds()?;
        let years = request.years(self.config.stability.lookback_years);

        let yearly = try_join_all(
            years
                .iter()
                .map(|&year| self.stability_year(request, year, from, to)),
        );
        let inflow = self.select(
            "stability.inflow",
            request.occupants_filter(request.year, to),
        );
        let (yearly, inflow_occupants) = tokio::try_join!(yearly, inflow)?;

        let yearly: Vec<YearlyStability> = yearly.into_iter().flatten().collect();
        let metrics = build_metrics(
            request,
            from,
            to,
            yearly,
            stability::inflow_rate(&inflow_occupants),
        );
        debug!(
            seat = %metrics.seat,
            score = metrics.stability_score,
            years = metrics.yearly_trend.len(),
            "stability scored"
        );
        Ok(metrics)
    }

    pub async fn probability(
        &self,
        request: &ProbabilityRequest,
    ) -> AnalysisResult<UpgradeProbabilityMatrix> {
        request.validate()?;
        let to_round = request.resolve_to_round()?;
        let origin = request.origin();

        let occupants = self
            .select("probability.origin", request.origin_filter())
            .await?;
        let next = if occupants.is_empty() {
            Vec::new()
        } else {
            let ranks: Vec<u32> = occupants.iter().map(|r| r.rank).collect();
            self.select(
                "probability.next_round",
                request.next_round_filter(to_round, ranks),
            )
            .await?
        };

        Ok(build_matrix(
            &origin,
            request.year,
            request.round,
            to_round,
            &occupants,
            &next,
        ))
    }

    pub async fn compare_years(
        &self,
        request: &YearComparisonRequest,
    ) -> AnalysisResult<YearComparison> {
        request.validate()?;
        let (first, second) = tokio::try_join!(
            self.aggregate(
                "rank_group.year1",
                request.band.filter(request.year1, request.round)
            ),
            self.aggregate(
                "rank_group.year2",
                request.band.filter(request.year2, request.round)
            ),
        )?;
        let report = build_year_comparison(request, first, second);
        info!(
            year1 = request.year1,
            year2 = request.year2,
            verdict = ?report.verdict.difficulty,
            "rank band compared across years"
        );
        Ok(report)
    }

    pub async fn compare_rounds(
        &self,
        request: &RoundComparisonRequest,
    ) -> AnalysisResult<RoundComparison> {
        request.validate()?;
        let (first, second) = tokio::try_join!(
            self.aggregate(
                "rank_group.round1",
                request.band.filter(request.year, request.round1)
            ),
            self.aggregate(
                "rank_group.round2",
                request.band.filter(request.year, request.round2)
            ),
        )?;
        Ok(build_round_comparison(request, first, second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Difficulty, StabilityClass};
    use crate::error::StoreError;
    use crate::fixtures::RecordBuilder;
    use crate::models::{AllocationStatus, SeatKey, UpgradeType};
    use crate::store::InMemoryAllocationStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy() -> QueryPolicy {
        QueryPolicy {
            timeout: Duration::from_millis(50),
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn engine_over(records: Vec<AllocationRecord>) -> MigrationEngine {
        let store = InMemoryAllocationStore::from_records(records).unwrap();
        MigrationEngine::new(Arc::new(store), EngineConfig::default()).with_policy(fast_policy())
    }

    fn journey_request(rank: u32) -> JourneyRequest {
        JourneyRequest {
            rank,
            year: 2024,
            category: "GENERAL".into(),
            quota: "STATE".into(),
            source_id: "KEA".into(),
            level_id: "UG".into(),
        }
    }

    fn r(n: u16) -> Round {
        Round::new(n).unwrap()
    }

    struct FailingStore {
        calls: AtomicU32,
        error: StoreError,
    }

    #[async_trait]
    impl AllocationStore for FailingStore {
        async fn select_allocations(
            &self,
            _filter: &AllocationFilter,
        ) -> Result<Vec<AllocationRecord>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }

        async fn aggregate_seats(
            &self,
            _filter: &AllocationFilter,
        ) -> Result<Vec<SeatAggregate>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    struct SlowStore;

    #[async_trait]
    impl AllocationStore for SlowStore {
        async fn select_allocations(
            &self,
            _filter: &AllocationFilter,
        ) -> Result<Vec<AllocationRecord>, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn aggregate_seats(
            &self,
            _filter: &AllocationFilter,
        ) -> Result<Vec<SeatAggregate>, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_journey_scenario_and_cache() {
        let engine = engine_over(vec![
            RecordBuilder::new(450, 1).seat("A", "X").build(),
            RecordBuilder::new(450, 2)
                .seat("B", "Y")
                .upgraded_from("A", "X", UpgradeType::College)
                .build(),
            RecordBuilder::new(450, 3)
                .seat("B", "Y")
                .previous("B", "Y")
                .status(AllocationStatus::Freeze)
                .build(),
        ]);

        let journey = engine.journey(&journey_request(450)).await.unwrap().unwrap();
        assert_eq!(journey.total_rounds_participated, 3);
        assert_eq!(journey.total_upgrades, 1);
        assert_eq!(journey.final_college_id.as_deref(), Some("B"));
        assert_eq!(journey.final_status, AllocationStatus::Freeze);

        engine.journey(&journey_request(450)).await.unwrap();
        assert_eq!(engine.cache_stats().hits, 1);

        assert!(engine.journey(&journey_request(451)).await.unwrap().is_none());
        assert_eq!(engine.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_not_masked() {
        let store = Arc::new(FailingStore {
            calls: AtomicU32::new(0),
            error: StoreError::Unavailable("connection refused".into()),
        });
        let engine =
            MigrationEngine::new(store.clone(), EngineConfig::default()).with_policy(fast_policy());

        let err = engine.journey(&journey_request(450)).await.unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Store(StoreError::Unavailable(_))
        ));
        assert!(err.is_retryable());
        // One attempt plus two retries.
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_malformed_rows_are_not_retried() {
        let store = Arc::new(FailingStore {
            calls: AtomicU32::new(0),
            error: StoreError::MalformedRow {
                field: "round".into(),
                reason: "not a round".into(),
            },
        });
        let engine =
            MigrationEngine::new(store.clone(), EngineConfig::default()).with_policy(fast_policy());
        assert!(engine.journey(&journey_request(1)).await.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let policy = QueryPolicy {
            max_retries: 0,
            ..fast_policy()
        };
        let engine =
            MigrationEngine::new(Arc::new(SlowStore), EngineConfig::default()).with_policy(policy);
        let request = YearComparisonRequest {
            band: crate::analysis::RankBand {
                rank_start: 1,
                rank_end: 500,
                category: "GENERAL".into(),
                quota: "STATE".into(),
                source_id: "KEA".into(),
                level_id: "UG".into(),
            },
            year1: 2023,
            year2: 2024,
            round: r(1),
        };
        let err = engine.compare_years(&request).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Store(StoreError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected_before_query() {
        let store = Arc::new(FailingStore {
            calls: AtomicU32::new(0),
            error: StoreError::Unavailable("down".into()),
        });
        let engine = MigrationEngine::new(store.clone(), EngineConfig::default());
        let request = FlowRequest {
            year: 2024,
            source_id: "KEA".into(),
            level_id: "UG".into(),
            category: None,
            quota: None,
            from_round: r(2),
            to_round: r(2),
            min_flow_count: None,
            include_freezes: false,
        };
        let err = engine.flows(&request).await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidFilter { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    fn cohort_at_a() -> Vec<AllocationRecord> {
        let mut records = Vec::new();
        for rank in 1..=8u32 {
            records.push(RecordBuilder::new(rank, 1).seat("A", "X").build());
            let round2 = if rank <= 6 {
                RecordBuilder::new(rank, 2).seat("A", "X").previous("A", "X")
            } else {
                RecordBuilder::new(rank, 2)
                    .seat("B", "X")
                    .upgraded_from("A", "X", UpgradeType::College)
            };
            records.push(round2.build());
        }
        // Rank 9 arrives at A/X by upgrade in round 2.
        records.push(RecordBuilder::new(9, 1).seat("C", "X").build());
        records.push(
            RecordBuilder::new(9, 2)
                .seat("A", "X")
                .upgraded_from("C", "X", UpgradeType::College)
                .build(),
        );
        records
    }

    #[tokio::test]
    async fn test_flows_and_migrations() {
        let engine = engine_over(cohort_at_a());
        let request = FlowRequest {
            year: 2024,
            source_id: "KEA".into(),
            level_id: "UG".into(),
            category: Some("GENERAL".into()),
            quota: Some("STATE".into()),
            from_round: r(1),
            to_round: r(2),
            min_flow_count: Some(1),
            include_freezes: false,
        };
        let report = engine.flows(&request).await.unwrap();
        assert_eq!(report.summary.total_students, 9);
        assert_eq!(report.summary.freezers, 6);
        assert_eq!(report.flows.len(), 2);
        assert_eq!(report.flows[0].student_count, 2);

        let page = engine
            .student_migrations(
                &request,
                &MigrationFilters {
                    rank_min: Some(8),
                    ..MigrationFilters::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].rank, 8);
        assert_eq!(page.items[1].destination, SeatKey::new("A", "X"));
    }

    #[tokio::test]
    async fn test_stability_and_probability() {
        let engine = engine_over(cohort_at_a());
        let stability = engine
            .stability(&StabilityRequest {
                year: 2024,
                lookback_years: Some(0),
                source_id: "KEA".into(),
                level_id: "UG".into(),
                college_id: "A".into(),
                course_id: "X".into(),
                category: None,
                quota: None,
            })
            .await
            .unwrap();
        assert_eq!(stability.yearly_trend.len(), 1);
        assert!((stability.stability_score - 75.0).abs() < 1e-9);
        assert_eq!(stability.classification, Some(StabilityClass::Terminal));
        assert!((stability.inflow_rate - 100.0 / 7.0).abs() < 1e-9);
        assert_eq!(stability.retention_rate + stability.outflow_rate, 100.0);

        let matrix = engine
            .probability(&ProbabilityRequest {
                year: 2024,
                source_id: "KEA".into(),
                level_id: "UG".into(),
                category: "GENERAL".into(),
                quota: "STATE".into(),
                round: r(1),
                college_id: "A".into(),
                course_id: "X".into(),
                to_round: None,
            })
            .await
            .unwrap();
        assert_eq!(matrix.total_sample_size, 8);
        assert_eq!(matrix.freeze_count, 6);
        assert_eq!(matrix.probabilities.len(), 1);
        assert!((matrix.probabilities[0].probability - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_compare_years_over_store() {
        let mut records = Vec::new();
        for (year, colleges) in [(2023u16, 1..=2usize), (2024, 1..=4)] {
            for (i, college) in colleges.enumerate() {
                records.push(
                    RecordBuilder::new(10 + i as u32, 1)
                        .year(year)
                        .seat(&format!("C{}", college), "MBBS")
                        .build(),
                );
            }
        }
        let engine = engine_over(records);
        let report = engine
            .compare_years(&YearComparisonRequest {
                band: crate::analysis::RankBand {
                    rank_start: 1,
                    rank_end: 500,
                    category: "GENERAL".into(),
                    quota: "STATE".into(),
                    source_id: "KEA".into(),
                    level_id: "UG".into(),
                },
                year1: 2023,
                year2: 2024,
                round: r(1),
            })
            .await
            .unwrap();
        assert_eq!(report.diff.new_colleges.len(), 2);
        assert!(report.diff.lost_colleges.is_empty());
        assert_eq!(report.verdict.difficulty, Difficulty::Easier);
    }
}
