//! Analyses over the allocation log. Each module is pure: the engine fetches records
//! and hands them in.

pub mod classify;
pub mod flows;
pub mod journey;
pub mod probability;
pub mod rank_group;
pub mod stability;

pub use classify::{classify_upgrade, RankRange};
pub use flows::{
    FlowRequest, FlowSummary, MigrationFilters, MigrationFlowReport, Page, PageRequest,
    StudentMigration, UpgradeFlow,
};
pub use journey::{JourneyRequest, JourneyStep, JourneyTransition, RankJourney};
pub use probability::{
    Destination, DestinationProbability, ProbabilityRequest, UpgradeProbabilityMatrix,
};
pub use rank_group::{
    Difficulty, RankBand, RankGroupCollege, RankGroupSide, RoundComparison,
    RoundComparisonRequest, YearComparison, YearComparisonRequest,
};
pub use stability::{
    StabilityClass, StabilityMetrics, StabilityRequest, TrendDirection, YearlyStability,
};
