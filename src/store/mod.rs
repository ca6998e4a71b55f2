//! Allocation Record Store
//!
//! Query contract consumed by the analysis engine, plus the two shipped backends:
//! an in-memory store for fixtures/tests and a SQLite store for real allocation logs.

pub mod filter;
pub mod memory;
pub mod policy;
pub mod sqlite;

pub use filter::AllocationFilter;
pub use memory::InMemoryAllocationStore;
pub use policy::QueryPolicy;
pub use sqlite::{ImportSummary, SqliteAllocationStore, StoreStats};

use crate::error::StoreError;
use crate::models::{AllocationRecord, SeatKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// GROUP BY (college, course) over allotted rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAggregate {
    pub seat: SeatKey,
    pub student_count: u64,
    pub min_rank: u32,
    pub max_rank: u32,
}

/// Read-side contract of the allocation store.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Rows matching `filter`, ordered by (rank, category, quota, round).
    async fn select_allocations(
        &self,
        filter: &AllocationFilter,
    ) -> Result<Vec<AllocationRecord>, StoreError>;

    /// Per-seat COUNT / MIN(rank) / MAX(rank) over allotted rows matching `filter`,
    /// ordered by seat.
    async fn aggregate_seats(
        &self,
        filter: &AllocationFilter,
    ) -> Result<Vec<SeatAggregate>, StoreError>;
}

pub(crate) fn sort_records(records: &mut [AllocationRecord]) {
    records.sort_by(|a, b| {
        (a.rank, &a.category, &a.quota, a.round).cmp(&(b.rank, &b.category, &b.quota, b.round))
    });
}
