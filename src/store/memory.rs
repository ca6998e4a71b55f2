//! In-memory allocation store
//!
//! Holds validated records in a `Vec` behind a `parking_lot::RwLock`. Used by tests and by
//! the fixture generator; never a fallback for a failing production store.

use super::{sort_records, AllocationFilter, AllocationStore, SeatAggregate};
use crate::error::StoreError;
use crate::models::{AllocationRecord, SeatKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct InMemoryAllocationStore {
    records: RwLock<Vec<AllocationRecord>>,
}

impl InMemoryAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<AllocationRecord>) -> Result<Self, StoreError> {
        let store = Self::new();
        store.insert_batch(records)?;
        Ok(store)
    }

    pub fn insert(&self, record: AllocationRecord) -> Result<(), StoreError> {
        record.validate()?;
        self.records.write().push(record);
        Ok(())
    }

    /// Validates every record before inserting any of them.
    pub fn insert_batch(&self, records: Vec<AllocationRecord>) -> Result<usize, StoreError> {
        for record in &records {
            record.validate()?;
        }
        let n = records.len();
        self.records.write().extend(records);
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AllocationStore for InMemoryAllocationStore {
    async fn select_allocations(
        &self,
        filter: &AllocationFilter,
    ) -> Result<Vec<AllocationRecord>, StoreError> {
        let mut out: Vec<AllocationRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut out);
        Ok(out)
    }

    async fn aggregate_seats(
        &self,
        filter: &AllocationFilter,
    ) -> Result<Vec<SeatAggregate>, StoreError> {
        let records = self.records.read();
        let mut groups: BTreeMap<SeatKey, SeatAggregate> = BTreeMap::new();

        for record in records.iter().filter(|r| filter.matches(r)) {
            let Some(seat) = &record.seat else {
                continue;
            };
            groups
                .entry(seat.clone())
                .and_modify(|agg| {
                    agg.student_count += 1;
                    agg.min_rank = agg.min_rank.min(record.rank);
                    agg.max_rank = agg.max_rank.max(record.rank);
                })
                .or_insert_with(|| SeatAggregate {
                    seat: seat.clone(),
                    student_count: 1,
                    min_rank: record.rank,
                    max_rank: record.rank,
                });
        }

        Ok(groups.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AllocationStatus, Round, UpgradeType, VerificationStatus};

    fn allotted(rank: u32, round: u16, college: &str, course: &str) -> AllocationRecord {
        AllocationRecord {
            rank,
            year: 2024,
            category: "GENERAL".into(),
            quota: "STATE".into(),
            round: Round::new(round).unwrap(),
            source_id: "KEA".into(),
            level_id: "UG".into(),
            seat: Some(SeatKey::new(college, course)),
            allocation_status: AllocationStatus::Allotted,
            is_upgrade: false,
            previous_seat: None,
            upgrade_type: UpgradeType::None,
            data_source: "test".into(),
            verification_status: VerificationStatus::Unverified,
            college_name: None,
            course_name: None,
            state: None,
        }
    }

    #[tokio::test]
    async fn test_select_orders_by_rank_then_round() {
        let store = InMemoryAllocationStore::from_records(vec![
            allotted(20, 2, "A", "X"),
            allotted(10, 2, "A", "X"),
            allotted(20, 1, "B", "X"),
            allotted(10, 1, "A", "X"),
        ])
        .unwrap();

        let rows = store
            .select_allocations(&AllocationFilter::new())
            .await
            .unwrap();
        let order: Vec<_> = rows.iter().map(|r| (r.rank, r.round.number())).collect();
        assert_eq!(order, vec![(10, 1), (10, 2), (20, 1), (20, 2)]);
    }

    #[tokio::test]
    async fn test_aggregate_seats() {
        let store = InMemoryAllocationStore::from_records(vec![
            allotted(5, 1, "A", "X"),
            allotted(9, 1, "A", "X"),
            allotted(7, 1, "B", "X"),
            allotted(3, 2, "A", "X"),
        ])
        .unwrap();

        let aggs = store
            .aggregate_seats(&AllocationFilter::new().round(Round::new(1).unwrap()))
            .await
            .unwrap();
        assert_eq!(aggs.len(), 2);
        assert_eq!(aggs[0].seat, SeatKey::new("A", "X"));
        assert_eq!(aggs[0].student_count, 2);
        assert_eq!((aggs[0].min_rank, aggs[0].max_rank), (5, 9));
        assert_eq!(aggs[1].student_count, 1);
    }

    #[test]
    fn test_invalid_record_rejected_at_insert() {
        let store = InMemoryAllocationStore::new();
        let mut bad = allotted(1, 1, "A", "X");
        bad.seat = None;
        assert!(store.insert(bad.clone()).is_err());
        assert!(store
            .insert_batch(vec![allotted(2, 1, "A", "X"), bad])
            .is_err());
        assert!(store.is_empty());
    }
}
