//! Folds closed sessions into per-day, per-domain records.

use chrono::NaiveDate;
use std::sync::Arc;

use crate::error::Result;
use crate::store::TrackerStore;
use crate::types::DailyDomainRecord;

#[derive(Clone)]
pub struct DurationAggregator {
    store: Arc<dyn TrackerStore>,
}

impl DurationAggregator {
    pub fn new(store: Arc<dyn TrackerStore>) -> Self {
        Self { store }
    }

    /// Adds `duration` seconds and `visit_count` visits to the record for
    /// `(date, domain_id)`, creating it if this is the first close.
    pub fn merge(
        &self,
        date: NaiveDate,
        domain_id: &str,
        domain: &str,
        category: &str,
        duration: u64,
        visit_count: u32,
    ) -> Result<DailyDomainRecord> {
        let increment = increment(date, domain_id, domain, category, duration, visit_count);
        let merged = self.store.merge_daily_record(&increment)?;
        log_merge(&merged, duration);
        Ok(merged)
    }

    /// Merges one closed visit and clears the tracking slot in the same
    /// store write.
    pub fn merge_closed_session(
        &self,
        date: NaiveDate,
        domain_id: &str,
        domain: &str,
        category: &str,
        duration: u64,
    ) -> Result<DailyDomainRecord> {
        let increment = increment(date, domain_id, domain, category, duration, 1);
        let merged = self.store.merge_and_clear_tracking_state(&increment)?;
        log_merge(&merged, duration);
        Ok(merged)
    }

    pub fn records_for_date(&self, date: NaiveDate) -> Result<Vec<DailyDomainRecord>> {
        self.store.records_for_date(date)
    }

    pub fn all_records(&self) -> Result<Vec<DailyDomainRecord>> {
        self.store.all_records()
    }
}

fn increment(
    date: NaiveDate,
    domain_id: &str,
    domain: &str,
    category: &str,
    duration: u64,
    visit_count: u32,
) -> DailyDomainRecord {
    DailyDomainRecord {
        date,
        domain_id: domain_id.to_string(),
        domain: domain.to_string(),
        category: category.to_string(),
        duration,
        visit_count,
    }
}

fn log_merge(merged: &DailyDomainRecord, added: u64) {
    tracing::debug!(
        key = %merged.key(),
        added,
        duration = merged.duration,
        visit_count = merged.visit_count,
        "Merged session duration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 4).expect("date")
    }

    fn merged_totals(durations: &[u64]) -> (u64, u32) {
        let aggregator = DurationAggregator::new(Arc::new(MemoryStore::new()));
        let mut last = None;
        for duration in durations {
            last = Some(
                aggregator
                    .merge(date(), "a.example-News", "a.example", "News", *duration, 1)
                    .expect("merge"),
            );
        }
        let record = last.expect("at least one merge");
        (record.duration, record.visit_count)
    }

    #[test]
    fn merge_order_does_not_change_totals() {
        assert_eq!(merged_totals(&[40, 95]), merged_totals(&[95, 40]));
        assert_eq!(merged_totals(&[40, 95]), (135, 2));
    }

    #[test]
    fn separate_days_and_domains_stay_separate() {
        let aggregator = DurationAggregator::new(Arc::new(MemoryStore::new()));
        let next_day = date().succ_opt().expect("next day");
        aggregator
            .merge(date(), "a.example-News", "a.example", "News", 10, 1)
            .expect("merge");
        aggregator
            .merge(next_day, "a.example-News", "a.example", "News", 20, 1)
            .expect("merge");
        aggregator
            .merge(date(), "b.example-News", "b.example", "News", 30, 1)
            .expect("merge");

        assert_eq!(aggregator.records_for_date(date()).expect("records").len(), 2);
        assert_eq!(aggregator.records_for_date(next_day).expect("records").len(), 1);
        assert_eq!(aggregator.all_records().expect("records").len(), 3);
    }

    #[test]
    fn zero_duration_still_counts_a_visit() {
        assert_eq!(merged_totals(&[0]), (0, 1));
    }
}
