//! Plain-text rendering of daemon replies for the terminal.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use tabtime_daemon_protocol::{CommandOutcome, CommandStatus};
use tracker_core::DailyDomainRecord;

/// `"2 hrs 5 mins"` above an hour, `"42 mins"` otherwise.
pub fn format_duration(seconds: u64) -> String {
    let minutes = seconds / 60;
    let hours = minutes / 60;
    if hours > 0 {
        format!("{} hrs {} mins", hours, minutes % 60)
    } else {
        format!("{} mins", minutes)
    }
}

/// One block per day, longest domains first.
pub fn render_records(records: &[DailyDomainRecord]) -> String {
    if records.is_empty() {
        return "No browsing data recorded.\n".to_string();
    }

    let mut by_date: BTreeMap<NaiveDate, Vec<&DailyDomainRecord>> = BTreeMap::new();
    for record in records {
        by_date.entry(record.date).or_default().push(record);
    }

    let mut out = String::new();
    for (date, mut day) in by_date {
        day.sort_by(|a, b| {
            b.duration
                .cmp(&a.duration)
                .then_with(|| a.domain_id.cmp(&b.domain_id))
        });
        let total: u64 = day.iter().map(|record| record.duration).sum();
        let _ = writeln!(out, "{}  ({})", date.format("%Y-%m-%d"), format_duration(total));

        let width = day.iter().map(|record| record.domain.len()).max().unwrap_or(0);
        for record in day {
            let _ = writeln!(
                out,
                "  {:<width$}  {:<16}  {:>14}  {} visit{}",
                record.domain,
                record.category,
                format_duration(record.duration),
                record.visit_count,
                if record.visit_count == 1 { "" } else { "s" },
                width = width,
            );
        }
    }
    out
}

pub fn describe_sync(status: &CommandStatus) -> String {
    match (status.status, status.detail.as_deref()) {
        (CommandOutcome::Success, Some(detail)) => format!("{}.", detail.trim_end_matches('.')),
        (CommandOutcome::Success, None) => "Data synced to drive successfully!".to_string(),
        (CommandOutcome::Failure, Some(detail)) => {
            format!("Error syncing data ({}). Please try again.", detail)
        }
        (CommandOutcome::Failure, None) => "Error syncing data. Please try again.".to_string(),
    }
}
