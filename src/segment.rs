use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::debug;

use crate::models::{CohortMonth, StudentId, Subscription};
use crate::normalize::{elapsed_months, NormalizedSubscription, NormalizedTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortView {
    All,
    Renewal,
    Terminal,
}

/// A subscription placed in a cohort: row key `cohort_month`, column key
/// `elapsed_months`.
#[derive(Debug, Clone, Serialize)]
pub struct CohortRecord<'a> {
    pub subscription: &'a Subscription,
    pub sequence: usize,
    pub first_subscribed_at: NaiveDateTime,
    pub expired_at: NaiveDateTime,
    pub cohort_anchor: NaiveDateTime,
    pub cohort_month: CohortMonth,
    pub elapsed_months: i64,
}

impl<'a> CohortRecord<'a> {
    fn anchored(row: &NormalizedSubscription<'a>, cohort_anchor: NaiveDateTime) -> Self {
        Self {
            subscription: row.subscription,
            sequence: row.sequence,
            first_subscribed_at: row.first_subscribed_at,
            expired_at: row.expired_at,
            cohort_anchor,
            cohort_month: CohortMonth::of(cohort_anchor),
            elapsed_months: elapsed_months(cohort_anchor, row.first_subscribed_at),
        }
    }

    pub fn student_id(&self) -> StudentId {
        self.subscription.student_id
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentedViews<'a> {
    pub all: Vec<CohortRecord<'a>>,
    pub renewal: Vec<CohortRecord<'a>>,
    pub terminal: Vec<CohortRecord<'a>>,
    /// Carried over from normalization.
    pub excluded: usize,
}

impl<'a> SegmentedViews<'a> {
    pub fn view(&self, view: CohortView) -> &[CohortRecord<'a>] {
        match view {
            CohortView::All => &self.all,
            CohortView::Renewal => &self.renewal,
            CohortView::Terminal => &self.terminal,
        }
    }
}

/// Splits normalized rows into the all, renewal and terminal views. Anything
/// anchored on or after `reference_day` has not matured and is dropped.
pub fn segment<'a>(table: &NormalizedTable<'a>, reference_day: NaiveDate) -> SegmentedViews<'a> {
    let matured = |anchor: NaiveDateTime| anchor.date() < reference_day;
    let mut views = SegmentedViews {
        excluded: table.excluded,
        ..Default::default()
    };

    for group in table
        .rows
        .chunk_by(|a, b| a.student_id() == b.student_id())
    {
        for row in group {
            if matured(row.expired_at) {
                views.all.push(CohortRecord::anchored(row, row.expired_at));
            }
        }

        for pair in group.windows(2) {
            let (row, next) = (&pair[0], &pair[1]);
            if matured(next.expired_at) {
                views.renewal.push(CohortRecord::anchored(row, next.expired_at));
            }
        }

        if let Some(last) = group.last() {
            if matured(last.expired_at) {
                views.terminal.push(CohortRecord::anchored(last, last.expired_at));
            }
        }
    }

    debug!(
        all = views.all.len(),
        renewal = views.renewal.len(),
        terminal = views.terminal.len(),
        %reference_day,
        "segmented cohort views"
    );
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::normalize::normalize;
    use crate::normalize::tests::{at, subscription};

    fn day(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn renewal_rows_use_next_expiry() {
        let subs = vec![
            subscription(1, at(2023, 1, 1), at(2023, 2, 1)),
            subscription(1, at(2023, 2, 1), at(2023, 4, 15)),
        ];
        let table = normalize(&subs);
        let views = segment(&table, day(2024, 1, 1));

        assert_eq!(views.renewal.len(), 1);
        let record = &views.renewal[0];
        assert_eq!(record.sequence, 0);
        assert_eq!(record.cohort_anchor, at(2023, 4, 15));
        assert_eq!(record.cohort_month.to_string(), "2023-04");
        assert_eq!(record.elapsed_months, 3);
    }

    #[test]
    fn renewal_excludes_only_last_subscription() {
        let subs = vec![
            subscription(1, at(2022, 1, 1), at(2022, 2, 1)),
            subscription(1, at(2022, 2, 1), at(2022, 3, 1)),
            subscription(1, at(2022, 3, 1), at(2022, 4, 1)),
            subscription(2, at(2022, 5, 1), at(2022, 6, 1)),
            subscription(3, at(2022, 1, 1), at(2022, 2, 1)),
            subscription(3, at(2022, 6, 1), at(2022, 9, 1)),
        ];
        let table = normalize(&subs);
        let views = segment(&table, day(2024, 1, 1));

        let renewed: HashSet<(StudentId, usize)> = views
            .renewal
            .iter()
            .map(|record| (record.student_id(), record.sequence))
            .collect();
        let expected: HashSet<(StudentId, usize)> =
            [(1, 0), (1, 1), (3, 0)].into_iter().collect();
        assert_eq!(renewed, expected);
        assert_eq!(views.all.len(), subs.len());
    }

    #[test]
    fn terminal_view_has_one_row_per_churned_student() {
        let subs = vec![
            subscription(1, at(2023, 1, 1), at(2023, 2, 1)),
            subscription(1, at(2023, 2, 1), at(2023, 3, 1)),
            subscription(2, at(2023, 1, 1), at(2023, 2, 1)),
            // Still running on the reference day.
            subscription(2, at(2023, 5, 1), at(2023, 7, 1)),
        ];
        let table = normalize(&subs);
        let views = segment(&table, day(2023, 6, 1));

        assert_eq!(views.terminal.len(), 1);
        assert_eq!(views.terminal[0].student_id(), 1);
        assert_eq!(views.terminal[0].sequence, 1);
    }

    #[test]
    fn anchors_on_reference_day_are_not_matured() {
        let subs = vec![
            subscription(1, at(2023, 1, 1), at(2023, 6, 1) + chrono::Duration::hours(10)),
            subscription(2, at(2023, 1, 1), at(2023, 5, 31) + chrono::Duration::hours(23)),
        ];
        let table = normalize(&subs);
        let views = segment(&table, day(2023, 6, 1));

        let all: Vec<StudentId> = views.all.iter().map(CohortRecord::student_id).collect();
        assert_eq!(all, vec![2]);
        let churned: Vec<StudentId> = views
            .terminal
            .iter()
            .map(CohortRecord::student_id)
            .collect();
        assert_eq!(churned, vec![2]);
    }

    #[test]
    fn unmatured_renewal_is_dropped() {
        let subs = vec![
            subscription(1, at(2023, 1, 1), at(2023, 2, 1)),
            subscription(1, at(2023, 2, 1), at(2023, 8, 1)),
        ];
        let table = normalize(&subs);
        let views = segment(&table, day(2023, 6, 1));

        assert!(views.renewal.is_empty());
        assert!(views.terminal.is_empty());
        assert_eq!(views.all.len(), 1);
    }
}
