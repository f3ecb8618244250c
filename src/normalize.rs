use std::cmp::Ordering;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{StudentId, Subscription};

const SECONDS_PER_DAY: i64 = 86_400;
const DAYS_PER_BUCKET: i64 = 30;

/// A subscription with its per-student time anchors resolved.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedSubscription<'a> {
    pub subscription: &'a Subscription,
    /// 0-based position among the student's subscriptions by `created_at`.
    pub sequence: usize,
    pub first_subscribed_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub expired_at: NaiveDateTime,
}

impl NormalizedSubscription<'_> {
    pub fn student_id(&self) -> StudentId {
        self.subscription.student_id
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizedTable<'a> {
    /// Ordered by student, then sequence.
    pub rows: Vec<NormalizedSubscription<'a>>,
    /// Rows dropped because `created_at` or `expired_at` was missing or unparseable.
    pub excluded: usize,
}

pub fn normalize(subscriptions: &[Subscription]) -> NormalizedTable<'_> {
    let mut excluded = 0usize;
    let mut dated = Vec::with_capacity(subscriptions.len());

    for subscription in subscriptions {
        match (subscription.created_at, subscription.expired_at) {
            (Some(created_at), Some(expired_at)) => {
                dated.push((subscription, created_at, expired_at))
            }
            _ => excluded += 1,
        }
    }

    if excluded > 0 {
        warn!(excluded, "skipping subscriptions without usable created_at/expired_at");
    }

    // Stable: equal created_at keeps input order.
    dated.sort_by_key(|(subscription, created_at, _)| (subscription.student_id, *created_at));

    let mut rows = Vec::with_capacity(dated.len());
    for group in dated.chunk_by(|a, b| a.0.student_id == b.0.student_id) {
        let first_subscribed_at = group[0].1;
        for (sequence, (subscription, created_at, expired_at)) in group.iter().enumerate() {
            rows.push(NormalizedSubscription {
                subscription: *subscription,
                sequence,
                first_subscribed_at,
                created_at: *created_at,
                expired_at: *expired_at,
            });
        }
    }

    debug!(rows = rows.len(), excluded, "normalized subscriptions");
    NormalizedTable { rows, excluded }
}

/// Coarse 30-day buckets between the first subscription and `anchor`.
///
/// Whole days are floored first, then `days / 30` is rounded half to even,
/// so 45 days is bucket 2 and 75 days is also bucket 2.
pub fn elapsed_months(anchor: NaiveDateTime, first_subscribed_at: NaiveDateTime) -> i64 {
    let days = (anchor - first_subscribed_at)
        .num_seconds()
        .div_euclid(SECONDS_PER_DAY);
    round_half_even_div(days, DAYS_PER_BUCKET)
}

fn round_half_even_div(numerator: i64, denominator: i64) -> i64 {
    let quotient = numerator.div_euclid(denominator);
    let twice_remainder = numerator.rem_euclid(denominator) * 2;
    match twice_remainder.cmp(&denominator) {
        Ordering::Less => quotient,
        Ordering::Greater => quotient + 1,
        Ordering::Equal if quotient % 2 == 0 => quotient,
        Ordering::Equal => quotient + 1,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    use crate::models::Currency;

    pub(crate) fn at(year: i32, month: u32, day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    pub(crate) fn subscription(
        student_id: StudentId,
        created_at: NaiveDateTime,
        expired_at: NaiveDateTime,
    ) -> Subscription {
        Subscription {
            student_id,
            created_at: Some(created_at),
            activated_at: Some(created_at),
            expired_at: Some(expired_at),
            refund_at: None,
            currency: Currency::Egp,
            paid_amount: 1000.0,
            remaining_amount: 0.0,
            refund_amount: 0.0,
            plan: "monthly".to_string(),
            active_years: BTreeSet::new(),
        }
    }

    #[test]
    fn assigns_sequence_and_first_subscription() {
        let subs = vec![
            subscription(7, at(2023, 4, 15), at(2023, 7, 15)),
            subscription(7, at(2023, 1, 1), at(2023, 4, 1)),
        ];
        let table = normalize(&subs);

        assert_eq!(table.excluded, 0);
        let sequences: Vec<usize> = table.rows.iter().map(|row| row.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(table.rows[0].created_at, at(2023, 1, 1));
        assert!(table
            .rows
            .iter()
            .all(|row| row.first_subscribed_at == at(2023, 1, 1)));
        assert_eq!(elapsed_months(at(2023, 4, 15), table.rows[0].first_subscribed_at), 3);
    }

    #[test]
    fn ties_keep_input_order() {
        let mut first = subscription(1, at(2023, 1, 1), at(2023, 2, 1));
        first.plan = "first".to_string();
        let mut second = subscription(1, at(2023, 1, 1), at(2023, 3, 1));
        second.plan = "second".to_string();
        let subs = vec![first, second];

        for _ in 0..5 {
            let table = normalize(&subs);
            let plans: Vec<&str> = table
                .rows
                .iter()
                .map(|row| row.subscription.plan.as_str())
                .collect();
            assert_eq!(plans, vec!["first", "second"]);
        }
    }

    #[test]
    fn sequences_restart_per_student() {
        let subs = vec![
            subscription(2, at(2023, 2, 1), at(2023, 3, 1)),
            subscription(1, at(2023, 1, 1), at(2023, 2, 1)),
            subscription(2, at(2023, 1, 1), at(2023, 2, 1)),
        ];
        let table = normalize(&subs);
        let keys: Vec<(StudentId, usize)> = table
            .rows
            .iter()
            .map(|row| (row.student_id(), row.sequence))
            .collect();
        assert_eq!(keys, vec![(1, 0), (2, 0), (2, 1)]);
    }

    #[test]
    fn counts_rows_with_missing_dates() {
        let mut broken = subscription(3, at(2023, 1, 1), at(2023, 2, 1));
        broken.expired_at = None;
        let subs = vec![broken, subscription(3, at(2023, 3, 1), at(2023, 4, 1))];
        let table = normalize(&subs);
        assert_eq!(table.excluded, 1);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].sequence, 0);
    }

    #[test]
    fn half_buckets_round_to_even() {
        let start = at(2023, 1, 1);
        let plus = |days: i64| start + chrono::Duration::days(days);
        assert_eq!(elapsed_months(plus(15), start), 0);
        assert_eq!(elapsed_months(plus(45), start), 2);
        assert_eq!(elapsed_months(plus(75), start), 2);
        assert_eq!(elapsed_months(plus(105), start), 4);
        assert_eq!(elapsed_months(plus(-45), start), -2);
    }

    #[test]
    fn buckets_are_coarse_day_counts() {
        let start = at(2023, 1, 1);
        let plus = |days: i64| start + chrono::Duration::days(days);
        assert_eq!(elapsed_months(plus(14), start), 0);
        assert_eq!(elapsed_months(plus(16), start), 1);
        assert_eq!(elapsed_months(plus(25), start), elapsed_months(plus(44), start));
        // Partial days are floored before bucketing.
        assert_eq!(
            elapsed_months(plus(44) + chrono::Duration::hours(23), start),
            1
        );
    }
}
