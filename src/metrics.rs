use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{Datelike, Months};
use serde::Serialize;

use crate::config::AnalyticsConfig;
use crate::models::{Currency, Dataset, Student, StudentId, StudentStatus, Subscription};

/// Subscriptions counted as active only if they ended within this many
/// months of activation.
const ACTIVE_WINDOW_MONTHS: u32 = 18;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FinancialMetrics {
    pub total_revenue: f64,
    pub net_revenue: f64,
    pub remaining_amount: f64,
    pub refunded_amount: f64,
}

/// Exact-match status tallies. Unrecognised statuses land in no bucket but
/// still count towards `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub free: usize,
    pub active: usize,
    /// Students in `pending_schedule`.
    pub inactive: usize,
    pub pending: usize,
    pub expired: usize,
    pub canceled: usize,
}

impl StatusCounts {
    pub fn churned(&self) -> usize {
        self.expired + self.canceled
    }

    pub fn paying(&self) -> usize {
        self.active + self.inactive + self.pending + self.churned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct YearlyRevenue {
    pub year: i32,
    pub total_revenue: f64,
    pub net_revenue: f64,
    pub refund_amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct YearlyUsers {
    pub year: i32,
    pub registered: usize,
    pub active: usize,
    pub free_registered: usize,
}

/// Everything on the dashboard landing page.
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub currencies: Vec<Currency>,
    pub financial: FinancialMetrics,
    pub statuses: StatusCounts,
    pub arpu: Option<f64>,
    pub churn_rate: Option<f64>,
    pub yearly_revenue: Vec<YearlyRevenue>,
    pub yearly_users: Vec<YearlyUsers>,
}

impl Overview {
    pub fn build(dataset: &Dataset, config: &AnalyticsConfig) -> Self {
        let scoped: Vec<Subscription> = in_currencies(&dataset.subscriptions, &config.currencies)
            .cloned()
            .collect();
        Self {
            currencies: config.currencies.clone(),
            financial: financial_metrics(&dataset.subscriptions, &config.currencies),
            statuses: status_counts(&dataset.students),
            arpu: arpu(&dataset.subscriptions, &config.currencies),
            churn_rate: churn_rate(&dataset.students),
            yearly_revenue: yearly_revenue_trends(&scoped),
            yearly_users: yearly_user_trends(&dataset.students, &dataset.subscriptions),
        }
    }
}

pub fn in_currencies<'a>(
    subscriptions: &'a [Subscription],
    currencies: &'a [Currency],
) -> impl Iterator<Item = &'a Subscription> + 'a {
    subscriptions
        .iter()
        .filter(move |subscription| currencies.contains(&subscription.currency))
}

pub fn financial_metrics(subscriptions: &[Subscription], currencies: &[Currency]) -> FinancialMetrics {
    let mut paid = 0.0;
    let mut remaining = 0.0;
    let mut refunded = 0.0;
    for subscription in in_currencies(subscriptions, currencies) {
        paid += subscription.paid_amount;
        remaining += subscription.remaining_amount;
        refunded += subscription.refund_amount;
    }

    FinancialMetrics {
        total_revenue: paid + remaining,
        net_revenue: paid - refunded,
        remaining_amount: remaining,
        refunded_amount: refunded,
    }
}

pub fn total_revenue(subscriptions: &[Subscription], currencies: &[Currency]) -> f64 {
    financial_metrics(subscriptions, currencies).total_revenue
}

pub fn net_revenue(subscriptions: &[Subscription], currencies: &[Currency]) -> f64 {
    financial_metrics(subscriptions, currencies).net_revenue
}

pub fn status_counts(students: &[Student]) -> StatusCounts {
    let mut counts = StatusCounts {
        total: students.len(),
        ..Default::default()
    };
    for student in students {
        match student.status {
            StudentStatus::Active => counts.active += 1,
            StudentStatus::PendingSchedule => counts.inactive += 1,
            StudentStatus::Pending => counts.pending += 1,
            StudentStatus::Expired => counts.expired += 1,
            StudentStatus::Canceled => counts.canceled += 1,
            StudentStatus::Free => counts.free += 1,
            StudentStatus::Other(_) => {}
        }
    }
    counts
}

/// Churned share of paying students, in percent. `None` when no student is
/// in a paying status.
pub fn churn_rate(students: &[Student]) -> Option<f64> {
    let counts = status_counts(students);
    let paying = counts.paying();
    (paying > 0).then(|| counts.churned() as f64 / paying as f64 * 100.0)
}

/// Average revenue per distinct student in the given currencies. `None` when
/// no subscription matches.
pub fn arpu(subscriptions: &[Subscription], currencies: &[Currency]) -> Option<f64> {
    let students: HashSet<StudentId> = in_currencies(subscriptions, currencies)
        .map(|subscription| subscription.student_id)
        .collect();
    if students.is_empty() {
        return None;
    }
    Some(total_revenue(subscriptions, currencies) / students.len() as f64)
}

/// Revenue per `created_at` year. Refunds are bucketed by `refund_at` year
/// and only reported for years that had subscriptions created.
pub fn yearly_revenue_trends(subscriptions: &[Subscription]) -> Vec<YearlyRevenue> {
    let mut years: BTreeMap<i32, YearlyRevenue> = BTreeMap::new();
    for subscription in subscriptions {
        let Some(created_at) = subscription.created_at else {
            continue;
        };
        let year = created_at.year();
        let entry = years.entry(year).or_insert(YearlyRevenue {
            year,
            total_revenue: 0.0,
            net_revenue: 0.0,
            refund_amount: 0.0,
        });
        entry.total_revenue += subscription.paid_amount + subscription.remaining_amount;
        entry.net_revenue += subscription.paid_amount - subscription.refund_amount;
    }

    for subscription in subscriptions {
        let Some(refund_at) = subscription.refund_at else {
            continue;
        };
        if let Some(entry) = years.get_mut(&refund_at.year()) {
            entry.refund_amount += subscription.refund_amount;
        }
    }

    years.into_values().collect()
}

/// Registered, active and free-registered students per year.
pub fn yearly_user_trends(students: &[Student], subscriptions: &[Subscription]) -> Vec<YearlyUsers> {
    let mut registered: BTreeMap<i32, usize> = BTreeMap::new();
    let mut free_registered: BTreeMap<i32, usize> = BTreeMap::new();
    for student in students {
        let Some(created_at) = student.created_at else {
            continue;
        };
        *registered.entry(created_at.year()).or_default() += 1;
        if student.signed_up_free {
            *free_registered.entry(created_at.year()).or_default() += 1;
        }
    }

    let mut active: BTreeMap<i32, HashSet<StudentId>> = BTreeMap::new();
    for subscription in subscriptions.iter().filter(|s| within_active_window(s)) {
        for year in &subscription.active_years {
            active.entry(*year).or_default().insert(subscription.student_id);
        }
    }

    let years: BTreeSet<i32> = registered
        .keys()
        .chain(active.keys())
        .chain(free_registered.keys())
        .copied()
        .collect();

    years
        .into_iter()
        .map(|year| YearlyUsers {
            year,
            registered: registered.get(&year).copied().unwrap_or(0),
            active: active.get(&year).map_or(0, HashSet::len),
            free_registered: free_registered.get(&year).copied().unwrap_or(0),
        })
        .collect()
}

fn within_active_window(subscription: &Subscription) -> bool {
    match (subscription.activated_at, subscription.expired_at) {
        (Some(activated_at), Some(expired_at)) => activated_at
            .checked_add_months(Months::new(ACTIVE_WINDOW_MONTHS))
            .is_some_and(|limit| expired_at < limit),
        _ => false,
    }
}
