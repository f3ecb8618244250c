use std::collections::BTreeSet;

use clap::ValueEnum;
use serde::Serialize;

use crate::models::CohortMonth;
use crate::pivot::{
    distribution, pivot, project_churn_revenue, Amount, Dimension, Distribution, Metric,
    PivotTable, StudentIndex,
};
use crate::segment::{CohortRecord, CohortView, SegmentedViews};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Retention,
    Churn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterQuery {
    pub kind: FilterKind,
    /// `None` selects every cohort month.
    pub cohort_month: Option<CohortMonth>,
    /// `None` selects every elapsed-months bucket.
    pub elapsed_months: Option<i64>,
}

/// Values a caller can offer for the cohort month and months-count filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterOptions {
    pub cohort_months: Vec<CohortMonth>,
    pub elapsed_months: Vec<i64>,
}

impl FilterOptions {
    pub fn from_views(views: &SegmentedViews<'_>) -> Self {
        let months: BTreeSet<CohortMonth> = views.all.iter().map(|r| r.cohort_month).collect();
        let elapsed: BTreeSet<i64> = views.all.iter().map(|r| r.elapsed_months).collect();
        Self {
            cohort_months: months.into_iter().collect(),
            elapsed_months: elapsed.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DrillDown<'a> {
    pub query: FilterQuery,
    pub records: Vec<CohortRecord<'a>>,
    pub distributions: Vec<Distribution>,
    pub counts: PivotTable<f64>,
    /// Renewed revenue, retention only.
    pub revenue: Option<PivotTable<f64>>,
    /// Projected lost revenue, churn only.
    pub projection: Option<PivotTable<i64>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FilterOutcome<'a> {
    Empty { query: FilterQuery },
    Data(DrillDown<'a>),
}

impl FilterOutcome<'_> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }
}

const RETENTION_BREAKDOWNS: [Dimension; 3] =
    [Dimension::Country, Dimension::Currency, Dimension::Plan];
const CHURN_BREAKDOWNS: [Dimension; 5] = [
    Dimension::Country,
    Dimension::Currency,
    Dimension::Grade,
    Dimension::Tutor,
    Dimension::LostReason,
];

/// Narrows the renewal or terminal view to one cohort month and/or elapsed
/// bucket and breaks the selection down.
pub fn drill_down<'a>(
    views: &SegmentedViews<'a>,
    students: &StudentIndex<'_>,
    query: FilterQuery,
    aov: f64,
) -> FilterOutcome<'a> {
    let source = views.view(match query.kind {
        FilterKind::Retention => CohortView::Renewal,
        FilterKind::Churn => CohortView::Terminal,
    });
    let records: Vec<CohortRecord<'a>> = source
        .iter()
        .filter(|record| query.cohort_month.map_or(true, |month| record.cohort_month == month))
        .filter(|record| {
            query
                .elapsed_months
                .map_or(true, |months| record.elapsed_months == months)
        })
        .cloned()
        .collect();

    if records.is_empty() {
        return FilterOutcome::Empty { query };
    }

    let breakdowns: &[Dimension] = match query.kind {
        FilterKind::Retention => &RETENTION_BREAKDOWNS,
        FilterKind::Churn => &CHURN_BREAKDOWNS,
    };
    let distributions = breakdowns
        .iter()
        .map(|dimension| distribution(&records, *dimension, students))
        .collect();

    let counts = pivot(&records, Metric::Count, Dimension::ElapsedMonths, students);
    let (revenue, projection) = match query.kind {
        FilterKind::Retention => (
            Some(pivot(
                &records,
                Metric::Sum(Amount::Paid),
                Dimension::ElapsedMonths,
                students,
            )),
            None,
        ),
        FilterKind::Churn => (None, Some(project_churn_revenue(&counts, aov))),
    };

    FilterOutcome::Data(DrillDown {
        query,
        records,
        distributions,
        counts,
        revenue,
        projection,
    })
}
