use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::models::{CohortMonth, Student, StudentId, Subscription};
use crate::segment::CohortRecord;

/// Column dimension of a pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    ElapsedMonths,
    SubscriptionSequence,
    Country,
    Plan,
    Currency,
    Grade,
    Tutor,
    LostReason,
}

impl Dimension {
    pub fn label(self) -> &'static str {
        match self {
            Self::ElapsedMonths => "Months Since First Subscription",
            Self::SubscriptionSequence => "Subscription Number",
            Self::Country => "Country",
            Self::Plan => "Plan",
            Self::Currency => "Currency",
            Self::Grade => "Grade and Module",
            Self::Tutor => "Instructor",
            Self::LostReason => "Lost Reason",
        }
    }

    /// Categorical dimensions zero-fill empty cells and sort columns by total.
    pub fn is_categorical(self) -> bool {
        !matches!(self, Self::ElapsedMonths | Self::SubscriptionSequence)
    }

    /// Whether the value comes from the student record rather than the subscription.
    pub fn is_student_attribute(self) -> bool {
        matches!(
            self,
            Self::Country | Self::Grade | Self::Tutor | Self::LostReason
        )
    }

    fn student_value(self, student: &Student) -> Option<&str> {
        match self {
            Self::Country => student.country.as_deref(),
            Self::Grade => student.last_or_current_grade_and_module.as_deref(),
            Self::Tutor => student.last_or_current_tutor.as_deref(),
            Self::LostReason => student.lost_reason.as_deref(),
            _ => None,
        }
    }

    fn value(self, record: &CohortRecord<'_>, student: Option<&Student>) -> Option<DimensionValue> {
        match self {
            Self::ElapsedMonths => Some(DimensionValue::Months(record.elapsed_months)),
            Self::SubscriptionSequence => Some(DimensionValue::Sequence(record.sequence)),
            Self::Plan => Some(DimensionValue::Label(record.subscription.plan.clone())),
            Self::Currency => Some(DimensionValue::Label(
                record.subscription.currency.code().to_string(),
            )),
            _ => student
                .and_then(|student| self.student_value(student))
                .map(|value| DimensionValue::Label(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum DimensionValue {
    Months(i64),
    Sequence(usize),
    Label(String),
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Months(months) => write!(f, "{months}"),
            Self::Sequence(sequence) => write!(f, "{sequence}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    Paid,
    Remaining,
    Refund,
}

impl Amount {
    fn of(self, subscription: &Subscription) -> f64 {
        match self {
            Self::Paid => subscription.paid_amount,
            Self::Remaining => subscription.remaining_amount,
            Self::Refund => subscription.refund_amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Number of records in the cell.
    Count,
    DistinctStudents,
    Sum(Amount),
}

/// Lookup of students by id for student-attribute dimensions.
pub struct StudentIndex<'a> {
    by_id: HashMap<StudentId, &'a Student>,
}

impl<'a> StudentIndex<'a> {
    pub fn new(students: &'a [Student]) -> Self {
        Self {
            by_id: students.iter().map(|student| (student.id, student)).collect(),
        }
    }

    pub fn get(&self, id: StudentId) -> Option<&'a Student> {
        self.by_id.get(&id).copied()
    }
}

/// Cohort-month rows by dimension columns. `None` cells had no records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotTable<T> {
    pub dimension: Dimension,
    pub rows: Vec<CohortMonth>,
    pub columns: Vec<DimensionValue>,
    pub cells: Vec<Vec<Option<T>>>,
}

impl<T> PivotTable<T> {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row: &CohortMonth, column: &DimensionValue) -> Option<&T> {
        let r = self.rows.iter().position(|candidate| candidate == row)?;
        let c = self.columns.iter().position(|candidate| candidate == column)?;
        self.cells[r][c].as_ref()
    }

    /// Applies `f` to every present cell; absent cells stay absent.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> PivotTable<U> {
        PivotTable {
            dimension: self.dimension,
            rows: self.rows.clone(),
            columns: self.columns.clone(),
            cells: self
                .cells
                .iter()
                .map(|row| row.iter().map(|cell| cell.as_ref().map(&mut f)).collect())
                .collect(),
        }
    }
}

#[derive(Default)]
struct Cell {
    count: u64,
    sum: f64,
    students: HashSet<StudentId>,
}

impl Cell {
    fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Count => self.count as f64,
            Metric::DistinctStudents => self.students.len() as f64,
            Metric::Sum(_) => self.sum,
        }
    }
}

/// Aggregates `records` into a cohort-month by `dimension` table.
///
/// Records whose dimension value is unknown (missing student, empty
/// attribute) are left out.
pub fn pivot(
    records: &[CohortRecord<'_>],
    metric: Metric,
    dimension: Dimension,
    students: &StudentIndex<'_>,
) -> PivotTable<f64> {
    let mut groups: BTreeMap<(CohortMonth, DimensionValue), Cell> = BTreeMap::new();
    let mut unmatched = 0usize;

    for record in records {
        let student = students.get(record.student_id());
        if dimension.is_student_attribute() && student.is_none() {
            unmatched += 1;
            continue;
        }
        let Some(key) = dimension.value(record, student) else {
            continue;
        };

        let cell = groups.entry((record.cohort_month, key)).or_default();
        cell.count += 1;
        cell.students.insert(record.student_id());
        if let Metric::Sum(amount) = metric {
            cell.sum += amount.of(record.subscription);
        }
    }

    if unmatched > 0 {
        warn!(unmatched, ?dimension, "records reference unknown students");
    }

    let rows: Vec<CohortMonth> = groups
        .keys()
        .map(|(row, _)| *row)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut columns: Vec<DimensionValue> = groups
        .keys()
        .map(|(_, column)| column.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let fill = dimension.is_categorical().then_some(0.0);
    let cell_at = |row: &CohortMonth, column: &DimensionValue| {
        groups
            .get(&(*row, column.clone()))
            .map(|cell| cell.value(metric))
            .or(fill)
    };

    if dimension.is_categorical() {
        let total = |column: &DimensionValue| -> f64 {
            rows.iter().filter_map(|row| cell_at(row, column)).sum()
        };
        let mut ranked: Vec<(f64, DimensionValue)> =
            columns.into_iter().map(|column| (total(&column), column)).collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        columns = ranked.into_iter().map(|(_, column)| column).collect();
    }

    let cells = rows
        .iter()
        .map(|row| columns.iter().map(|column| cell_at(row, column)).collect())
        .collect();

    PivotTable {
        dimension,
        rows,
        columns,
        cells,
    }
}

/// Projects revenue lost to churn: each count times the average order value,
/// floored to whole currency units.
pub fn project_churn_revenue(churned: &PivotTable<f64>, aov: f64) -> PivotTable<i64> {
    churned.map(|count| (count * aov).floor() as i64)
}

/// Distinct students per cohort month.
pub fn cohort_student_counts(records: &[CohortRecord<'_>]) -> BTreeMap<CohortMonth, usize> {
    let mut students: BTreeMap<CohortMonth, HashSet<StudentId>> = BTreeMap::new();
    for record in records {
        students
            .entry(record.cohort_month)
            .or_default()
            .insert(record.student_id());
    }
    students
        .into_iter()
        .map(|(month, ids)| (month, ids.len()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionEntry {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub dimension: Dimension,
    pub entries: Vec<DistributionEntry>,
}

/// One-dimensional breakdown, most common value first. Student attributes
/// count distinct students; subscription attributes count records.
pub fn distribution(
    records: &[CohortRecord<'_>],
    dimension: Dimension,
    students: &StudentIndex<'_>,
) -> Distribution {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();

    if dimension.is_student_attribute() {
        let ids: BTreeSet<StudentId> = records.iter().map(CohortRecord::student_id).collect();
        for student in ids.into_iter().filter_map(|id| students.get(id)) {
            if let Some(value) = dimension.student_value(student) {
                *counts.entry(value.to_string()).or_default() += 1;
            }
        }
    } else {
        for record in records {
            if let Some(value) = dimension.value(record, None) {
                *counts.entry(value.to_string()).or_default() += 1;
            }
        }
    }

    let mut entries: Vec<DistributionEntry> = counts
        .into_iter()
        .map(|(value, count)| DistributionEntry { value, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count));

    Distribution { dimension, entries }
}
