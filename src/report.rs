use std::collections::BTreeMap;
use std::fmt::{Display, Write};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::config::AnalyticsConfig;
use crate::filter::{DrillDown, FilterOutcome, FilterQuery};
use crate::metrics::Overview;
use crate::models::{CohortMonth, Dataset};
use crate::normalize::normalize;
use crate::percent::{row_percentages, Percentage};
use crate::pivot::{
    cohort_student_counts, pivot, project_churn_revenue, Amount, Dimension, Metric, PivotTable,
    StudentIndex,
};
use crate::segment::segment;

pub const NO_DATA: &str = "No data available for this filter combination.";

/// Every cohort table on the analysis page, in absolute values.
#[derive(Debug, Clone, Serialize)]
pub struct CohortReport {
    pub reference_day: NaiveDate,
    pub excluded_rows: usize,
    pub cohort_students: BTreeMap<CohortMonth, usize>,
    pub by_country: PivotTable<f64>,
    pub by_grade: PivotTable<f64>,
    pub by_currency: PivotTable<f64>,
    pub retention: PivotTable<f64>,
    pub churn: PivotTable<f64>,
    pub renewed_revenue: PivotTable<f64>,
    pub churn_projection: PivotTable<i64>,
    pub by_sequence: PivotTable<f64>,
}

/// The same tables as row percentages.
#[derive(Debug, Clone, Serialize)]
pub struct CohortPercentages {
    pub reference_day: NaiveDate,
    pub by_country: PivotTable<Percentage>,
    pub by_grade: PivotTable<Percentage>,
    pub by_currency: PivotTable<Percentage>,
    pub retention: PivotTable<Percentage>,
    pub churn: PivotTable<Percentage>,
    pub renewed_revenue: PivotTable<Percentage>,
    pub churn_projection: PivotTable<Percentage>,
    pub by_sequence: PivotTable<Percentage>,
}

impl CohortReport {
    pub fn build(dataset: &Dataset, config: &AnalyticsConfig) -> Self {
        let table = normalize(&dataset.subscriptions);
        let views = segment(&table, config.reference_day);
        let students = StudentIndex::new(&dataset.students);

        let churn = pivot(&views.terminal, Metric::Count, Dimension::ElapsedMonths, &students);
        let report = Self {
            reference_day: config.reference_day,
            excluded_rows: views.excluded,
            cohort_students: cohort_student_counts(&views.all),
            by_country: pivot(&views.all, Metric::Count, Dimension::Country, &students),
            by_grade: pivot(&views.all, Metric::Count, Dimension::Grade, &students),
            by_currency: pivot(&views.all, Metric::Count, Dimension::Currency, &students),
            retention: pivot(&views.renewal, Metric::Count, Dimension::ElapsedMonths, &students),
            churn_projection: project_churn_revenue(&churn, config.aov),
            churn,
            renewed_revenue: pivot(
                &views.renewal,
                Metric::Sum(Amount::Paid),
                Dimension::ElapsedMonths,
                &students,
            ),
            by_sequence: pivot(
                &views.renewal,
                Metric::Count,
                Dimension::SubscriptionSequence,
                &students,
            ),
        };

        info!(
            cohorts = report.cohort_students.len(),
            excluded = report.excluded_rows,
            reference_day = %report.reference_day,
            "built cohort report"
        );
        report
    }

    pub fn percentages(&self) -> CohortPercentages {
        CohortPercentages {
            reference_day: self.reference_day,
            by_country: row_percentages(&self.by_country),
            by_grade: row_percentages(&self.by_grade),
            by_currency: row_percentages(&self.by_currency),
            retention: row_percentages(&self.retention),
            churn: row_percentages(&self.churn),
            renewed_revenue: row_percentages(&self.renewed_revenue),
            churn_projection: row_percentages(&self.churn_projection),
            by_sequence: row_percentages(&self.by_sequence),
        }
    }
}

pub fn format_amount(value: f64, currency: &str) -> String {
    let whole = value.trunc() as i64;
    let digits = whole.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if whole < 0 { "-" } else { "" };
    format!("{} {sign}{grouped}", currency.to_uppercase())
}

fn format_optional(value: Option<f64>, render: impl Fn(f64) -> String) -> String {
    value.map(render).unwrap_or_else(|| "n/a".to_string())
}

pub fn render_pivot<T: Display>(output: &mut String, title: &str, table: &PivotTable<T>) {
    let _ = writeln!(output, "## {title}");
    if table.is_empty() {
        let _ = writeln!(output, "No data available.");
        let _ = writeln!(output);
        return;
    }

    let _ = write!(output, "| Cohort Month |");
    for column in &table.columns {
        let _ = write!(output, " {column} |");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "|---|{}", "---|".repeat(table.columns.len()));

    for (row, cells) in table.rows.iter().zip(&table.cells) {
        let _ = write!(output, "| {row} |");
        for cell in cells {
            match cell {
                Some(value) => {
                    let _ = write!(output, " {value} |");
                }
                None => output.push_str("  |"),
            }
        }
        let _ = writeln!(output);
    }
    let _ = writeln!(output);
}

pub fn render_overview(overview: &Overview) -> String {
    let mut output = String::new();
    let currency = overview
        .currencies
        .iter()
        .map(|c| c.code().to_uppercase())
        .collect::<Vec<_>>()
        .join("/");
    let money = |value: f64| format_amount(value, &currency);

    let _ = writeln!(output, "# Dashboard Overview");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Revenue Metrics ({currency})");
    let _ = writeln!(output, "- Total revenue: {}", money(overview.financial.total_revenue));
    let _ = writeln!(output, "- Net revenue: {}", money(overview.financial.net_revenue));
    let _ = writeln!(
        output,
        "- Remaining amount: {}",
        money(overview.financial.remaining_amount)
    );
    let _ = writeln!(
        output,
        "- Refund amount: {}",
        money(overview.financial.refunded_amount)
    );

    let statuses = &overview.statuses;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Student Subscription Status");
    let _ = writeln!(output, "- Active: {}", statuses.active);
    let _ = writeln!(output, "- Inactive: {}", statuses.inactive);
    let _ = writeln!(output, "- Pending: {}", statuses.pending);
    let _ = writeln!(output, "- Expired: {}", statuses.expired);
    let _ = writeln!(output, "- Canceled: {}", statuses.canceled);
    let _ = writeln!(output, "- Free: {}", statuses.free);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Business Snapshot");
    let _ = writeln!(output, "- Total students: {}", statuses.total);
    let _ = writeln!(output, "- ARPU: {}", format_optional(overview.arpu, money));
    let _ = writeln!(
        output,
        "- Churn rate: {}",
        format_optional(overview.churn_rate, |rate| format!("{rate:.2}%"))
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Yearly Revenue Trends ({currency})");
    if overview.yearly_revenue.is_empty() {
        let _ = writeln!(output, "No revenue recorded.");
    } else {
        let _ = writeln!(output, "| Year | Total Revenue | Net Revenue | Refund Amount |");
        let _ = writeln!(output, "|---|---|---|---|");
        for year in &overview.yearly_revenue {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                year.year,
                money(year.total_revenue),
                money(year.net_revenue),
                money(year.refund_amount)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## User Trends");
    if overview.yearly_users.is_empty() {
        let _ = writeln!(output, "No students recorded.");
    } else {
        let _ = writeln!(
            output,
            "| Year | Total Registered Students | Active Students | Free Registered Students |"
        );
        let _ = writeln!(output, "|---|---|---|---|");
        for year in &overview.yearly_users {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                year.year, year.registered, year.active, year.free_registered
            );
        }
    }

    output
}

pub fn render_cohorts(report: &CohortReport, percentage: bool) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Subscription Analysis");
    let _ = writeln!(output, "Matured as of {}", report.reference_day);
    if report.excluded_rows > 0 {
        let _ = writeln!(
            output,
            "{} subscriptions skipped for unparseable dates.",
            report.excluded_rows
        );
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Cohort Breakdown by Student Count");
    if report.cohort_students.is_empty() {
        let _ = writeln!(output, "No data available.");
    } else {
        for (month, students) in &report.cohort_students {
            let _ = writeln!(output, "- {month}: {students}");
        }
    }
    let _ = writeln!(output);

    if percentage {
        let shares = report.percentages();
        render_pivot(&mut output, "Country Distribution by Cohort Month", &shares.by_country);
        render_pivot(&mut output, "Grade and Module Distribution by Cohort Month", &shares.by_grade);
        render_pivot(&mut output, "Currency Distribution by Cohort Month", &shares.by_currency);
        render_pivot(&mut output, "Retention Achieved", &shares.retention);
        render_pivot(&mut output, "Churned Subscriptions", &shares.churn);
        render_pivot(&mut output, "Renewed Revenue by Cohort Month", &shares.renewed_revenue);
        render_pivot(&mut output, "Churned AOV Projection", &shares.churn_projection);
        render_pivot(&mut output, "Renewals by Subscription Number", &shares.by_sequence);
    } else {
        render_pivot(&mut output, "Country Distribution by Cohort Month", &report.by_country);
        render_pivot(&mut output, "Grade and Module Distribution by Cohort Month", &report.by_grade);
        render_pivot(&mut output, "Currency Distribution by Cohort Month", &report.by_currency);
        render_pivot(&mut output, "Retention Achieved", &report.retention);
        render_pivot(&mut output, "Churned Subscriptions", &report.churn);
        render_pivot(&mut output, "Renewed Revenue by Cohort Month", &report.renewed_revenue);
        render_pivot(&mut output, "Churned AOV Projection", &report.churn_projection);
        render_pivot(&mut output, "Renewals by Subscription Number", &report.by_sequence);
    }

    output
}

fn describe(query: &FilterQuery) -> String {
    let month = query
        .cohort_month
        .map_or_else(|| "All Cohort Months".to_string(), |month| month.to_string());
    let months = query
        .elapsed_months
        .map_or_else(|| "All Months in Cohort".to_string(), |months| months.to_string());
    format!("Cohort {month} - Months Count {months}")
}

pub fn render_drill_down(outcome: &FilterOutcome<'_>) -> String {
    let mut output = String::new();
    match outcome {
        FilterOutcome::Empty { query } => {
            let _ = writeln!(output, "# {:?} for {}", query.kind, describe(query));
            let _ = writeln!(output, "{NO_DATA}");
        }
        FilterOutcome::Data(drill) => render_drill_down_data(&mut output, drill),
    }
    output
}

fn render_drill_down_data(output: &mut String, drill: &DrillDown<'_>) {
    let _ = writeln!(output, "# {:?} for {}", drill.query.kind, describe(&drill.query));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Subscriptions");
    for record in drill.records.iter().take(50) {
        let subscription = record.subscription;
        let _ = writeln!(
            output,
            "- student {} first subscribed {} expired {} ({} {}, {})",
            subscription.student_id,
            record.first_subscribed_at.date(),
            record.expired_at.date(),
            subscription.currency,
            subscription.paid_amount,
            subscription.plan
        );
    }
    if drill.records.len() > 50 {
        let _ = writeln!(output, "- ... {} more", drill.records.len() - 50);
    }
    let _ = writeln!(output);

    for distribution in &drill.distributions {
        let _ = writeln!(output, "## {} Distribution", distribution.dimension.label());
        if distribution.entries.is_empty() {
            let _ = writeln!(output, "No values recorded.");
        }
        for entry in &distribution.entries {
            let _ = writeln!(output, "- {}: {}", entry.value, entry.count);
        }
        let _ = writeln!(output);
    }

    render_pivot(output, "Subscriptions by Cohort", &drill.counts);
    if let Some(revenue) = &drill.revenue {
        render_pivot(output, "Renewed Revenue", revenue);
    }
    if let Some(projection) = &drill.projection {
        render_pivot(output, "Churned AOV Projection", projection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterKind;
    use crate::models::{Student, StudentStatus};
    use crate::normalize::tests::{at, subscription};
    use crate::pivot::DimensionValue;

    fn dataset() -> Dataset {
        let student = |id, status: StudentStatus| Student {
            id,
            status,
            country: Some("EG".to_string()),
            created_at: Some(at(2022, 12, 1)),
            signed_up_free: false,
            last_or_current_grade_and_module: Some("G5 M2".to_string()),
            last_or_current_tutor: None,
            lost_reason: None,
        };
        Dataset {
            students: vec![
                student(1, StudentStatus::Active),
                student(2, StudentStatus::Expired),
            ],
            subscriptions: vec![
                subscription(1, at(2023, 1, 1), at(2023, 2, 1)),
                subscription(1, at(2023, 2, 1), at(2023, 4, 1)),
                subscription(2, at(2023, 1, 1), at(2023, 2, 1)),
            ],
        }
    }

    fn config() -> AnalyticsConfig {
        AnalyticsConfig::new(
            5900.0,
            Vec::new(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
    }

    #[test]
    fn cohort_report_tables_line_up() {
        let report = CohortReport::build(&dataset(), &config());
        let february: CohortMonth = "2023-02".parse().unwrap();
        let april: CohortMonth = "2023-04".parse().unwrap();

        assert_eq!(report.cohort_students[&february], 2);
        assert_eq!(report.retention.get(&april, &DimensionValue::Months(3)), Some(&1.0));
        assert_eq!(report.churn.get(&february, &DimensionValue::Months(1)), Some(&1.0));
        assert_eq!(
            report.churn_projection.get(&february, &DimensionValue::Months(1)),
            Some(&5900)
        );
        assert_eq!(report.by_sequence.columns, vec![DimensionValue::Sequence(0)]);
    }

    #[test]
    fn renders_percentages_and_gaps() {
        let report = CohortReport::build(&dataset(), &config());
        let absolute = render_cohorts(&report, false);
        assert!(absolute.contains("## Retention Achieved"));
        assert!(absolute.contains("| 2023-04 |  | 1 |"));

        let shares = render_cohorts(&report, true);
        assert!(shares.contains("100.00%"));
    }

    #[test]
    fn empty_drill_down_says_no_data() {
        let outcome = FilterOutcome::Empty {
            query: FilterQuery {
                kind: FilterKind::Retention,
                cohort_month: None,
                elapsed_months: Some(7),
            },
        };
        let text = render_drill_down(&outcome);
        assert!(text.contains(NO_DATA));
        assert!(text.contains("Months Count 7"));
    }

    #[test]
    fn overview_shows_undefined_metrics() {
        let overview = Overview::build(&Dataset::default(), &config());
        let text = render_overview(&overview);
        assert!(text.contains("- ARPU: n/a"));
        assert!(text.contains("- Churn rate: n/a"));
    }

    #[test]
    fn amounts_are_grouped() {
        assert_eq!(format_amount(1234567.9, "egp"), "EGP 1,234,567");
        assert_eq!(format_amount(-950.0, "usd"), "USD -950");
    }
}
