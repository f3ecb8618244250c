use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::models::{Currency, Dataset, Student, StudentStatus, Subscription};

pub const STUDENTS_FILE: &str = "students.csv";
pub const SUBSCRIPTIONS_FILE: &str = "subscriptions.csv";

#[derive(Deserialize)]
struct StudentRow {
    id: i64,
    status: String,
    country: Option<String>,
    created_at: Option<String>,
    signed_up_free: Option<String>,
    last_or_current_grade_and_module: Option<String>,
    last_or_current_tutor: Option<String>,
    lost_reason: Option<String>,
}

#[derive(Deserialize)]
struct SubscriptionRow {
    student_id: i64,
    created_at: Option<String>,
    activated_at: Option<String>,
    expired_at: Option<String>,
    refund_at: Option<String>,
    currency: String,
    paid_amount: Option<f64>,
    remaining_amount: Option<f64>,
    refund_amount: Option<f64>,
    plan: Option<String>,
    active_years: Option<String>,
}

/// Loads `students.csv` and `subscriptions.csv` from `dir`.
pub fn load_csv_dir(dir: &Path) -> anyhow::Result<Dataset> {
    let students_path = dir.join(STUDENTS_FILE);
    let subscriptions_path = dir.join(SUBSCRIPTIONS_FILE);

    let students = read_students(
        std::fs::File::open(&students_path)
            .with_context(|| format!("failed to open {}", students_path.display()))?,
    )
    .with_context(|| format!("failed to read {}", students_path.display()))?;
    let subscriptions = read_subscriptions(
        std::fs::File::open(&subscriptions_path)
            .with_context(|| format!("failed to open {}", subscriptions_path.display()))?,
    )
    .with_context(|| format!("failed to read {}", subscriptions_path.display()))?;

    info!(
        students = students.len(),
        subscriptions = subscriptions.len(),
        dir = %dir.display(),
        "loaded csv snapshot"
    );
    Ok(Dataset {
        students,
        subscriptions,
    })
}

pub fn read_students<R: Read>(reader: R) -> anyhow::Result<Vec<Student>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut students = Vec::new();
    let mut bad_timestamps = 0usize;
    let mut skipped = 0usize;

    for result in reader.deserialize::<StudentRow>() {
        let Some(row) = usable_row(result, &mut skipped)? else {
            continue;
        };
        let created_at = lenient_timestamp(row.created_at.as_deref(), &mut bad_timestamps);
        students.push(Student {
            id: row.id,
            status: StudentStatus::from(row.status),
            country: non_empty(row.country),
            created_at,
            signed_up_free: row.signed_up_free.as_deref().is_some_and(parse_flag),
            last_or_current_grade_and_module: non_empty(row.last_or_current_grade_and_module),
            last_or_current_tutor: non_empty(row.last_or_current_tutor),
            lost_reason: non_empty(row.lost_reason),
        });
    }

    if bad_timestamps > 0 {
        warn!(bad_timestamps, "student timestamps could not be parsed");
    }
    if skipped > 0 {
        warn!(skipped, "malformed student rows skipped");
    }
    Ok(students)
}

pub fn read_subscriptions<R: Read>(reader: R) -> anyhow::Result<Vec<Subscription>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut subscriptions = Vec::new();
    let mut bad_timestamps = 0usize;
    let mut skipped = 0usize;

    for result in reader.deserialize::<SubscriptionRow>() {
        let Some(row) = usable_row(result, &mut skipped)? else {
            continue;
        };
        let mut timestamp = |value: Option<String>| {
            lenient_timestamp(value.as_deref(), &mut bad_timestamps)
        };
        let created_at = timestamp(row.created_at);
        let activated_at = timestamp(row.activated_at);
        let expired_at = timestamp(row.expired_at);
        let refund_at = timestamp(row.refund_at);

        subscriptions.push(Subscription {
            student_id: row.student_id,
            created_at,
            activated_at,
            expired_at,
            refund_at,
            currency: Currency::from(row.currency),
            paid_amount: row.paid_amount.unwrap_or(0.0),
            remaining_amount: row.remaining_amount.unwrap_or(0.0),
            refund_amount: row.refund_amount.unwrap_or(0.0),
            plan: row.plan.unwrap_or_default(),
            active_years: decode_active_years(row.active_years.as_deref()),
        });
    }

    if bad_timestamps > 0 {
        warn!(bad_timestamps, "subscription timestamps could not be parsed");
    }
    if skipped > 0 {
        warn!(skipped, "malformed subscription rows skipped");
    }
    Ok(subscriptions)
}

/// A row whose fields do not decode is counted and dropped; a failing reader
/// still aborts the load.
fn usable_row<T>(result: csv::Result<T>, skipped: &mut usize) -> anyhow::Result<Option<T>> {
    match result {
        Ok(row) => Ok(Some(row)),
        Err(err) if err.is_io_error() => Err(err.into()),
        Err(err) => {
            debug!(error = %err, "skipping malformed csv row");
            *skipped += 1;
            Ok(None)
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]`
/// and bare dates.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.naive_local());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(value, format) {
            return Some(timestamp);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn lenient_timestamp(value: Option<&str>, bad: &mut usize) -> Option<NaiveDateTime> {
    let value = value.map(str::trim).filter(|v| !v.is_empty() && *v != "NaT")?;
    let parsed = parse_timestamp(value);
    if parsed.is_none() {
        *bad += 1;
    }
    parsed
}

/// Decodes the textual `active_years` column: a JSON list (`[2022, 2023]`),
/// a Postgres array literal (`{2022,2023}`) or nothing.
pub fn decode_active_years(value: Option<&str>) -> BTreeSet<i32> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return BTreeSet::new();
    };
    if let Ok(years) = serde_json::from_str::<Vec<i32>>(value) {
        return years.into_iter().collect();
    }

    let inner = value
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(value);
    let parsed: Result<BTreeSet<i32>, _> = inner
        .split(',')
        .map(str::trim)
        .filter(|year| !year.is_empty())
        .map(str::parse::<i32>)
        .collect();

    match parsed {
        Ok(years) => years,
        Err(err) => {
            warn!(value, error = %err, "could not decode active_years");
            BTreeSet::new()
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "1.0" | "true" | "t" | "yes"
    )
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_common_timestamp_shapes() {
        let expected = NaiveDate::from_ymd_opt(2023, 4, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2023-04-15 10:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2023-04-15T10:30:00.000"), Some(expected));
        assert_eq!(parse_timestamp("2023-04-15T10:30:00+02:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2023-04-15"),
            NaiveDate::from_ymd_opt(2023, 4, 15).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_timestamp("15/04/2023"), None);
    }

    #[test]
    fn decodes_active_years_once() {
        let expected: BTreeSet<i32> = [2022, 2023].into_iter().collect();
        assert_eq!(decode_active_years(Some("[2022, 2023]")), expected);
        assert_eq!(decode_active_years(Some("{2023,2022}")), expected);
        assert_eq!(decode_active_years(Some("[2022, 2022, 2023]")), expected);
        assert!(decode_active_years(Some("")).is_empty());
        assert!(decode_active_years(None).is_empty());
        assert!(decode_active_years(Some("[twenty]")).is_empty());
    }

    #[test]
    fn reads_subscriptions_with_bad_dates() {
        let data = "\
student_id,created_at,activated_at,expired_at,refund_at,currency,paid_amount,remaining_amount,refund_amount,plan,active_years
1,2023-01-01 09:00:00,2023-01-02 09:00:00,2023-04-01 00:00:00,,egp,1500,0,,quarterly,\"[2023]\"
2,not-a-date,,2023-04-01,,USD,99.5,,,monthly,
";
        let subs = read_subscriptions(data.as_bytes()).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].currency, Currency::Egp);
        assert_eq!(subs[0].refund_amount, 0.0);
        assert!(subs[0].refund_at.is_none());
        assert!(subs[0].active_years.contains(&2023));
        assert!(subs[1].created_at.is_none());
        assert!(subs[1].expired_at.is_some());
        assert_eq!(subs[1].paid_amount, 99.5);
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let subscriptions = "\
student_id,created_at,activated_at,expired_at,refund_at,currency,paid_amount,remaining_amount,refund_amount,plan,active_years
1,2023-01-01,,2023-02-01,,egp,1500,0,0,monthly,
abc,2023-01-01,,2023-02-01,,egp,1500,0,0,monthly,
2,2023-01-05,,2023-02-05,,egp,lots,0,0,monthly,
3,2023-01-09,,2023-02-09,,egp,900,0,0,monthly,
";
        let subs = read_subscriptions(subscriptions.as_bytes()).unwrap();
        let ids: Vec<i64> = subs.iter().map(|sub| sub.student_id).collect();
        assert_eq!(ids, vec![1, 3]);

        let students = "\
id,status,country,created_at,signed_up_free,last_or_current_grade_and_module,last_or_current_tutor,lost_reason
x1,active,EG,2022-05-01,0,,,
4,active,EG,2022-05-01,0,,,
";
        let students = read_students(students.as_bytes()).unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].id, 4);
    }

    #[test]
    fn loads_snapshot_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut students = std::fs::File::create(dir.path().join(STUDENTS_FILE)).unwrap();
        writeln!(
            students,
            "id,status,country,created_at,signed_up_free,last_or_current_grade_and_module,last_or_current_tutor,lost_reason"
        )
        .unwrap();
        writeln!(students, "1,active,EG,2022-05-01,0,G5 M1,Mona,").unwrap();
        writeln!(students, "2,free,,2023-01-09,1,,,").unwrap();
        let mut subscriptions =
            std::fs::File::create(dir.path().join(SUBSCRIPTIONS_FILE)).unwrap();
        writeln!(
            subscriptions,
            "student_id,created_at,activated_at,expired_at,refund_at,currency,paid_amount,remaining_amount,refund_amount,plan,active_years"
        )
        .unwrap();
        writeln!(
            subscriptions,
            "1,2022-05-01,2022-05-02,2022-08-01,,egp,3000,0,0,quarterly,[2022]"
        )
        .unwrap();

        let dataset = load_csv_dir(dir.path()).unwrap();
        assert_eq!(dataset.students.len(), 2);
        assert_eq!(dataset.students[1].status, StudentStatus::Free);
        assert!(dataset.students[1].signed_up_free);
        assert!(dataset.students[1].country.is_none());
        assert_eq!(dataset.subscriptions.len(), 1);
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_csv_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains(STUDENTS_FILE));
    }
}
