use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::loader;
use crate::models::{Currency, Dataset, Student, StudentStatus, Subscription};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let at = |y, m, d| -> anyhow::Result<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(10, 0, 0))
            .context("invalid date")
    };

    let students = vec![
        seed_student(1001, "active", "Egypt", at(2023, 1, 4)?, "Grade 6 - Module 3", "Mona Adel", None),
        seed_student(1002, "expired", "Egypt", at(2023, 1, 19)?, "Grade 4 - Module 1", "Omar Hany", Some("price")),
        seed_student(1003, "pending_schedule", "Saudi Arabia", at(2023, 2, 2)?, "Grade 8 - Module 2", "Mona Adel", None),
        seed_student(1004, "canceled", "United Arab Emirates", at(2023, 3, 11)?, "Grade 5 - Module 1", "Salma Nabil", Some("schedule conflict")),
        seed_student(1005, "free", "Egypt", at(2023, 4, 7)?, "Grade 3 - Module 1", "Omar Hany", None),
    ];

    let subscriptions = vec![
        seed_subscription(1001, at(2023, 1, 4)?, at(2023, 4, 4)?, "egp", 4500.0, "quarterly", &[2023]),
        seed_subscription(1001, at(2023, 4, 2)?, at(2023, 10, 2)?, "egp", 8200.0, "semi_annual", &[2023]),
        seed_subscription(1001, at(2023, 10, 1)?, at(2024, 10, 1)?, "egp", 15000.0, "annual", &[2023, 2024]),
        seed_subscription(1002, at(2023, 1, 19)?, at(2023, 2, 19)?, "egp", 1700.0, "monthly", &[2023]),
        seed_subscription(1003, at(2023, 2, 2)?, at(2023, 5, 2)?, "USD", 120.0, "quarterly", &[2023]),
        seed_subscription(1003, at(2023, 5, 1)?, at(2023, 8, 1)?, "USD", 120.0, "quarterly", &[2023]),
        seed_subscription(1004, at(2023, 3, 11)?, at(2023, 6, 11)?, "AED", 450.0, "quarterly", &[2023]),
    ];

    let dataset = Dataset {
        students,
        subscriptions,
    };
    store_dataset(pool, &dataset, "seed").await
}

fn seed_student(
    id: i64,
    status: &str,
    country: &str,
    created_at: NaiveDateTime,
    grade: &str,
    tutor: &str,
    lost_reason: Option<&str>,
) -> Student {
    let status = StudentStatus::from(status.to_string());
    Student {
        id,
        signed_up_free: status == StudentStatus::Free,
        status,
        country: Some(country.to_string()),
        created_at: Some(created_at),
        last_or_current_grade_and_module: Some(grade.to_string()),
        last_or_current_tutor: Some(tutor.to_string()),
        lost_reason: lost_reason.map(str::to_string),
    }
}

fn seed_subscription(
    student_id: i64,
    created_at: NaiveDateTime,
    expired_at: NaiveDateTime,
    currency: &str,
    paid_amount: f64,
    plan: &str,
    active_years: &[i32],
) -> Subscription {
    Subscription {
        student_id,
        created_at: Some(created_at),
        activated_at: Some(created_at),
        expired_at: Some(expired_at),
        refund_at: None,
        currency: Currency::from(currency),
        paid_amount,
        remaining_amount: 0.0,
        refund_amount: 0.0,
        plan: plan.to_string(),
        active_years: active_years.iter().copied().collect(),
    }
}

/// Copies a CSV snapshot directory into Postgres. Rows already stored are
/// skipped whatever path or row order the snapshot arrives with.
pub async fn import_csv(pool: &PgPool, dir: &std::path::Path) -> anyhow::Result<usize> {
    let dataset = loader::load_csv_dir(dir)?;
    let source = dir.display().to_string();
    store_dataset(pool, &dataset, &source).await
}

/// Dedupe key built from what identifies a subscription row, not from where
/// it was read.
pub(crate) fn source_key(subscription: &Subscription) -> String {
    let timestamp = |value: Option<NaiveDateTime>| {
        value
            .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            .unwrap_or_default()
    };
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        subscription.student_id,
        timestamp(subscription.created_at),
        timestamp(subscription.activated_at),
        timestamp(subscription.expired_at),
        subscription.currency.code(),
        subscription.paid_amount,
        subscription.plan,
    )
}

/// Upserts students and inserts subscriptions not seen before, returning the
/// number of new subscriptions.
async fn store_dataset(pool: &PgPool, dataset: &Dataset, source: &str) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;

    for student in &dataset.students {
        sqlx::query(
            r#"
            INSERT INTO subscription_analytics.students
            (id, status, country, created_at, signed_up_free,
             last_or_current_grade_and_module, last_or_current_tutor, lost_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                country = EXCLUDED.country,
                created_at = EXCLUDED.created_at,
                signed_up_free = EXCLUDED.signed_up_free,
                last_or_current_grade_and_module = EXCLUDED.last_or_current_grade_and_module,
                last_or_current_tutor = EXCLUDED.last_or_current_tutor,
                lost_reason = EXCLUDED.lost_reason
            "#,
        )
        .bind(student.id)
        .bind(student.status.as_str())
        .bind(&student.country)
        .bind(student.created_at)
        .bind(student.signed_up_free)
        .bind(&student.last_or_current_grade_and_module)
        .bind(&student.last_or_current_tutor)
        .bind(&student.lost_reason)
        .execute(&mut *tx)
        .await?;
    }

    let mut inserted = 0usize;
    for subscription in &dataset.subscriptions {
        let key = source_key(subscription);
        let active_years: Vec<i32> = subscription.active_years.iter().copied().collect();

        let result = sqlx::query(
            r#"
            INSERT INTO subscription_analytics.subscriptions
            (student_id, created_at, activated_at, expired_at, refund_at, currency,
             paid_amount, remaining_amount, refund_amount, plan, active_years, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(subscription.student_id)
        .bind(subscription.created_at)
        .bind(subscription.activated_at)
        .bind(subscription.expired_at)
        .bind(subscription.refund_at)
        .bind(subscription.currency.code())
        .bind(subscription.paid_amount)
        .bind(subscription.remaining_amount)
        .bind(subscription.refund_amount)
        .bind(&subscription.plan)
        .bind(active_years)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    tx.commit().await?;
    info!(
        students = dataset.students.len(),
        inserted,
        source,
        "stored dataset"
    );
    Ok(inserted)
}

/// Reads the full snapshot. Subscriptions keep insertion order so ties on
/// `created_at` resolve the same way as the source file.
pub async fn load_dataset(pool: &PgPool) -> anyhow::Result<Dataset> {
    let student_rows = sqlx::query(
        "SELECT id, status, country, created_at, signed_up_free, \
         last_or_current_grade_and_module, last_or_current_tutor, lost_reason \
         FROM subscription_analytics.students ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("failed to load students")?;

    let students = student_rows
        .into_iter()
        .map(|row| Student {
            id: row.get("id"),
            status: StudentStatus::from(row.get::<String, _>("status")),
            country: row.get("country"),
            created_at: row.get("created_at"),
            signed_up_free: row.get("signed_up_free"),
            last_or_current_grade_and_module: row.get("last_or_current_grade_and_module"),
            last_or_current_tutor: row.get("last_or_current_tutor"),
            lost_reason: row.get("lost_reason"),
        })
        .collect();

    let subscription_rows = sqlx::query(
        "SELECT student_id, created_at, activated_at, expired_at, refund_at, currency, \
         paid_amount, remaining_amount, refund_amount, plan, active_years \
         FROM subscription_analytics.subscriptions ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("failed to load subscriptions")?;

    let subscriptions = subscription_rows
        .into_iter()
        .map(|row| Subscription {
            student_id: row.get("student_id"),
            created_at: row.get("created_at"),
            activated_at: row.get("activated_at"),
            expired_at: row.get("expired_at"),
            refund_at: row.get("refund_at"),
            currency: Currency::from(row.get::<String, _>("currency")),
            paid_amount: row.get("paid_amount"),
            remaining_amount: row.get("remaining_amount"),
            refund_amount: row.get("refund_amount"),
            plan: row.get("plan"),
            active_years: row
                .get::<Vec<i32>, _>("active_years")
                .into_iter()
                .collect(),
        })
        .collect();

    Ok(Dataset {
        students,
        subscriptions,
    })
}
