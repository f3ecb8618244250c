use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize, Serializer};

pub type StudentId = i64;

/// Student lifecycle status as recorded by the CRM. Values outside the known
/// set are kept verbatim and fall into no status bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StudentStatus {
    Active,
    PendingSchedule,
    Pending,
    Expired,
    Canceled,
    Free,
    Other(String),
}

impl StudentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::PendingSchedule => "pending_schedule",
            Self::Pending => "pending",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
            Self::Free => "free",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for StudentStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "active" => Self::Active,
            "pending_schedule" => Self::PendingSchedule,
            "pending" => Self::Pending,
            "expired" => Self::Expired,
            "canceled" => Self::Canceled,
            "free" => Self::Free,
            _ => Self::Other(value),
        }
    }
}

impl From<StudentStatus> for String {
    fn from(value: StudentStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Billing currency code. Codes are matched exactly, so `egp` and `EGP` differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Currency {
    Egp,
    Usd,
    Eur,
    Aed,
    Other(String),
}

impl Currency {
    pub fn code(&self) -> &str {
        match self {
            Self::Egp => "egp",
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Aed => "AED",
            Self::Other(code) => code,
        }
    }
}

impl From<String> for Currency {
    fn from(value: String) -> Self {
        match value.as_str() {
            "egp" => Self::Egp,
            "USD" => Self::Usd,
            "EUR" => Self::Eur,
            "AED" => Self::Aed,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Currency {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.code().to_string()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub status: StudentStatus,
    pub country: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub signed_up_free: bool,
    pub last_or_current_grade_and_module: Option<String>,
    pub last_or_current_tutor: Option<String>,
    pub lost_reason: Option<String>,
}

/// One purchased subscription. Timestamps that failed to parse at ingestion
/// are `None`; `active_years` is already decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub student_id: StudentId,
    pub created_at: Option<NaiveDateTime>,
    pub activated_at: Option<NaiveDateTime>,
    pub expired_at: Option<NaiveDateTime>,
    pub refund_at: Option<NaiveDateTime>,
    pub currency: Currency,
    pub paid_amount: f64,
    pub remaining_amount: f64,
    pub refund_amount: f64,
    pub plan: String,
    pub active_years: BTreeSet<i32>,
}

/// Read-only snapshot of both input tables.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub students: Vec<Student>,
    pub subscriptions: Vec<Subscription>,
}

/// Calendar month used as the row key of cohort pivots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CohortMonth {
    pub year: i32,
    pub month: u32,
}

impl CohortMonth {
    pub fn of(timestamp: NaiveDateTime) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }
}

impl fmt::Display for CohortMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for CohortMonth {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let date = NaiveDate::parse_from_str(&format!("{}-01", value.trim()), "%Y-%m-%d")
            .with_context(|| format!("invalid cohort month {value:?}, expected YYYY-MM"))?;
        Ok(Self {
            year: date.year(),
            month: date.month(),
        })
    }
}

impl Serialize for CohortMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_is_kept_verbatim() {
        let status = StudentStatus::from("Active".to_string());
        assert_eq!(status, StudentStatus::Other("Active".to_string()));
        assert_eq!(status.as_str(), "Active");
        assert_eq!(
            StudentStatus::from("pending_schedule".to_string()),
            StudentStatus::PendingSchedule
        );
    }

    #[test]
    fn currency_codes_match_exactly() {
        assert_eq!(Currency::from("egp"), Currency::Egp);
        assert_eq!(Currency::from("EGP"), Currency::Other("EGP".to_string()));
        assert_eq!(Currency::Usd.to_string(), "USD");
    }

    #[test]
    fn cohort_month_parses_and_orders() {
        let march: CohortMonth = "2023-03".parse().unwrap();
        let december: CohortMonth = "2022-12".parse().unwrap();
        assert!(december < march);
        assert_eq!(march.to_string(), "2023-03");
        assert!("2023-13".parse::<CohortMonth>().is_err());
    }
}
