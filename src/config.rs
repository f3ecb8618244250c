use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::models::Currency;

pub const DEFAULT_AOV: f64 = 5900.0;
pub const DEFAULT_TIMEZONE: &str = "Africa/Cairo";

/// Settings threaded through every time-gated or currency-scoped computation.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsConfig {
    /// Average order value used to project revenue lost to churn.
    pub aov: f64,
    /// Currencies included in revenue and ARPU figures.
    pub currencies: Vec<Currency>,
    /// Subscriptions whose anchor falls on or after this day are not matured.
    pub reference_day: NaiveDate,
}

impl AnalyticsConfig {
    pub fn new(aov: f64, currencies: Vec<Currency>, reference_day: NaiveDate) -> Self {
        let currencies = if currencies.is_empty() {
            vec![Currency::Egp]
        } else {
            currencies
        };
        Self {
            aov,
            currencies,
            reference_day,
        }
    }
}

/// Resolves the processing day: an explicit override wins, otherwise today's
/// date in the reference zone.
pub fn reference_day(as_of: Option<NaiveDate>, zone: Tz) -> NaiveDate {
    as_of.unwrap_or_else(|| day_in_zone(Utc::now(), zone))
}

/// Calendar day of `now` on the wall clock of `zone`, daylight saving included.
pub fn day_in_zone(now: DateTime<Utc>, zone: Tz) -> NaiveDate {
    now.with_timezone(&zone).date_naive()
}

pub fn parse_timezone(value: &str) -> anyhow::Result<Tz> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|err| anyhow::anyhow!("invalid time zone {value:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cairo() -> Tz {
        parse_timezone(DEFAULT_TIMEZONE).unwrap()
    }

    #[test]
    fn explicit_day_overrides_clock() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(reference_day(Some(day), cairo()), day);
    }

    #[test]
    fn clock_day_uses_zone() {
        let expected = Utc::now().with_timezone(&cairo()).date_naive();
        assert_eq!(reference_day(None, cairo()), expected);
    }

    #[test]
    fn summer_time_moves_the_day_boundary() {
        // Cairo is UTC+3 in July, so 21:30 UTC is already the next day.
        let summer = Utc.with_ymd_and_hms(2024, 7, 1, 21, 30, 0).unwrap();
        assert_eq!(
            day_in_zone(summer, cairo()),
            NaiveDate::from_ymd_opt(2024, 7, 2).unwrap()
        );

        // UTC+2 in January: still the same day.
        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 21, 30, 0).unwrap();
        assert_eq!(
            day_in_zone(winter, cairo()),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
    }

    #[test]
    fn day_flips_at_local_midnight_around_the_spring_switch() {
        // Clocks jump from 00:00 to 01:00 local on 2024-04-26.
        let before = Utc.with_ymd_and_hms(2024, 4, 25, 21, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 4, 25, 22, 0, 0).unwrap();
        assert_eq!(
            day_in_zone(before, cairo()),
            NaiveDate::from_ymd_opt(2024, 4, 25).unwrap()
        );
        assert_eq!(
            day_in_zone(after, cairo()),
            NaiveDate::from_ymd_opt(2024, 4, 26).unwrap()
        );
    }

    #[test]
    fn empty_currency_list_defaults_to_egp() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let config = AnalyticsConfig::new(DEFAULT_AOV, Vec::new(), day);
        assert_eq!(config.currencies, vec![Currency::Egp]);
    }

    #[test]
    fn rejects_unknown_zone() {
        assert!(parse_timezone("Africa/Atlantis").is_err());
        assert!(parse_timezone("+02:00").is_err());
    }
}
