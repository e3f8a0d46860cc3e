//! Free-tier usage types.
//!
//! Free generations are counted per (user, model) over two windows: the current
//! local calendar hour and the current local calendar day.

use chrono::{DateTime, Local, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// One free generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeUsageRecord {
    /// User who consumed the slot.
    pub user_id: UserId,
    /// Free model used.
    pub model_id: String,
    /// Job the slot was consumed for, used to undo a failed attempt.
    #[serde(default)]
    pub job_id: Option<String>,
    /// When the slot was consumed.
    pub created_at: DateTime<Utc>,
}

impl FreeUsageRecord {
    /// Create a record stamped now.
    #[must_use]
    pub fn new(user_id: UserId, model_id: impl Into<String>, job_id: Option<String>) -> Self {
        Self {
            user_id,
            model_id: model_id.into(),
            job_id,
            created_at: Utc::now(),
        }
    }

    /// Whether this record is the one identified by the triple.
    #[must_use]
    pub fn matches(&self, user_id: UserId, model_id: &str, job_id: Option<&str>) -> bool {
        self.user_id == user_id && self.model_id == model_id && self.job_id.as_deref() == job_id
    }
}

/// Why a free-tier check ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    /// Under both limits.
    Ok,
    /// Hourly limit reached.
    HourlyLimitExceeded,
    /// Daily limit reached.
    DailyLimitExceeded,
    /// The model has no free tier.
    NotFree,
}

impl LimitReason {
    /// Get the reason as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::HourlyLimitExceeded => "hourly_limit_exceeded",
            Self::DailyLimitExceeded => "daily_limit_exceeded",
            Self::NotFree => "not_free",
        }
    }
}

/// Outcome of a free-tier check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDecision {
    /// Whether the call may proceed for free.
    pub allowed: bool,
    /// Why.
    pub reason: LimitReason,
    /// Slots used this hour (including this call when reserved).
    pub hourly_used: u32,
    /// Hourly limit, bonus included.
    pub hourly_limit: u32,
    /// Slots used today (including this call when reserved).
    pub daily_used: u32,
    /// Daily limit.
    pub daily_limit: u32,
}

impl LimitDecision {
    /// Decision for a model without a free tier.
    #[must_use]
    pub const fn not_free() -> Self {
        Self {
            allowed: false,
            reason: LimitReason::NotFree,
            hourly_used: 0,
            hourly_limit: 0,
            daily_used: 0,
            daily_limit: 0,
        }
    }
}

/// Start of the hourly and daily windows containing `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindows {
    /// Top of the current local hour.
    pub hour_start: DateTime<Utc>,
    /// Local midnight that began the current day.
    pub day_start: DateTime<Utc>,
}

impl UsageWindows {
    /// Compute the windows around `now` in the given time zone.
    #[must_use]
    pub fn at<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        let hour_start = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .map_or_else(|| now.with_timezone(&Utc), |t| t.with_timezone(&Utc));

        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| now.timezone().from_local_datetime(&midnight).earliest())
            .map_or(hour_start, |t| t.with_timezone(&Utc));

        Self {
            hour_start,
            day_start,
        }
    }

    /// Windows around the current local time.
    #[must_use]
    pub fn now() -> Self {
        Self::at(&Local::now())
    }

    /// Count records in the hourly and daily windows.
    #[must_use]
    pub fn count<'a, I>(&self, records: I) -> (u32, u32)
    where
        I: IntoIterator<Item = &'a FreeUsageRecord>,
    {
        let mut hourly = 0u32;
        let mut daily = 0u32;
        for record in records {
            if record.created_at >= self.day_start {
                daily = daily.saturating_add(1);
            }
            if record.created_at >= self.hour_start {
                hourly = hourly.saturating_add(1);
            }
        }
        (hourly, daily)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    #[test]
    fn windows_in_fixed_zone() {
        let tz = FixedOffset::east_opt(3 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 3, 10, 14, 37, 12).unwrap();
        let windows = UsageWindows::at(&now);

        assert_eq!(
            windows.hour_start,
            tz.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap().with_timezone(&Utc)
        );
        assert_eq!(
            windows.day_start,
            tz.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap().with_timezone(&Utc)
        );
    }

    #[test]
    fn count_splits_windows() {
        let tz = FixedOffset::east_opt(0).unwrap();
        let now = tz.with_ymd_and_hms(2024, 3, 10, 14, 30, 0).unwrap();
        let windows = UsageWindows::at(&now);
        let user = UserId::new(1).unwrap();

        let at = |t: DateTime<FixedOffset>| FreeUsageRecord {
            user_id: user,
            model_id: "z-image".into(),
            job_id: None,
            created_at: t.with_timezone(&Utc),
        };

        let records = vec![
            at(now - Duration::minutes(10)),
            at(now - Duration::minutes(40)),
            at(now - Duration::hours(20)),
        ];

        assert_eq!(windows.count(&records), (1, 2));
    }

    #[test]
    fn reason_strings() {
        assert_eq!(LimitReason::HourlyLimitExceeded.as_str(), "hourly_limit_exceeded");
        assert_eq!(
            serde_json::to_string(&LimitReason::DailyLimitExceeded).unwrap(),
            r#""daily_limit_exceeded""#
        );
    }
}
