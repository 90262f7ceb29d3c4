//! Core domain model and the pure recheck cadence for schedwatch.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "schedwatch-core";

/// Zone in which cadence hours are interpreted. Target pages publish for
/// west-coast tournaments, so local hours mean Pacific local hours.
pub const CHECK_TZ: Tz = chrono_tz::America::Los_Angeles;

/// One watched page that is expected to eventually publish a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredTarget {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub owner_email: String,
    pub notification_email: Option<String>,
    /// Tournament date driving the recheck cadence. `None` means the target
    /// has no adaptive cadence and is never selected as due.
    pub target_date: Option<NaiveDate>,
    pub active: bool,
    pub schedule_available: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoredTarget {
    /// Build a new target with creation defaults: active, no schedule seen
    /// yet, first check time computed immediately.
    pub fn new(
        url: impl Into<String>,
        name: impl Into<String>,
        owner_email: impl Into<String>,
        target_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            name: name.into(),
            owner_email: owner_email.into(),
            notification_email: None,
            target_date,
            active: true,
            schedule_available: false,
            last_checked_at: None,
            next_check_at: next_check_time(target_date, now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Notification recipient: explicit address if set, owner otherwise.
    pub fn recipient(&self) -> &str {
        self.notification_email
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or(&self.owner_email)
    }
}

/// One immutable recorded check result for a target. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    pub id: Uuid,
    pub target_id: Uuid,
    pub content: String,
    pub content_hash: String,
    pub summary: String,
    pub games: Option<Vec<GameEntry>>,
    pub checked_at: DateTime<Utc>,
    pub changes_detected: bool,
}

/// Structured game entry extracted by the classifier. The oracle is loose
/// about key names, so alternate spellings are accepted on deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GameEntry {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default, alias = "home")]
    pub team1: Option<String>,
    #[serde(default, alias = "away", alias = "opponent")]
    pub team2: Option<String>,
    #[serde(default, alias = "field", alias = "venue")]
    pub location: Option<String>,
}

/// Read-only per-target projection consumed by outer layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub notification_email: Option<String>,
    pub schedule_available: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub target_date: Option<NaiveDate>,
    pub next_check_at: Option<DateTime<Utc>>,
}

impl From<&MonitoredTarget> for TargetSummary {
    fn from(target: &MonitoredTarget) -> Self {
        Self {
            id: target.id,
            url: target.url.clone(),
            name: target.name.clone(),
            notification_email: target.notification_email.clone(),
            schedule_available: target.schedule_available,
            last_checked_at: target.last_checked_at,
            active: target.active,
            target_date: target.target_date,
            next_check_at: target.next_check_at,
        }
    }
}

/// Read-only per-snapshot projection consumed by outer layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    pub id: Uuid,
    pub summary: String,
    pub checked_at: DateTime<Utc>,
}

impl From<&ScheduleSnapshot> for SnapshotSummary {
    fn from(snapshot: &ScheduleSnapshot) -> Self {
        Self {
            id: snapshot.id,
            summary: snapshot.summary.clone(),
            checked_at: snapshot.checked_at,
        }
    }
}

/// Whole days between the target date and `now`'s calendar date in
/// [`CHECK_TZ`]. Negative once the date has passed.
pub fn days_until(target_date: NaiveDate, now: DateTime<Utc>) -> i64 {
    let today = now.with_timezone(&CHECK_TZ).date_naive();
    (target_date - today).num_days()
}

/// Local hours-of-day at which a check should occur, keyed by proximity to
/// the target date. Escalates as the date approaches; empty once past.
pub fn cadence_hours(days_until: i64) -> &'static [u32] {
    match days_until {
        d if d < 0 => &[],
        0..=1 => &[9, 12, 15, 18, 22],
        2..=4 => &[9, 12, 17, 22],
        5..=7 => &[9, 15, 22],
        8..=13 => &[10, 22],
        _ => &[10],
    }
}

/// Next scheduled check strictly after `now`, or `None` when the target
/// date is absent or already past.
///
/// Picks the smallest cadence hour later than `now`'s local hour; failing
/// that, the first cadence hour tomorrow, with the band recomputed for
/// tomorrow's proximity (it can shift as the date nears).
pub fn next_check_time(
    target_date: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let target_date = target_date?;
    let local = now.with_timezone(&CHECK_TZ);
    let today = local.date_naive();
    let days = (target_date - today).num_days();
    if days < 0 {
        return None;
    }

    if let Some(&hour) = cadence_hours(days).iter().find(|&&h| h > local.hour()) {
        return local_at_hour(today, hour);
    }

    let tomorrow = today.succ_opt()?;
    let hours = cadence_hours((target_date - tomorrow).num_days());
    local_at_hour(tomorrow, *hours.first()?)
}

fn local_at_hour(date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, 0, 0)?;
    // Cadence hours never land in the 2am DST gap, but `earliest` keeps
    // this total anyway.
    CHECK_TZ
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Whether a target should be enqueued for a check right now: active, date
/// not yet past, and no pending `next_check_at` later than `now`.
pub fn is_due(target: &MonitoredTarget, now: DateTime<Utc>) -> bool {
    if !target.active {
        return false;
    }
    let Some(date) = target.target_date else {
        return false;
    };
    if days_until(date, now) < 0 {
        return false;
    }
    match target.next_check_at {
        None => true,
        Some(at) => at <= now,
    }
}
