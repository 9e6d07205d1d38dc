use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression with a seconds field (6 or 7 fields).
    Cron { expression: String },
    /// Fixed rate, millisecond precision.
    FixedInterval { every_ms: u64 },
}

impl Schedule {
    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
        }
    }

    pub fn every(interval: Duration) -> Self {
        Schedule::FixedInterval {
            every_ms: interval.as_millis() as u64,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
            Schedule::FixedInterval { every_ms: 0 } => Err(SchedulerError::InvalidSchedule(
                "fixed interval must be > 0".into(),
            )),
            Schedule::FixedInterval { .. } => Ok(()),
        }
    }

    /// First slot strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Cron { expression } => Ok(parse_cron(expression)?.after(&after).next()),
            Schedule::FixedInterval { every_ms } => {
                Ok(Some(after + chrono_millis(nonzero_interval(*every_ms)?)))
            }
        }
    }

    /// Slot following `scheduled` that is strictly later than both `scheduled`
    /// and `now`.
    ///
    /// Slots missed while nobody fired are skipped, not replayed: a fixed-rate
    /// trigger stays on its original grid.
    pub fn next_fire(
        &self,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Cron { expression } => {
                Ok(parse_cron(expression)?.after(&scheduled.max(now)).next())
            }
            Schedule::FixedInterval { every_ms } => {
                let every = nonzero_interval(*every_ms)?;
                if now < scheduled {
                    return Ok(Some(scheduled + chrono_millis(every)));
                }
                let behind = (now - scheduled).num_milliseconds() as u64;
                let slots = behind / every + 1;
                Ok(Some(scheduled + chrono_millis(slots.saturating_mul(every))))
            }
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Cron { expression } => write!(f, "cron({expression})"),
            Schedule::FixedInterval { every_ms } => write!(f, "every {every_ms}ms"),
        }
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))
}

fn nonzero_interval(every_ms: u64) -> Result<u64> {
    if every_ms == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "fixed interval must be > 0".into(),
        ));
    }
    Ok(every_ms)
}

/// std -> chrono duration, clamped to a range chrono can represent.
pub(crate) fn chrono_millis(ms: u64) -> chrono::Duration {
    const MAX_MS: u64 = 1 << 52;
    chrono::Duration::milliseconds(ms.min(MAX_MS) as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Normal,
    /// Stopped by an operator or by repeated failures; resumable.
    Paused,
    Disabled,
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerStatus::Normal => write!(f, "normal"),
            TriggerStatus::Paused => write!(f, "paused"),
            TriggerStatus::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for TriggerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TriggerStatus::Normal),
            "paused" => Ok(TriggerStatus::Paused),
            "disabled" => Ok(TriggerStatus::Disabled),
            other => Err(format!("unknown trigger status: {other}")),
        }
    }
}

/// What to do with a slot that was claimed later than its misfire threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once, flagged as a misfire, then resync to the next future slot.
    #[default]
    FireOnce,
    /// Skip the late slot and resync without running the job.
    Ignore,
}

impl std::fmt::Display for MisfirePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MisfirePolicy::FireOnce => write!(f, "fire_once"),
            MisfirePolicy::Ignore => write!(f, "ignore"),
        }
    }
}

impl FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fire_once" => Ok(MisfirePolicy::FireOnce),
            "ignore" => Ok(MisfirePolicy::Ignore),
            other => Err(format!("unknown misfire policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub job_id: Uuid,
    pub namespace: String,
    pub name: String,
    pub schedule: Schedule,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// `None` once the trigger has run past its end time.
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fire_time: Option<DateTime<Utc>>,
    /// Overrides the node's default misfire threshold.
    pub misfire_threshold_ms: Option<u64>,
    pub misfire_policy: MisfirePolicy,
    /// Node currently holding the claim; `None` means unclaimed.
    pub owner: Option<String>,
    /// Bumped on every successful claim.
    pub version: u64,
    pub status: TriggerStatus,
    pub consecutive_failures: u32,
    /// Set by a manual fire request, cleared when that fire is planned.
    pub manual_fire: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    /// New trigger for `job`, starting now.
    pub fn new(job: &Job, name: impl Into<String>, schedule: Schedule) -> Result<Self> {
        schedule.validate()?;
        let now = Utc::now();
        let mut trigger = Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            namespace: job.namespace.clone(),
            name: name.into(),
            schedule,
            start_time: now,
            end_time: None,
            next_fire_time: None,
            last_fire_time: None,
            misfire_threshold_ms: None,
            misfire_policy: MisfirePolicy::default(),
            owner: None,
            version: 0,
            status: TriggerStatus::Normal,
            consecutive_failures: 0,
            manual_fire: false,
            created_at: now,
            updated_at: now,
        };
        trigger.recompute_next_fire_time()?;
        Ok(trigger)
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Result<Self> {
        self.start_time = start;
        self.recompute_next_fire_time()?;
        Ok(self)
    }

    pub fn ending_at(mut self, end: DateTime<Utc>) -> Result<Self> {
        self.end_time = Some(end);
        self.recompute_next_fire_time()?;
        Ok(self)
    }

    pub fn with_misfire(mut self, policy: MisfirePolicy, threshold: Option<Duration>) -> Self {
        self.misfire_policy = policy;
        self.misfire_threshold_ms = threshold.map(|t| t.as_millis() as u64);
        self
    }

    /// First slot after `max(start_time, last_fire_time)`, bounded by `end_time`.
    ///
    /// The result may lie in the past; the engine treats that as a misfire.
    pub fn recompute_next_fire_time(&mut self) -> Result<()> {
        let base = match self.last_fire_time {
            Some(last) if last > self.start_time => last,
            _ => self.start_time,
        };
        let next = self.schedule.next_after(base)?;
        self.next_fire_time = self.bound_by_end_time(next);
        Ok(())
    }

    /// Fire time that follows a fire planned for `scheduled`, as seen at `now`.
    pub fn following_fire_time(
        &self,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let next = self.schedule.next_fire(scheduled, now)?;
        Ok(self.bound_by_end_time(next))
    }

    fn bound_by_end_time(&self, next: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match (next, self.end_time) {
            (Some(next), Some(end)) if next > end => None,
            (next, _) => next,
        }
    }

    pub fn misfire_threshold(&self, default: Duration) -> Duration {
        self.misfire_threshold_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// How far `now` is past the next fire time, if at all.
    pub fn lateness(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_fire_time?;
        (now - next).to_std().ok()
    }

    pub fn is_misfire(&self, now: DateTime<Utc>, default_threshold: Duration) -> bool {
        !self.manual_fire
            && self
                .lateness(now)
                .is_some_and(|late| late > self.misfire_threshold(default_threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ShellType;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn job() -> Job {
        Job::shell("default", "j", ShellType::Sh, "true")
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = Trigger::new(&job(), "t", Schedule::FixedInterval { every_ms: 0 });
        assert!(matches!(result, Err(SchedulerError::InvalidSchedule(_))));
    }

    #[test]
    fn bad_cron_is_rejected() {
        let result = Trigger::new(&job(), "t", Schedule::cron("not a cron"));
        assert!(matches!(result, Err(SchedulerError::InvalidSchedule(_))));
    }

    #[test]
    fn first_fire_is_one_interval_after_start() {
        let trigger = Trigger::new(&job(), "t", Schedule::every(Duration::from_millis(100)))
            .unwrap()
            .starting_at(ts(0))
            .unwrap();
        assert_eq!(trigger.next_fire_time, Some(ts(100)));
    }

    #[test]
    fn fixed_interval_keeps_grid_when_on_time() {
        let schedule = Schedule::every(Duration::from_millis(100));
        assert_eq!(schedule.next_fire(ts(100), ts(90)).unwrap(), Some(ts(200)));
        assert_eq!(schedule.next_fire(ts(100), ts(100)).unwrap(), Some(ts(200)));
    }

    #[test]
    fn fixed_interval_resyncs_after_outage() {
        let schedule = Schedule::every(Duration::from_millis(100));
        // Ten slots were missed; the next one is the first grid point after now.
        assert_eq!(schedule.next_fire(ts(100), ts(1_050)).unwrap(), Some(ts(1_100)));
        assert_eq!(schedule.next_fire(ts(100), ts(1_100)).unwrap(), Some(ts(1_200)));
    }

    #[test]
    fn cron_next_fire_is_after_now() {
        let schedule = Schedule::cron("0 * * * * *");
        let next = schedule.next_fire(ts(0), ts(125_000)).unwrap().unwrap();
        assert!(next > ts(125_000));
        assert_eq!(next.timestamp() % 60, 0);
    }

    #[test]
    fn end_time_exhausts_trigger() {
        let trigger = Trigger::new(&job(), "t", Schedule::every(Duration::from_millis(100)))
            .unwrap()
            .starting_at(ts(0))
            .unwrap()
            .ending_at(ts(150))
            .unwrap();
        assert_eq!(trigger.next_fire_time, Some(ts(100)));
        assert_eq!(trigger.following_fire_time(ts(100), ts(100)).unwrap(), None);
    }

    #[test]
    fn misfire_uses_trigger_threshold_over_default() {
        let mut trigger = Trigger::new(&job(), "t", Schedule::every(Duration::from_secs(1)))
            .unwrap()
            .with_misfire(MisfirePolicy::FireOnce, Some(Duration::from_millis(50)));
        trigger.next_fire_time = Some(ts(0));

        assert!(!trigger.is_misfire(ts(40), Duration::from_secs(10)));
        assert!(trigger.is_misfire(ts(60), Duration::from_secs(10)));
        assert_eq!(trigger.lateness(ts(60)), Some(Duration::from_millis(60)));
        assert_eq!(trigger.lateness(ts(-10)), None);
    }

    #[test]
    fn manual_fire_is_never_a_misfire() {
        let mut trigger =
            Trigger::new(&job(), "t", Schedule::every(Duration::from_secs(1))).unwrap();
        trigger.next_fire_time = Some(ts(0));
        trigger.manual_fire = true;
        assert!(!trigger.is_misfire(ts(60_000), Duration::from_millis(1)));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [TriggerStatus::Normal, TriggerStatus::Paused, TriggerStatus::Disabled] {
            assert_eq!(status.to_string().parse::<TriggerStatus>().unwrap(), status);
        }
    }
}
