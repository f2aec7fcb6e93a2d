//! Schedule trigger: fires a synthetic envelope on a minute-of-hour schedule.
//!
//! The envelope id is derived from the schedule name and fire time, so a
//! tick delivered twice lands on the same idempotency key.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use serde_json::json;
use tracing::{debug, info};

use super::{DeadLetterQueue, Shutdown, hand_off};
use crate::engine::{RunHandle, Workflow};
use crate::error::{Error, Result};
use crate::model::WorkUnit;

pub const DEFAULT_SCHEDULE: &str = "0/5";

/// The minute field of a cron expression.
///
/// Accepts `*`, a single minute `N`, ranges `A-B`, steps `A/S`, `*/S` and
/// `A-B/S`, and comma-separated lists of any of those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronMinute {
    expression: String,
    minutes: BTreeSet<u32>,
}

impl CronMinute {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let invalid = |reason: &str| Error::Config(format!("schedule {expression:?}: {reason}"));

        let mut minutes = BTreeSet::new();
        for part in expression.split(',') {
            let part = part.trim();
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                    if step == 0 {
                        return Err(invalid("step must be positive"));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" {
                (0, 59)
            } else if let Some((a, b)) = range.split_once('-') {
                let a: u32 = a.parse().map_err(|_| invalid("bad range start"))?;
                let b: u32 = b.parse().map_err(|_| invalid("bad range end"))?;
                (a, b)
            } else {
                let n: u32 = range.parse().map_err(|_| invalid("bad minute"))?;
                // `A/S` runs from A to the end of the hour.
                (n, if step.is_some() { 59 } else { n })
            };

            if start > end || end > 59 {
                return Err(invalid("minutes must be within 0-59"));
            }
            let step = step.unwrap_or(1) as usize;
            minutes.extend((start..=end).step_by(step));
        }

        if minutes.is_empty() {
            return Err(invalid("no minutes selected"));
        }
        Ok(Self {
            expression: expression.to_string(),
            minutes,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    pub fn contains(&self, minute: u32) -> bool {
        self.minutes.contains(&minute)
    }

    /// The first fire time strictly after `after`, on a whole minute.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let minute = ChronoDuration::minutes(1);
        let mut t = after.duration_trunc(minute).unwrap_or(after) + minute;
        // Every hour contains at least one selected minute.
        for _ in 0..60 {
            if self.contains(t.minute()) {
                return t;
            }
            t += minute;
        }
        t
    }
}

impl Default for CronMinute {
    fn default() -> Self {
        Self {
            expression: DEFAULT_SCHEDULE.to_string(),
            minutes: (0..60).step_by(5).collect(),
        }
    }
}

impl std::str::FromStr for CronMinute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

pub struct ScheduleTrigger {
    name: String,
    schedule: CronMinute,
    enabled: bool,
    workflow: Workflow,
    dlq: Option<Arc<dyn DeadLetterQueue>>,
}

impl ScheduleTrigger {
    /// Disabled until [`ScheduleTrigger::enabled`] is set.
    pub fn new(name: impl Into<String>, schedule: CronMinute, workflow: Workflow) -> Self {
        Self {
            name: name.into(),
            schedule,
            enabled: false,
            workflow,
            dlq: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn dead_letters(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn schedule(&self) -> &CronMinute {
        &self.schedule
    }

    pub fn envelope(&self, fire_time: DateTime<Utc>) -> WorkUnit {
        let time = fire_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        WorkUnit::new(json!({
            "id": format!("{}:{}", self.name, time),
            "source": "schedule",
            "time": time,
            "schedule": self.name,
        }))
    }

    /// Deliver the envelope for one tick.
    pub async fn fire(&self, fire_time: DateTime<Utc>) -> Option<RunHandle> {
        debug!(schedule = %self.name, %fire_time, "schedule fired");
        hand_off(
            "schedule",
            &self.workflow,
            self.envelope(fire_time),
            self.dlq.as_deref(),
        )
        .await
        .into_handle()
    }

    /// Fire on every scheduled minute until shutdown. Returns immediately
    /// when disabled.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        if !self.enabled {
            info!(schedule = %self.name, "schedule disabled");
            return Ok(());
        }
        info!(
            schedule = %self.name,
            cron = self.schedule.as_str(),
            workflow = self.workflow.name(),
            "schedule trigger started"
        );

        loop {
            let now = Utc::now();
            let next = self.schedule.next_after(now);
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(wait) => {
                    self.fire(next).await;
                }
            }
        }

        info!(schedule = %self.name, "schedule trigger stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn default_fires_every_five_minutes() {
        let cron = CronMinute::parse("0/5").unwrap();
        assert_eq!(cron, CronMinute::default());
        assert_eq!(cron.next_after(at(10, 0, 0)), at(10, 5, 0));
        assert_eq!(cron.next_after(at(10, 3, 59)), at(10, 5, 0));
        assert_eq!(cron.next_after(at(10, 57, 1)), at(11, 0, 0));
    }

    #[test]
    fn parses_lists_ranges_and_steps() {
        let cron = CronMinute::parse("7, 30-40/5,*/20").unwrap();
        for m in [0, 7, 20, 30, 35, 40] {
            assert!(cron.contains(m), "{m}");
        }
        assert!(!cron.contains(45));
        assert_eq!(CronMinute::parse("*").unwrap().next_after(at(1, 1, 30)), at(1, 2, 0));
        assert_eq!(CronMinute::parse("15").unwrap().next_after(at(1, 15, 0)), at(2, 15, 0));
    }

    #[test]
    fn rejects_bad_expressions() {
        for bad in ["", "60", "5/0", "a", "40-20", "1-2-3", "*/x"] {
            assert!(CronMinute::parse(bad).is_err(), "{bad:?}");
        }
    }
}
