//! Cron expression parsing on top of [`cron`](https://docs.rs/cron), plus
//! `@every`/`@hourly`/`@daily`/... shortcuts expanded into genuine cron
//! expressions, and a distinguished `@triggered` schedule that never fires
//! on its own.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

const EVERY_PREFIX: &str = "@every ";
pub const TRIGGERED: &str = "@triggered";

#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// A fixed-interval schedule, `@every <duration>`.
    Every(Duration),
    /// A standard 5/6-field cron expression, including the `@hourly` etc.
    /// shortcuts which are expanded to their cron-expression equivalent.
    Cron(Box<Schedule>),
    /// `@triggered` — installs no cron entry; only `Scheduler::run_job`
    /// can fire it.
    Triggered,
}

impl JobSchedule {
    pub fn is_triggered(&self) -> bool {
        matches!(self, JobSchedule::Triggered)
    }

    /// Computes the next fire time strictly after `after`, or `None` for
    /// `@triggered` schedules.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Every(d) => Some(after + chrono::Duration::from_std(*d).ok()?),
            JobSchedule::Cron(s) => s.after(&after).next(),
            JobSchedule::Triggered => None,
        }
    }

    /// Returns up to `n` upcoming fire times after `after`, for UI /
    /// introspection purposes.
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(n);
        let mut cursor = after;
        for _ in 0..n {
            match self.next_after(cursor) {
                Some(t) => {
                    out.push(t);
                    cursor = t;
                }
                None => break,
            }
        }
        out
    }
}

impl Display for JobSchedule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobSchedule::Every(d) => {
                write!(f, "{}{}", EVERY_PREFIX, humantime::format_duration(*d))
            }
            JobSchedule::Cron(s) => write!(f, "{}", s),
            JobSchedule::Triggered => write!(f, "{}", TRIGGERED),
        }
    }
}

impl FromStr for JobSchedule {
    type Err = crate::error::SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |msg: String| crate::error::SchedulerError::InvalidSchedule(msg);

        if s == TRIGGERED {
            return Ok(JobSchedule::Triggered);
        }

        if let Some(rest) = s.strip_prefix(EVERY_PREFIX) {
            let dur = humantime::parse_duration(rest)
                .map_err(|e| invalid(format!("bad @every duration '{rest}': {e}")))?;
            return Ok(JobSchedule::Every(dur));
        }

        // Calendar shortcuts expand to a genuine 6-field cron expression
        // (sec min hour dom month dow) rather than a fixed-interval
        // approximation, so `@daily` fires at local midnight every day
        // rather than every 24h from process start.
        let expanded = match s {
            "@hourly" => Some("0 0 * * * *"),
            "@daily" | "@midnight" => Some("0 0 0 * * *"),
            "@weekly" => Some("0 0 0 * * SUN"),
            "@monthly" => Some("0 0 0 1 * *"),
            "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
            _ => None,
        };

        let expr = expanded.unwrap_or(s);
        let schedule =
            Schedule::from_str(expr).map_err(|e| invalid(format!("bad cron expression '{s}': {e}")))?;
        Ok(JobSchedule::Cron(Box::new(schedule)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every() {
        let s = JobSchedule::from_str("@every 1s").unwrap();
        assert!(matches!(s, JobSchedule::Every(d) if d == Duration::from_secs(1)));
    }

    #[test]
    fn parses_triggered() {
        assert!(JobSchedule::from_str("@triggered").unwrap().is_triggered());
    }

    #[test]
    fn triggered_has_no_next_fire() {
        let s = JobSchedule::Triggered;
        assert!(s.next_after(Utc::now()).is_none());
    }

    #[test]
    fn hourly_shortcut_expands_to_cron() {
        let s = JobSchedule::from_str("@hourly").unwrap();
        assert!(matches!(s, JobSchedule::Cron(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(JobSchedule::from_str("not a schedule").is_err());
    }

    #[test]
    fn upcoming_returns_n_increasing_times() {
        let s = JobSchedule::from_str("@every 1m").unwrap();
        let now = Utc::now();
        let times = s.upcoming(now, 3);
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }
}
