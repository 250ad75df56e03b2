//! Clock abstraction and duration parsing.
//!
//! Every component that reads wall-clock time does so through the [`Clock`]
//! trait, so deadline and expiry semantics stay testable without sleeping.
//! The escalation engine accepts SLA timeouts as the ISO-8601 duration
//! subset `P[nD][T[nH][nM][nS]]`.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use crate::errors::{CoreError, CoreResult};

/// Monotonic-enough wall clock used across the crate.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Current Unix epoch milliseconds.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Production clock delegating to the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock whose time only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.write().expect("clock poisoned");
        *now = *now + delta;
    }

    /// Pins the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.write().expect("clock poisoned");
        *now = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("clock poisoned")
    }
}

/// Parses the ISO-8601 duration subset `P[nD][T[nH][nM][nS]]`.
///
/// At least one component must be present; years, months and weeks are not
/// accepted. Fractions are not accepted.
pub fn parse_duration(input: &str) -> CoreResult<Duration> {
    let invalid = || CoreError::Validation(format!("invalid ISO-8601 duration: `{input}`"));

    let rest = input.strip_prefix('P').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if let Some(t) = time_part {
        if t.is_empty() {
            return Err(invalid());
        }
    }

    let mut total = Duration::zero();
    let mut matched = false;

    if !date_part.is_empty() {
        let days = date_part.strip_suffix('D').ok_or_else(invalid)?;
        let days: u32 = days.parse().map_err(|_| invalid())?;
        total = total + Duration::days(i64::from(days));
        matched = true;
    }

    if let Some(time_part) = time_part {
        let mut cursor = time_part;
        // Units must appear in H, M, S order, each at most once.
        for (unit, seconds) in [('H', 3600i64), ('M', 60), ('S', 1)] {
            if let Some(pos) = cursor.find(unit) {
                let digits = &cursor[..pos];
                let value: u32 = digits.parse().map_err(|_| invalid())?;
                total = total + Duration::seconds(i64::from(value) * seconds);
                cursor = &cursor[pos + 1..];
                matched = true;
            }
        }
        if !cursor.is_empty() {
            return Err(invalid());
        }
    }

    if !matched {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_accepted_subset() {
        assert_eq!(parse_duration("PT1H").expect("PT1H"), Duration::hours(1));
        assert_eq!(
            parse_duration("PT30M").expect("PT30M"),
            Duration::minutes(30)
        );
        assert_eq!(
            parse_duration("PT90S").expect("PT90S"),
            Duration::seconds(90)
        );
        assert_eq!(parse_duration("P2D").expect("P2D"), Duration::days(2));
        assert_eq!(
            parse_duration("P1DT2H30M15S").expect("full"),
            Duration::days(1) + Duration::hours(2) + Duration::minutes(30) + Duration::seconds(15)
        );
    }

    #[test]
    fn test_parse_duration_rejects_malformed() {
        for input in ["", "P", "PT", "1H", "PT1X", "P1W", "PT1H2", "PTM", "P-1D"] {
            assert!(parse_duration(input).is_err(), "accepted `{input}`");
        }
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(3601));
        assert_eq!(clock.now(), start + Duration::seconds(3601));
    }
}
