//! The watermark is the boundary between processed and unprocessed audit-log events. Events at or
//! after the watermark have not yet been fully shipped.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, TimeDelta, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Hard ceiling on how far back a watermark may be re-derived, keeps a stale or long idle
/// checkpoint from triggering an unbounded re-fetch against the rate-limited remote API.
pub const DEFAULT_MAX_LOOK_BACK: Duration = Duration::from_secs(6 * 60 * 60);

/// An absolute UTC instant with whole-second precision. The precision matches the checkpoint
/// format, so a stored watermark loads back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at.with_nanosecond(0).unwrap_or(at))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Seconds since the unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    fn saturating_sub(self, delta: TimeDelta) -> Self {
        Self(
            self.0
                .checked_sub_signed(delta)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(value: DateTime<Utc>) -> Self {
        Watermark::new(value)
    }
}

/// RFC 3339 with a `Z` suffix and no fractional part, e.g. `2024-05-01T10:00:00Z`.
impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

impl FromStr for Watermark {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parsed = DateTime::parse_from_rfc3339(s.trim())?;
        Ok(Watermark::new(parsed.with_timezone(&Utc)))
    }
}

/// Source of "now". Injected so the two samples taken per tick can be controlled in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Look-back policy: how often a tick runs and how far back a watermark may ever start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookBack {
    tick_interval: Duration,
    max_look_back: Duration,
    max_look_back_delta: TimeDelta,
}

impl LookBack {
    /// `max_look_back` must cover at least one tick interval, otherwise a single missed tick
    /// leaves a gap that is never fetched.
    pub fn new(tick_interval: Duration, max_look_back: Duration) -> Result<Self> {
        if tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be positive".to_string()));
        }
        if max_look_back < tick_interval {
            return Err(Error::Config(format!(
                "max look-back ({}s) must not be shorter than the tick interval ({}s)",
                max_look_back.as_secs(),
                tick_interval.as_secs()
            )));
        }
        let max_look_back_delta = TimeDelta::from_std(max_look_back).map_err(|e| {
            Error::Config(format!(
                "max look-back {}s is out of range: {e}",
                max_look_back.as_secs()
            ))
        })?;

        Ok(Self {
            tick_interval,
            max_look_back,
            max_look_back_delta,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn max_look_back(&self) -> Duration {
        self.max_look_back
    }

    /// The oldest watermark a tick starting at `now` may query from.
    pub fn floor(&self, now: Watermark) -> Watermark {
        now.saturating_sub(self.max_look_back_delta)
    }

    /// Resolves the query lower bound for a tick: `max(persisted, now - max_look_back)`, or the
    /// floor itself when nothing was persisted yet.
    pub fn resolve(&self, persisted: Option<Watermark>, now: Watermark) -> Watermark {
        let floor = self.floor(now);
        match persisted {
            None => floor,
            Some(persisted) if persisted < floor => {
                warn!(
                    %persisted,
                    %floor,
                    "Persisted watermark is older than the max look-back, clamping"
                );
                floor
            }
            Some(persisted) => {
                if persisted > now {
                    warn!(%persisted, %now, "Persisted watermark is in the future");
                }
                persisted
            }
        }
    }
}

impl Default for LookBack {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5 * 60),
            max_look_back: DEFAULT_MAX_LOOK_BACK,
            max_look_back_delta: TimeDelta::hours(6),
        }
    }
}
