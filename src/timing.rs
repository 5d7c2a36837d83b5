//! Timing preference resolution.
//!
//! Converts a caller-supplied preference string into an absolute target
//! delivery time. Resolution is a pure function of the preference, the
//! current time, and the recipient's UTC offset, so every path is
//! deterministic under test.
//!
//! Unrecognized preferences are not an error: the enqueue path falls back to
//! immediate delivery and logs a warning (see [`crate::service::Service`]).

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};

/// A recognized timing preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingPreference {
    /// "as soon as possible": no delay.
    Immediate,
    /// A fixed duration from now, e.g. "2 hours" or "45 minutes".
    FixedDelay(Duration),
    /// The next occurrence of the configured local morning hour, strictly
    /// after now.
    TomorrowMorning,
}

impl TimingPreference {
    /// Parses a preference string. Matching is case-insensitive and
    /// whitespace-trimmed. Returns `None` for anything unrecognized so the
    /// caller can decide the fallback.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_lowercase();

        match normalized.as_str() {
            "as soon as possible" => return Some(Self::Immediate),
            "tomorrow morning" => return Some(Self::TomorrowMorning),
            _ => {}
        }

        let mut parts = normalized.split_whitespace();
        let amount = parts.next()?.parse::<u32>().ok()?;
        let unit = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let delay = match unit {
            "hour" | "hours" => Duration::hours(i64::from(amount)),
            "minute" | "minutes" => Duration::minutes(i64::from(amount)),
            _ => return None,
        };

        Some(Self::FixedDelay(delay))
    }

    /// Resolves the preference into an absolute delivery time.
    ///
    /// Never returns a time before `now`: "tomorrow morning" already past
    /// today's configured hour rolls to the following calendar day.
    pub fn resolve(
        self,
        now: DateTime<Utc>,
        recipient_offset: FixedOffset,
        morning_hour: u32,
    ) -> DateTime<Utc> {
        match self {
            Self::Immediate => now,
            Self::FixedDelay(delay) => now + delay,
            Self::TomorrowMorning => {
                let local_now = now.with_timezone(&recipient_offset);
                let morning =
                    NaiveTime::from_hms_opt(morning_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);

                let mut candidate = local_date_at(local_now.date_naive(), morning, recipient_offset);
                if candidate <= local_now {
                    candidate = local_date_at(
                        local_now.date_naive() + Duration::days(1),
                        morning,
                        recipient_offset,
                    );
                }

                candidate.with_timezone(&Utc)
            }
        }
    }
}

fn local_date_at(
    date: chrono::NaiveDate,
    time: NaiveTime,
    offset: FixedOffset,
) -> DateTime<FixedOffset> {
    match date.and_time(time).and_local_timezone(offset) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        // Fixed offsets have no gaps; unreachable, but total.
        chrono::LocalResult::None => date.and_time(time).and_utc().with_timezone(&offset),
    }
}
