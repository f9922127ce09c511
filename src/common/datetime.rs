use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{fmt, str::FromStr};

use jiff::{Span, SpanRelativeTo};
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize,
};

//----------- TimeSpan ---------------------------------------------------------

/// A wrapper around [`Duration`] with fancier (de)serialization
///
/// Configuration files accept both a bare number of seconds and friendly
/// duration strings ("2h 30m", "P14D").
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpan(u32);

impl TimeSpan {
    pub fn as_secs(&self) -> u32 {
        self.0
    }

    pub fn from_secs(x: u32) -> Self {
        Self(x)
    }
}

struct TimeSpanVisitor;

impl<'de> Visitor<'de> for TimeSpanVisitor {
    type Value = TimeSpan;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("string or int")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        FromStr::from_str(value).map_err(E::custom)
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(TimeSpan::from_secs(value.try_into().map_err(|_| {
            E::custom(format!("duration value must be between 0 and {}", u32::MAX))
        })?))
    }
}

impl<'de> Deserialize<'de> for TimeSpan {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TimeSpanVisitor)
    }
}

impl Serialize for TimeSpan {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.as_secs().serialize(serializer)
    }
}

impl TryFrom<Span> for TimeSpan {
    type Error = String;

    fn try_from(value: Span) -> Result<Self, Self::Error> {
        let signeddur = value
            .to_duration(SpanRelativeTo::days_are_24_hours())
            .map_err(|e| format!("unable to convert duration: {e}\n"))?;

        let duration = Duration::try_from(signeddur)
            .map_err(|e| format!("unable to convert duration: {e}\n"))?;

        let secs = duration
            .as_secs()
            .try_into()
            .map_err(|_| format!("duration value must be between 0 and {}", u32::MAX))?;

        Ok(Self(secs))
    }
}

impl FromStr for TimeSpan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Handle a small edge case to treat the string "10" as 10 seconds.
        if let Ok(secs) = s.parse() {
            return Ok(Self::from_secs(secs));
        }
        let span: Span = s
            .parse()
            .map_err(|e| format!("unable to parse {s} as timespan: {e}\n"))?;

        Self::try_from(span)
    }
}

//----------- UnixTime ---------------------------------------------------------

/// A point in time as whole seconds since the Unix epoch.
///
/// Task due times are kept in this form so they order naturally, survive a
/// plain-text round trip through task backup files, and render for operators
/// without dragging a full datetime type through the scheduler.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixTime(u64);

impl UnixTime {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(secs)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Seconds until `self`, or zero if it already passed.
    pub fn saturating_since(&self, now: UnixTime) -> u64 {
        self.0.saturating_sub(now.0)
    }
}

impl Add<u64> for UnixTime {
    type Output = UnixTime;

    fn add(self, secs: u64) -> UnixTime {
        UnixTime(self.0.saturating_add(secs))
    }
}

impl Add<TimeSpan> for UnixTime {
    type Output = UnixTime;

    fn add(self, span: TimeSpan) -> UnixTime {
        self + u64::from(span.as_secs())
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match jiff::Timestamp::from_second(self.0 as i64) {
            Ok(ts) => write!(f, "{}", ts.strftime("%a %b %e %T %Y")),
            Err(_) => write!(f, "@{}", self.0),
        }
    }
}
