use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Format used by PBS for timestamps in `qstat -f -F json` output (`Thu Aug 19 13:05:17 2021`).
const PBS_DATETIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

pub fn local_to_utc(datetime: NaiveDateTime) -> Option<DateTime<Utc>> {
    chrono::Local
        .from_local_datetime(&datetime)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_pbs_datetime(datetime: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(datetime, PBS_DATETIME_FORMAT)
        .with_context(|| format!("Cannot parse PBS datetime `{datetime}`"))?;
    local_to_utc(naive).with_context(|| format!("Invalid local datetime `{datetime}`"))
}

/// Monotonic clock used by the background loops.
///
/// It follows the tokio clock, so tests running with a paused runtime can advance it.
#[inline]
pub fn now_monotonic() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Elapsed wall-clock time between `since` and `now`, saturating at zero.
pub fn elapsed_between(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

pub fn unix_seconds(datetime: DateTime<Utc>) -> f64 {
    datetime.timestamp_millis() as f64 / 1000.0
}

/// (De)serialization of [`Duration`] values written in humantime format (`5s`, `30m`).
/// Plain integers are accepted as seconds.
pub mod human_duration {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationRepr {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match DurationRepr::deserialize(deserializer)? {
            DurationRepr::Seconds(secs) => Ok(Duration::from_secs(secs)),
            DurationRepr::Text(text) => humantime::parse_duration(&text).map_err(D::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{elapsed_between, parse_pbs_datetime};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    #[test]
    fn parse_pbs_datetime_valid() {
        assert!(parse_pbs_datetime("Thu Aug 19 13:05:17 2021").is_ok());
    }

    #[test]
    fn parse_pbs_datetime_invalid() {
        assert!(parse_pbs_datetime("2021-08-19T13:05:17").is_err());
    }

    #[test]
    fn elapsed_saturates_for_future_timestamps() {
        let now = Utc::now();
        assert_eq!(
            elapsed_between(now + ChronoDuration::seconds(10), now),
            Duration::ZERO
        );
        assert_eq!(
            elapsed_between(now - ChronoDuration::seconds(10), now),
            Duration::from_secs(10)
        );
    }
}
