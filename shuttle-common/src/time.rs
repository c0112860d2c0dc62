use chrono::{DateTime, Utc};

/// Seconds between the Unix epoch and the Farcaster epoch (2021-01-01T00:00:00Z).
pub const FARCASTER_EPOCH: i64 = 1_609_459_200;

/// Convert a Farcaster timestamp (seconds since the Farcaster epoch) into a UTC datetime.
pub fn farcaster_time_to_datetime(timestamp: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(FARCASTER_EPOCH + i64::from(timestamp), 0)
}

/// Convert a UTC datetime into a Farcaster timestamp, if it is representable.
pub fn datetime_to_farcaster_time(datetime: DateTime<Utc>) -> Option<u32> {
    u32::try_from(datetime.timestamp() - FARCASTER_EPOCH).ok()
}

pub trait TimeSource: Send + Sync {
    /// Processing time, used when a message carries no timestamp of its own.
    fn current_time(&self) -> DateTime<Utc>;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_farcaster_epoch() {
        let epoch = farcaster_time_to_datetime(0).unwrap();
        assert_eq!(epoch.to_rfc3339(), "2021-01-01T00:00:00+00:00");

        let later = farcaster_time_to_datetime(86_400).unwrap();
        assert_eq!(datetime_to_farcaster_time(later), Some(86_400));
    }

    #[test]
    fn test_datetime_before_epoch_is_not_representable() {
        let before = DateTime::from_timestamp(FARCASTER_EPOCH - 1, 0).unwrap();
        assert_eq!(datetime_to_farcaster_time(before), None);
    }
}
