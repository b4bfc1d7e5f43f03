use crate::domain::clock::TimestampMs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTripSummary {
    pub trip_id: String,
    pub session_key: String,
    pub last_sample_at: TimestampMs,
}

/// Open trips whose latest sample is older than `idle_timeout_secs` at `now`.
/// A trip exactly at the timeout is still considered live.
pub fn select_stale_trips(
    open_trips: &[OpenTripSummary],
    now: TimestampMs,
    idle_timeout_secs: u64,
) -> Vec<OpenTripSummary> {
    let cutoff = now.saturating_sub_secs(idle_timeout_secs);
    open_trips
        .iter()
        .filter(|trip| trip.last_sample_at < cutoff)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{OpenTripSummary, select_stale_trips};
    use crate::domain::clock::TimestampMs;

    fn open_trip(id: &str, last_sample_at: i64) -> OpenTripSummary {
        OpenTripSummary {
            trip_id: id.to_string(),
            session_key: format!("session-{id}"),
            last_sample_at: TimestampMs(last_sample_at),
        }
    }

    #[test]
    fn selects_only_trips_silent_past_timeout() {
        let open = vec![
            open_trip("fresh", 1_000_000),
            open_trip("boundary", 880_000),
            open_trip("stale", 879_999),
        ];

        let stale = select_stale_trips(&open, TimestampMs(1_000_000), 120);

        assert_eq!(stale, vec![open_trip("stale", 879_999)]);
    }

    #[test]
    fn empty_input_selects_nothing() {
        assert!(select_stale_trips(&[], TimestampMs(0), 120).is_empty());
    }
}
