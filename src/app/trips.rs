use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::adapters::events::{FinalizedTripEvent, TripEventSink};
use crate::app::services::{ServiceError, SqliteTelemetryStore};
use crate::domain::clock::{Clock, TimestampMs};
use crate::domain::models::{
    NewLogEventRecord, NewSocFloorRecord, NewTripRecord, TripFinalization, TripRecord,
};
use crate::domain::sample::TelemetrySample;
use crate::domain::trip_stats::{TripStats, TripStatsParams, compute_trip_stats};

/// Resolve-or-create attempts before a sample is given up on. A retry only
/// happens when the open trip vanished between a lost insert race and the
/// follow-up fetch.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum TripError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("trip {0} not found")]
    NotFound(String),
    #[error("trip {0} is still open")]
    StillOpen(String),
    #[error("no open trip could be resolved for session {session_key} after {attempts} attempts")]
    ResolveExhausted { session_key: String, attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripOutcome {
    Opened { trip_id: String },
    Extended { trip_id: String },
    /// The sample arrived after its trip closed and was discarded.
    LateSampleDropped { trip_id: String },
    /// Ingestion failed; the reason was logged and recorded as a log event.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    Manual,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Finalized(TripRecord),
    AlreadyClosed,
}

struct FinalizeCommit {
    trip: TripRecord,
    event: FinalizedTripEvent,
    failure_count: usize,
}

pub struct TripLifecycleManager<E, Cl> {
    store: SqliteTelemetryStore,
    clock: Cl,
    events: Arc<E>,
    params: TripStatsParams,
}

impl<E, Cl: Clone> Clone for TripLifecycleManager<E, Cl> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            events: Arc::clone(&self.events),
            params: self.params,
        }
    }
}

impl<E, Cl> TripLifecycleManager<E, Cl>
where
    E: TripEventSink,
    Cl: Clock,
{
    pub fn new(store: SqliteTelemetryStore, clock: Cl, events: E, params: TripStatsParams) -> Self {
        Self {
            store,
            clock,
            events: Arc::new(events),
            params,
        }
    }

    /// Appends `sample` to its session's open trip, opening one when none
    /// exists. Opening is an insert guarded by the one-open-trip-per-session
    /// index; losing that race falls back to fetching the winner.
    pub fn ingest(&self, sample: &TelemetrySample) -> Result<TripOutcome, TripError> {
        let received_at = self.clock.now().to_iso8601();

        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            let resolved = self
                .store
                .with_transaction(|connection| resolve_and_append(connection, sample, &received_at))?;

            match resolved {
                Some(outcome) => {
                    log_ingest_outcome(&outcome, sample);
                    return Ok(outcome);
                }
                None => tracing::debug!(
                    session_key = %sample.session_key,
                    attempt,
                    "open trip vanished after insert conflict; retrying"
                ),
            }
        }

        Err(TripError::ResolveExhausted {
            session_key: sample.session_key.clone(),
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }

    /// Closes the trip and persists its derived statistics. Only the first
    /// call for a trip has any effect; the finalized-trip event is published
    /// after that call commits.
    pub fn finalize(
        &self,
        trip_id: &str,
        reason: CloseReason,
    ) -> Result<FinalizeOutcome, TripError> {
        let closed_at = self.clock.now();
        let params = self.params;

        let committed = self.store.with_transaction(|connection| {
            let Some(trip) = db::get_trip(connection, trip_id)? else {
                return Ok(None);
            };
            if trip.is_closed {
                return Ok(Some(None));
            }

            let samples = db::list_trip_samples(connection, trip_id)?;
            let stats = compute_trip_stats(&samples, &params);
            let finalization = finalization_from_stats(&stats, closed_at, reason.as_str());

            if !db::close_trip(connection, trip_id, &finalization)? {
                return Ok(Some(None));
            }
            record_soc_floor(connection, trip_id, &stats, closed_at)?;
            record_field_failures(connection, trip_id, &stats, closed_at)?;

            let Some(trip) = db::get_trip(connection, trip_id)? else {
                return Ok(None);
            };
            let event = FinalizedTripEvent {
                trip_id: trip.id.clone(),
                first_gps_fix: samples.iter().find_map(|sample| sample.gps),
                started_at: trip.start_time.clone(),
            };

            Ok(Some(Some(FinalizeCommit {
                trip,
                event,
                failure_count: stats.failures.len(),
            })))
        })?;

        let Some(committed) = committed else {
            return Err(TripError::NotFound(trip_id.to_string()));
        };
        let Some(commit) = committed else {
            tracing::debug!(trip_id, "trip already closed; finalize ignored");
            return Ok(FinalizeOutcome::AlreadyClosed);
        };

        tracing::info!(
            trip_id,
            session_key = %commit.trip.session_key,
            reason = reason.as_str(),
            sample_count = commit.trip.sample_count,
            distance_mi = ?commit.trip.distance_mi,
            mpg = ?commit.trip.mpg,
            kwh_per_mile = ?commit.trip.kwh_per_mile,
            failed_fields = commit.failure_count,
            "trip finalized"
        );

        if let Err(error) = self.events.publish(commit.event) {
            tracing::warn!(trip_id, error = %error, "failed to publish finalized trip event");
        }

        Ok(FinalizeOutcome::Finalized(commit.trip))
    }

    /// Re-derives the statistics of a closed trip from its stored samples.
    /// Does not reopen the trip or emit another finalized-trip event.
    pub fn recompute(&self, trip_id: &str) -> Result<TripRecord, TripError> {
        let now = self.clock.now();
        let params = self.params;

        let trip = self.store.with_transaction(|connection| {
            let Some(trip) = db::get_trip(connection, trip_id)? else {
                return Ok(Err(TripError::NotFound(trip_id.to_string())));
            };
            if !trip.is_closed {
                return Ok(Err(TripError::StillOpen(trip_id.to_string())));
            }

            let samples = db::list_trip_samples(connection, trip_id)?;
            let stats = compute_trip_stats(&samples, &params);
            let reason = trip.close_reason.as_deref().unwrap_or(CloseReason::Manual.as_str());
            let finalization = finalization_from_stats(&stats, now, reason);

            db::correct_closed_trip(connection, trip_id, &finalization)?;
            record_soc_floor(connection, trip_id, &stats, now)?;
            record_field_failures(connection, trip_id, &stats, now)?;

            Ok(db::get_trip(connection, trip_id)?
                .ok_or_else(|| TripError::NotFound(trip_id.to_string())))
        })??;

        tracing::info!(trip_id, mpg = ?trip.mpg, kwh_per_mile = ?trip.kwh_per_mile, "trip recomputed");
        Ok(trip)
    }

    pub fn delete(&self, trip_id: &str) -> Result<bool, TripError> {
        let deleted = self
            .store
            .with_transaction(|connection| db::delete_trip(connection, trip_id))?;

        if deleted {
            tracing::info!(trip_id, "trip deleted");
        }
        Ok(deleted)
    }
}

/// One resolve-or-create pass. `None` asks the caller to retry.
fn resolve_and_append(
    connection: &Connection,
    sample: &TelemetrySample,
    received_at: &str,
) -> Result<Option<TripOutcome>, DbError> {
    let session_key = sample.session_key.as_str();

    if let Some(trip) = db::get_open_trip_for_session(connection, session_key)? {
        return append_sample(connection, trip.id, sample, received_at, false).map(Some);
    }

    if let Some(closed) = db::get_latest_closed_trip_for_session(connection, session_key)?
        && TimestampMs::parse_iso8601(&closed.end_time)
            .is_some_and(|end_time| sample.timestamp <= end_time)
    {
        return Ok(Some(TripOutcome::LateSampleDropped { trip_id: closed.id }));
    }

    let timestamp = sample.timestamp.to_iso8601();
    let new_trip = NewTripRecord {
        id: uuid::Uuid::new_v4().to_string(),
        session_key: session_key.to_string(),
        start_time: timestamp,
        start_odometer_mi: sample.odometer_mi,
        start_soc_pct: sample.soc_pct,
        created_at: received_at.to_string(),
    };

    if db::insert_trip_if_absent(connection, &new_trip)? {
        return append_sample(connection, new_trip.id, sample, received_at, true).map(Some);
    }

    match db::get_open_trip_for_session(connection, session_key)? {
        Some(trip) => append_sample(connection, trip.id, sample, received_at, false).map(Some),
        None => Ok(None),
    }
}

fn append_sample(
    connection: &Connection,
    trip_id: String,
    sample: &TelemetrySample,
    received_at: &str,
    opened: bool,
) -> Result<TripOutcome, DbError> {
    if !db::extend_open_trip(connection, &trip_id, sample)? {
        return Ok(TripOutcome::LateSampleDropped { trip_id });
    }
    db::insert_sample(connection, &trip_id, sample, received_at)?;

    Ok(if opened {
        TripOutcome::Opened { trip_id }
    } else {
        TripOutcome::Extended { trip_id }
    })
}

fn log_ingest_outcome(outcome: &TripOutcome, sample: &TelemetrySample) {
    let recorded_at = sample.timestamp.to_iso8601();
    match outcome {
        TripOutcome::Opened { trip_id } => tracing::info!(
            trip_id = %trip_id,
            session_key = %sample.session_key,
            recorded_at = %recorded_at,
            "trip opened"
        ),
        TripOutcome::Extended { trip_id } => tracing::debug!(
            trip_id = %trip_id,
            session_key = %sample.session_key,
            recorded_at = %recorded_at,
            "trip extended"
        ),
        TripOutcome::LateSampleDropped { trip_id } => tracing::warn!(
            trip_id = %trip_id,
            session_key = %sample.session_key,
            recorded_at = %recorded_at,
            "late sample for closed trip dropped"
        ),
        TripOutcome::Failed => {}
    }
}

fn finalization_from_stats(
    stats: &TripStats,
    closed_at: TimestampMs,
    reason: &str,
) -> TripFinalization {
    let entry = stats.combustion_entry;
    TripFinalization {
        end_time: stats.end_time.map(TimestampMs::to_iso8601),
        start_odometer_mi: stats.start_odometer_mi,
        end_odometer_mi: stats.end_odometer_mi,
        start_soc_pct: stats.start_soc_pct,
        end_soc_pct: stats.end_soc_pct,
        has_combustion_entry: entry.is_some(),
        combustion_entry_at: entry.map(|entry| entry.timestamp.to_iso8601()),
        combustion_entry_soc_pct: entry.map(|entry| entry.soc_pct),
        distance_mi: stats.distance_mi,
        electric_miles: stats.electric_miles,
        combustion_miles: stats.combustion_miles,
        fuel_used_gallons: stats.fuel_used_gallons,
        mpg: stats.mpg,
        kwh_used: stats.kwh_used,
        kwh_per_mile: stats.kwh_per_mile,
        avg_ambient_temp_f: stats.avg_ambient_temp_f,
        closed_at: closed_at.to_iso8601(),
        close_reason: reason.to_string(),
    }
}

fn record_soc_floor(
    connection: &Connection,
    trip_id: &str,
    stats: &TripStats,
    now: TimestampMs,
) -> Result<(), DbError> {
    let Some(entry) = stats.combustion_entry else {
        return Ok(());
    };

    db::insert_soc_floor_record_if_absent(
        connection,
        &NewSocFloorRecord {
            trip_id: trip_id.to_string(),
            recorded_at: entry.timestamp.to_iso8601(),
            soc_pct: entry.soc_pct,
            ambient_temp_f: stats.avg_ambient_temp_f,
            created_at: now.to_iso8601(),
        },
    )?;
    Ok(())
}

fn record_field_failures(
    connection: &Connection,
    trip_id: &str,
    stats: &TripStats,
    now: TimestampMs,
) -> Result<(), DbError> {
    for failure in &stats.failures {
        tracing::warn!(
            trip_id,
            field = failure.field,
            reason = %failure.reason,
            "trip field computation failed"
        );
        db::insert_log_event(
            connection,
            &NewLogEventRecord {
                created_at: now.to_iso8601(),
                level: "warn".to_string(),
                code: "trip.field_failed".to_string(),
                message: format!("{} could not be computed: {}", failure.field, failure.reason),
                source: "trip_finalizer".to_string(),
                subject_id: Some(trip_id.to_string()),
                details_json: serde_json::to_string(failure).ok(),
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Receiver;
    use std::thread;

    use super::{CloseReason, FinalizeOutcome, TripError, TripLifecycleManager, TripOutcome};
    use crate::adapters::db;
    use crate::adapters::events::{ChannelTripEventSink, FinalizedTripEvent};
    use crate::app::services::SqliteTelemetryStore;
    use crate::domain::clock::TimestampMs;
    use crate::domain::sample::{GpsFix, TelemetrySample};
    use crate::domain::trip_stats::TripStatsParams;
    use crate::test_support::{
        FixedClock, copy_template_db, open_connection_at, shared_test_connection,
    };

    const BASE_MS: i64 = 1_771_581_600_000;

    type Manager = TripLifecycleManager<ChannelTripEventSink, FixedClock>;

    fn manager(name: &str) -> (Manager, SqliteTelemetryStore, Receiver<FinalizedTripEvent>) {
        let store = SqliteTelemetryStore::new(shared_test_connection(name));
        let (sink, receiver) = ChannelTripEventSink::new();
        let manager = TripLifecycleManager::new(
            store.clone(),
            FixedClock(TimestampMs(BASE_MS + 3_600_000)),
            sink,
            TripStatsParams::default(),
        );
        (manager, store, receiver)
    }

    fn sample(session: &str, offset_secs: i64) -> TelemetrySample {
        TelemetrySample {
            session_key: session.to_string(),
            timestamp: TimestampMs(BASE_MS + offset_secs * 1000),
            speed_mph: Some(30.0),
            soc_pct: Some(80.0),
            odometer_mi: Some(1000.0 + offset_secs as f64 / 120.0),
            ..TelemetrySample::default()
        }
    }

    fn trip_id(outcome: &TripOutcome) -> String {
        match outcome {
            TripOutcome::Opened { trip_id }
            | TripOutcome::Extended { trip_id }
            | TripOutcome::LateSampleDropped { trip_id } => trip_id.clone(),
            TripOutcome::Failed => panic!("ingest failed"),
        }
    }

    #[test]
    fn opens_then_extends_one_trip_per_session() {
        let (manager, store, _events) = manager("trips-open-extend");

        let first = manager.ingest(&sample("S1", 0)).expect("ingest should succeed");
        let second = manager.ingest(&sample("S1", 10)).expect("ingest should succeed");
        let other = manager.ingest(&sample("S2", 5)).expect("ingest should succeed");

        assert!(matches!(first, TripOutcome::Opened { .. }));
        assert_eq!(second, TripOutcome::Extended { trip_id: trip_id(&first) });
        assert!(matches!(other, TripOutcome::Opened { .. }));
        assert_ne!(trip_id(&first), trip_id(&other));

        let trip = store
            .with_connection(|connection| db::get_trip(connection, &trip_id(&first)))
            .expect("query should succeed")
            .expect("trip should exist");
        assert_eq!(trip.sample_count, 2);
        assert_eq!(trip.end_time, "2026-02-20T10:00:10.000Z");
    }

    #[test]
    fn concurrent_first_samples_share_one_trip() {
        let db_path = copy_template_db("trips-concurrent");
        let threads = 8;

        let handles: Vec<_> = (0..threads)
            .map(|index| {
                let path = db_path.clone();
                thread::spawn(move || {
                    let store = SqliteTelemetryStore::new(std::sync::Arc::new(
                        std::sync::Mutex::new(open_connection_at(&path)),
                    ));
                    let (sink, _receiver) = ChannelTripEventSink::new();
                    let manager = TripLifecycleManager::new(
                        store,
                        FixedClock(TimestampMs(BASE_MS)),
                        sink,
                        TripStatsParams::default(),
                    );
                    manager
                        .ingest(&sample("S1", index))
                        .expect("ingest should succeed")
                })
            })
            .collect();

        let outcomes: Vec<TripOutcome> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should finish"))
            .collect();

        let opened = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, TripOutcome::Opened { .. }))
            .count();
        assert_eq!(opened, 1);

        let connection = open_connection_at(&db_path);
        assert_eq!(db::count_trips(&connection).expect("count should succeed"), 1);
        let trip_id = trip_id(&outcomes[0]);
        assert_eq!(
            db::count_trip_samples(&connection, &trip_id).expect("count should succeed"),
            threads
        );
    }

    #[test]
    fn finalize_is_idempotent_and_emits_one_event() {
        let (manager, store, events) = manager("trips-finalize-idempotent");
        let mut first = sample("S1", 0);
        first.gps = Some(GpsFix {
            latitude: 42.33,
            longitude: -83.05,
        });
        let trip_id = trip_id(&manager.ingest(&first).expect("ingest should succeed"));
        manager.ingest(&sample("S1", 60)).expect("ingest should succeed");

        let outcome = manager
            .finalize(&trip_id, CloseReason::IdleTimeout)
            .expect("finalize should succeed");
        let FinalizeOutcome::Finalized(trip) = outcome else {
            panic!("first finalize should close the trip");
        };
        assert!(trip.is_closed);
        assert_eq!(trip.close_reason.as_deref(), Some("idle_timeout"));
        assert_eq!(trip.distance_mi, Some(0.5));

        let again = manager
            .finalize(&trip_id, CloseReason::IdleTimeout)
            .expect("second finalize should succeed");
        assert_eq!(again, FinalizeOutcome::AlreadyClosed);

        let unchanged = store
            .with_connection(|connection| db::get_trip(connection, &trip_id))
            .expect("query should succeed")
            .expect("trip should exist");
        assert_eq!(unchanged, trip);

        let published: Vec<FinalizedTripEvent> = events.try_iter().collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].trip_id, trip_id);
        assert_eq!(published[0].started_at, "2026-02-20T10:00:00.000Z");
        assert_eq!(
            published[0].first_gps_fix,
            Some(GpsFix {
                latitude: 42.33,
                longitude: -83.05,
            })
        );
    }

    #[test]
    fn finalize_unknown_trip_reports_not_found() {
        let (manager, _, _events) = manager("trips-finalize-missing");

        let result = manager.finalize("missing", CloseReason::Manual);

        assert!(matches!(result, Err(TripError::NotFound(id)) if id == "missing"));
    }

    #[test]
    fn late_sample_after_close_is_dropped_and_later_sample_opens_new_trip() {
        let (manager, store, _events) = manager("trips-late-sample");
        let closed_id = trip_id(&manager.ingest(&sample("S1", 0)).expect("ingest"));
        manager.ingest(&sample("S1", 30)).expect("ingest");
        manager
            .finalize(&closed_id, CloseReason::IdleTimeout)
            .expect("finalize should succeed");

        let late = manager.ingest(&sample("S1", 20)).expect("ingest should succeed");
        assert_eq!(late, TripOutcome::LateSampleDropped { trip_id: closed_id.clone() });

        let fresh = manager.ingest(&sample("S1", 900)).expect("ingest should succeed");
        assert!(matches!(fresh, TripOutcome::Opened { .. }));
        assert_ne!(trip_id(&fresh), closed_id);

        let closed_samples = store
            .with_connection(|connection| db::count_trip_samples(connection, &closed_id))
            .expect("count should succeed");
        assert_eq!(closed_samples, 2);
    }

    #[test]
    fn electric_then_combustion_trip_records_entry_and_floor() {
        let (manager, store, _events) = manager("trips-scenario");
        let mut trip_id_seen = None;

        for index in 0..50_i64 {
            let electric = index < 30;
            let sample = TelemetrySample {
                session_key: "S1".to_string(),
                timestamp: TimestampMs(BASE_MS + index * 10_000),
                speed_mph: Some(45.0),
                engine_rpm: Some(if electric { 0.0 } else { 1200.0 }),
                soc_pct: Some(if electric {
                    100.0 - index as f64 * 75.0 / 29.0
                } else {
                    18.0
                }),
                fuel_level_pct: Some(if index <= 30 {
                    50.0
                } else {
                    50.0 - (index - 30) as f64 * 0.1
                }),
                odometer_mi: Some(1000.0 + index as f64 * 0.125),
                ambient_temp_f: Some(68.0),
                ..TelemetrySample::default()
            };
            let outcome = manager.ingest(&sample).expect("ingest should succeed");
            trip_id_seen.get_or_insert_with(|| trip_id(&outcome));
        }
        let trip_id = trip_id_seen.expect("trip should be opened");

        let FinalizeOutcome::Finalized(trip) = manager
            .finalize(&trip_id, CloseReason::IdleTimeout)
            .expect("finalize should succeed")
        else {
            panic!("trip should finalize");
        };

        assert!(trip.has_combustion_entry);
        assert_eq!(trip.combustion_entry_at.as_deref(), Some("2026-02-20T10:05:00.000Z"));
        assert_eq!(trip.combustion_entry_soc_pct, Some(18.0));
        assert!(trip.kwh_per_mile.is_some());
        let combustion_miles = trip.combustion_miles.expect("combustion miles");
        assert!((combustion_miles - 2.375).abs() < 1e-9);
        assert!(trip.mpg.is_some());

        let floor = store
            .with_connection(|connection| db::get_soc_floor_record(connection, &trip_id))
            .expect("query should succeed")
            .expect("floor record should exist");
        assert_eq!(floor.soc_pct, 18.0);
        assert_eq!(floor.ambient_temp_f, Some(68.0));
    }

    #[test]
    fn recompute_rewrites_closed_trip_without_reopening() {
        let (manager, store, events) = manager("trips-recompute");
        let trip_id = trip_id(&manager.ingest(&sample("S1", 0)).expect("ingest"));
        manager.ingest(&sample("S1", 60)).expect("ingest");
        manager
            .finalize(&trip_id, CloseReason::IdleTimeout)
            .expect("finalize should succeed");

        store
            .with_connection(|connection| {
                connection.execute(
                    "UPDATE trips SET distance_mi = NULL WHERE id = ?1",
                    [&trip_id],
                )?;
                Ok(())
            })
            .expect("update should succeed");

        let recomputed = manager.recompute(&trip_id).expect("recompute should succeed");

        assert!(recomputed.is_closed);
        assert_eq!(recomputed.distance_mi, Some(0.5));
        assert_eq!(recomputed.close_reason.as_deref(), Some("idle_timeout"));
        assert_eq!(events.try_iter().count(), 1);
    }

    #[test]
    fn recompute_refuses_open_trip() {
        let (manager, _, _events) = manager("trips-recompute-open");
        let trip_id = trip_id(&manager.ingest(&sample("S1", 0)).expect("ingest"));

        let result = manager.recompute(&trip_id);

        assert!(matches!(result, Err(TripError::StillOpen(_))));
    }

    #[test]
    fn delete_removes_trip_and_samples() {
        let (manager, store, _events) = manager("trips-delete");
        let trip_id = trip_id(&manager.ingest(&sample("S1", 0)).expect("ingest"));

        assert!(manager.delete(&trip_id).expect("delete should succeed"));
        assert!(!manager.delete(&trip_id).expect("second delete should succeed"));

        let remaining = store
            .with_connection(|connection| db::count_trip_samples(connection, &trip_id))
            .expect("count should succeed");
        assert_eq!(remaining, 0);
    }
}
