use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::adapters::db;
use crate::adapters::events::TripEventSink;
use crate::app::charging::{ChargingCloseReason, ChargingOutcome, ChargingSessionManager};
use crate::app::services::{ServiceError, SqliteTelemetryStore};
use crate::app::trips::{CloseReason, FinalizeOutcome, TripLifecycleManager};
use crate::domain::clock::{Clock, TimestampMs};
use crate::domain::models::NewLogEventRecord;
use crate::domain::staleness::{OpenTripSummary, select_stale_trips};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_trips: usize,
    pub finalized: usize,
    pub already_closed: usize,
    pub failed: usize,
    pub charging_closed: bool,
}

pub struct IdleSweeper<E, Cl> {
    store: SqliteTelemetryStore,
    trips: TripLifecycleManager<E, Cl>,
    charging: ChargingSessionManager<Cl>,
    clock: Cl,
    idle_timeout_secs: u64,
}

impl<E, Cl> IdleSweeper<E, Cl>
where
    E: TripEventSink,
    Cl: Clock,
{
    pub fn new(
        store: SqliteTelemetryStore,
        trips: TripLifecycleManager<E, Cl>,
        charging: ChargingSessionManager<Cl>,
        clock: Cl,
        idle_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            trips,
            charging,
            clock,
            idle_timeout_secs,
        }
    }

    /// Open trips that have been silent longer than the idle timeout.
    pub fn stale_trips(&self, now: TimestampMs) -> Result<Vec<OpenTripSummary>, ServiceError> {
        let open = self.store.with_connection(db::list_open_trips)?;
        Ok(select_stale_trips(&open, now, self.idle_timeout_secs))
    }

    pub fn sweep_once(&self) -> SweepReport {
        self.sweep_at(self.clock.now())
    }

    /// Finalizes every stale trip and closes an idle charging session. A
    /// failure on one trip is logged and does not stop the rest.
    pub fn sweep_at(&self, now: TimestampMs) -> SweepReport {
        let mut report = SweepReport::default();

        match self.stale_trips(now) {
            Ok(stale) => {
                report.stale_trips = stale.len();
                for trip in stale {
                    match self.trips.finalize(&trip.trip_id, CloseReason::IdleTimeout) {
                        Ok(FinalizeOutcome::Finalized(_)) => report.finalized += 1,
                        Ok(FinalizeOutcome::AlreadyClosed) => report.already_closed += 1,
                        Err(error) => {
                            report.failed += 1;
                            tracing::warn!(
                                trip_id = %trip.trip_id,
                                session_key = %trip.session_key,
                                error = %error,
                                "failed to finalize stale trip"
                            );
                            self.store.record_log_event(&sweep_failure(
                                now,
                                Some(trip.trip_id.clone()),
                                &error.to_string(),
                            ));
                        }
                    }
                }
            }
            Err(error) => {
                report.failed += 1;
                tracing::warn!(error = %error, "failed to list open trips");
            }
        }

        match self.charging.close_if_idle(now, ChargingCloseReason::Silence) {
            Ok(ChargingOutcome::Closed { .. }) => report.charging_closed = true,
            Ok(_) => {}
            Err(error) => {
                report.failed += 1;
                tracing::warn!(error = %error, "failed to check charging session idleness");
                self.store
                    .record_log_event(&sweep_failure(now, None, &error.to_string()));
            }
        }

        if report.stale_trips > 0 || report.charging_closed || report.failed > 0 {
            tracing::info!(
                stale_trips = report.stale_trips,
                finalized = report.finalized,
                already_closed = report.already_closed,
                failed = report.failed,
                charging_closed = report.charging_closed,
                "sweep completed"
            );
        }

        report
    }
}

fn sweep_failure(now: TimestampMs, subject_id: Option<String>, message: &str) -> NewLogEventRecord {
    NewLogEventRecord {
        created_at: now.to_iso8601(),
        level: "warn".to_string(),
        code: "sweep.failed".to_string(),
        message: message.to_string(),
        source: "idle_sweeper".to_string(),
        subject_id,
        details_json: None,
    }
}

pub fn start_sweeper<E, Cl>(
    sweeper: IdleSweeper<E, Cl>,
    sweep_interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    E: TripEventSink,
    Cl: Clock + Send + Sync + 'static,
{
    std::thread::spawn(move || {
        while !stop_flag.load(Ordering::Relaxed) {
            sweeper.sweep_once();
            std::thread::sleep(sweep_interval);
        }
    })
}
