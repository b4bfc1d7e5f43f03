use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::app::services::{ServiceError, SqliteTelemetryStore};
use crate::domain::charging_energy::{
    EnergyComputationError, EnergyWarning, SocSnapshot, compute_energy_added_kwh,
};
use crate::domain::clock::{Clock, TimestampMs};
use crate::domain::mode_classifier::{
    ChargerClass, ChargerThresholds, ChargingRegime, classify_charging,
};
use crate::domain::models::{
    ChargingCurvePoint, ChargingProgress, ChargingSessionRecord, NewChargingSessionRecord,
    NewLogEventRecord,
};
use crate::domain::sample::TelemetrySample;

const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargingSettings {
    pub thresholds: ChargerThresholds,
    pub curve_cap: usize,
    pub idle_timeout_secs: u64,
    pub nominal_battery_kwh: f64,
}

impl Default for ChargingSettings {
    fn default() -> Self {
        Self {
            thresholds: ChargerThresholds::default(),
            curve_cap: 1000,
            idle_timeout_secs: 60,
            nominal_battery_kwh: 18.4,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChargingError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("no open charging session could be resolved after {attempts} attempts")]
    ResolveExhausted { attempts: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingCloseReason {
    /// A sample without charging evidence arrived and the recent window
    /// holds no charging sample either.
    Unplugged,
    /// The sweeper found no charging sample inside the idle window.
    Silence,
}

impl ChargingCloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unplugged => "unplugged",
            Self::Silence => "silence",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargingOutcome {
    Opened {
        session_id: String,
    },
    Extended {
        session_id: String,
        curve_point_stored: bool,
    },
    Closed {
        session_id: String,
        energy_added_kwh: Option<f64>,
    },
    Unchanged,
    Failed,
}

#[derive(Clone)]
pub struct ChargingSessionManager<Cl> {
    store: SqliteTelemetryStore,
    clock: Cl,
    settings: ChargingSettings,
}

impl<Cl> ChargingSessionManager<Cl>
where
    Cl: Clock,
{
    pub fn new(store: SqliteTelemetryStore, clock: Cl, settings: ChargingSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Feeds one sample carrying charging fields. A charging sample opens or
    /// extends the single open session; any other sample gives the open
    /// session a chance to close.
    pub fn observe(&self, sample: &TelemetrySample) -> Result<ChargingOutcome, ChargingError> {
        if sample.is_charging() {
            return self.open_or_extend(sample);
        }
        self.close_if_idle(self.clock.now(), ChargingCloseReason::Unplugged)
    }

    /// Completes the open session when no charging sample was recorded
    /// inside the idle window ending at `now`.
    pub fn close_if_idle(
        &self,
        now: TimestampMs,
        reason: ChargingCloseReason,
    ) -> Result<ChargingOutcome, ChargingError> {
        let settings = self.settings;
        let window_start = now.saturating_sub_secs(settings.idle_timeout_secs);

        let closed = self.store.with_transaction(|connection| {
            let Some(session) = db::get_open_charging_session(connection)? else {
                return Ok(None);
            };

            let window = db::list_samples_since(connection, window_start)?;
            if let ChargingRegime::Charging { .. } = classify_charging(&window, &settings.thresholds)
            {
                return Ok(None);
            }

            let energy = compute_energy_added_kwh(
                &SocSnapshot {
                    start_soc_pct: session.start_soc_pct,
                    end_soc_pct: session.end_soc_pct,
                },
                settings.nominal_battery_kwh,
            );
            if let Err(error) = &energy {
                record_energy_failure(connection, &session, error, now)?;
            }
            let energy_added_kwh = energy.as_ref().ok().map(|result| result.kwh);

            if !db::complete_charging_session(
                connection,
                &session.id,
                &session.last_sample_at,
                energy_added_kwh,
                reason.as_str(),
            )? {
                return Ok(None);
            }

            Ok(Some((session, energy)))
        })?;

        let Some((session, energy)) = closed else {
            return Ok(ChargingOutcome::Unchanged);
        };

        let energy_added_kwh = match &energy {
            Ok(result) => {
                if result.warnings.contains(&EnergyWarning::NegativeSocDeltaClamped) {
                    tracing::warn!(
                        charging_session_id = %session.id,
                        "state of charge fell during charging; energy added clamped to zero"
                    );
                }
                Some(result.kwh)
            }
            Err(error) => {
                tracing::warn!(
                    charging_session_id = %session.id,
                    error = %error,
                    "energy added could not be computed"
                );
                None
            }
        };

        tracing::info!(
            charging_session_id = %session.id,
            reason = reason.as_str(),
            started_at = %session.started_at,
            ended_at = %session.last_sample_at,
            peak_power_kw = ?session.peak_power_kw,
            average_power_kw = ?session.average_power_kw(),
            charger_class = ?session.charger_class,
            energy_added_kwh = ?energy_added_kwh,
            "charging session completed"
        );

        Ok(ChargingOutcome::Closed {
            session_id: session.id,
            energy_added_kwh,
        })
    }

    fn open_or_extend(&self, sample: &TelemetrySample) -> Result<ChargingOutcome, ChargingError> {
        let settings = self.settings;
        let created_at = self.clock.now().to_iso8601();

        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let outcome = self.store.with_transaction(|connection| {
                let Some((session, opened)) = resolve_open_session(connection, sample, &created_at)?
                else {
                    return Ok(None);
                };
                extend_session(connection, &session, opened, sample, &settings).map(Some)
            })?;

            if let Some(outcome) = outcome {
                match &outcome {
                    ChargingOutcome::Opened { session_id } => tracing::info!(
                        charging_session_id = %session_id,
                        started_at = %sample.timestamp.to_iso8601(),
                        soc_pct = ?sample.soc_pct,
                        "charging session started"
                    ),
                    ChargingOutcome::Extended {
                        session_id,
                        curve_point_stored,
                    } => tracing::debug!(
                        charging_session_id = %session_id,
                        curve_point_stored,
                        "charging session extended"
                    ),
                    _ => {}
                }
                return Ok(outcome);
            }
        }

        Err(ChargingError::ResolveExhausted {
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }
}

/// Fetches the open session, creating it when absent. The boolean reports
/// whether this call created it.
fn resolve_open_session(
    connection: &Connection,
    sample: &TelemetrySample,
    created_at: &str,
) -> Result<Option<(ChargingSessionRecord, bool)>, DbError> {
    if let Some(session) = db::get_open_charging_session(connection)? {
        return Ok(Some((session, false)));
    }

    let new_session = NewChargingSessionRecord {
        id: uuid::Uuid::new_v4().to_string(),
        started_at: sample.timestamp.to_iso8601(),
        start_soc_pct: sample.soc_pct,
        created_at: created_at.to_string(),
    };
    let created = db::insert_charging_session_if_absent(connection, &new_session)?;

    Ok(db::get_open_charging_session(connection)?.map(|session| (session, created)))
}

fn extend_session(
    connection: &Connection,
    session: &ChargingSessionRecord,
    opened: bool,
    sample: &TelemetrySample,
    settings: &ChargingSettings,
) -> Result<ChargingOutcome, DbError> {
    let power_kw = sample.charging_power_kw().filter(|power| power.is_finite());
    let peak_kw = match (session.peak_power_kw, power_kw) {
        (Some(peak), Some(power)) => Some(peak.max(power)),
        (peak, power) => peak.or(power),
    };
    let charger_class = peak_kw
        .map(|peak| ChargerClass::from_power_kw(peak, &settings.thresholds).as_str().to_string());
    let recorded_at = sample.timestamp.to_iso8601();

    db::extend_charging_session(
        connection,
        &session.id,
        &ChargingProgress {
            sample_at: recorded_at.clone(),
            soc_pct: sample.soc_pct,
            power_kw,
            charger_class,
        },
    )?;

    let curve_point_stored = db::append_curve_point_capped(
        connection,
        &session.id,
        &ChargingCurvePoint {
            recorded_at,
            power_kw,
            soc_pct: sample.soc_pct,
        },
        settings.curve_cap,
    )?;

    if !curve_point_stored && session.curve_point_count == settings.curve_cap as i64 {
        tracing::debug!(
            charging_session_id = %session.id,
            curve_cap = settings.curve_cap,
            "charging curve full; further points not stored"
        );
    }

    Ok(if opened {
        ChargingOutcome::Opened {
            session_id: session.id.clone(),
        }
    } else {
        ChargingOutcome::Extended {
            session_id: session.id.clone(),
            curve_point_stored,
        }
    })
}

fn record_energy_failure(
    connection: &Connection,
    session: &ChargingSessionRecord,
    error: &EnergyComputationError,
    now: TimestampMs,
) -> Result<(), DbError> {
    db::insert_log_event(
        connection,
        &NewLogEventRecord {
            created_at: now.to_iso8601(),
            level: "warn".to_string(),
            code: "charging.energy_failed".to_string(),
            message: error.to_string(),
            source: "charging_session_manager".to_string(),
            subject_id: Some(session.id.clone()),
            details_json: Some(
                serde_json::json!({
                    "start_soc_pct": session.start_soc_pct,
                    "end_soc_pct": session.end_soc_pct,
                })
                .to_string(),
            ),
        },
    )?;
    Ok(())
}
