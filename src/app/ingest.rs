use std::collections::HashMap;

use crate::adapters::events::TripEventSink;
use crate::app::charging::{ChargingOutcome, ChargingSessionManager};
use crate::app::services::SqliteTelemetryStore;
use crate::app::trips::{TripLifecycleManager, TripOutcome};
use crate::domain::clock::Clock;
use crate::domain::models::NewLogEventRecord;
use crate::domain::sample_decoder::decode_sample;

/// What became of one upload. Observability only; the uploader is always
/// acknowledged regardless.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    pub session_key: String,
    pub trip: TripOutcome,
    pub charging: Option<ChargingOutcome>,
}

pub trait SampleIngestor: Send + Sync {
    fn ingest(&self, raw: &HashMap<String, String>) -> SampleOutcome;
}

pub struct IngestPipeline<E, Cl> {
    store: SqliteTelemetryStore,
    clock: Cl,
    trips: TripLifecycleManager<E, Cl>,
    charging: ChargingSessionManager<Cl>,
}

impl<E, Cl> IngestPipeline<E, Cl>
where
    E: TripEventSink,
    Cl: Clock,
{
    pub fn new(
        store: SqliteTelemetryStore,
        clock: Cl,
        trips: TripLifecycleManager<E, Cl>,
        charging: ChargingSessionManager<Cl>,
    ) -> Self {
        Self {
            store,
            clock,
            trips,
            charging,
        }
    }

    pub fn ingest(&self, raw: &HashMap<String, String>) -> SampleOutcome {
        let decoded = decode_sample(raw, &self.clock);
        let sample = decoded.sample;

        if decoded.session_synthesized {
            tracing::debug!(session_key = %sample.session_key, "upload without usable session key");
        }
        if decoded.timestamp_from_receipt {
            tracing::debug!(session_key = %sample.session_key, "upload without usable timestamp");
        }

        let trip = match self.trips.ingest(&sample) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    session_key = %sample.session_key,
                    error = %error,
                    "failed to record sample on trip"
                );
                self.record_failure("ingest.trip_failed", &sample.session_key, &error.to_string());
                TripOutcome::Failed
            }
        };

        let charging = if !sample.has_charging_fields()
            || matches!(trip, TripOutcome::LateSampleDropped { .. })
        {
            None
        } else {
            Some(match self.charging.observe(&sample) {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(
                        session_key = %sample.session_key,
                        error = %error,
                        "failed to update charging session"
                    );
                    self.record_failure(
                        "ingest.charging_failed",
                        &sample.session_key,
                        &error.to_string(),
                    );
                    ChargingOutcome::Failed
                }
            })
        };

        SampleOutcome {
            session_key: sample.session_key,
            trip,
            charging,
        }
    }

    fn record_failure(&self, code: &str, session_key: &str, message: &str) {
        self.store.record_log_event(&NewLogEventRecord {
            created_at: self.clock.now().to_iso8601(),
            level: "warn".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            source: "ingest_pipeline".to_string(),
            subject_id: Some(session_key.to_string()),
            details_json: None,
        });
    }
}

impl<E, Cl> SampleIngestor for IngestPipeline<E, Cl>
where
    E: TripEventSink,
    Cl: Clock + Send + Sync,
{
    fn ingest(&self, raw: &HashMap<String, String>) -> SampleOutcome {
        IngestPipeline::ingest(self, raw)
    }
}
