use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use actix_web::{App, HttpServer, web};
use rusqlite::Connection;

use crate::adapters::db;
use crate::adapters::events::{
    ChannelTripEventSink, FinalizedTripEvent, TripEventSink, start_event_consumer,
};
use crate::adapters::upload::{UploadState, configure_routes};
use crate::app::charging::ChargingSessionManager;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::ingest::IngestPipeline;
use crate::app::services::SqliteTelemetryStore;
use crate::app::sweeper::{IdleSweeper, start_sweeper};
use crate::app::trips::TripLifecycleManager;
use crate::domain::clock::SystemClock;

/// Managers sharing one store and clock, wired the same way for the server
/// and the admin tool.
pub struct Components<E> {
    pub store: SqliteTelemetryStore,
    pub trips: TripLifecycleManager<E, SystemClock>,
    pub charging: ChargingSessionManager<SystemClock>,
}

impl<E: TripEventSink> Components<E> {
    pub fn new(connection: Connection, events: E, config: &AppConfig) -> Self {
        let store = SqliteTelemetryStore::new(Arc::new(Mutex::new(connection)));
        let trips = TripLifecycleManager::new(
            store.clone(),
            SystemClock,
            events,
            config.trip_stats_params(),
        );
        let charging =
            ChargingSessionManager::new(store.clone(), SystemClock, config.charging_settings());
        Self {
            store,
            trips,
            charging,
        }
    }

    pub fn sweeper(&self, config: &AppConfig) -> IdleSweeper<E, SystemClock> {
        IdleSweeper::new(
            self.store.clone(),
            self.trips.clone(),
            self.charging.clone(),
            SystemClock,
            config.idle_timeout_secs,
        )
    }
}

pub fn open_database(config: &AppConfig) -> Result<Connection, AppError> {
    let mut connection =
        db::open_connection(&config.db_path, config.busy_timeout()).map_err(AppError::database_init)?;
    db::run_migrations(&mut connection).map_err(AppError::database_init)?;
    Ok(connection)
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let connection = open_database(&config)?;
    let (sink, receiver) = ChannelTripEventSink::new();
    let components = Components::new(connection, sink, &config);
    let stop_flag = Arc::new(AtomicBool::new(false));

    let consumer_handle = start_event_consumer(
        receiver,
        log_enrichment_request,
        Arc::clone(&stop_flag),
    );
    let sweeper_handle = start_sweeper(
        components.sweeper(&config),
        config.sweep_interval(),
        Arc::clone(&stop_flag),
    );

    let upload_state = UploadState {
        ingestor: Arc::new(IngestPipeline::new(
            components.store.clone(),
            SystemClock,
            components.trips.clone(),
            components.charging.clone(),
        )),
        store: components.store.clone(),
    };
    drop(components);

    tracing::info!(bind = %config.http_bind, "http server starting");

    let http_bind = config.http_bind.clone();
    let server_result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(upload_state.clone()))
                .configure(configure_routes)
        })
        .bind(&http_bind)?
        .run()
        .await
    });

    stop_flag.store(true, Ordering::Relaxed);
    if sweeper_handle.join().is_err() {
        return Err(AppError::runtime("sweeper thread panicked"));
    }
    if consumer_handle.join().is_err() {
        return Err(AppError::runtime("event consumer thread panicked"));
    }

    server_result.map_err(AppError::runtime)
}

/// Weather and elevation lookups live outside this process; the consumer
/// records which trips are ready for them.
fn log_enrichment_request(event: FinalizedTripEvent) {
    match event.first_gps_fix {
        Some(fix) => tracing::info!(
            trip_id = %event.trip_id,
            started_at = %event.started_at,
            latitude = fix.latitude,
            longitude = fix.longitude,
            "finalized trip ready for enrichment"
        ),
        None => tracing::info!(
            trip_id = %event.trip_id,
            started_at = %event.started_at,
            "finalized trip has no gps fix; enrichment skipped"
        ),
    }
}

#[cfg(test)]
mod tests {
    use crate::adapters::db;
    use crate::adapters::events::DiscardingTripEventSink;
    use crate::app::config::AppConfig;
    use crate::domain::sample::TelemetrySample;

    use super::{Components, open_database};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    fn config_for(path: &std::path::Path) -> AppConfig {
        let db_path = path.to_string_lossy().to_string();
        AppConfig::from_lookup(move |key| match key {
            "DB_PATH" => Some(db_path.clone()),
            _ => None,
        })
        .expect("config should be valid")
    }

    #[test]
    fn opens_and_migrates_configured_database() {
        let path = temp_db_path("runtime-open.sqlite");
        let config = config_for(&path);

        let connection = open_database(&config).expect("database should open");

        assert_eq!(
            db::schema_version(&connection).expect("version should be readable"),
            db::LATEST_SCHEMA_VERSION
        );
    }

    #[test]
    fn wired_components_share_one_store() {
        let path = temp_db_path("runtime-components.sqlite");
        let config = config_for(&path);
        let connection = open_database(&config).expect("database should open");
        let components = Components::new(connection, DiscardingTripEventSink, &config);

        components
            .trips
            .ingest(&TelemetrySample {
                session_key: "S1".to_string(),
                ..TelemetrySample::default()
            })
            .expect("ingest should succeed");

        let report = components.sweeper(&config).sweep_once();
        assert_eq!(report.finalized, 1);
        let count = components
            .store
            .with_connection(db::count_trips)
            .expect("count should succeed");
        assert_eq!(count, 1);
    }
}
