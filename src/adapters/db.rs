use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::clock::TimestampMs;
use crate::domain::models::{
    ChargingCurvePoint, ChargingProgress, ChargingSessionRecord, LogEventRecord,
    NewChargingSessionRecord, NewLogEventRecord, NewSocFloorRecord, NewTripRecord,
    SocFloorRecord, TripFinalization, TripRecord,
};
use crate::domain::sample::{GpsFix, TelemetrySample};
use crate::domain::staleness::OpenTripSummary;

pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS trips (
    id TEXT PRIMARY KEY,
    session_key TEXT NOT NULL,
    is_closed INTEGER NOT NULL DEFAULT 0,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    start_odometer_mi REAL,
    end_odometer_mi REAL,
    start_soc_pct REAL,
    end_soc_pct REAL,
    sample_count INTEGER NOT NULL DEFAULT 0,
    has_combustion_entry INTEGER NOT NULL DEFAULT 0,
    combustion_entry_at TEXT,
    combustion_entry_soc_pct REAL,
    distance_mi REAL,
    electric_miles REAL,
    combustion_miles REAL,
    fuel_used_gallons REAL,
    mpg REAL,
    kwh_used REAL,
    kwh_per_mile REAL,
    avg_ambient_temp_f REAL,
    closed_at TEXT,
    close_reason TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_trips_one_open_per_session
ON trips (session_key) WHERE is_closed = 0;

CREATE INDEX IF NOT EXISTS idx_trips_session_end_time
ON trips (session_key, end_time DESC);

CREATE TABLE IF NOT EXISTS samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trip_id TEXT NOT NULL,
    session_key TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    received_at TEXT NOT NULL,
    latitude REAL,
    longitude REAL,
    speed_mph REAL,
    engine_rpm REAL,
    soc_pct REAL,
    fuel_level_pct REAL,
    ambient_temp_f REAL,
    odometer_mi REAL,
    battery_power_kw REAL,
    battery_voltage_v REAL,
    battery_current_a REAL,
    charger_connected INTEGER,
    charger_power_kw REAL,
    charger_voltage_v REAL,
    charger_current_a REAL
);

CREATE INDEX IF NOT EXISTS idx_samples_trip_recorded_at
ON samples (trip_id, recorded_at);

CREATE INDEX IF NOT EXISTS idx_samples_recorded_at
ON samples (recorded_at);

CREATE TABLE IF NOT EXISTS charging_sessions (
    id TEXT PRIMARY KEY,
    is_complete INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    last_sample_at TEXT NOT NULL,
    start_soc_pct REAL,
    end_soc_pct REAL,
    peak_power_kw REAL,
    power_sum_kw REAL NOT NULL DEFAULT 0,
    power_sample_count INTEGER NOT NULL DEFAULT 0,
    charger_class TEXT,
    curve_point_count INTEGER NOT NULL DEFAULT 0,
    energy_added_kwh REAL,
    close_reason TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_charging_sessions_one_open
ON charging_sessions (is_complete) WHERE is_complete = 0;

CREATE TABLE IF NOT EXISTS charging_curve_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    power_kw REAL,
    soc_pct REAL
);

CREATE INDEX IF NOT EXISTS idx_charging_curve_points_session
ON charging_curve_points (session_id, id);

CREATE TABLE IF NOT EXISTS soc_floor_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trip_id TEXT NOT NULL UNIQUE,
    recorded_at TEXT NOT NULL,
    soc_pct REAL NOT NULL,
    ambient_temp_f REAL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS log_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    level TEXT NOT NULL,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    source TEXT NOT NULL,
    subject_id TEXT,
    details_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_log_events_created_at_desc
ON log_events (created_at DESC);
"#,
)];

const TRIP_COLUMNS: &str = "id, session_key, is_closed, start_time, end_time, start_odometer_mi,
    end_odometer_mi, start_soc_pct, end_soc_pct, sample_count, has_combustion_entry,
    combustion_entry_at, combustion_entry_soc_pct, distance_mi, electric_miles, combustion_miles,
    fuel_used_gallons, mpg, kwh_used, kwh_per_mile, avg_ambient_temp_f, closed_at, close_reason,
    created_at";

const SAMPLE_COLUMNS: &str = "session_key, recorded_at, latitude, longitude, speed_mph,
    engine_rpm, soc_pct, fuel_level_pct, ambient_temp_f, odometer_mi, battery_power_kw,
    battery_voltage_v, battery_current_a, charger_connected, charger_power_kw, charger_voltage_v,
    charger_current_a";

const CHARGING_COLUMNS: &str = "id, is_complete, started_at, ended_at, last_sample_at,
    start_soc_pct, end_soc_pct, peak_power_kw, power_sum_kw, power_sample_count, charger_class,
    curve_point_count, energy_added_kwh, close_reason, created_at";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

/// Opens a connection whose statements give up after `busy_timeout` instead
/// of waiting indefinitely on a locked database.
pub fn open_connection(path: &str, busy_timeout: Duration) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(busy_timeout)?;
    connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Inserts the trip unless the session already has an open one. Returns
/// whether this call created the row.
pub fn insert_trip_if_absent(
    connection: &Connection,
    new_trip: &NewTripRecord,
) -> Result<bool, DbError> {
    let inserted = connection.execute(
        "INSERT INTO trips (id, session_key, is_closed, start_time, end_time, start_odometer_mi,
            end_odometer_mi, start_soc_pct, end_soc_pct, created_at)
         VALUES (?1, ?2, 0, ?3, ?3, ?4, ?4, ?5, ?5, ?6)
         ON CONFLICT DO NOTHING",
        params![
            new_trip.id,
            new_trip.session_key,
            new_trip.start_time,
            new_trip.start_odometer_mi,
            new_trip.start_soc_pct,
            new_trip.created_at,
        ],
    )?;

    Ok(inserted == 1)
}

pub fn get_trip(connection: &Connection, trip_id: &str) -> Result<Option<TripRecord>, DbError> {
    let sql = format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?1");
    let trip = connection
        .query_row(&sql, params![trip_id], map_trip_row)
        .optional()?;
    Ok(trip)
}

pub fn get_open_trip_for_session(
    connection: &Connection,
    session_key: &str,
) -> Result<Option<TripRecord>, DbError> {
    let sql = format!("SELECT {TRIP_COLUMNS} FROM trips WHERE session_key = ?1 AND is_closed = 0");
    let trip = connection
        .query_row(&sql, params![session_key], map_trip_row)
        .optional()?;
    Ok(trip)
}

pub fn get_latest_closed_trip_for_session(
    connection: &Connection,
    session_key: &str,
) -> Result<Option<TripRecord>, DbError> {
    let sql = format!(
        "SELECT {TRIP_COLUMNS} FROM trips
         WHERE session_key = ?1 AND is_closed = 1
         ORDER BY end_time DESC
         LIMIT 1"
    );
    let trip = connection
        .query_row(&sql, params![session_key], map_trip_row)
        .optional()?;
    Ok(trip)
}

pub fn list_trips(connection: &Connection, limit: u32) -> Result<Vec<TripRecord>, DbError> {
    let sql = format!(
        "SELECT {TRIP_COLUMNS} FROM trips
         ORDER BY start_time DESC, id DESC
         LIMIT ?1"
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params![i64::from(limit)], map_trip_row)?;

    let mut trips = Vec::new();
    for row in rows {
        trips.push(row?);
    }

    Ok(trips)
}

pub fn count_trips(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM trips", [], |row| row.get(0))?;
    Ok(count)
}

/// Widens the open trip's bounds to cover `sample`. Returns `false` when the
/// trip is no longer open.
pub fn extend_open_trip(
    connection: &Connection,
    trip_id: &str,
    sample: &TelemetrySample,
) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE trips SET
            start_soc_pct = CASE
                WHEN ?3 IS NOT NULL AND (?2 < start_time OR start_soc_pct IS NULL) THEN ?3
                ELSE start_soc_pct END,
            end_soc_pct = CASE
                WHEN ?3 IS NOT NULL AND (?2 >= end_time OR end_soc_pct IS NULL) THEN ?3
                ELSE end_soc_pct END,
            start_odometer_mi = CASE
                WHEN ?4 IS NULL THEN start_odometer_mi
                WHEN start_odometer_mi IS NULL THEN ?4
                ELSE MIN(start_odometer_mi, ?4) END,
            end_odometer_mi = CASE
                WHEN ?4 IS NULL THEN end_odometer_mi
                WHEN end_odometer_mi IS NULL THEN ?4
                ELSE MAX(end_odometer_mi, ?4) END,
            start_time = MIN(start_time, ?2),
            end_time = MAX(end_time, ?2),
            sample_count = sample_count + 1
         WHERE id = ?1 AND is_closed = 0",
        params![
            trip_id,
            sample.timestamp.to_iso8601(),
            sample.soc_pct,
            sample.odometer_mi,
        ],
    )?;

    Ok(updated == 1)
}

pub fn insert_sample(
    connection: &Connection,
    trip_id: &str,
    sample: &TelemetrySample,
    received_at: &str,
) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO samples (trip_id, received_at, session_key, recorded_at, latitude, longitude,
            speed_mph, engine_rpm, soc_pct, fuel_level_pct, ambient_temp_f, odometer_mi,
            battery_power_kw, battery_voltage_v, battery_current_a, charger_connected,
            charger_power_kw, charger_voltage_v, charger_current_a)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19)",
        params![
            trip_id,
            received_at,
            sample.session_key,
            sample.timestamp.to_iso8601(),
            sample.gps.map(|fix| fix.latitude),
            sample.gps.map(|fix| fix.longitude),
            sample.speed_mph,
            sample.engine_rpm,
            sample.soc_pct,
            sample.fuel_level_pct,
            sample.ambient_temp_f,
            sample.odometer_mi,
            sample.battery_power_kw,
            sample.battery_voltage_v,
            sample.battery_current_a,
            sample.charger_connected,
            sample.charger_power_kw,
            sample.charger_voltage_v,
            sample.charger_current_a,
        ],
    )?;

    Ok(connection.last_insert_rowid())
}

/// All samples of a trip, oldest first. Ties keep arrival order.
pub fn list_trip_samples(
    connection: &Connection,
    trip_id: &str,
) -> Result<Vec<TelemetrySample>, DbError> {
    let sql = format!(
        "SELECT {SAMPLE_COLUMNS} FROM samples
         WHERE trip_id = ?1
         ORDER BY recorded_at ASC, id ASC"
    );
    collect_samples(connection, &sql, params![trip_id])
}

/// Samples of every session recorded at or after `since`, oldest first.
pub fn list_samples_since(
    connection: &Connection,
    since: TimestampMs,
) -> Result<Vec<TelemetrySample>, DbError> {
    let sql = format!(
        "SELECT {SAMPLE_COLUMNS} FROM samples
         WHERE recorded_at >= ?1
         ORDER BY recorded_at ASC, id ASC"
    );
    collect_samples(connection, &sql, params![since.to_iso8601()])
}

pub fn count_trip_samples(connection: &Connection, trip_id: &str) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM samples WHERE trip_id = ?1",
        params![trip_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn list_open_trips(connection: &Connection) -> Result<Vec<OpenTripSummary>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, session_key, end_time FROM trips
         WHERE is_closed = 0
         ORDER BY end_time ASC",
    )?;
    let rows = statement.query_map([], |row| {
        Ok(OpenTripSummary {
            trip_id: row.get(0)?,
            session_key: row.get(1)?,
            last_sample_at: timestamp_column(row, 2)?,
        })
    })?;

    let mut trips = Vec::new();
    for row in rows {
        trips.push(row?);
    }

    Ok(trips)
}

/// Writes the derived fields and flips the trip closed. Returns `false` when
/// the trip was already closed, leaving it untouched.
pub fn close_trip(
    connection: &Connection,
    trip_id: &str,
    finalization: &TripFinalization,
) -> Result<bool, DbError> {
    write_finalization(connection, trip_id, finalization, false)
}

/// Rewrites the derived fields of an already closed trip.
pub fn correct_closed_trip(
    connection: &Connection,
    trip_id: &str,
    finalization: &TripFinalization,
) -> Result<bool, DbError> {
    write_finalization(connection, trip_id, finalization, true)
}

fn write_finalization(
    connection: &Connection,
    trip_id: &str,
    finalization: &TripFinalization,
    already_closed: bool,
) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE trips SET
            is_closed = 1,
            end_time = COALESCE(?2, end_time),
            start_odometer_mi = ?3,
            end_odometer_mi = ?4,
            start_soc_pct = ?5,
            end_soc_pct = ?6,
            has_combustion_entry = ?7,
            combustion_entry_at = ?8,
            combustion_entry_soc_pct = ?9,
            distance_mi = ?10,
            electric_miles = ?11,
            combustion_miles = ?12,
            fuel_used_gallons = ?13,
            mpg = ?14,
            kwh_used = ?15,
            kwh_per_mile = ?16,
            avg_ambient_temp_f = ?17,
            closed_at = CASE WHEN ?20 = 1 THEN closed_at ELSE ?18 END,
            close_reason = CASE WHEN ?20 = 1 THEN close_reason ELSE ?19 END
         WHERE id = ?1 AND is_closed = ?20",
        params![
            trip_id,
            finalization.end_time,
            finalization.start_odometer_mi,
            finalization.end_odometer_mi,
            finalization.start_soc_pct,
            finalization.end_soc_pct,
            finalization.has_combustion_entry,
            finalization.combustion_entry_at,
            finalization.combustion_entry_soc_pct,
            finalization.distance_mi,
            finalization.electric_miles,
            finalization.combustion_miles,
            finalization.fuel_used_gallons,
            finalization.mpg,
            finalization.kwh_used,
            finalization.kwh_per_mile,
            finalization.avg_ambient_temp_f,
            finalization.closed_at,
            finalization.close_reason,
            already_closed,
        ],
    )?;

    Ok(updated == 1)
}

/// Deletes a trip together with its samples and battery-floor record.
/// Returns whether the trip existed.
pub fn delete_trip(connection: &Connection, trip_id: &str) -> Result<bool, DbError> {
    connection.execute("DELETE FROM samples WHERE trip_id = ?1", params![trip_id])?;
    connection.execute(
        "DELETE FROM soc_floor_records WHERE trip_id = ?1",
        params![trip_id],
    )?;
    let deleted = connection.execute("DELETE FROM trips WHERE id = ?1", params![trip_id])?;
    Ok(deleted == 1)
}

/// Records the battery-floor observation for a trip once; later calls for
/// the same trip are ignored.
pub fn insert_soc_floor_record_if_absent(
    connection: &Connection,
    record: &NewSocFloorRecord,
) -> Result<bool, DbError> {
    let inserted = connection.execute(
        "INSERT INTO soc_floor_records (trip_id, recorded_at, soc_pct, ambient_temp_f, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (trip_id) DO NOTHING",
        params![
            record.trip_id,
            record.recorded_at,
            record.soc_pct,
            record.ambient_temp_f,
            record.created_at,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn get_soc_floor_record(
    connection: &Connection,
    trip_id: &str,
) -> Result<Option<SocFloorRecord>, DbError> {
    let record = connection
        .query_row(
            "SELECT id, trip_id, recorded_at, soc_pct, ambient_temp_f, created_at
             FROM soc_floor_records
             WHERE trip_id = ?1",
            params![trip_id],
            |row| {
                Ok(SocFloorRecord {
                    id: row.get(0)?,
                    trip_id: row.get(1)?,
                    recorded_at: row.get(2)?,
                    soc_pct: row.get(3)?,
                    ambient_temp_f: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

/// Inserts the session unless another one is still incomplete. Returns
/// whether this call created the row.
pub fn insert_charging_session_if_absent(
    connection: &Connection,
    new_session: &NewChargingSessionRecord,
) -> Result<bool, DbError> {
    let inserted = connection.execute(
        "INSERT INTO charging_sessions (id, is_complete, started_at, last_sample_at,
            start_soc_pct, end_soc_pct, created_at)
         VALUES (?1, 0, ?2, ?2, ?3, ?3, ?4)
         ON CONFLICT DO NOTHING",
        params![
            new_session.id,
            new_session.started_at,
            new_session.start_soc_pct,
            new_session.created_at,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn get_open_charging_session(
    connection: &Connection,
) -> Result<Option<ChargingSessionRecord>, DbError> {
    let sql = format!("SELECT {CHARGING_COLUMNS} FROM charging_sessions WHERE is_complete = 0");
    let session = connection
        .query_row(&sql, [], map_charging_row)
        .optional()?;
    Ok(session)
}

pub fn get_charging_session(
    connection: &Connection,
    session_id: &str,
) -> Result<Option<ChargingSessionRecord>, DbError> {
    let sql = format!("SELECT {CHARGING_COLUMNS} FROM charging_sessions WHERE id = ?1");
    let session = connection
        .query_row(&sql, params![session_id], map_charging_row)
        .optional()?;
    Ok(session)
}

pub fn list_charging_sessions(
    connection: &Connection,
    limit: u32,
) -> Result<Vec<ChargingSessionRecord>, DbError> {
    let sql = format!(
        "SELECT {CHARGING_COLUMNS} FROM charging_sessions
         ORDER BY started_at DESC, id DESC
         LIMIT ?1"
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params![i64::from(limit)], map_charging_row)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }

    Ok(sessions)
}

/// Folds one charging sample into the open session's running statistics.
pub fn extend_charging_session(
    connection: &Connection,
    session_id: &str,
    progress: &ChargingProgress,
) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE charging_sessions SET
            last_sample_at = MAX(last_sample_at, ?2),
            start_soc_pct = CASE
                WHEN ?3 IS NOT NULL AND (?2 < started_at OR start_soc_pct IS NULL) THEN ?3
                ELSE start_soc_pct END,
            end_soc_pct = CASE
                WHEN ?3 IS NOT NULL AND (?2 >= last_sample_at OR end_soc_pct IS NULL) THEN ?3
                ELSE end_soc_pct END,
            started_at = MIN(started_at, ?2),
            peak_power_kw = CASE
                WHEN ?4 IS NULL THEN peak_power_kw
                WHEN peak_power_kw IS NULL THEN ?4
                ELSE MAX(peak_power_kw, ?4) END,
            power_sum_kw = power_sum_kw + COALESCE(?4, 0),
            power_sample_count = power_sample_count + CASE WHEN ?4 IS NULL THEN 0 ELSE 1 END,
            charger_class = COALESCE(?5, charger_class)
         WHERE id = ?1 AND is_complete = 0",
        params![
            session_id,
            progress.sample_at,
            progress.soc_pct,
            progress.power_kw,
            progress.charger_class,
        ],
    )?;
    Ok(updated == 1)
}

/// Appends a curve point unless the session already holds `cap` points.
/// Returns whether the point was stored.
pub fn append_curve_point_capped(
    connection: &Connection,
    session_id: &str,
    point: &ChargingCurvePoint,
    cap: usize,
) -> Result<bool, DbError> {
    let cap = i64::try_from(cap).unwrap_or(i64::MAX);
    let inserted = connection.execute(
        "INSERT INTO charging_curve_points (session_id, recorded_at, power_kw, soc_pct)
         SELECT ?1, ?2, ?3, ?4
         WHERE (SELECT COUNT(*) FROM charging_curve_points WHERE session_id = ?1) < ?5",
        params![session_id, point.recorded_at, point.power_kw, point.soc_pct, cap],
    )?;

    if inserted == 1 {
        connection.execute(
            "UPDATE charging_sessions SET curve_point_count = curve_point_count + 1 WHERE id = ?1",
            params![session_id],
        )?;
    }

    Ok(inserted == 1)
}

pub fn list_curve_points(
    connection: &Connection,
    session_id: &str,
) -> Result<Vec<ChargingCurvePoint>, DbError> {
    let mut statement = connection.prepare(
        "SELECT recorded_at, power_kw, soc_pct FROM charging_curve_points
         WHERE session_id = ?1
         ORDER BY recorded_at ASC, id ASC",
    )?;
    let rows = statement.query_map(params![session_id], |row| {
        Ok(ChargingCurvePoint {
            recorded_at: row.get(0)?,
            power_kw: row.get(1)?,
            soc_pct: row.get(2)?,
        })
    })?;

    let mut points = Vec::new();
    for row in rows {
        points.push(row?);
    }

    Ok(points)
}

/// Marks the open session complete. Returns `false` when it was already
/// complete.
pub fn complete_charging_session(
    connection: &Connection,
    session_id: &str,
    ended_at: &str,
    energy_added_kwh: Option<f64>,
    close_reason: &str,
) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE charging_sessions SET
            is_complete = 1,
            ended_at = ?2,
            energy_added_kwh = ?3,
            close_reason = ?4
         WHERE id = ?1 AND is_complete = 0",
        params![session_id, ended_at, energy_added_kwh, close_reason],
    )?;
    Ok(updated == 1)
}

pub fn insert_log_event(
    connection: &Connection,
    new_log_event: &NewLogEventRecord,
) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO log_events (created_at, level, code, message, source, subject_id, details_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new_log_event.created_at,
            new_log_event.level,
            new_log_event.code,
            new_log_event.message,
            new_log_event.source,
            new_log_event.subject_id,
            new_log_event.details_json,
        ],
    )?;

    Ok(connection.last_insert_rowid())
}

pub fn list_recent_log_events(
    connection: &Connection,
    limit: u32,
) -> Result<Vec<LogEventRecord>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, created_at, level, code, message, source, subject_id, details_json
         FROM log_events
         ORDER BY created_at DESC, id DESC
         LIMIT ?1",
    )?;

    let rows = statement.query_map(params![i64::from(limit)], |row| {
        Ok(LogEventRecord {
            id: row.get(0)?,
            created_at: row.get(1)?,
            level: row.get(2)?,
            code: row.get(3)?,
            message: row.get(4)?,
            source: row.get(5)?,
            subject_id: row.get(6)?,
            details_json: row.get(7)?,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }

    Ok(events)
}

pub fn count_log_events(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM log_events", [], |row| row.get(0))?;
    Ok(count)
}

fn collect_samples(
    connection: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<TelemetrySample>, DbError> {
    let mut statement = connection.prepare(sql)?;
    let rows = statement.query_map(params, map_sample_row)?;

    let mut samples = Vec::new();
    for row in rows {
        samples.push(row?);
    }

    Ok(samples)
}

fn map_trip_row(row: &Row<'_>) -> rusqlite::Result<TripRecord> {
    Ok(TripRecord {
        id: row.get(0)?,
        session_key: row.get(1)?,
        is_closed: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        start_odometer_mi: row.get(5)?,
        end_odometer_mi: row.get(6)?,
        start_soc_pct: row.get(7)?,
        end_soc_pct: row.get(8)?,
        sample_count: row.get(9)?,
        has_combustion_entry: row.get(10)?,
        combustion_entry_at: row.get(11)?,
        combustion_entry_soc_pct: row.get(12)?,
        distance_mi: row.get(13)?,
        electric_miles: row.get(14)?,
        combustion_miles: row.get(15)?,
        fuel_used_gallons: row.get(16)?,
        mpg: row.get(17)?,
        kwh_used: row.get(18)?,
        kwh_per_mile: row.get(19)?,
        avg_ambient_temp_f: row.get(20)?,
        closed_at: row.get(21)?,
        close_reason: row.get(22)?,
        created_at: row.get(23)?,
    })
}

fn map_sample_row(row: &Row<'_>) -> rusqlite::Result<TelemetrySample> {
    let latitude: Option<f64> = row.get(2)?;
    let longitude: Option<f64> = row.get(3)?;

    Ok(TelemetrySample {
        session_key: row.get(0)?,
        timestamp: timestamp_column(row, 1)?,
        gps: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| GpsFix {
                latitude,
                longitude,
            }),
        speed_mph: row.get(4)?,
        engine_rpm: row.get(5)?,
        soc_pct: row.get(6)?,
        fuel_level_pct: row.get(7)?,
        ambient_temp_f: row.get(8)?,
        odometer_mi: row.get(9)?,
        battery_power_kw: row.get(10)?,
        battery_voltage_v: row.get(11)?,
        battery_current_a: row.get(12)?,
        charger_connected: row.get(13)?,
        charger_power_kw: row.get(14)?,
        charger_voltage_v: row.get(15)?,
        charger_current_a: row.get(16)?,
    })
}

fn map_charging_row(row: &Row<'_>) -> rusqlite::Result<ChargingSessionRecord> {
    Ok(ChargingSessionRecord {
        id: row.get(0)?,
        is_complete: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        last_sample_at: row.get(4)?,
        start_soc_pct: row.get(5)?,
        end_soc_pct: row.get(6)?,
        peak_power_kw: row.get(7)?,
        power_sum_kw: row.get(8)?,
        power_sample_count: row.get(9)?,
        charger_class: row.get(10)?,
        curve_point_count: row.get(11)?,
        energy_added_kwh: row.get(12)?,
        close_reason: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<TimestampMs> {
    let text: String = row.get(index)?;
    TimestampMs::parse_iso8601(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            format!("invalid timestamp: {text}").into(),
        )
    })
}
