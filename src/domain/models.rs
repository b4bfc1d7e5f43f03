#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub id: String,
    pub session_key: String,
    pub is_closed: bool,
    pub start_time: String,
    pub end_time: String,
    pub start_odometer_mi: Option<f64>,
    pub end_odometer_mi: Option<f64>,
    pub start_soc_pct: Option<f64>,
    pub end_soc_pct: Option<f64>,
    pub sample_count: i64,
    pub has_combustion_entry: bool,
    pub combustion_entry_at: Option<String>,
    pub combustion_entry_soc_pct: Option<f64>,
    pub distance_mi: Option<f64>,
    pub electric_miles: Option<f64>,
    pub combustion_miles: Option<f64>,
    pub fuel_used_gallons: Option<f64>,
    pub mpg: Option<f64>,
    pub kwh_used: Option<f64>,
    pub kwh_per_mile: Option<f64>,
    pub avg_ambient_temp_f: Option<f64>,
    pub closed_at: Option<String>,
    pub close_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTripRecord {
    pub id: String,
    pub session_key: String,
    pub start_time: String,
    pub start_odometer_mi: Option<f64>,
    pub start_soc_pct: Option<f64>,
    pub created_at: String,
}

/// Derived fields written when a trip closes, or when it is recomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct TripFinalization {
    pub end_time: Option<String>,
    pub start_odometer_mi: Option<f64>,
    pub end_odometer_mi: Option<f64>,
    pub start_soc_pct: Option<f64>,
    pub end_soc_pct: Option<f64>,
    pub has_combustion_entry: bool,
    pub combustion_entry_at: Option<String>,
    pub combustion_entry_soc_pct: Option<f64>,
    pub distance_mi: Option<f64>,
    pub electric_miles: Option<f64>,
    pub combustion_miles: Option<f64>,
    pub fuel_used_gallons: Option<f64>,
    pub mpg: Option<f64>,
    pub kwh_used: Option<f64>,
    pub kwh_per_mile: Option<f64>,
    pub avg_ambient_temp_f: Option<f64>,
    pub closed_at: String,
    pub close_reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSocFloorRecord {
    pub trip_id: String,
    pub recorded_at: String,
    pub soc_pct: f64,
    pub ambient_temp_f: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocFloorRecord {
    pub id: i64,
    pub trip_id: String,
    pub recorded_at: String,
    pub soc_pct: f64,
    pub ambient_temp_f: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargingSessionRecord {
    pub id: String,
    pub is_complete: bool,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub last_sample_at: String,
    pub start_soc_pct: Option<f64>,
    pub end_soc_pct: Option<f64>,
    pub peak_power_kw: Option<f64>,
    pub power_sum_kw: f64,
    pub power_sample_count: i64,
    pub charger_class: Option<String>,
    pub curve_point_count: i64,
    pub energy_added_kwh: Option<f64>,
    pub close_reason: Option<String>,
    pub created_at: String,
}

impl ChargingSessionRecord {
    pub fn average_power_kw(&self) -> Option<f64> {
        (self.power_sample_count > 0).then(|| self.power_sum_kw / self.power_sample_count as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChargingSessionRecord {
    pub id: String,
    pub started_at: String,
    pub start_soc_pct: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargingProgress {
    pub sample_at: String,
    pub soc_pct: Option<f64>,
    pub power_kw: Option<f64>,
    pub charger_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargingCurvePoint {
    pub recorded_at: String,
    pub power_kw: Option<f64>,
    pub soc_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEventRecord {
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub source: String,
    pub subject_id: Option<String>,
    pub details_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEventRecord {
    pub id: i64,
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub source: String,
    pub subject_id: Option<String>,
    pub details_json: Option<String>,
}
