use crate::domain::clock::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
}

/// One decoded logger report in the crate's unit system: miles, mph,
/// degrees Fahrenheit, kW, volts, amps and percent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySample {
    pub session_key: String,
    pub timestamp: TimestampMs,
    pub gps: Option<GpsFix>,
    pub speed_mph: Option<f64>,
    pub engine_rpm: Option<f64>,
    pub soc_pct: Option<f64>,
    pub fuel_level_pct: Option<f64>,
    pub ambient_temp_f: Option<f64>,
    pub odometer_mi: Option<f64>,
    pub battery_power_kw: Option<f64>,
    pub battery_voltage_v: Option<f64>,
    pub battery_current_a: Option<f64>,
    pub charger_connected: Option<bool>,
    pub charger_power_kw: Option<f64>,
    pub charger_voltage_v: Option<f64>,
    pub charger_current_a: Option<f64>,
}

impl TelemetrySample {
    pub fn has_charging_fields(&self) -> bool {
        self.charger_connected.is_some()
            || self.charger_power_kw.is_some()
            || self.charger_voltage_v.is_some()
            || self.charger_current_a.is_some()
    }

    pub fn is_charging(&self) -> bool {
        self.charger_connected == Some(true)
    }

    /// Charger power when reported, otherwise derived from AC volts and amps.
    pub fn charging_power_kw(&self) -> Option<f64> {
        self.charger_power_kw.or_else(|| {
            match (self.charger_voltage_v, self.charger_current_a) {
                (Some(volts), Some(amps)) => Some(volts * amps / 1000.0),
                _ => None,
            }
        })
    }
}
