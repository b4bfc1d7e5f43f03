use std::time::Duration;

use crate::app::AppError;
use crate::app::charging::ChargingSettings;
use crate::domain::mode_classifier::{ChargerThresholds, CombustionThresholds};
use crate::domain::trip_stats::TripStatsParams;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub http_bind: String,
    pub db_busy_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub charging_idle_timeout_secs: u64,
    pub combustion_rpm_threshold: f64,
    pub depletion_soc_threshold: f64,
    pub min_combustion_miles: f64,
    pub min_electric_miles: f64,
    pub charging_curve_cap: usize,
    pub slow_charger_max_kw: f64,
    pub fast_charger_max_kw: f64,
    pub tank_capacity_gallons: f64,
    pub usable_battery_kwh: f64,
    pub nominal_battery_kwh: f64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            db_path: string_or_default(&lookup, "DB_PATH", "/var/lib/hybrid-trips/trips.db"),
            http_bind: string_or_default(&lookup, "HTTP_BIND", "0.0.0.0:8080"),
            db_busy_timeout_ms: parse_or_default(&lookup, "DB_BUSY_TIMEOUT_MS", 2000_u64)?,
            sweep_interval_ms: parse_or_default(&lookup, "SWEEP_INTERVAL_MS", 30_000_u64)?,
            idle_timeout_secs: parse_or_default(&lookup, "IDLE_TIMEOUT_SECS", 120_u64)?,
            charging_idle_timeout_secs: parse_or_default(
                &lookup,
                "CHARGING_IDLE_TIMEOUT_SECS",
                60_u64,
            )?,
            combustion_rpm_threshold: parse_or_default(
                &lookup,
                "COMBUSTION_RPM_THRESHOLD",
                500.0_f64,
            )?,
            depletion_soc_threshold: parse_or_default(&lookup, "DEPLETION_SOC_THRESHOLD", 25.0_f64)?,
            min_combustion_miles: parse_or_default(&lookup, "MIN_COMBUSTION_MILES", 1.0_f64)?,
            min_electric_miles: parse_or_default(&lookup, "MIN_ELECTRIC_MILES", 0.5_f64)?,
            charging_curve_cap: parse_or_default(&lookup, "CHARGING_CURVE_CAP", 1000_usize)?,
            slow_charger_max_kw: parse_or_default(&lookup, "SLOW_CHARGER_MAX_KW", 3.0_f64)?,
            fast_charger_max_kw: parse_or_default(&lookup, "FAST_CHARGER_MAX_KW", 20.0_f64)?,
            tank_capacity_gallons: parse_or_default(&lookup, "TANK_CAPACITY_GALLONS", 9.3_f64)?,
            usable_battery_kwh: parse_or_default(&lookup, "USABLE_BATTERY_KWH", 14.0_f64)?,
            nominal_battery_kwh: parse_or_default(&lookup, "NOMINAL_BATTERY_KWH", 18.4_f64)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.slow_charger_max_kw >= self.fast_charger_max_kw {
            return Err(AppError::config(
                "SLOW_CHARGER_MAX_KW must be below FAST_CHARGER_MAX_KW",
            ));
        }
        if self.charging_curve_cap == 0 {
            return Err(AppError::config("CHARGING_CURVE_CAP must be positive"));
        }
        for (key, value) in [
            ("TANK_CAPACITY_GALLONS", self.tank_capacity_gallons),
            ("USABLE_BATTERY_KWH", self.usable_battery_kwh),
            ("NOMINAL_BATTERY_KWH", self.nominal_battery_kwh),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(AppError::config(format!("{key} must be positive")));
            }
        }
        if self.sweep_interval_ms == 0 {
            return Err(AppError::config("SWEEP_INTERVAL_MS must be positive"));
        }

        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn trip_stats_params(&self) -> TripStatsParams {
        TripStatsParams {
            combustion: CombustionThresholds {
                rpm_threshold: self.combustion_rpm_threshold,
                depletion_soc_pct: self.depletion_soc_threshold,
            },
            min_combustion_miles: self.min_combustion_miles,
            min_electric_miles: self.min_electric_miles,
            tank_capacity_gallons: self.tank_capacity_gallons,
            usable_battery_kwh: self.usable_battery_kwh,
        }
    }

    pub fn charging_settings(&self) -> ChargingSettings {
        ChargingSettings {
            thresholds: ChargerThresholds {
                slow_max_kw: self.slow_charger_max_kw,
                fast_max_kw: self.fast_charger_max_kw,
            },
            curve_cap: self.charging_curve_cap,
            idle_timeout_secs: self.charging_idle_timeout_secs,
            nominal_battery_kwh: self.nominal_battery_kwh,
        }
    }
}

fn string_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    #[test]
    fn applies_defaults_for_optional_fields() {
        let result = AppConfig::from_lookup(|_| None).expect("config should be valid");

        assert_eq!(result.db_path, "/var/lib/hybrid-trips/trips.db");
        assert_eq!(result.http_bind, "0.0.0.0:8080");
        assert_eq!(result.idle_timeout_secs, 120);
        assert_eq!(result.charging_idle_timeout_secs, 60);
        assert_eq!(result.combustion_rpm_threshold, 500.0);
        assert_eq!(result.depletion_soc_threshold, 25.0);
        assert_eq!(result.min_combustion_miles, 1.0);
        assert_eq!(result.min_electric_miles, 0.5);
        assert_eq!(result.charging_curve_cap, 1000);
        assert_eq!(result.slow_charger_max_kw, 3.0);
        assert_eq!(result.fast_charger_max_kw, 20.0);
    }

    #[test]
    fn blank_strings_fall_back_to_defaults() {
        let result = AppConfig::from_lookup(|key| match key {
            "DB_PATH" => Some("   ".to_string()),
            "IDLE_TIMEOUT_SECS" => Some(" 300 ".to_string()),
            _ => None,
        })
        .expect("config should be valid");

        assert_eq!(result.db_path, "/var/lib/hybrid-trips/trips.db");
        assert_eq!(result.idle_timeout_secs, 300);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let result = AppConfig::from_lookup(|key| match key {
            "SWEEP_INTERVAL_MS" => Some("abc".to_string()),
            _ => None,
        });

        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: SWEEP_INTERVAL_MS must be a valid number"
        );
    }

    #[test]
    fn rejects_inverted_charger_thresholds() {
        let result = AppConfig::from_lookup(|key| match key {
            "SLOW_CHARGER_MAX_KW" => Some("25".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: SLOW_CHARGER_MAX_KW must be below FAST_CHARGER_MAX_KW"
        );
    }

    #[test]
    fn rejects_zero_curve_cap() {
        let result = AppConfig::from_lookup(|key| match key {
            "CHARGING_CURVE_CAP" => Some("0".to_string()),
            _ => None,
        });

        assert!(result.is_err());
    }

    #[test]
    fn maps_thresholds_into_domain_parameters() {
        let config = AppConfig::from_lookup(|key| match key {
            "COMBUSTION_RPM_THRESHOLD" => Some("650".to_string()),
            "CHARGING_CURVE_CAP" => Some("10".to_string()),
            _ => None,
        })
        .expect("config should be valid");

        assert_eq!(config.trip_stats_params().combustion.rpm_threshold, 650.0);
        assert_eq!(config.charging_settings().curve_cap, 10);
    }
}
