use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::clock::{Clock, TimestampMs};
use crate::domain::sample::{GpsFix, TelemetrySample};

const MAX_SESSION_KEY_LEN: usize = 128;
const EPOCH_SECONDS_UPPER_BOUND: f64 = 100_000_000_000.0;
const KM_PER_MILE: f64 = 1.609_344;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub sample: TelemetrySample,
    pub session_synthesized: bool,
    pub timestamp_from_receipt: bool,
}

#[derive(Clone, Copy)]
enum Conversion {
    None,
    KmhToMph,
    CelsiusToFahrenheit,
    KmToMiles,
    WattsToKw,
}

#[derive(Clone, Copy)]
struct MeasureAlias {
    key: &'static str,
    conversion: Conversion,
}

const fn alias(key: &'static str) -> MeasureAlias {
    MeasureAlias {
        key,
        conversion: Conversion::None,
    }
}

const fn converted(key: &'static str, conversion: Conversion) -> MeasureAlias {
    MeasureAlias { key, conversion }
}

const SESSION_KEYS: &[&str] = &["session", "session_id", "sessionid"];
const TIME_KEYS: &[&str] = &["time", "timestamp", "ts"];
const LATITUDE_KEYS: &[&str] = &["kff1006", "lat", "latitude"];
const LONGITUDE_KEYS: &[&str] = &["kff1005", "lon", "lng", "longitude"];
const CHARGER_CONNECTED_KEYS: &[&str] = &["k22437d", "charger_connected", "plugged", "charging"];

const SPEED_KEYS: &[MeasureAlias] = &[
    converted("kd", Conversion::KmhToMph),
    converted("kff1001", Conversion::KmhToMph),
    converted("speed_kmh", Conversion::KmhToMph),
    alias("speed_mph"),
];
const RPM_KEYS: &[MeasureAlias] = &[alias("kc"), alias("rpm"), alias("engine_rpm")];
const SOC_KEYS: &[MeasureAlias] = &[
    alias("k22005b"),
    alias("soc"),
    alias("state_of_charge"),
    alias("hv_soc"),
];
const FUEL_LEVEL_KEYS: &[MeasureAlias] = &[alias("k2f"), alias("fuel_level"), alias("fuel")];
const AMBIENT_TEMP_KEYS: &[MeasureAlias] = &[
    converted("k46", Conversion::CelsiusToFahrenheit),
    converted("ambient_temp_c", Conversion::CelsiusToFahrenheit),
    alias("ambient_temp_f"),
];
const ODOMETER_KEYS: &[MeasureAlias] = &[
    converted("k2201a6", Conversion::KmToMiles),
    converted("odometer_km", Conversion::KmToMiles),
    converted("odometer", Conversion::KmToMiles),
    alias("odometer_mi"),
];
const BATTERY_POWER_KEYS: &[MeasureAlias] = &[
    converted("k22241f", Conversion::WattsToKw),
    converted("hv_power_w", Conversion::WattsToKw),
    alias("hv_power_kw"),
];
const BATTERY_VOLTAGE_KEYS: &[MeasureAlias] = &[
    alias("k222429"),
    alias("hv_voltage"),
    alias("battery_voltage"),
];
const BATTERY_CURRENT_KEYS: &[MeasureAlias] = &[
    alias("k222414"),
    alias("hv_current"),
    alias("battery_current"),
];
const CHARGER_POWER_KEYS: &[MeasureAlias] = &[
    converted("k224368", Conversion::WattsToKw),
    converted("charger_power_w", Conversion::WattsToKw),
    alias("charger_power_kw"),
];
const CHARGER_VOLTAGE_KEYS: &[MeasureAlias] = &[
    alias("k224369"),
    alias("charger_voltage"),
    alias("charger_ac_voltage"),
];
const CHARGER_CURRENT_KEYS: &[MeasureAlias] = &[
    alias("k22436a"),
    alias("charger_current"),
    alias("charger_ac_current"),
];

/// Decodes one raw upload. Never fails: unusable values become `None`,
/// a bad session key is replaced by a fresh UUID and a bad timestamp by
/// the clock's receipt time.
pub fn decode_sample<C: Clock>(raw: &HashMap<String, String>, clock: &C) -> DecodedSample {
    let (session_key, session_synthesized) =
        match find_value(raw, SESSION_KEYS).and_then(valid_session_key) {
            Some(key) => (key, false),
            None => (uuid::Uuid::new_v4().to_string(), true),
        };

    let parsed_timestamp = find_value(raw, TIME_KEYS).and_then(parse_timestamp);
    let (timestamp, timestamp_from_receipt) = match parsed_timestamp {
        Some(timestamp) => (timestamp, false),
        None => (clock.now(), true),
    };

    let sample = TelemetrySample {
        session_key,
        timestamp,
        gps: parse_gps(raw),
        speed_mph: find_measure(raw, SPEED_KEYS).filter(|value| *value >= 0.0),
        engine_rpm: find_measure(raw, RPM_KEYS).filter(|value| *value >= 0.0),
        soc_pct: find_measure(raw, SOC_KEYS).filter(|value| is_percent(*value)),
        fuel_level_pct: find_measure(raw, FUEL_LEVEL_KEYS).filter(|value| is_percent(*value)),
        ambient_temp_f: find_measure(raw, AMBIENT_TEMP_KEYS),
        odometer_mi: find_measure(raw, ODOMETER_KEYS).filter(|value| *value >= 0.0),
        battery_power_kw: find_measure(raw, BATTERY_POWER_KEYS),
        battery_voltage_v: find_measure(raw, BATTERY_VOLTAGE_KEYS),
        battery_current_a: find_measure(raw, BATTERY_CURRENT_KEYS),
        charger_connected: find_value(raw, CHARGER_CONNECTED_KEYS).and_then(parse_flag),
        charger_power_kw: find_measure(raw, CHARGER_POWER_KEYS).filter(|value| *value >= 0.0),
        charger_voltage_v: find_measure(raw, CHARGER_VOLTAGE_KEYS),
        charger_current_a: find_measure(raw, CHARGER_CURRENT_KEYS),
    };

    DecodedSample {
        sample,
        session_synthesized,
        timestamp_from_receipt,
    }
}

fn valid_session_key(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let well_formed = !trimmed.is_empty()
        && trimmed.len() <= MAX_SESSION_KEY_LEN
        && trimmed
            .chars()
            .all(|char| char.is_ascii_alphanumeric() || matches!(char, '-' | '_' | '.' | ':'));

    well_formed.then(|| trimmed.to_string())
}

fn parse_timestamp(value: &str) -> Option<TimestampMs> {
    let trimmed = value.trim();
    if let Ok(number) = trimmed.parse::<f64>() {
        if !number.is_finite() || number <= 0.0 {
            return None;
        }
        let millis = if number < EPOCH_SECONDS_UPPER_BOUND {
            number * 1000.0
        } else {
            number
        };
        let millis = millis.round() as i64;
        // Out-of-range values saturate; anything chrono cannot represent is
        // treated as malformed.
        return DateTime::<Utc>::from_timestamp_millis(millis).map(|_| TimestampMs(millis));
    }

    TimestampMs::parse_iso8601(trimmed)
}

fn parse_gps(raw: &HashMap<String, String>) -> Option<GpsFix> {
    let latitude = find_value(raw, LATITUDE_KEYS).and_then(parse_f64_from_text)?;
    let longitude = find_value(raw, LONGITUDE_KEYS).and_then(parse_f64_from_text)?;

    let in_range = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
    let null_island = latitude == 0.0 && longitude == 0.0;
    if !in_range || null_island {
        return None;
    }

    Some(GpsFix {
        latitude,
        longitude,
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        other => parse_f64_from_text(other).map(|number| number > 0.0),
    }
}

fn is_percent(value: f64) -> bool {
    (0.0..=100.0).contains(&value)
}

fn find_measure(raw: &HashMap<String, String>, aliases: &[MeasureAlias]) -> Option<f64> {
    aliases.iter().find_map(|alias| {
        find_value(raw, &[alias.key]).and_then(|value| {
            let number = parse_f64_from_text(value)?;
            let converted = match alias.conversion {
                Conversion::None => number,
                Conversion::KmhToMph => number / KM_PER_MILE,
                Conversion::CelsiusToFahrenheit => number * 9.0 / 5.0 + 32.0,
                Conversion::KmToMiles => number / KM_PER_MILE,
                Conversion::WattsToKw => number / 1000.0,
            };
            converted.is_finite().then_some(converted)
        })
    })
}

fn find_value<'a>(raw: &'a HashMap<String, String>, aliases: &[&str]) -> Option<&'a str> {
    for alias in aliases {
        if let Some(value) = raw.get(*alias) {
            return Some(value.as_str());
        }
    }

    // Several raw keys may normalize to the same alias; the smallest raw key
    // wins so the choice does not depend on map iteration order.
    aliases.iter().find_map(|alias| {
        let normalized_alias = normalize_key(alias);
        raw.iter()
            .filter(|(key, _)| normalize_key(key) == normalized_alias)
            .min_by(|(left, _), (right, _)| left.cmp(right))
            .map(|(_, value)| value.as_str())
    })
}

fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|char| char.is_ascii_alphanumeric())
        .flat_map(|char| char.to_lowercase())
        .collect()
}

fn parse_f64_from_text(text: &str) -> Option<f64> {
    extract_numeric_tokens(text).into_iter().find_map(|token| {
        normalize_numeric_token(&token)
            .and_then(|normalized| normalized.parse::<f64>().ok())
            .filter(|number| number.is_finite())
    })
}

fn extract_numeric_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for char in text.chars() {
        if char.is_ascii_digit() || char == ',' || char == '.' || char == '-' {
            current.push(char);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn normalize_numeric_token(token: &str) -> Option<String> {
    let comma_count = token.matches(',').count();
    let dot_count = token.matches('.').count();

    if comma_count > 0 && dot_count > 0 {
        let comma_index = token.rfind(',')?;
        let dot_index = token.rfind('.')?;
        if comma_index > dot_index {
            return Some(token.replace('.', "").replace(',', "."));
        }
        return Some(token.replace(',', ""));
    }

    if comma_count > 0 {
        return Some(token.replace(',', "."));
    }

    if dot_count > 1 {
        return Some(token.replace('.', ""));
    }

    Some(token.to_string())
}
