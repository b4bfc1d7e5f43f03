use serde::Serialize;

use crate::domain::clock::TimestampMs;
use crate::domain::mode_classifier::{CombustionEntry, CombustionThresholds, detect_combustion_entry};
use crate::domain::sample::TelemetrySample;

/// Speed integration ignores gaps longer than this between two samples.
const MAX_INTEGRATION_GAP_SECONDS: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripStatsParams {
    pub combustion: CombustionThresholds,
    pub min_combustion_miles: f64,
    pub min_electric_miles: f64,
    pub tank_capacity_gallons: f64,
    pub usable_battery_kwh: f64,
}

impl Default for TripStatsParams {
    fn default() -> Self {
        Self {
            combustion: CombustionThresholds::default(),
            min_combustion_miles: 1.0,
            min_electric_miles: 0.5,
            tank_capacity_gallons: 9.3,
            usable_battery_kwh: 14.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldFailure {
    pub field: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TripStats {
    pub start_time: Option<TimestampMs>,
    pub end_time: Option<TimestampMs>,
    pub start_odometer_mi: Option<f64>,
    pub end_odometer_mi: Option<f64>,
    pub start_soc_pct: Option<f64>,
    pub end_soc_pct: Option<f64>,
    pub distance_mi: Option<f64>,
    pub combustion_entry: Option<CombustionEntry>,
    pub electric_miles: Option<f64>,
    pub combustion_miles: Option<f64>,
    pub fuel_used_gallons: Option<f64>,
    pub mpg: Option<f64>,
    pub kwh_used: Option<f64>,
    pub kwh_per_mile: Option<f64>,
    pub avg_ambient_temp_f: Option<f64>,
    pub failures: Vec<FieldFailure>,
}

/// Derives the finalized statistics of one trip from its samples, which
/// must be ordered by timestamp. A field whose computation fails is left
/// `None` and reported in `failures`; the remaining fields are unaffected.
pub fn compute_trip_stats(samples: &[TelemetrySample], params: &TripStatsParams) -> TripStats {
    let mut stats = TripStats {
        start_time: samples.first().map(|sample| sample.timestamp),
        end_time: samples.last().map(|sample| sample.timestamp),
        start_odometer_mi: samples.iter().find_map(|sample| sample.odometer_mi),
        end_odometer_mi: samples.iter().rev().find_map(|sample| sample.odometer_mi),
        start_soc_pct: samples.iter().find_map(|sample| sample.soc_pct),
        end_soc_pct: samples.iter().rev().find_map(|sample| sample.soc_pct),
        avg_ambient_temp_f: mean(samples.iter().filter_map(|sample| sample.ambient_temp_f)),
        ..TripStats::default()
    };

    if samples.is_empty() {
        return stats;
    }

    stats.combustion_entry = detect_combustion_entry(samples, &params.combustion);

    // Electric and combustion miles are shares of the distance, so they are
    // left `None` together with it.
    let cumulative = match (stats.start_odometer_mi, stats.end_odometer_mi) {
        (Some(start), Some(end)) if end < start => {
            stats.failures.push(FieldFailure {
                field: "distance_mi",
                reason: format!("odometer moved backwards from {start} to {end}"),
            });
            None
        }
        _ => cumulative_miles(samples),
    };
    stats.distance_mi = cumulative.as_ref().and_then(|miles| miles.last().copied());

    if let (Some(miles), Some(total)) = (cumulative.as_ref(), stats.distance_mi) {
        let electric = stats
            .combustion_entry
            .map_or(total, |entry| miles[entry.index]);
        stats.electric_miles = Some(electric);
        stats.combustion_miles = Some(total - electric);
    }

    apply_fuel_economy(samples, params, &mut stats);
    apply_energy_use(params, &mut stats);

    stats
}

fn apply_fuel_economy(samples: &[TelemetrySample], params: &TripStatsParams, stats: &mut TripStats) {
    let Some(entry) = stats.combustion_entry else {
        return;
    };

    let fuel_at_entry = samples[..=entry.index]
        .iter()
        .rev()
        .find_map(|sample| sample.fuel_level_pct)
        .or_else(|| samples[entry.index..].iter().find_map(|sample| sample.fuel_level_pct));
    let fuel_at_end = samples.iter().rev().find_map(|sample| sample.fuel_level_pct);

    let (Some(entry_pct), Some(end_pct)) = (fuel_at_entry, fuel_at_end) else {
        return;
    };

    let delta_pct = entry_pct - end_pct;
    if delta_pct < 0.0 {
        // Refuelled mid-trip; consumption is unknowable.
        stats.fuel_used_gallons = Some(0.0);
        return;
    }

    let fuel_used = delta_pct / 100.0 * params.tank_capacity_gallons;
    stats.fuel_used_gallons = Some(fuel_used);

    let Some(combustion_miles) = stats.combustion_miles else {
        return;
    };
    if combustion_miles < params.min_combustion_miles {
        return;
    }

    match checked_ratio(combustion_miles, fuel_used) {
        Ok(mpg) => stats.mpg = Some(mpg),
        Err(reason) => stats.failures.push(FieldFailure {
            field: "mpg",
            reason,
        }),
    }
}

fn apply_energy_use(params: &TripStatsParams, stats: &mut TripStats) {
    let Some(start_soc) = stats.start_soc_pct else {
        return;
    };
    let reference_soc = match stats.combustion_entry {
        Some(entry) => Some(entry.soc_pct),
        None => stats.end_soc_pct,
    };
    let Some(reference_soc) = reference_soc else {
        return;
    };

    let kwh_used = ((start_soc - reference_soc) / 100.0 * params.usable_battery_kwh).max(0.0);
    stats.kwh_used = Some(kwh_used);

    let Some(electric_miles) = stats.electric_miles else {
        return;
    };
    if electric_miles < params.min_electric_miles {
        return;
    }

    match checked_ratio(kwh_used, electric_miles) {
        Ok(kwh_per_mile) => stats.kwh_per_mile = Some(kwh_per_mile),
        Err(reason) => stats.failures.push(FieldFailure {
            field: "kwh_per_mile",
            reason,
        }),
    }
}

fn checked_ratio(numerator: f64, denominator: f64) -> Result<f64, String> {
    if denominator == 0.0 {
        return Err(format!("division by zero ({numerator} / 0)"));
    }

    let ratio = numerator / denominator;
    if ratio.is_finite() {
        Ok(ratio)
    } else {
        Err(format!("non-finite result ({numerator} / {denominator})"))
    }
}

/// Miles travelled up to each sample. Prefers the odometer (carried forward
/// across samples without a reading, never decreasing) and falls back to
/// integrating speed when fewer than two odometer readings exist.
fn cumulative_miles(samples: &[TelemetrySample]) -> Option<Vec<f64>> {
    let odometer_readings = samples
        .iter()
        .filter(|sample| sample.odometer_mi.is_some())
        .count();

    if odometer_readings >= 2 {
        let first = samples.iter().find_map(|sample| sample.odometer_mi)?;
        let mut furthest = first;
        return Some(
            samples
                .iter()
                .map(|sample| {
                    if let Some(odometer) = sample.odometer_mi {
                        furthest = furthest.max(odometer);
                    }
                    furthest - first
                })
                .collect(),
        );
    }

    if samples.iter().all(|sample| sample.speed_mph.is_none()) {
        return None;
    }

    let mut total = 0.0;
    let mut miles = Vec::with_capacity(samples.len());
    miles.push(0.0);
    for pair in samples.windows(2) {
        let gap_seconds = pair[1].timestamp.seconds_since(pair[0].timestamp);
        if let (Some(from), Some(to)) = (pair[0].speed_mph, pair[1].speed_mph)
            && gap_seconds > 0.0
            && gap_seconds <= MAX_INTEGRATION_GAP_SECONDS
        {
            total += (from + to) / 2.0 * gap_seconds / 3600.0;
        }
        miles.push(total);
    }

    Some(miles)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0_usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::{TripStatsParams, compute_trip_stats};
    use crate::domain::clock::TimestampMs;
    use crate::domain::sample::TelemetrySample;

    const START_MS: i64 = 1_700_000_000_000;

    fn sample(index: i64) -> TelemetrySample {
        TelemetrySample {
            session_key: "S1".to_string(),
            timestamp: TimestampMs(START_MS + index * 5_000),
            ..TelemetrySample::default()
        }
    }

    fn electric(index: i64, odometer_mi: f64, soc_pct: f64) -> TelemetrySample {
        TelemetrySample {
            odometer_mi: Some(odometer_mi),
            soc_pct: Some(soc_pct),
            engine_rpm: Some(0.0),
            fuel_level_pct: Some(50.0),
            ..sample(index)
        }
    }

    fn combustion(index: i64, odometer_mi: f64, fuel_level_pct: f64) -> TelemetrySample {
        TelemetrySample {
            odometer_mi: Some(odometer_mi),
            soc_pct: Some(18.0),
            engine_rpm: Some(1200.0),
            fuel_level_pct: Some(fuel_level_pct),
            ..sample(index)
        }
    }

    /// Electric leg from 100.0 to `entry_odometer`, then a combustion leg of
    /// three samples ending at `end_odometer`.
    fn split_trip(
        entry_odometer: f64,
        end_odometer: f64,
        end_fuel_pct: f64,
    ) -> Vec<TelemetrySample> {
        let middle = (entry_odometer + end_odometer) / 2.0;
        vec![
            electric(0, 100.0, 40.0),
            electric(1, entry_odometer, 30.0),
            combustion(2, entry_odometer, 50.0),
            combustion(3, middle, 50.0),
            combustion(4, end_odometer, end_fuel_pct),
        ]
    }

    #[test]
    fn zero_samples_yield_empty_statistics() {
        let stats = compute_trip_stats(&[], &TripStatsParams::default());

        assert_eq!(stats.distance_mi, None);
        assert_eq!(stats.mpg, None);
        assert_eq!(stats.kwh_per_mile, None);
        assert_eq!(stats.end_time, None);
        assert!(stats.failures.is_empty());
    }

    #[test]
    fn combustion_distance_below_floor_has_no_fuel_economy() {
        let samples = split_trip(101.0, 101.9, 45.0);

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        let combustion_miles = stats.combustion_miles.expect("combustion miles");
        assert!((combustion_miles - 0.9).abs() < 1e-9);
        assert!(stats.fuel_used_gallons.is_some());
        assert_eq!(stats.mpg, None);
    }

    #[test]
    fn combustion_distance_at_floor_has_fuel_economy() {
        let samples = split_trip(101.0, 102.0, 45.0);

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert_eq!(stats.combustion_miles, Some(1.0));
        let fuel_used = 0.05 * 9.3;
        assert!((stats.fuel_used_gallons.expect("fuel used") - fuel_used).abs() < 1e-9);
        assert!((stats.mpg.expect("mpg") - 1.0 / fuel_used).abs() < 1e-9);
    }

    #[test]
    fn backwards_odometer_nulls_distance_and_split() {
        let samples = vec![
            electric(0, 100.0, 40.0),
            electric(1, 105.0, 35.0),
            electric(2, 99.0, 30.0),
        ];

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert_eq!(stats.start_odometer_mi, Some(100.0));
        assert_eq!(stats.end_odometer_mi, Some(99.0));
        assert_eq!(stats.distance_mi, None);
        assert_eq!(stats.electric_miles, None);
        assert_eq!(stats.combustion_miles, None);
        assert_eq!(stats.kwh_per_mile, None);
        assert!(stats.kwh_used.is_some());
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].field, "distance_mi");
        assert_eq!(
            stats.failures[0].reason,
            "odometer moved backwards from 100 to 99"
        );
    }

    #[test]
    fn refuel_suppresses_fuel_economy() {
        let samples = split_trip(101.0, 110.0, 95.0);

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert_eq!(stats.fuel_used_gallons, Some(0.0));
        assert_eq!(stats.mpg, None);
        assert!(stats.failures.is_empty());
    }

    #[test]
    fn zero_fuel_used_is_recorded_as_field_failure() {
        let samples = split_trip(101.0, 103.0, 50.0);

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert_eq!(stats.mpg, None);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].field, "mpg");
        assert_eq!(stats.distance_mi, Some(3.0));
    }

    #[test]
    fn electric_distance_below_floor_has_no_energy_rate() {
        let samples = vec![electric(0, 100.0, 90.0), electric(1, 100.25, 89.0)];

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert_eq!(stats.electric_miles, Some(0.25));
        assert!(stats.kwh_used.is_some());
        assert_eq!(stats.kwh_per_mile, None);
    }

    #[test]
    fn electric_only_trip_uses_end_soc_for_energy() {
        let samples = vec![electric(0, 100.0, 90.0), electric(1, 102.0, 80.0)];

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert_eq!(stats.combustion_entry, None);
        assert_eq!(stats.combustion_miles, Some(0.0));
        assert_eq!(stats.fuel_used_gallons, None);
        assert!((stats.kwh_used.expect("kwh") - 1.4).abs() < 1e-9);
        assert!((stats.kwh_per_mile.expect("rate") - 0.7).abs() < 1e-9);
    }

    #[test]
    fn integrates_speed_when_odometer_missing() {
        let samples: Vec<TelemetrySample> = (0..=12)
            .map(|index| TelemetrySample {
                speed_mph: Some(60.0),
                ..sample(index * 6)
            })
            .collect();

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert!((stats.distance_mi.expect("distance") - 6.0).abs() < 1e-9);
    }

    #[test]
    fn averages_ambient_temperature() {
        let samples = vec![
            TelemetrySample {
                ambient_temp_f: Some(60.0),
                ..sample(0)
            },
            sample(1),
            TelemetrySample {
                ambient_temp_f: Some(70.0),
                ..sample(2)
            },
        ];

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        assert_eq!(stats.avg_ambient_temp_f, Some(65.0));
    }

    #[test]
    fn scenario_electric_leg_then_sustained_combustion() {
        let mut samples = Vec::new();
        let mile_per_sample = 45.0 * 5.0 / 3600.0;
        for index in 0..30 {
            samples.push(TelemetrySample {
                speed_mph: Some(45.0),
                odometer_mi: Some(1000.0 + index as f64 * mile_per_sample),
                soc_pct: Some(100.0 - index as f64 * 75.0 / 29.0),
                engine_rpm: Some(0.0),
                fuel_level_pct: Some(80.0),
                ..sample(index)
            });
        }
        for index in 30..50 {
            samples.push(TelemetrySample {
                speed_mph: Some(45.0),
                odometer_mi: Some(1000.0 + index as f64 * mile_per_sample),
                soc_pct: Some(18.0),
                engine_rpm: Some(1200.0),
                fuel_level_pct: Some(80.0 - (index - 29) as f64 * 0.2),
                ..sample(index)
            });
        }

        let stats = compute_trip_stats(&samples, &TripStatsParams::default());

        let entry = stats.combustion_entry.expect("combustion entry expected");
        assert_eq!(entry.index, 30);
        assert_eq!(entry.soc_pct, 18.0);
        assert!(stats.kwh_per_mile.is_some());

        let combustion_miles = stats.combustion_miles.expect("combustion miles");
        assert!((combustion_miles - 19.0 * mile_per_sample).abs() < 1e-9);
        assert_eq!(stats.mpg.is_some(), combustion_miles >= 1.0);
    }
}
