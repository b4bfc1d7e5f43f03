//! Pure classification of sample windows into energy and charging regimes.
//!
//! Every function here takes an immutable, timestamp-ordered slice and
//! returns the same answer for the same slice, so the sweeper can re-run a
//! classification on a stale window and land on the decision ingestion made.

use crate::domain::clock::TimestampMs;
use crate::domain::sample::TelemetrySample;

/// Samples that must follow a candidate entry with RPM above half threshold.
const SUSTAIN_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombustionThresholds {
    pub rpm_threshold: f64,
    pub depletion_soc_pct: f64,
}

impl Default for CombustionThresholds {
    fn default() -> Self {
        Self {
            rpm_threshold: 500.0,
            depletion_soc_pct: 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargerThresholds {
    pub slow_max_kw: f64,
    pub fast_max_kw: f64,
}

impl Default for ChargerThresholds {
    fn default() -> Self {
        Self {
            slow_max_kw: 3.0,
            fast_max_kw: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombustionEntry {
    pub index: usize,
    pub timestamp: TimestampMs,
    pub soc_pct: f64,
    pub rpm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyRegime {
    Electric,
    Transitional,
    SustainedCombustion,
}

impl EnergyRegime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Electric => "electric",
            Self::Transitional => "transitional",
            Self::SustainedCombustion => "sustained_combustion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChargerClass {
    Slow,
    Fast,
    Rapid,
}

impl ChargerClass {
    pub fn from_power_kw(power_kw: f64, thresholds: &ChargerThresholds) -> Self {
        if power_kw <= thresholds.slow_max_kw {
            Self::Slow
        } else if power_kw <= thresholds.fast_max_kw {
            Self::Fast
        } else {
            Self::Rapid
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slow => "slow",
            Self::Fast => "fast",
            Self::Rapid => "rapid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "slow" => Some(Self::Slow),
            "fast" => Some(Self::Fast),
            "rapid" => Some(Self::Rapid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargingRegime {
    Charging {
        peak_kw: f64,
        average_kw: f64,
        charger_class: ChargerClass,
    },
    NotCharging,
}

/// First sample where the engine runs above threshold on a depleted battery
/// and keeps running for the next two samples. A lone generator pulse, or
/// an entry candidate too close to the end of the window to verify, is not
/// an entry.
pub fn detect_combustion_entry(
    window: &[TelemetrySample],
    thresholds: &CombustionThresholds,
) -> Option<CombustionEntry> {
    let sustain_rpm = thresholds.rpm_threshold / 2.0;

    window.iter().enumerate().find_map(|(index, sample)| {
        let rpm = sample.engine_rpm?;
        let soc_pct = sample.soc_pct?;
        if rpm <= thresholds.rpm_threshold || soc_pct >= thresholds.depletion_soc_pct {
            return None;
        }

        let following = window.get(index + 1..index + 1 + SUSTAIN_SAMPLES)?;
        let sustained = following
            .iter()
            .all(|next| next.engine_rpm.is_some_and(|next_rpm| next_rpm > sustain_rpm));

        sustained.then_some(CombustionEntry {
            index,
            timestamp: sample.timestamp,
            soc_pct,
            rpm,
        })
    })
}

pub fn classify_energy_regime(
    window: &[TelemetrySample],
    thresholds: &CombustionThresholds,
) -> EnergyRegime {
    if detect_combustion_entry(window, thresholds).is_some() {
        return EnergyRegime::SustainedCombustion;
    }

    let any_spike = window.iter().any(|sample| {
        sample
            .engine_rpm
            .is_some_and(|rpm| rpm > thresholds.rpm_threshold)
    });

    if any_spike {
        EnergyRegime::Transitional
    } else {
        EnergyRegime::Electric
    }
}

/// Charging when at least one sample carries the charger-connected flag.
/// Power statistics only cover flagged samples that report power; a flagged
/// window without any power reading classifies as a slow charge at 0 kW.
pub fn classify_charging(
    window: &[TelemetrySample],
    thresholds: &ChargerThresholds,
) -> ChargingRegime {
    let charging: Vec<&TelemetrySample> =
        window.iter().filter(|sample| sample.is_charging()).collect();
    if charging.is_empty() {
        return ChargingRegime::NotCharging;
    }

    let powers: Vec<f64> = charging
        .iter()
        .filter_map(|sample| sample.charging_power_kw())
        .filter(|power| power.is_finite())
        .collect();

    let peak_kw = powers.iter().copied().fold(0.0_f64, f64::max);
    let average_kw = if powers.is_empty() {
        0.0
    } else {
        powers.iter().sum::<f64>() / powers.len() as f64
    };

    ChargingRegime::Charging {
        peak_kw,
        average_kw,
        charger_class: ChargerClass::from_power_kw(peak_kw, thresholds),
    }
}
