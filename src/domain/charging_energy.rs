use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocSnapshot {
    pub start_soc_pct: Option<f64>,
    pub end_soc_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyAddedResult {
    pub kwh: f64,
    pub warnings: Vec<EnergyWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyWarning {
    NegativeSocDeltaClamped,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnergyComputationError {
    #[error("unable to compute energy added: no usable state of charge data")]
    NoUsableSocData,
    #[error("unable to compute energy added: battery capacity must be positive")]
    InvalidCapacity,
}

pub fn compute_energy_added_kwh(
    snapshot: &SocSnapshot,
    nominal_capacity_kwh: f64,
) -> Result<EnergyAddedResult, EnergyComputationError> {
    if !nominal_capacity_kwh.is_finite() || nominal_capacity_kwh <= 0.0 {
        return Err(EnergyComputationError::InvalidCapacity);
    }

    let (Some(start), Some(end)) = (snapshot.start_soc_pct, snapshot.end_soc_pct) else {
        return Err(EnergyComputationError::NoUsableSocData);
    };

    let raw_kwh = (end - start) / 100.0 * nominal_capacity_kwh;
    if raw_kwh < 0.0 {
        return Ok(EnergyAddedResult {
            kwh: 0.0,
            warnings: vec![EnergyWarning::NegativeSocDeltaClamped],
        });
    }

    Ok(EnergyAddedResult {
        kwh: raw_kwh,
        warnings: Vec::new(),
    })
}
