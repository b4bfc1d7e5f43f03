pub mod charging_energy;
pub mod clock;
pub mod mode_classifier;
pub mod models;
pub mod sample;
pub mod sample_decoder;
pub mod staleness;
pub mod trip_stats;
