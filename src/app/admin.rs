use crate::adapters::db;
use crate::adapters::events::DiscardingTripEventSink;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::runtime::{Components, open_database};
use crate::app::sweeper::SweepReport;
use crate::domain::models::TripRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// One sweep pass, for deployments where an external scheduler replaces
    /// the in-process sweeper thread.
    Sweep,
    Recompute { trip_id: String },
    Delete { trip_id: String },
    ListTrips { limit: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminOutput {
    Swept(SweepReport),
    Recomputed(TripRecord),
    Deleted { trip_id: String, existed: bool },
    Trips(Vec<TripRecord>),
}

pub fn execute(config: &AppConfig, command: AdminCommand) -> Result<AdminOutput, AppError> {
    let connection = open_database(config)?;
    let components = Components::new(connection, DiscardingTripEventSink, config);

    match command {
        AdminCommand::Sweep => Ok(AdminOutput::Swept(components.sweeper(config).sweep_once())),
        AdminCommand::Recompute { trip_id } => components
            .trips
            .recompute(&trip_id)
            .map(AdminOutput::Recomputed)
            .map_err(AppError::runtime),
        AdminCommand::Delete { trip_id } => {
            let existed = components
                .trips
                .delete(&trip_id)
                .map_err(AppError::runtime)?;
            Ok(AdminOutput::Deleted { trip_id, existed })
        }
        AdminCommand::ListTrips { limit } => components
            .store
            .with_connection(|connection| db::list_trips(connection, limit))
            .map(AdminOutput::Trips)
            .map_err(AppError::runtime),
    }
}
