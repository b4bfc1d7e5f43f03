pub mod admin;
pub mod charging;
pub mod config;
mod error;
pub mod ingest;
mod logging;
mod runtime;
pub mod services;
pub mod sweeper;
pub mod trips;

pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    run_service()
}

pub fn run_service() -> Result<(), AppError> {
    logging::init()?;

    let config = config::AppConfig::from_env()?;

    tracing::info!(
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        sweep_interval_ms = config.sweep_interval_ms,
        idle_timeout_secs = config.idle_timeout_secs,
        charging_idle_timeout_secs = config.charging_idle_timeout_secs,
        "application bootstrap initialized"
    );

    runtime::run(config)
}

/// Runs one administrative command against the configured database.
/// `db_path` overrides `DB_PATH` when given.
pub fn run_admin(
    command: admin::AdminCommand,
    db_path: Option<String>,
) -> Result<admin::AdminOutput, AppError> {
    logging::init()?;

    let mut config = config::AppConfig::from_env()?;
    if let Some(path) = db_path {
        config.db_path = path;
    }

    tracing::info!(db_path = %config.db_path, command = ?command, "admin command starting");
    admin::execute(&config, command)
}
