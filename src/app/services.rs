use std::sync::{Arc, Mutex};

use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::domain::models::NewLogEventRecord;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Shared handle on the SQLite connection used by every manager.
#[derive(Clone)]
pub struct SqliteTelemetryStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteTelemetryStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    pub fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }

    /// Runs `op` inside a write transaction that commits only when `op`
    /// succeeds. The write lock is taken up front so concurrent writers on
    /// other connections queue on the busy timeout instead of failing.
    pub fn with_transaction<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let value = op(&transaction)?;
        transaction.commit().map_err(DbError::from)?;
        Ok(value)
    }

    /// Persists a structured failure. Errors are logged, never returned, so
    /// failure reporting cannot turn into a failure of its own.
    pub fn record_log_event(&self, event: &NewLogEventRecord) {
        if let Err(error) = self.with_connection(|connection| db::insert_log_event(connection, event))
        {
            tracing::warn!(
                error = %error,
                code = %event.code,
                "failed to persist log event"
            );
        }
    }
}
