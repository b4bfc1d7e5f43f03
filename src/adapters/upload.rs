use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use crate::adapters::db;
use crate::app::ingest::SampleIngestor;
use crate::app::services::{ServiceError, SqliteTelemetryStore};

const UPLOAD_ACK: &str = "OK!";

#[derive(Clone)]
pub struct UploadState {
    pub ingestor: Arc<dyn SampleIngestor>,
    pub store: SqliteTelemetryStore,
}

#[derive(Debug, Deserialize)]
pub struct DiagnosticsLogQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsDbResponse {
    pub schema_version: u32,
    pub trips_count: i64,
    pub open_trips_count: usize,
    pub log_events_count: i64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsLogEventResponse {
    pub id: i64,
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub source: String,
    pub subject_id: Option<String>,
    pub details_json: Option<String>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(upload_query)
        .service(upload_form)
        .service(get_db_diagnostics_endpoint)
        .service(list_log_events_diagnostics_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[get("/upload")]
async fn upload_query(state: web::Data<UploadState>, request: HttpRequest) -> impl Responder {
    ingest_encoded(&state, request.query_string());
    HttpResponse::Ok().body(UPLOAD_ACK)
}

#[post("/upload")]
async fn upload_form(
    state: web::Data<UploadState>,
    request: HttpRequest,
    body: web::Bytes,
) -> impl Responder {
    let form = std::str::from_utf8(&body).unwrap_or_default();
    let encoded = if form.trim().is_empty() {
        request.query_string()
    } else {
        form
    };
    ingest_encoded(&state, encoded);
    HttpResponse::Ok().body(UPLOAD_ACK)
}

/// Decodes url-encoded key/value pairs and hands them to the ingestor.
/// Nothing here may fail the request: the logger retries on anything but a
/// success and would otherwise resend the same report forever.
fn ingest_encoded(state: &UploadState, encoded: &str) {
    let raw = match web::Query::<HashMap<String, String>>::from_query(encoded) {
        Ok(query) => query.into_inner(),
        Err(error) => {
            tracing::warn!(error = %error, "upload payload could not be decoded");
            return;
        }
    };

    if raw.is_empty() {
        tracing::debug!("empty upload ignored");
        return;
    }

    let outcome = state.ingestor.ingest(&raw);
    tracing::debug!(
        session_key = %outcome.session_key,
        trip = ?outcome.trip,
        charging = ?outcome.charging,
        "upload processed"
    );
}

#[get("/diagnostics/db")]
async fn get_db_diagnostics_endpoint(state: web::Data<UploadState>) -> impl Responder {
    let diagnostics = state.store.with_connection(|connection| {
        Ok(DiagnosticsDbResponse {
            schema_version: db::schema_version(connection)?,
            trips_count: db::count_trips(connection)?,
            open_trips_count: db::list_open_trips(connection)?.len(),
            log_events_count: db::count_log_events(connection)?,
        })
    });

    match diagnostics {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(error) => service_error_response(error),
    }
}

#[get("/diagnostics/log-events")]
async fn list_log_events_diagnostics_endpoint(
    state: web::Data<UploadState>,
    query: web::Query<DiagnosticsLogQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state
        .store
        .with_connection(|connection| db::list_recent_log_events(connection, limit))
    {
        Ok(events) => {
            let mapped: Vec<DiagnosticsLogEventResponse> = events
                .into_iter()
                .map(|event| DiagnosticsLogEventResponse {
                    id: event.id,
                    created_at: event.created_at,
                    level: event.level,
                    code: event.code,
                    message: event.message,
                    source: event.source,
                    subject_id: event.subject_id,
                    details_json: event.details_json,
                })
                .collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    match error {
        ServiceError::DbLockPoisoned => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "database lock poisoned"
            }))
        }
        ServiceError::Database(error) => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("database query failed: {error}")
            }))
        }
    }
}
