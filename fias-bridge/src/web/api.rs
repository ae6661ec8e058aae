//! Admin API endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Local};
use fias_protocol::{date_time_fields, field, RecordId};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;

use crate::dispatch::guest::database_sync_records;
use crate::error::BridgeError;
use crate::guests::GuestRecord;
use crate::web::state::WebState;

const DEFAULT_LOG_COUNT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub count: Option<usize>,
}

// ============================================================================
// Server endpoints
// ============================================================================

/// Connection status and interface settings.
pub async fn get_server_status(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let link = &web_state.link;
    let settings = &web_state.settings;

    Json(json!({
        "isConnected": link.is_connected(),
        "status": link.state(),
        "peer": link.peer().map(|p| p.to_string()),
        "uptimeSeconds": web_state.uptime_seconds(),
        "settings": {
            "protocolVersion": settings.protocol_version,
            "interfaceType": settings.interface_type,
            "characterSet": settings.character_set,
            "decimalPlaces": settings.decimal_places,
            "guestNameTemplate": settings.guest_name_template.as_str(),
        },
    }))
}

/// Drop the PMS connection. The server keeps listening.
pub async fn disconnect(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let disconnected = web_state.link.force_disconnect();
    let message = if disconnected {
        "Disconnect requested"
    } else {
        "PMS is not connected"
    };
    Json(json!({
        "success": disconnected,
        "message": message,
    }))
}

// ============================================================================
// Guest endpoints
// ============================================================================

pub async fn get_guests(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(web_state.registry.list())
}

pub async fn search_guests(
    State(web_state): State<Arc<WebState>>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    Json(web_state.registry.search(&query.q))
}

pub async fn get_guest(
    State(web_state): State<Arc<WebState>>,
    Path(reservation): Path<String>,
) -> Response {
    match web_state.registry.get(&reservation) {
        Some(guest) => Json(guest).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("Reservation {} not found", reservation) })),
        )
            .into_response(),
    }
}

/// Insert a fake guest for trying out inquiries and postings.
pub async fn add_test_guest(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let now = Local::now();
    let mut guest = GuestRecord::new(now.format("TEST%Y%m%d%H%M%S%3f").to_string());
    guest.room_number = "101".to_string();
    guest.guest_name = "John Doe (Test)".to_string();
    guest.language = "EN".to_string();
    guest.arrival_date = Some(now.date_naive());
    guest.departure_date = Some((now + Duration::days(3)).date_naive());

    web_state.registry.upsert(guest.clone());
    info!("Test guest {} added", guest.reservation_number);

    Json(json!({
        "message": "Test guest added successfully",
        "guest": guest,
    }))
}

pub async fn clear_guests(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let count = web_state.registry.clear();
    info!("Cleared {} guests via API", count);
    Json(json!({
        "message": format!("Cleared {} guests", count),
    }))
}

// ============================================================================
// Database endpoints
// ============================================================================

/// Ask the PMS to resend every in-house guest (`DR`).
pub async fn request_resync(State(web_state): State<Arc<WebState>>) -> Response {
    info!("Database resync requested via API");
    send_stamped(
        &web_state,
        RecordId::DatabaseResync,
        "Database resync request sent to PMS. The PMS should respond with all in-house guests.",
    )
    .await
}

/// Send `DS` to the PMS.
pub async fn start_sync(State(web_state): State<Arc<WebState>>) -> Response {
    info!("Database Start sent via API");
    send_stamped(
        &web_state,
        RecordId::DatabaseStart,
        "Database Start sent. PMS should begin sending guest records.",
    )
    .await
}

/// Push the local registry to the PMS: `DS`, one `GI` per guest, `DE`.
pub async fn push_guests(State(web_state): State<Arc<WebState>>) -> Response {
    if !web_state.link.is_connected() {
        return not_connected();
    }

    let guests = web_state.registry.list();
    for record in database_sync_records(&guests) {
        if let Err(e) = web_state.link.send_record(&record).await {
            return send_failed(record.record_id, e);
        }
    }

    info!("Pushed {} guests to PMS", guests.len());
    Json(json!({
        "success": true,
        "message": format!("Sent {} guest records", guests.len()),
        "guestCount": guests.len(),
    }))
    .into_response()
}

pub async fn get_stats(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let stats = web_state.registry.stats();
    let guests_by_language: Vec<_> = stats
        .guests_by_language
        .iter()
        .map(|(language, count)| json!({ "language": language, "count": count }))
        .collect();

    Json(json!({
        "totalGuests": stats.total_guests,
        "checkedIn": stats.checked_in,
        "rooms": stats.rooms,
        "totalBalance": stats.total_balance,
        "lastUpdate": stats.last_update,
        "isConnectedToPms": web_state.link.is_connected(),
        "guestsByLanguage": guests_by_language,
    }))
}

pub async fn clear_database(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let count = web_state.registry.clear();
    info!("Cleared {} guests from local database", count);
    Json(json!({
        "success": true,
        "message": format!("Cleared {} guests from local database", count),
        "clearedCount": count,
    }))
}

// ============================================================================
// Log endpoints
// ============================================================================

pub async fn get_logs(
    State(web_state): State<Arc<WebState>>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    Json(web_state.logs.recent(query.count.unwrap_or(DEFAULT_LOG_COUNT)))
}

pub async fn clear_logs(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    web_state.logs.clear();
    StatusCode::OK
}

// ============================================================================
// Helpers
// ============================================================================

async fn send_stamped(web_state: &WebState, record_id: RecordId, message: &str) -> Response {
    if !web_state.link.is_connected() {
        return not_connected();
    }

    let now = Local::now();
    let (date, time) = date_time_fields(now);
    let fields = [(field::DATE, date), (field::TIME, time)];

    match web_state.link.send_directive(record_id.clone(), &fields).await {
        Ok(()) => Json(json!({
            "success": true,
            "message": message,
            "timestamp": now,
        }))
        .into_response(),
        Err(e) => send_failed(record_id, e),
    }
}

fn not_connected() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "message": "PMS is not connected",
            "isConnected": false,
        })),
    )
        .into_response()
}

fn send_failed(record_id: RecordId, e: BridgeError) -> Response {
    error!("Failed to send {} record: {}", record_id, e);
    let status = match e {
        BridgeError::NotConnected | BridgeError::SessionClosed => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "success": false,
            "message": format!("Error sending {} record", record_id),
            "error": e.to_string(),
        })),
    )
        .into_response()
}
