//! Guest records: `DR`, `GI`, `GO` and `GC`, plus the outbound database sync.

use chrono::NaiveDate;
use fias_protocol::{field, Message, OutboundRecord, RecordId, DATE_FORMAT};
use log::{info, warn};

use super::{wire_safe, HandlerContext, Step};
use crate::guests::{GuestPatch, GuestRecord};

/// Parse a `yyMMdd` date field. Empty or malformed values give `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

pub fn handle_database_resync(_message: &Message, _ctx: &HandlerContext<'_>) -> Vec<Step> {
    info!("Database resync requested by PMS");
    Vec::new()
}

pub fn handle_check_in(message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
    let Some(reservation) = message.non_empty_field(field::RESERVATION) else {
        warn!("Check-in without reservation number ignored (room {})", message.field_or_empty(field::ROOM));
        return Vec::new();
    };

    let mut guest = GuestRecord::new(reservation);
    guest.room_number = message.field_or_empty(field::ROOM).to_string();
    guest.guest_name = message.field_or_empty(field::GUEST_NAME).to_string();
    guest.language = message.field_or_empty(field::LANGUAGE).to_string();
    guest.arrival_date = parse_date(message.field_or_empty(field::ARRIVAL));
    guest.departure_date = parse_date(message.field_or_empty(field::DEPARTURE));

    info!("Guest checked in: {} - Room {}", guest.guest_name, guest.room_number);
    if ctx.registry.upsert(guest).is_some() {
        info!("Reservation {} replaced by new check-in", reservation);
    }
    Vec::new()
}

pub fn handle_check_out(message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
    let reservation = message.field_or_empty(field::RESERVATION);
    match ctx.registry.remove(reservation) {
        Some(guest) => info!("Guest checked out: Reservation {} - Room {}", reservation, guest.room_number),
        None => warn!("Check-out for unknown reservation {:?}", reservation),
    }
    Vec::new()
}

pub fn handle_change(message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
    let reservation = message.field_or_empty(field::RESERVATION);

    let patch = GuestPatch {
        room_number: message.field(field::ROOM).map(str::to_string),
        guest_name: message.field(field::GUEST_NAME).map(str::to_string),
        language: message.field(field::LANGUAGE).map(str::to_string),
        arrival_date: message.field(field::ARRIVAL).and_then(parse_date),
        departure_date: message.field(field::DEPARTURE).and_then(parse_date),
    };

    match ctx.registry.patch(reservation, patch) {
        Some(guest) => info!("Guest updated: {} - Room {}", guest.guest_name, guest.room_number),
        None => warn!("Guest change for unknown reservation {:?}", reservation),
    }
    Vec::new()
}

/// Records pushing the registry to the PMS: `DS`, one `GI` per guest, `DE`.
pub fn database_sync_records(guests: &[GuestRecord]) -> Vec<OutboundRecord> {
    let mut records = Vec::with_capacity(guests.len() + 2);
    records.push(OutboundRecord::stamped(RecordId::DatabaseStart));
    for guest in guests {
        records.push(
            OutboundRecord::new(RecordId::GuestCheckIn)
                .field(field::ROOM, wire_safe(&guest.room_number))
                .field(field::RESERVATION, wire_safe(&guest.reservation_number))
                .field(field::GUEST_NAME, wire_safe(&guest.guest_name))
                .field(field::LANGUAGE, wire_safe(&guest.language))
                .field(field::ARRIVAL, format_date(guest.arrival_date))
                .field(field::DEPARTURE, format_date(guest.departure_date)),
        );
    }
    records.push(OutboundRecord::stamped(RecordId::DatabaseEnd));
    records
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::test_support::message;
    use crate::dispatch::{Dispatcher, LinkSettings};
    use crate::guests::{GuestRegistry, GuestStatus};

    fn setup() -> (Arc<GuestRegistry>, Dispatcher) {
        let registry = Arc::new(GuestRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::new(LinkSettings::default()));
        (registry, dispatcher)
    }

    #[test]
    fn test_check_in_then_out() {
        let (registry, d) = setup();

        let steps = d.dispatch(&message(
            "GI",
            &[("RN", "101"), ("G#", "R1"), ("GN", "Smith"), ("GL", "EN"), ("GA", "240101"), ("GD", "240105")],
        ));
        assert!(steps.is_empty());

        let guest = registry.get("R1").unwrap();
        assert_eq!(guest.room_number, "101");
        assert_eq!(guest.guest_name, "Smith");
        assert_eq!(guest.language, "EN");
        assert_eq!(guest.status, GuestStatus::CheckedIn);
        assert_eq!(guest.arrival_date, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(guest.departure_date, NaiveDate::from_ymd_opt(2024, 1, 5));

        assert!(d.dispatch(&message("GO", &[("RN", "101"), ("G#", "R1")])).is_empty());
        assert!(registry.get("R1").is_none());
    }

    #[test]
    fn test_check_in_bad_dates_left_unset() {
        let (registry, d) = setup();
        d.dispatch(&message("GI", &[("RN", "7"), ("G#", "R7"), ("GA", "24-01-01"), ("GD", "")]));

        let guest = registry.get("R7").unwrap();
        assert!(guest.arrival_date.is_none());
        assert!(guest.departure_date.is_none());
    }

    #[test]
    fn test_check_in_replaces_existing() {
        let (registry, d) = setup();
        d.dispatch(&message("GI", &[("RN", "101"), ("G#", "R1"), ("GN", "Smith")]));
        d.dispatch(&message("GI", &[("RN", "202"), ("G#", "R1"), ("GN", "Jones")]));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("R1").unwrap().room_number, "202");
    }

    #[test]
    fn test_check_in_without_reservation_ignored() {
        let (registry, d) = setup();
        d.dispatch(&message("GI", &[("RN", "101"), ("GN", "Smith")]));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_check_out_unknown_is_noop() {
        let (registry, d) = setup();
        d.dispatch(&message("GI", &[("RN", "101"), ("G#", "R1")]));
        d.dispatch(&message("GO", &[("G#", "R9")]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_change_patches_present_fields() {
        let (registry, d) = setup();
        d.dispatch(&message("GI", &[("RN", "101"), ("G#", "R1"), ("GN", "Smith"), ("GL", "EN")]));
        let before = registry.get("R1").unwrap().last_update;

        d.dispatch(&message("GC", &[("G#", "R1"), ("RN", "205"), ("GD", "240110")]));

        let guest = registry.get("R1").unwrap();
        assert_eq!(guest.room_number, "205");
        assert_eq!(guest.guest_name, "Smith");
        assert_eq!(guest.language, "EN");
        assert_eq!(guest.departure_date, NaiveDate::from_ymd_opt(2024, 1, 10));
        assert!(guest.last_update >= before);
    }

    #[test]
    fn test_change_unknown_reservation_is_noop() {
        let (registry, d) = setup();
        d.dispatch(&message("GC", &[("G#", "R1"), ("RN", "205")]));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_database_resync_has_no_reply() {
        let (_, d) = setup();
        assert!(d.dispatch(&message("DR", &[])).is_empty());
    }

    #[test]
    fn test_database_sync_records() {
        let mut guest = GuestRecord::new("R1");
        guest.room_number = "101".to_string();
        guest.guest_name = "Müller".to_string();
        guest.arrival_date = NaiveDate::from_ymd_opt(2024, 3, 9);

        let records = database_sync_records(&[guest]);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].record_id, RecordId::DatabaseStart);
        assert_eq!(records[1].record_id, RecordId::GuestCheckIn);
        assert_eq!(records[1].get("GN"), Some("M?ller"));
        assert_eq!(records[1].get("GA"), Some("240309"));
        assert_eq!(records[1].get("GD"), Some(""));
        assert_eq!(records[2].record_id, RecordId::DatabaseEnd);

        for record in &records {
            assert!(fias_protocol::encode_record(record).is_ok());
        }
    }
}
