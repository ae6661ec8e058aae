//! Link handshake: `LS`, `LA` and `LE` handling.

use chrono::{DateTime, Local};
use fias_protocol::{field, Message, OutboundRecord, RecordId, SUPPORTED_RECORDS};
use log::info;

use super::{reply, HandlerContext, LinkSettings, Step};

/// `RT` flag: the interface asks for room payment methods.
const REQUEST_TYPE_PAYMENT_METHODS: &str = "1";

/// The `LS` record sent when a PMS connects.
pub fn link_start() -> OutboundRecord {
    OutboundRecord::stamped(RecordId::LinkStart)
}

/// Build the `LD` link description.
pub fn build_link_description(settings: &LinkSettings, at: DateTime<Local>) -> OutboundRecord {
    OutboundRecord::new(RecordId::LinkDescription)
        .with_timestamp(at)
        .field(field::VERSION, settings.protocol_version.as_str())
        .field(field::INTERFACE_FAMILY, settings.interface_type.as_str())
        .field(field::REQUEST_TYPE, REQUEST_TYPE_PAYMENT_METHODS)
}

/// Build one `LR` record per supported record type, in table order.
pub fn build_link_records() -> Vec<OutboundRecord> {
    SUPPORTED_RECORDS
        .iter()
        .map(|(record, layout)| {
            OutboundRecord::new(RecordId::LinkRecord)
                .field(field::RECORD_ID, *record)
                .field(field::FIELD_LIST, *layout)
        })
        .collect()
}

/// The full handshake answering an `LS`: `LD`, every `LR`, then `LA`.
pub fn handshake_steps(settings: &LinkSettings, at: DateTime<Local>) -> Vec<Step> {
    let pacing = settings.pacing;
    let records = build_link_records();

    let mut steps = Vec::with_capacity(4 + records.len() * 2);
    steps.push(Step::Pause(pacing.before_description));
    steps.push(Step::Send(build_link_description(settings, at)));
    steps.push(Step::Pause(pacing.after_description));
    for record in records {
        steps.push(Step::Send(record));
        steps.push(Step::Pause(pacing.after_record));
    }
    steps.push(Step::Send(OutboundRecord::new(RecordId::LinkAlive).with_timestamp(at)));
    steps
}

pub fn handle_link_start(_message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
    info!("Link Start received, sending link description");
    handshake_steps(ctx.settings, Local::now())
}

pub fn handle_link_alive(_message: &Message, _ctx: &HandlerContext<'_>) -> Vec<Step> {
    info!("Link Alive received");
    reply(OutboundRecord::stamped(RecordId::LinkAlive))
}

pub fn handle_link_end(_message: &Message, _ctx: &HandlerContext<'_>) -> Vec<Step> {
    info!("Link End received");
    reply(OutboundRecord::stamped(RecordId::LinkEnd))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::dispatch::test_support::{message, sent};
    use crate::dispatch::Dispatcher;
    use crate::guests::GuestRegistry;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(GuestRegistry::new()), Arc::new(LinkSettings::default()))
    }

    #[test]
    fn test_link_start_sequence() {
        let d = dispatcher();
        let steps = d.dispatch(&message("LS", &[("DA", "240101"), ("TI", "120000")]));
        let records = sent(&steps);

        assert_eq!(records.len(), 2 + SUPPORTED_RECORDS.len());
        assert_eq!(records[0].record_id, RecordId::LinkDescription);
        for (record, (code, layout)) in records[1..=SUPPORTED_RECORDS.len()].iter().zip(SUPPORTED_RECORDS) {
            assert_eq!(record.record_id, RecordId::LinkRecord);
            assert_eq!(record.get("RI"), Some(*code));
            assert_eq!(record.get("FL"), Some(*layout));
        }
        assert_eq!(records.last().unwrap().record_id, RecordId::LinkAlive);
    }

    #[test]
    fn test_link_start_pacing() {
        let steps = handshake_steps(&LinkSettings::default(), Local::now());

        assert_eq!(steps[0], Step::Pause(Duration::from_millis(100)));
        assert!(matches!(steps[1], Step::Send(_)));
        assert_eq!(steps[2], Step::Pause(Duration::from_millis(100)));
        assert_eq!(steps[4], Step::Pause(Duration::from_millis(50)));
        assert!(matches!(steps.last(), Some(Step::Send(r)) if r.record_id == RecordId::LinkAlive));
    }

    #[test]
    fn test_link_start_repeats_mid_session() {
        let d = dispatcher();
        let first = sent(&d.dispatch(&message("LS", &[]))).len();
        let second = sent(&d.dispatch(&message("LS", &[]))).len();
        assert_eq!(first, second);
    }

    #[test]
    fn test_link_description_fields() {
        let mut settings = LinkSettings::default();
        settings.protocol_version = "2.1".to_string();
        settings.interface_type = "PB".to_string();

        let ld = build_link_description(&settings, Local::now());
        let ids: Vec<_> = ld.fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(ids, vec!["DA", "TI", "V#", "IF", "RT"]);
        assert_eq!(ld.get("V#"), Some("2.1"));
        assert_eq!(ld.get("IF"), Some("PB"));
        assert_eq!(ld.get("RT"), Some("1"));
    }

    #[test]
    fn test_link_alive_and_end_echo() {
        let d = dispatcher();

        let la = d.dispatch(&message("LA", &[]));
        assert_eq!(sent(&la)[0].record_id, RecordId::LinkAlive);
        assert!(sent(&la)[0].get("DA").is_some());

        let le = d.dispatch(&message("LE", &[]));
        assert_eq!(sent(&le).len(), 1);
        assert_eq!(sent(&le)[0].record_id, RecordId::LinkEnd);
    }
}
