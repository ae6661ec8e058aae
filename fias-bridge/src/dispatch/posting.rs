//! Postings and guest inquiries: `PS` and `PR`.

use chrono::Local;
use fias_protocol::{field, AnswerStatus, Message, OutboundRecord, RecordId};
use log::{info, warn};

use super::{reply, wire_safe, HandlerContext, Step};
use crate::guests::{Balance, PostingError};

const GUEST_NOT_FOUND: &str = "GUEST NOT FOUND";

fn answer(status: AnswerStatus) -> OutboundRecord {
    OutboundRecord::new(RecordId::PostingAnswer).field(field::ANSWER_STATUS, status.code())
}

pub fn handle_posting_simple(message: &Message, _ctx: &HandlerContext<'_>) -> Vec<Step> {
    let room = message.field_or_empty(field::ROOM);
    info!("Posting: Room {}, Amount {}", room, message.field_or_empty(field::AMOUNT));

    reply(
        OutboundRecord::new(RecordId::PostingAnswer)
            .field(field::ROOM, wire_safe(room))
            .field(field::ANSWER_STATUS, AnswerStatus::Ok.code())
            .with_timestamp(Local::now()),
    )
}

/// `PR` is a posting when it carries a non-empty `TA`, an inquiry otherwise.
pub fn handle_posting_request(message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
    if message.non_empty_field(field::AMOUNT).is_some() {
        handle_posting(message, ctx)
    } else {
        handle_inquiry(message, ctx)
    }
}

fn handle_posting(message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
    let room = message.field_or_empty(field::ROOM);
    let reservation = message.field_or_empty(field::RESERVATION);
    let raw_amount = message.field_or_empty(field::AMOUNT);

    info!("Posting to room {}: {}", room, raw_amount);

    match Balance::parse_minor_units(raw_amount, ctx.settings.decimal_places) {
        Some(amount) => match ctx.registry.apply_posting(reservation, amount) {
            Ok(balance) => info!("Reservation {} balance is now {}", reservation, balance),
            Err(PostingError::UnknownReservation) => {
                warn!("Posting of {} for unknown reservation {:?} not applied", amount, reservation)
            }
            Err(PostingError::Overflow) => {
                warn!("Posting of {} to reservation {} not applied: balance would overflow", amount, reservation)
            }
        },
        None => warn!("Posting amount {:?} is not a valid amount, not applied", raw_amount),
    }

    reply(
        OutboundRecord::new(RecordId::PostingAnswer)
            .field(field::ROOM, wire_safe(room))
            .field(field::RESERVATION, wire_safe(reservation))
            .field(field::ANSWER_STATUS, AnswerStatus::Ok.code())
            .with_timestamp(Local::now()),
    )
}

fn handle_inquiry(message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
    let term = message.field_or_empty(field::INQUIRY);
    let matches = ctx.registry.search(term);

    info!("Guest inquiry {:?}: {} match(es)", term, matches.len());

    if matches.is_empty() {
        return reply(
            answer(AnswerStatus::Declined)
                .field(field::CLEAR_TEXT, GUEST_NOT_FOUND)
                .with_timestamp(Local::now()),
        );
    }

    let template = &ctx.settings.guest_name_template;
    matches
        .iter()
        .map(|guest| {
            Step::Send(
                OutboundRecord::new(RecordId::PostingList)
                    .field(field::ROOM, wire_safe(&guest.room_number))
                    .field(field::RESERVATION, wire_safe(&guest.reservation_number))
                    .field(field::GUEST_NAME, template.render(&guest.guest_name))
                    .with_timestamp(Local::now()),
            )
        })
        .collect()
}
