//! Record dispatch: maps inbound record ids to handlers.
//!
//! Handlers are plain functions of the decoded [`Message`] and a
//! [`HandlerContext`]. They return the ordered steps the session should
//! perform, which keeps them independent of the socket and easy to test.

pub mod guest;
pub mod handshake;
pub mod posting;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fias_protocol::{Message, OutboundRecord, RecordId};
use log::debug;

use crate::error::BridgeError;
use crate::guests::{Balance, GuestRegistry};

/// One action a handler asks the session to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Encode and send a record.
    Send(OutboundRecord),
    /// Wait before the next step. Cancelled on shutdown or disconnect.
    Pause(Duration),
}

/// Delays between the records of the link handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePacing {
    pub before_description: Duration,
    pub after_description: Duration,
    pub after_record: Duration,
}

impl Default for HandshakePacing {
    fn default() -> Self {
        Self {
            before_description: Duration::from_millis(100),
            after_description: Duration::from_millis(100),
            after_record: Duration::from_millis(50),
        }
    }
}

/// Macro used to render guest names in posting lists.
///
/// `$GN` expands to the full name, `$FN` to the first word and `$LN` to the
/// last word. Anything else is copied literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNameTemplate(String);

impl Default for GuestNameTemplate {
    fn default() -> Self {
        Self("$LN".to_string())
    }
}

impl GuestNameTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expand the template for a guest name. The result is wire-safe ASCII.
    pub fn render(&self, full_name: &str) -> String {
        let full_name = full_name.trim();
        let first = full_name.split_whitespace().next().unwrap_or("");
        let last = full_name.split_whitespace().last().unwrap_or("");

        let rendered = self
            .0
            .replace("$GN", full_name)
            .replace("$FN", first)
            .replace("$LN", last);
        wire_safe(&rendered)
    }
}

/// Replace anything that cannot travel in a field value with `?`.
pub fn wire_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '|' {
                c
            } else {
                '?'
            }
        })
        .collect()
}

/// Interface parameters announced to the PMS and used by the handlers.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Protocol version announced in `LD` (`V#`).
    pub protocol_version: String,
    /// Interface family code announced in `LD` (`IF`).
    pub interface_type: String,
    /// Character set agreed with the PMS. Frames are always 7-bit ASCII.
    pub character_set: String,
    /// Implied decimal places of amounts sent by the PMS.
    pub decimal_places: u32,
    /// Template for guest names in posting lists.
    pub guest_name_template: GuestNameTemplate,
    /// Handshake pacing.
    pub pacing: HandshakePacing,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            protocol_version: "1.0".to_string(),
            interface_type: "WW".to_string(),
            character_set: "UTF-8".to_string(),
            decimal_places: 2,
            guest_name_template: GuestNameTemplate::default(),
            pacing: HandshakePacing::default(),
        }
    }
}

impl LinkSettings {
    /// Check that the settings can be put on the wire.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.protocol_version.is_empty() || wire_safe(&self.protocol_version) != self.protocol_version {
            return Err(BridgeError::Config(format!(
                "protocol version {:?} must be non-empty printable ASCII",
                self.protocol_version
            )));
        }
        if self.interface_type.len() != 2 || !self.interface_type.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(BridgeError::Config(format!(
                "interface type {:?} must be a two-character code",
                self.interface_type
            )));
        }
        if self.decimal_places > Balance::SCALE {
            return Err(BridgeError::Config(format!(
                "decimal precision {} is out of range (0-{})",
                self.decimal_places,
                Balance::SCALE
            )));
        }
        Ok(())
    }
}

/// Everything a handler may touch.
pub struct HandlerContext<'a> {
    pub registry: &'a GuestRegistry,
    pub settings: &'a LinkSettings,
}

/// A record handler.
pub trait RecordHandler: Send + Sync {
    fn handle(&self, message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step>;
}

impl<F> RecordHandler for F
where
    F: Fn(&Message, &HandlerContext<'_>) -> Vec<Step> + Send + Sync,
{
    fn handle(&self, message: &Message, ctx: &HandlerContext<'_>) -> Vec<Step> {
        self(message, ctx)
    }
}

/// Routes messages to the handler registered for their record id.
pub struct Dispatcher {
    handlers: HashMap<RecordId, Box<dyn RecordHandler>>,
    registry: Arc<GuestRegistry>,
    settings: Arc<LinkSettings>,
}

impl Dispatcher {
    /// Create a dispatcher with the standard link, guest and posting handlers.
    pub fn new(registry: Arc<GuestRegistry>, settings: Arc<LinkSettings>) -> Self {
        let mut dispatcher = Self::empty(registry, settings);

        dispatcher.register(RecordId::LinkStart, handshake::handle_link_start);
        dispatcher.register(RecordId::LinkAlive, handshake::handle_link_alive);
        dispatcher.register(RecordId::LinkEnd, handshake::handle_link_end);

        dispatcher.register(RecordId::DatabaseResync, guest::handle_database_resync);
        dispatcher.register(RecordId::GuestCheckIn, guest::handle_check_in);
        dispatcher.register(RecordId::GuestCheckOut, guest::handle_check_out);
        dispatcher.register(RecordId::GuestChange, guest::handle_change);

        dispatcher.register(RecordId::PostingSimple, posting::handle_posting_simple);
        dispatcher.register(RecordId::PostingRequest, posting::handle_posting_request);

        dispatcher
    }

    /// Create a dispatcher with no handlers.
    pub fn empty(registry: Arc<GuestRegistry>, settings: Arc<LinkSettings>) -> Self {
        Self {
            handlers: HashMap::new(),
            registry,
            settings,
        }
    }

    /// Register or replace the handler for a record id.
    pub fn register<H>(&mut self, record_id: RecordId, handler: H)
    where
        H: RecordHandler + 'static,
    {
        self.handlers.insert(record_id, Box::new(handler));
    }

    pub fn handles(&self, record_id: &RecordId) -> bool {
        self.handlers.contains_key(record_id)
    }

    /// Run the handler for a message. Unknown record ids produce no steps.
    pub fn dispatch(&self, message: &Message) -> Vec<Step> {
        let Some(handler) = self.handlers.get(message.record_id()) else {
            debug!("No handler for record {}, ignoring", message.record_id());
            return Vec::new();
        };

        let ctx = HandlerContext {
            registry: &self.registry,
            settings: &self.settings,
        };
        handler.handle(message, &ctx)
    }
}

/// Wrap a single record as a reply.
pub(crate) fn reply(record: OutboundRecord) -> Vec<Step> {
    vec![Step::Send(record)]
}
