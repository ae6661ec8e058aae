//! In-memory guest registry.
//!
//! The registry is the only owner of guest records. Protocol handlers and the
//! web API go through its methods, which take the lock, copy what they need
//! and release it before returning.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Local, NaiveDate};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};

/// Guest stay status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuestStatus {
    #[default]
    CheckedIn,
    CheckedOut,
}

/// Fixed-point currency amount.
///
/// Stored with [`Balance::SCALE`] decimal places so that every precision the
/// PMS may be configured with is kept exactly. Displayed with at least two
/// decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Balance(i64);

impl Balance {
    /// Number of decimal places kept.
    pub const SCALE: u32 = 6;

    const DISPLAY_DECIMALS: usize = 2;

    /// Zero balance.
    pub const ZERO: Balance = Balance(0);

    /// Create a balance from hundredths.
    pub const fn from_cents(cents: i64) -> Self {
        Balance(cents * 10i64.pow(Self::SCALE - 2))
    }

    /// Convert an integer amount expressed with `decimals` implied decimal
    /// places (as sent by the PMS) into a balance. Returns `None` when the
    /// precision exceeds [`Balance::SCALE`] or the value does not fit.
    pub fn from_minor_units(units: i64, decimals: u32) -> Option<Self> {
        let factor = 10i64.checked_pow(Self::SCALE.checked_sub(decimals)?)?;
        units.checked_mul(factor).map(Balance)
    }

    /// Parse a PMS amount field (digits with an optional leading sign).
    pub fn parse_minor_units(raw: &str, decimals: u32) -> Option<Self> {
        let units: i64 = raw.trim().parse().ok()?;
        Self::from_minor_units(units, decimals)
    }

    pub fn checked_add(self, other: Balance) -> Option<Balance> {
        self.0.checked_add(other.0).map(Balance)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let unit = 10u64.pow(Self::SCALE);
        let fraction = format!("{:0width$}", abs % unit, width = Self::SCALE as usize);
        let significant = fraction.trim_end_matches('0').len().max(Self::DISPLAY_DECIMALS);
        write!(f, "{}{}.{}", sign, abs / unit, &fraction[..significant])
    }
}

impl Serialize for Balance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Why a posting was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PostingError {
    #[error("unknown reservation")]
    UnknownReservation,
    #[error("balance would overflow")]
    Overflow,
}

/// A guest currently known to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestRecord {
    pub reservation_number: String,
    pub room_number: String,
    pub guest_name: String,
    pub language: String,
    pub arrival_date: Option<NaiveDate>,
    pub departure_date: Option<NaiveDate>,
    pub balance: Balance,
    pub status: GuestStatus,
    pub last_update: DateTime<Local>,
}

impl GuestRecord {
    /// Create an empty checked-in record for a reservation.
    pub fn new(reservation_number: impl Into<String>) -> Self {
        Self {
            reservation_number: reservation_number.into(),
            room_number: String::new(),
            guest_name: String::new(),
            language: String::new(),
            arrival_date: None,
            departure_date: None,
            balance: Balance::ZERO,
            status: GuestStatus::CheckedIn,
            last_update: Local::now(),
        }
    }

    fn matches(&self, needle_lower: &str) -> bool {
        self.room_number.to_lowercase().contains(needle_lower)
            || self.guest_name.to_lowercase().contains(needle_lower)
    }
}

/// Partial update of a guest record; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestPatch {
    pub room_number: Option<String>,
    pub guest_name: Option<String>,
    pub language: Option<String>,
    pub arrival_date: Option<NaiveDate>,
    pub departure_date: Option<NaiveDate>,
}

impl GuestPatch {
    pub fn is_empty(&self) -> bool {
        *self == GuestPatch::default()
    }

    fn apply(self, guest: &mut GuestRecord) {
        if let Some(room) = self.room_number {
            guest.room_number = room;
        }
        if let Some(name) = self.guest_name {
            guest.guest_name = name;
        }
        if let Some(language) = self.language {
            guest.language = language;
        }
        if let Some(date) = self.arrival_date {
            guest.arrival_date = Some(date);
        }
        if let Some(date) = self.departure_date {
            guest.departure_date = Some(date);
        }
    }
}

/// Aggregate figures over the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_guests: usize,
    pub checked_in: usize,
    pub rooms: usize,
    pub total_balance: Balance,
    pub last_update: Option<DateTime<Local>>,
    pub guests_by_language: BTreeMap<String, usize>,
}

/// Thread-safe map of reservation number to guest record.
#[derive(Debug, Default)]
pub struct GuestRegistry {
    guests: RwLock<HashMap<String, GuestRecord>>,
}

impl GuestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any record with the same reservation number.
    pub fn upsert(&self, guest: GuestRecord) -> Option<GuestRecord> {
        self.guests
            .write()
            .insert(guest.reservation_number.clone(), guest)
    }

    /// Remove a record.
    pub fn remove(&self, reservation_number: &str) -> Option<GuestRecord> {
        self.guests.write().remove(reservation_number)
    }

    /// Get a copy of one record.
    pub fn get(&self, reservation_number: &str) -> Option<GuestRecord> {
        self.guests.read().get(reservation_number).cloned()
    }

    /// Mutate a record in place and refresh its last-update time.
    ///
    /// Returns a copy of the updated record, or `None` if it does not exist.
    pub fn update<F>(&self, reservation_number: &str, f: F) -> Option<GuestRecord>
    where
        F: FnOnce(&mut GuestRecord),
    {
        let mut guests = self.guests.write();
        let guest = guests.get_mut(reservation_number)?;
        f(guest);
        guest.last_update = Local::now();
        Some(guest.clone())
    }

    /// Apply a partial update.
    pub fn patch(&self, reservation_number: &str, patch: GuestPatch) -> Option<GuestRecord> {
        self.update(reservation_number, |guest| patch.apply(guest))
    }

    /// Add an amount to a guest's balance, returning the new balance.
    ///
    /// The record is left untouched, timestamp included, when the posting
    /// fails.
    pub fn apply_posting(&self, reservation_number: &str, amount: Balance) -> Result<Balance, PostingError> {
        let mut guests = self.guests.write();
        let guest = guests
            .get_mut(reservation_number)
            .ok_or(PostingError::UnknownReservation)?;
        let balance = guest
            .balance
            .checked_add(amount)
            .ok_or(PostingError::Overflow)?;
        guest.balance = balance;
        guest.last_update = Local::now();
        Ok(balance)
    }

    /// Snapshot of every record, ordered by room then reservation number.
    pub fn list(&self) -> Vec<GuestRecord> {
        let mut guests: Vec<GuestRecord> = self.guests.read().values().cloned().collect();
        sort_guests(&mut guests);
        guests
    }

    /// Case-insensitive substring search over room number and guest name.
    pub fn search(&self, term: &str) -> Vec<GuestRecord> {
        let needle = term.to_lowercase();
        let mut guests: Vec<GuestRecord> = self
            .guests
            .read()
            .values()
            .filter(|g| g.matches(&needle))
            .cloned()
            .collect();
        sort_guests(&mut guests);
        guests
    }

    /// Remove every record, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut guests = self.guests.write();
        let count = guests.len();
        guests.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.guests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute aggregate statistics from a snapshot.
    pub fn stats(&self) -> RegistryStats {
        let guests = self.list();
        let mut rooms = HashSet::new();
        let mut guests_by_language = BTreeMap::new();
        let mut total_balance = Balance::ZERO;
        let mut last_update = None;
        let mut checked_in = 0;

        for guest in &guests {
            rooms.insert(guest.room_number.as_str());
            *guests_by_language.entry(guest.language.clone()).or_insert(0) += 1;
            total_balance = total_balance.checked_add(guest.balance).unwrap_or(total_balance);
            if guest.status == GuestStatus::CheckedIn {
                checked_in += 1;
            }
            if last_update.map_or(true, |t| guest.last_update > t) {
                last_update = Some(guest.last_update);
            }
        }

        RegistryStats {
            total_guests: guests.len(),
            checked_in,
            rooms: rooms.len(),
            total_balance,
            last_update,
            guests_by_language,
        }
    }
}

fn sort_guests(guests: &mut [GuestRecord]) {
    guests.sort_by(|a, b| {
        a.room_number
            .cmp(&b.room_number)
            .then_with(|| a.reservation_number.cmp(&b.reservation_number))
    });
}
