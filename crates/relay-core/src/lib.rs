//! Core domain model for the CRM appointment relay.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod format;

pub use format::{customer_name_from_title, MessageFormatter, UNKNOWN_CSR, UNKNOWN_CUSTOMER};

pub const CRATE_NAME: &str = "relay-core";

pub type MeetingId = i64;
pub type PartyId = i64;

/// One scheduled appointment as reported by the CRM meeting list.
///
/// Every field except `id` may be missing or `null` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    pub id: MeetingId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    /// Owner of the calendar slot, not the person who set the appointment.
    #[serde(default)]
    pub staff_first_name: Option<String>,
    #[serde(default)]
    pub staff_last_name: Option<String>,
    #[serde(default)]
    pub client_first_name: Option<String>,
    #[serde(default)]
    pub client_last_name: Option<String>,
    #[serde(default)]
    pub meeting_type_label: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub opportunity_id: Option<PartyId>,
    /// Join key into the party roster for lead-setter attribution.
    #[serde(default)]
    pub client_id: Option<PartyId>,
}

impl MeetingRecord {
    pub fn new(id: MeetingId) -> Self {
        Self {
            id,
            title: None,
            start_time: None,
            created_time: None,
            staff_first_name: None,
            staff_last_name: None,
            client_first_name: None,
            client_last_name: None,
            meeting_type_label: None,
            location: None,
            opportunity_id: None,
            client_id: None,
        }
    }

    /// True when the record was created at or after `cutoff`.
    /// Records without a creation instant never qualify.
    pub fn created_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_time.is_some_and(|created| created >= cutoff)
    }
}

/// One client/opportunity entry from the CRM roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyRecord {
    pub id: PartyId,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub lead_setter_first_name: Option<String>,
    #[serde(default)]
    pub lead_setter_last_name: Option<String>,
}

impl PartyRecord {
    /// Display name of the staff member who originated the lead, if the CRM has one.
    pub fn lead_setter_name(&self) -> Option<String> {
        join_name(
            self.lead_setter_first_name.as_deref(),
            self.lead_setter_last_name.as_deref(),
        )
    }
}

/// Joins the non-blank parts of a first/last name pair.
pub fn join_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let parts = [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Half-open `[start, end)` query window against the meeting source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}
