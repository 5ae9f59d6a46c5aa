//! Human-readable notification text for appointment records.
//!
//! Formatting never fails: every input is optional and has a fallback.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::{join_name, MeetingRecord};

pub const UNKNOWN_CSR: &str = "Unknown CSR";
pub const UNKNOWN_CUSTOMER: &str = "Unknown Customer";
pub const DATE_TBD: &str = "date TBD";

const TITLE_SEPARATORS: [&str; 5] = [" - ", " – ", " — ", " | ", ": "];

/// Labels the CRM appends to meeting titles; never part of a customer name.
const TITLE_LABELS: [&str; 9] = [
    "estimate",
    "free estimate",
    "appointment",
    "appt",
    "inspection",
    "consultation",
    "consult",
    "meeting",
    "follow up",
];

#[derive(Debug, Clone, Copy)]
pub struct MessageFormatter {
    display_tz: Tz,
}

impl Default for MessageFormatter {
    fn default() -> Self {
        Self::new(chrono_tz::America::New_York)
    }
}

impl MessageFormatter {
    pub fn new(display_tz: Tz) -> Self {
        Self { display_tz }
    }

    pub fn display_tz(&self) -> Tz {
        self.display_tz
    }

    /// Single-line notification for a newly created appointment.
    ///
    /// `lead_setter` is the resolved name of whoever set the appointment;
    /// the calendar-slot owner on the record is deliberately not used.
    pub fn appointment_message(&self, meeting: &MeetingRecord, lead_setter: Option<&str>) -> String {
        let staff = lead_setter
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_CSR);
        let customer = customer_name(meeting);
        let when = meeting
            .start_time
            .map(|t| self.format_instant(t))
            .unwrap_or_else(|| DATE_TBD.to_string());

        let mut line = format!("New appointment set by {staff} for {customer} on {when}");
        if let Some(label) = non_blank(meeting.meeting_type_label.as_deref()) {
            line.push_str(&format!(" [{label}]"));
        }
        if let Some(location) = non_blank(meeting.location.as_deref()) {
            line.push_str(&format!(" | Location: {location}"));
        }
        line
    }

    /// Long month, day, year and a 12-hour clock, e.g. `October 20, 2026 at 10:00 AM`.
    pub fn format_instant(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.display_tz)
            .format("%B %-d, %Y at %-I:%M %p")
            .to_string()
    }
}

/// Customer display name: both client name parts, else the cleaned title,
/// else whichever single name part exists.
pub fn customer_name(meeting: &MeetingRecord) -> String {
    let first = non_blank(meeting.client_first_name.as_deref());
    let last = non_blank(meeting.client_last_name.as_deref());
    if let (Some(first), Some(last)) = (first, last) {
        return format!("{first} {last}");
    }
    meeting
        .title
        .as_deref()
        .and_then(customer_name_from_title)
        .or_else(|| join_name(first, last))
        .unwrap_or_else(|| UNKNOWN_CUSTOMER.to_string())
}

/// Strips CRM-appended labels and separators from a meeting title.
///
/// `"Jane Doe - Estimate"` and `"Estimate: Jane Doe"` both yield `"Jane Doe"`.
pub fn customer_name_from_title(title: &str) -> Option<String> {
    let mut segments = vec![title.trim()];
    for separator in TITLE_SEPARATORS {
        segments = segments
            .into_iter()
            .flat_map(|segment| segment.split(separator))
            .map(str::trim)
            .collect();
    }

    segments
        .into_iter()
        .map(strip_parenthetical)
        .map(strip_trailing_label)
        .find(|segment| !segment.is_empty() && !is_label(segment))
        .map(ToString::to_string)
}

fn strip_parenthetical(segment: &str) -> &str {
    match (segment.rfind('('), segment.ends_with(')')) {
        (Some(open), true) => segment[..open].trim_end(),
        _ => segment,
    }
}

fn strip_trailing_label(segment: &str) -> &str {
    let lower = segment.to_ascii_lowercase();
    for label in TITLE_LABELS {
        if lower.len() > label.len() && lower.ends_with(label) {
            let cut = segment.len() - label.len();
            if segment[..cut].ends_with(' ') {
                return segment[..cut].trim_end_matches([' ', ',', '-']);
            }
        }
    }
    segment
}

fn is_label(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    TITLE_LABELS.iter().any(|label| lower == *label)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
