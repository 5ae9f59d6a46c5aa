//! Inbound CRM webhook events mapped to one-line chat messages.
//!
//! Payloads are loosely typed; every field is looked up by a list of
//! candidate keys and falls back to a placeholder.

use chrono::{DateTime, Utc};
use relay_core::format::DATE_TBD;
use relay_core::{MessageFormatter, UNKNOWN_CUSTOMER};
use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default, alias = "type")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    LeadCreated,
    AppointmentScheduled,
    ProjectUpdated,
    EstimateSent,
}

impl EventKind {
    /// Case-insensitive; `-`, `_` and `.` are interchangeable.
    pub fn parse(tag: &str) -> Option<Self> {
        let normalized = tag
            .trim()
            .to_ascii_lowercase()
            .replace(['-', '_'], ".");
        match normalized.as_str() {
            "lead.created" => Some(Self::LeadCreated),
            "appointment.scheduled" => Some(Self::AppointmentScheduled),
            "project.updated" => Some(Self::ProjectUpdated),
            "estimate.sent" => Some(Self::EstimateSent),
            _ => None,
        }
    }
}

pub fn event_message(kind: EventKind, data: &JsonValue, formatter: &MessageFormatter) -> String {
    match kind {
        EventKind::LeadCreated => {
            let mut line = format!("New lead: {}", contact_name(data));
            if let Some(source) = first_str(data, &["source", "leadSource", "lead_source"]) {
                line.push_str(&format!(" | Source: {source}"));
            }
            if let Some(phone) = first_str(data, &["phone", "phoneNumber", "phone_number"]) {
                line.push_str(&format!(" | Phone: {phone}"));
            }
            line
        }
        EventKind::AppointmentScheduled => {
            let when = first_str(data, &["startTime", "start_time", "start", "scheduledAt"])
                .map(|raw| match raw.parse::<DateTime<Utc>>() {
                    Ok(instant) => formatter.format_instant(instant),
                    Err(_) => raw.to_string(),
                })
                .unwrap_or_else(|| DATE_TBD.to_string());
            let mut line = format!("Appointment scheduled for {} on {when}", contact_name(data));
            if let Some(location) = first_str(data, &["location", "address"]) {
                line.push_str(&format!(" | Location: {location}"));
            }
            line
        }
        EventKind::ProjectUpdated => {
            let project = first_str(data, &["name", "projectName", "project_name", "title"])
                .map(str::to_string)
                .or_else(|| first_id(data, &["id", "projectId", "project_id"]).map(|id| format!("#{id}")))
                .unwrap_or_else(|| "(unnamed)".to_string());
            let status = first_str(data, &["status", "stage"]).unwrap_or("updated");
            format!("Project {project} is now {status}")
        }
        EventKind::EstimateSent => {
            let mut line = format!("Estimate sent to {}", contact_name(data));
            if let Some(total) = first_amount(data, &["total", "amount", "estimateTotal"]) {
                line.push_str(&format!(" for ${total:.2}"));
            }
            line
        }
    }
}

/// `name`, else first + last, else either part, else the placeholder.
fn contact_name(data: &JsonValue) -> String {
    if let Some(name) = first_str(data, &["name", "customerName", "customer_name", "clientName"]) {
        return name.to_string();
    }
    let first = first_str(data, &["firstName", "first_name"]);
    let last = first_str(data, &["lastName", "last_name"]);
    relay_core::join_name(first, last).unwrap_or_else(|| UNKNOWN_CUSTOMER.to_string())
}

fn first_str<'a>(data: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| data.get(*key)?.as_str())
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn first_id(data: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match data.get(*key)? {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

fn first_amount(data: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match data.get(*key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_start_matches('$').replace(',', "").parse().ok(),
        _ => None,
    })
}
