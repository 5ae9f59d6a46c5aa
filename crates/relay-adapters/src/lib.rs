//! CRM and chat adapter contracts plus their HTTP and fixture implementations.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::SecondsFormat;
use relay_core::{MeetingRecord, PartyRecord, TimeWindow};
use relay_http::{FetchError, HttpFetcher};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "relay-adapters";

pub const API_KEY_HEADER: &str = "x-api-key";
pub const MEETINGS_FIXTURE: &str = "meetings.json";
pub const ROSTER_FIXTURE: &str = "clients.json";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("crm rejected the request: {0}")]
    Rejected(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("fixture error: {0}")]
    Fixture(#[from] anyhow::Error),
}

/// Source of scheduled meetings for a start-time window.
///
/// Implementations never fail outward: a broken call is logged and yields no
/// records, so one bad window cannot abort the rest of a poll cycle.
#[async_trait]
pub trait MeetingSource: Send + Sync {
    async fn fetch_meetings(&self, window: &TimeWindow) -> Vec<MeetingRecord>;
}

/// Source of the full client/opportunity roster.
#[async_trait]
pub trait PartySource: Send + Sync {
    async fn fetch_roster(&self) -> Result<Vec<PartyRecord>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// The sink has no destination configured; nothing was sent.
    Skipped,
}

/// Delivers one formatted line of text to the chat channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<DeliveryOutcome, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiErrorEntry {
    Text(String),
    Detailed {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

impl fmt::Display for ApiErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text}"),
            Self::Detailed {
                message,
                code: Some(code),
            } => write!(f, "{code}: {message}"),
            Self::Detailed { message, code: None } => write!(f, "{message}"),
        }
    }
}

/// Response envelope of the meeting list endpoint.
///
/// The roster endpoint has no envelope and returns a bare array.
#[derive(Debug, Clone, Deserialize)]
pub struct MeetingEnvelope {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<MeetingRecord>,
    #[serde(default)]
    pub errors: Vec<ApiErrorEntry>,
}

impl MeetingEnvelope {
    pub fn into_meetings(self) -> Result<Vec<MeetingRecord>, AdapterError> {
        if self.success {
            return Ok(self.data);
        }
        let detail = if self.errors.is_empty() {
            "no error detail".to_string()
        } else {
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };
        Err(AdapterError::Rejected(detail))
    }
}

#[derive(Debug, Clone)]
pub struct CrmApiConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub meeting_page_limit: u32,
    pub roster_page_limit: u32,
}

/// HTTP client for the CRM meeting list and client roster.
#[derive(Debug, Clone)]
pub struct CrmClient {
    http: Arc<HttpFetcher>,
    config: CrmApiConfig,
}

impl CrmClient {
    pub fn new(http: Arc<HttpFetcher>, config: CrmApiConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn api_key(&self) -> Result<&str, AdapterError> {
        self.config
            .api_key
            .as_ref()
            .map(|key| key.expose_secret())
            .filter(|key| !key.trim().is_empty())
            .ok_or(AdapterError::NotConfigured("CRM_API_KEY"))
    }

    async fn request_meetings(&self, window: &TimeWindow) -> Result<Vec<MeetingRecord>, AdapterError> {
        let key = self.api_key()?;
        let url = self.endpoint("meetings");
        let query = [
            ("start", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("limit", self.config.meeting_page_limit.to_string()),
        ];
        let envelope: MeetingEnvelope = self
            .http
            .get_json(&url, &query, &[(API_KEY_HEADER, key)])
            .await?;
        envelope.into_meetings()
    }
}

#[async_trait]
impl MeetingSource for CrmClient {
    async fn fetch_meetings(&self, window: &TimeWindow) -> Vec<MeetingRecord> {
        match self.request_meetings(window).await {
            Ok(meetings) => {
                if meetings.len() as u64 >= u64::from(self.config.meeting_page_limit) {
                    warn!(
                        start = %window.start,
                        end = %window.end,
                        limit = self.config.meeting_page_limit,
                        "meeting page reached the result cap; later records in this window may be missing"
                    );
                }
                debug!(start = %window.start, end = %window.end, count = meetings.len(), "fetched meetings");
                meetings
            }
            Err(err) => {
                warn!(
                    start = %window.start,
                    end = %window.end,
                    status = err_status(&err),
                    error = %err,
                    "meeting fetch failed; window yields no records this cycle"
                );
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl PartySource for CrmClient {
    async fn fetch_roster(&self) -> Result<Vec<PartyRecord>, AdapterError> {
        let key = self.api_key()?;
        let url = self.endpoint("clients");
        let query = [("limit", self.config.roster_page_limit.to_string())];
        let roster: Vec<PartyRecord> = self
            .http
            .get_json(&url, &query, &[(API_KEY_HEADER, key)])
            .await?;
        Ok(roster)
    }
}

fn err_status(err: &AdapterError) -> u16 {
    match err {
        AdapterError::Fetch(fetch) => fetch.status().unwrap_or_default(),
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct ChatSinkConfig {
    pub post_url: String,
    pub bot_id: Option<String>,
    pub sender_name: String,
}

#[derive(Debug, Serialize)]
struct ChatPost<'a> {
    bot_id: &'a str,
    name: &'a str,
    text: &'a str,
}

/// Posts messages through a chat bot endpoint.
#[derive(Debug, Clone)]
pub struct ChatBotSink {
    http: Arc<HttpFetcher>,
    config: ChatSinkConfig,
}

impl ChatBotSink {
    pub fn new(http: Arc<HttpFetcher>, config: ChatSinkConfig) -> Self {
        Self { http, config }
    }

    pub fn is_configured(&self) -> bool {
        self.bot_id().is_some()
    }

    fn bot_id(&self) -> Option<&str> {
        self.config
            .bot_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[async_trait]
impl NotificationSink for ChatBotSink {
    async fn deliver(&self, text: &str) -> Result<DeliveryOutcome, AdapterError> {
        let Some(bot_id) = self.bot_id() else {
            warn!(text, "chat bot id not configured; skipping delivery");
            return Ok(DeliveryOutcome::Skipped);
        };
        let body = ChatPost {
            bot_id,
            name: &self.config.sender_name,
            text,
        };
        self.http.post_json(&self.config.post_url, &body).await?;
        info!(chars = text.len(), "chat message delivered");
        Ok(DeliveryOutcome::Delivered)
    }
}

/// Sink that only logs; used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, text: &str) -> Result<DeliveryOutcome, AdapterError> {
        info!(text, "dry run; message not sent");
        Ok(DeliveryOutcome::Skipped)
    }
}

/// CRM backed by captured JSON responses on disk.
///
/// `meetings.json` holds a meeting envelope and `clients.json` a bare roster
/// array, exactly as the live endpoints return them.
#[derive(Debug, Clone, Default)]
pub struct FixtureCrm {
    meetings: Vec<MeetingRecord>,
    roster: Vec<PartyRecord>,
}

impl FixtureCrm {
    pub fn new(meetings: Vec<MeetingRecord>, roster: Vec<PartyRecord>) -> Self {
        Self { meetings, roster }
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let dir = dir.as_ref();
        let meetings = load_meeting_envelope(dir.join(MEETINGS_FIXTURE))?.into_meetings()?;
        let roster = load_roster(dir.join(ROSTER_FIXTURE))?;
        Ok(Self { meetings, roster })
    }

    pub fn meetings(&self) -> &[MeetingRecord] {
        &self.meetings
    }

    pub fn roster(&self) -> &[PartyRecord] {
        &self.roster
    }
}

#[async_trait]
impl MeetingSource for FixtureCrm {
    async fn fetch_meetings(&self, window: &TimeWindow) -> Vec<MeetingRecord> {
        self.meetings
            .iter()
            .filter(|m| m.start_time.is_some_and(|start| window.contains(start)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PartySource for FixtureCrm {
    async fn fetch_roster(&self) -> Result<Vec<PartyRecord>, AdapterError> {
        Ok(self.roster.clone())
    }
}

pub fn load_meeting_envelope(path: impl AsRef<Path>) -> Result<MeetingEnvelope, AdapterError> {
    Ok(read_json_file(path)?)
}

pub fn load_roster(path: impl AsRef<Path>) -> Result<Vec<PartyRecord>, AdapterError> {
    Ok(read_json_file(path)?)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use chrono::{TimeZone, Utc};
    use relay_http::HttpClientConfig;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/crm")
            .canonicalize()
            .expect("fixtures dir")
    }

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client"))
    }

    #[test]
    fn meeting_envelope_fixture_parses() {
        let envelope = load_meeting_envelope(fixtures_dir().join(MEETINGS_FIXTURE)).unwrap();
        assert!(envelope.success);
        let meetings = envelope.into_meetings().unwrap();
        assert_eq!(meetings.len(), 4);

        let first = &meetings[0];
        assert_eq!(first.id, 42);
        assert_eq!(first.client_id, Some(7));
        assert_eq!(first.opportunity_id, Some(9001));
        assert_eq!(first.title.as_deref(), Some("Jane Doe - Estimate"));
        assert!(first.client_first_name.is_none());
    }

    #[test]
    fn roster_fixture_is_a_bare_array() {
        let roster = load_roster(fixtures_dir().join(ROSTER_FIXTURE)).unwrap();
        let party = roster.iter().find(|p| p.id == 7).unwrap();
        assert_eq!(party.lead_setter_name().as_deref(), Some("Sam Lee"));
        assert!(roster.iter().any(|p| p.lead_setter_name().is_none()));
    }

    #[test]
    fn rejected_envelope_carries_error_list() {
        let envelope: MeetingEnvelope = serde_json::from_str(
            r#"{"success": false, "errors": ["range too large", {"message": "bad key", "code": "AUTH"}]}"#,
        )
        .unwrap();
        let err = envelope.into_meetings().unwrap_err();
        assert_eq!(
            err.to_string(),
            "crm rejected the request: range too large; AUTH: bad key"
        );
    }

    #[test]
    fn roster_envelope_shape_is_not_accepted_as_roster() {
        let parsed = serde_json::from_str::<Vec<PartyRecord>>(r#"{"success": true, "data": []}"#);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn fixture_crm_filters_meetings_by_window() {
        let crm = FixtureCrm::load(fixtures_dir()).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + chrono::Duration::days(30));
        let ids = crm
            .fetch_meetings(&window)
            .await
            .into_iter()
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![42, 43, 44]);
    }

    #[tokio::test]
    async fn crm_client_without_key_returns_empty_and_errors_on_roster() {
        let client = CrmClient::new(
            http(),
            CrmApiConfig {
                base_url: "http://127.0.0.1:9/api/".into(),
                api_key: None,
                meeting_page_limit: 10,
                roster_page_limit: 10,
            },
        );
        assert_eq!(client.endpoint("meetings"), "http://127.0.0.1:9/api/meetings");

        let start = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + chrono::Duration::days(1));
        assert!(client.fetch_meetings(&window).await.is_empty());
        assert!(matches!(
            client.fetch_roster().await,
            Err(AdapterError::NotConfigured("CRM_API_KEY"))
        ));
    }

    #[tokio::test]
    async fn unreachable_crm_yields_empty_chunk() {
        let client = CrmClient::new(
            http(),
            CrmApiConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: Some("key".to_string().into()),
                meeting_page_limit: 10,
                roster_page_limit: 10,
            },
        );
        let start = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + chrono::Duration::days(1));
        assert!(client.fetch_meetings(&window).await.is_empty());
        assert!(client.fetch_roster().await.is_err());
    }

    #[tokio::test]
    async fn chat_sink_skips_without_bot_id() {
        let sink = ChatBotSink::new(
            http(),
            ChatSinkConfig {
                post_url: "http://127.0.0.1:9/bots/post".into(),
                bot_id: Some("  ".into()),
                sender_name: "CRM Relay".into(),
            },
        );
        assert!(!sink.is_configured());
        assert_eq!(sink.deliver("hello").await.unwrap(), DeliveryOutcome::Skipped);
    }

    #[tokio::test]
    async fn chat_sink_reports_transport_failure() {
        let sink = ChatBotSink::new(
            http(),
            ChatSinkConfig {
                post_url: "http://127.0.0.1:9/bots/post".into(),
                bot_id: Some("bot-123".into()),
                sender_name: "CRM Relay".into(),
            },
        );
        assert!(matches!(sink.deliver("hello").await, Err(AdapterError::Fetch(_))));
    }

    #[test]
    fn chat_post_body_shape() {
        let body = serde_json::to_value(ChatPost {
            bot_id: "bot-123",
            name: "CRM Relay",
            text: "hi",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"bot_id": "bot-123", "name": "CRM Relay", "text": "hi"}));
    }
}
