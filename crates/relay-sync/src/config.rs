use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use relay_adapters::{ChatSinkConfig, CrmApiConfig};
use relay_core::MessageFormatter;
use relay_http::HttpClientConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::PollSettings;

/// Largest span the CRM meeting endpoint accepts in one call.
pub const MAX_CHUNK_DAYS: u32 = 31;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: `{value}`")]
    Invalid { key: &'static str, value: String },
    #[error("`{key}` must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub crm_base_url: String,
    pub crm_api_key: Option<SecretString>,
    pub chat_post_url: String,
    pub chat_bot_id: Option<String>,
    pub chat_sender_name: String,
    pub poll_interval_secs: u64,
    pub horizon_days: u32,
    pub chunk_days: u32,
    pub roster_ttl_secs: u64,
    pub meeting_page_limit: u32,
    pub roster_page_limit: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub display_timezone: Tz,
    pub poller_enabled: bool,
    pub web_port: u16,
    pub log_format: LogFormat,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let poll_interval_secs = parse_or(&get, "POLL_INTERVAL_SECS", 60u64)?;
        let horizon_days = parse_or(&get, "POLL_HORIZON_DAYS", 120u32)?;
        let chunk_days = parse_or(&get, "POLL_CHUNK_DAYS", 30u32)?;
        ensure_range("POLL_INTERVAL_SECS", poll_interval_secs, 1, u64::MAX)?;
        ensure_range("POLL_HORIZON_DAYS", u64::from(horizon_days), 1, 3650)?;
        ensure_range("POLL_CHUNK_DAYS", u64::from(chunk_days), 1, u64::from(MAX_CHUNK_DAYS))?;

        let display_timezone = match get("DISPLAY_TIMEZONE") {
            Some(raw) => raw.parse::<Tz>().map_err(|_| ConfigError::Invalid {
                key: "DISPLAY_TIMEZONE",
                value: raw.clone(),
            })?,
            None => chrono_tz::America::New_York,
        };
        let log_format = match get("RELAY_LOG_FORMAT") {
            Some(raw) => raw.parse::<LogFormat>().map_err(|_| ConfigError::Invalid {
                key: "RELAY_LOG_FORMAT",
                value: raw.clone(),
            })?,
            None => LogFormat::default(),
        };

        Ok(Self {
            crm_base_url: get("CRM_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080/api/v1".to_string()),
            crm_api_key: get("CRM_API_KEY").map(SecretString::from),
            chat_post_url: get("CHAT_POST_URL")
                .unwrap_or_else(|| "https://api.groupme.com/v3/bots/post".to_string()),
            chat_bot_id: get("CHAT_BOT_ID"),
            chat_sender_name: get("CHAT_SENDER_NAME").unwrap_or_else(|| "CRM Relay".to_string()),
            poll_interval_secs,
            horizon_days,
            chunk_days,
            roster_ttl_secs: parse_or(&get, "ROSTER_TTL_SECS", 300u64)?,
            meeting_page_limit: parse_or(&get, "MEETING_PAGE_LIMIT", 500u32)?,
            roster_page_limit: parse_or(&get, "ROSTER_PAGE_LIMIT", 5000u32)?,
            http_timeout_secs: parse_or(&get, "HTTP_TIMEOUT_SECS", 20u64)?,
            user_agent: get("RELAY_USER_AGENT").unwrap_or_else(|| "crm-relay/0.1".to_string()),
            display_timezone,
            poller_enabled: get("POLLER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(true),
            web_port: parse_or(&get, "RELAY_WEB_PORT", 8000u16)?,
            log_format,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn crm_api_config(&self) -> CrmApiConfig {
        CrmApiConfig {
            base_url: self.crm_base_url.clone(),
            api_key: self.crm_api_key.clone(),
            meeting_page_limit: self.meeting_page_limit,
            roster_page_limit: self.roster_page_limit,
        }
    }

    pub fn chat_sink_config(&self) -> ChatSinkConfig {
        ChatSinkConfig {
            post_url: self.chat_post_url.clone(),
            bot_id: self.chat_bot_id.clone(),
            sender_name: self.chat_sender_name.clone(),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            horizon: chrono::Duration::days(i64::from(self.horizon_days)),
            chunk: chrono::Duration::days(i64::from(self.chunk_days)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn roster_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.roster_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn formatter(&self) -> MessageFormatter {
        MessageFormatter::new(self.display_timezone)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn ensure_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { key, value, min, max })
    }
}
