//! Poll cycle orchestration: config, clock, roster cache, cycle engine and
//! the interval scheduler that drives it.

pub mod clock;
pub mod config;
pub mod engine;
pub mod roster;
pub mod scheduler;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_adapters::{ChatBotSink, CrmClient, FixtureCrm, LogSink, MeetingSource, NotificationSink, PartySource};
use relay_http::HttpFetcher;

pub use clock::{midnight_cutoff, Clock, ManualClock, SystemClock};
pub use config::{ConfigError, LogFormat, RelayConfig, MAX_CHUNK_DAYS};
pub use engine::{
    plan_windows, select_new_meetings, CycleReport, EngineSnapshot, MeetingOutcome, NotifiedSet,
    PollEngine, PollSettings,
};
pub use roster::{PartyResolverCache, DEFAULT_ROSTER_TTL_SECS, ROSTER_RETRY_BACKOFF_SECS};
pub use scheduler::{run_guarded, PollScheduler, PollerState, SchedulerError};

pub const CRATE_NAME: &str = "relay-sync";

/// Everything a running relay needs, wired from one [`RelayConfig`].
pub struct RelayServices {
    pub config: RelayConfig,
    pub sink: Arc<dyn NotificationSink>,
    pub engine: Arc<PollEngine>,
    pub scheduler: Arc<PollScheduler>,
}

impl RelayServices {
    /// Live CRM client and chat bot sink sharing one HTTP client.
    pub fn from_config(config: RelayConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let crm = Arc::new(CrmClient::new(Arc::clone(&http), config.crm_api_config()));
        let sink = Arc::new(ChatBotSink::new(http, config.chat_sink_config()));
        Ok(Self::with_sources(config, crm.clone(), crm, sink))
    }

    pub fn with_sources(
        config: RelayConfig,
        meetings: Arc<dyn MeetingSource>,
        parties: Arc<dyn PartySource>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let engine = Arc::new(
            PollEngine::new(meetings, parties, Arc::clone(&sink))
                .with_formatter(config.formatter())
                .with_settings(config.poll_settings())
                .with_roster_ttl(config.roster_ttl()),
        );
        let scheduler = Arc::new(PollScheduler::new(Arc::clone(&engine), config.poll_interval()));
        Self {
            config,
            sink,
            engine,
            scheduler,
        }
    }
}

/// Runs a single poll cycle against an already loaded configuration.
///
/// With `fixtures`, meetings and the roster come from captured JSON files
/// instead of the CRM. With `dry_run`, messages are logged instead of posted.
pub async fn run_poll_once(config: RelayConfig, fixtures: Option<&Path>, dry_run: bool) -> Result<CycleReport> {
    let services = match fixtures {
        Some(dir) => {
            let crm = Arc::new(
                FixtureCrm::load(dir).with_context(|| format!("loading fixtures from {}", dir.display()))?,
            );
            let sink: Arc<dyn NotificationSink> = if dry_run {
                Arc::new(LogSink)
            } else {
                let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
                Arc::new(ChatBotSink::new(http, config.chat_sink_config()))
            };
            RelayServices::with_sources(config, crm.clone(), crm, sink)
        }
        None if dry_run => {
            let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
            let crm = Arc::new(CrmClient::new(http, config.crm_api_config()));
            RelayServices::with_sources(config, crm.clone(), crm, Arc::new(LogSink))
        }
        None => RelayServices::from_config(config)?,
    };
    Ok(services.engine.run_cycle().await)
}

/// [`run_poll_once`] with configuration read from the environment.
pub async fn run_poll_once_from_env(fixtures: Option<&Path>, dry_run: bool) -> Result<CycleReport> {
    let config = RelayConfig::from_env().context("loading relay configuration")?;
    run_poll_once(config, fixtures, dry_run).await
}
