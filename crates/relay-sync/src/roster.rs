use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use relay_adapters::PartySource;
use relay_core::{PartyId, PartyRecord};
use tracing::{debug, info, warn};

pub const DEFAULT_ROSTER_TTL_SECS: i64 = 300;

/// Quiet period after a failed refresh before the source is asked again.
pub const ROSTER_RETRY_BACKOFF_SECS: i64 = 30;

/// Time-bounded cache of the CRM party roster, keyed by party id.
///
/// A refresh fetches the whole roster and replaces the map wholesale; a
/// failed refresh keeps serving the previous (possibly stale) map and holds
/// off further fetches for a short backoff, so an outage costs one timeout
/// per backoff period rather than one per meeting.
pub struct PartyResolverCache {
    source: Arc<dyn PartySource>,
    ttl: Duration,
    retry_backoff: Duration,
    parties: HashMap<PartyId, PartyRecord>,
    last_refresh: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

impl PartyResolverCache {
    pub fn new(source: Arc<dyn PartySource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            retry_backoff: Duration::seconds(ROSTER_RETRY_BACKOFF_SECS),
            parties: HashMap::new(),
            last_refresh: None,
            last_failure: None,
        }
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.last_failure
    }

    /// True once the TTL has elapsed, unless a refresh failed within the
    /// retry backoff.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let expired = match self.last_refresh {
            Some(last) => now - last >= self.ttl,
            None => true,
        };
        let backing_off = self
            .last_failure
            .is_some_and(|failed| now - failed < self.retry_backoff);
        expired && !backing_off
    }

    /// Re-fetches the roster. Returns false when the fetch failed and the
    /// cached map was left untouched.
    pub async fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        match self.source.fetch_roster().await {
            Ok(roster) => {
                self.parties = roster.into_iter().map(|party| (party.id, party)).collect();
                self.last_refresh = Some(now);
                self.last_failure = None;
                info!(parties = self.parties.len(), "party roster refreshed");
                true
            }
            Err(err) => {
                self.last_failure = Some(now);
                warn!(
                    error = %err,
                    cached = self.parties.len(),
                    "party roster refresh failed; resolving against cached roster"
                );
                false
            }
        }
    }

    /// Name of the staff member who set the appointment for `client_id`.
    ///
    /// Refreshes first when the TTL has elapsed. A missing id, an unknown id
    /// or nulled lead-setter fields all resolve to `None`.
    pub async fn resolve(&mut self, client_id: Option<PartyId>, now: DateTime<Utc>) -> Option<String> {
        if self.needs_refresh(now) {
            self.refresh(now).await;
        }
        let client_id = client_id?;
        let resolved = self
            .parties
            .get(&client_id)
            .and_then(PartyRecord::lead_setter_name);
        if resolved.is_none() {
            debug!(client_id, "no lead setter on roster for client");
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use relay_adapters::AdapterError;

    use super::*;

    #[derive(Default)]
    struct ScriptedRoster {
        roster: Mutex<Vec<PartyRecord>>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedRoster {
        fn with(parties: Vec<PartyRecord>) -> Arc<Self> {
            Arc::new(Self {
                roster: Mutex::new(parties),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PartySource for ScriptedRoster {
        async fn fetch_roster(&self) -> Result<Vec<PartyRecord>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AdapterError::Rejected("roster unavailable".into()));
            }
            Ok(self.roster.lock().unwrap().clone())
        }
    }

    fn party(id: PartyId, setter: Option<(&str, &str)>) -> PartyRecord {
        PartyRecord {
            id,
            first_name: Some("Client".into()),
            last_name: Some(id.to_string()),
            lead_setter_first_name: setter.map(|(f, _)| f.to_string()),
            lead_setter_last_name: setter.map(|(_, l)| l.to_string()),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 13, 0, 0).unwrap()
    }

    fn cache(source: Arc<ScriptedRoster>) -> PartyResolverCache {
        PartyResolverCache::new(source, Duration::seconds(DEFAULT_ROSTER_TTL_SECS))
    }

    #[tokio::test]
    async fn resolves_lead_setter_by_client_id() {
        let source = ScriptedRoster::with(vec![party(7, Some(("Sam", "Lee"))), party(9, None)]);
        let mut cache = cache(source.clone());

        assert_eq!(cache.resolve(Some(7), t0()).await.as_deref(), Some("Sam Lee"));
        assert_eq!(cache.resolve(Some(9), t0()).await, None);
        assert_eq!(cache.resolve(Some(404), t0()).await, None);
        assert_eq!(cache.resolve(None, t0()).await, None);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn ttl_boundary_controls_refetch() {
        let source = ScriptedRoster::with(vec![party(7, Some(("Sam", "Lee")))]);
        let mut cache = cache(source.clone());
        let ttl = Duration::seconds(DEFAULT_ROSTER_TTL_SECS);

        cache.resolve(Some(7), t0()).await;
        assert_eq!(source.calls(), 1);

        cache.resolve(Some(7), t0() + ttl - Duration::milliseconds(1)).await;
        assert_eq!(source.calls(), 1, "no refetch just before the TTL elapses");

        cache.resolve(Some(7), t0() + ttl + Duration::milliseconds(1)).await;
        assert_eq!(source.calls(), 2, "refetch just after the TTL elapses");
    }

    #[tokio::test]
    async fn refresh_replaces_roster_wholesale() {
        let source = ScriptedRoster::with(vec![party(7, Some(("Sam", "Lee"))), party(8, Some(("Riley", "Park")))]);
        let mut cache = cache(source.clone());
        cache.resolve(Some(7), t0()).await;
        assert_eq!(cache.len(), 2);

        *source.roster.lock().unwrap() = vec![party(7, Some(("Dana", "Cruz")))];
        let later = t0() + Duration::minutes(6);
        assert_eq!(cache.resolve(Some(7), later).await.as_deref(), Some("Dana Cruz"));
        assert_eq!(cache.resolve(Some(8), later).await, None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_roster() {
        let source = ScriptedRoster::with(vec![party(7, Some(("Sam", "Lee")))]);
        let mut cache = cache(source.clone());
        cache.resolve(Some(7), t0()).await;

        source.fail.store(true, Ordering::SeqCst);
        let later = t0() + Duration::minutes(10);
        assert_eq!(cache.resolve(Some(7), later).await.as_deref(), Some("Sam Lee"));
        assert_eq!(cache.last_refresh(), Some(t0()));
        assert_eq!(cache.last_failure(), Some(later));
        assert!(!cache.needs_refresh(later));
        assert!(cache.needs_refresh(later + Duration::seconds(ROSTER_RETRY_BACKOFF_SECS)));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn outage_is_retried_once_per_backoff_not_per_resolve() {
        let source = ScriptedRoster::with(vec![party(7, Some(("Sam", "Lee")))]);
        source.fail.store(true, Ordering::SeqCst);
        let mut cache = cache(source.clone());

        for offset in [0, 1, 5, 29] {
            assert_eq!(cache.resolve(Some(7), t0() + Duration::seconds(offset)).await, None);
        }
        assert_eq!(source.calls(), 1);

        source.fail.store(false, Ordering::SeqCst);
        let retry_at = t0() + Duration::seconds(ROSTER_RETRY_BACKOFF_SECS);
        assert_eq!(cache.resolve(Some(7), retry_at).await.as_deref(), Some("Sam Lee"));
        assert_eq!(source.calls(), 2);
        assert_eq!(cache.last_refresh(), Some(retry_at));
        assert!(cache.last_failure().is_none());
    }

    #[tokio::test]
    async fn first_refresh_failure_resolves_to_none() {
        let source = ScriptedRoster::with(vec![]);
        source.fail.store(true, Ordering::SeqCst);
        let mut cache = cache(source);
        assert_eq!(cache.resolve(Some(7), t0()).await, None);
        assert!(cache.is_empty());
        assert!(cache.last_refresh().is_none());
    }
}
