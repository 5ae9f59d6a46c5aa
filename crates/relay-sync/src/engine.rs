use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, Duration, Utc};
use relay_adapters::{DeliveryOutcome, MeetingSource, NotificationSink, PartySource};
use relay_core::{MeetingId, MeetingRecord, MessageFormatter, TimeWindow};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::roster::{PartyResolverCache, DEFAULT_ROSTER_TTL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Total forward span queried each cycle.
    pub horizon: Duration,
    /// Span of a single meeting-source call.
    pub chunk: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            horizon: Duration::days(120),
            chunk: Duration::days(30),
        }
    }
}

/// Splits `[origin, origin + horizon)` into consecutive half-open windows of
/// at most `chunk`. The last window is truncated to the horizon end.
pub fn plan_windows(origin: DateTime<Utc>, horizon: Duration, chunk: Duration) -> Vec<TimeWindow> {
    if horizon <= Duration::zero() || chunk <= Duration::zero() {
        return Vec::new();
    }
    let end = origin + horizon;
    let mut windows = Vec::new();
    let mut start = origin;
    while start < end {
        let stop = (start + chunk).min(end);
        windows.push(TimeWindow::new(start, stop));
        start = stop;
    }
    windows
}

/// Ids already notified during this process's lifetime.
#[derive(Debug, Default, Clone)]
pub struct NotifiedSet {
    ids: HashSet<MeetingId>,
}

impl NotifiedSet {
    pub fn contains(&self, id: MeetingId) -> bool {
        self.ids.contains(&id)
    }

    pub fn insert(&mut self, id: MeetingId) -> bool {
        self.ids.insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Keeps meetings created at or after `cutoff` that were never notified,
/// in discovery order. Repeats of an id within one batch are dropped.
pub fn select_new_meetings(
    meetings: Vec<MeetingRecord>,
    cutoff: DateTime<Utc>,
    notified: &NotifiedSet,
) -> Vec<MeetingRecord> {
    let mut seen = HashSet::new();
    meetings
        .into_iter()
        .filter(|meeting| seen.insert(meeting.id))
        .filter(|meeting| meeting.created_since(cutoff) && !notified.contains(meeting.id))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingOutcome {
    Delivered,
    Skipped,
    /// Delivery failed; the id stays out of the dedup set.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub windows: usize,
    pub fetched: usize,
    pub candidates: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// State only a running cycle touches.
pub struct CycleState {
    pub roster: PartyResolverCache,
}

/// Counters published at every commit point; reading them never waits on
/// an in-flight cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub notified: usize,
    pub roster_size: usize,
    pub roster_refreshed_at: Option<DateTime<Utc>>,
}

/// One poll cycle: chunked fetch, new-today filter, then resolve, format,
/// deliver and commit for each surviving meeting in discovery order.
///
/// Cycle state sits behind an async mutex held for the whole cycle, so at
/// most one cycle runs at a time. The dedup set and the published snapshot
/// live outside it and are only locked for the duration of a read or insert.
pub struct PollEngine {
    meetings: Arc<dyn MeetingSource>,
    sink: Arc<dyn NotificationSink>,
    formatter: MessageFormatter,
    clock: Arc<dyn Clock>,
    settings: PollSettings,
    state: Mutex<CycleState>,
    notified: RwLock<NotifiedSet>,
    published: watch::Sender<EngineSnapshot>,
}

impl PollEngine {
    pub fn new(
        meetings: Arc<dyn MeetingSource>,
        parties: Arc<dyn PartySource>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            meetings,
            sink,
            formatter: MessageFormatter::default(),
            clock: Arc::new(SystemClock),
            settings: PollSettings::default(),
            state: Mutex::new(CycleState {
                roster: PartyResolverCache::new(parties, Duration::seconds(DEFAULT_ROSTER_TTL_SECS)),
            }),
            notified: RwLock::new(NotifiedSet::default()),
            published: watch::Sender::new(EngineSnapshot::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_formatter(mut self, formatter: MessageFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_roster_ttl(mut self, ttl: Duration) -> Self {
        self.state.get_mut().roster.set_ttl(ttl);
        self
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Counters as of the last commit point.
    pub fn snapshot(&self) -> EngineSnapshot {
        *self.published.borrow()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.published.subscribe()
    }

    pub fn is_notified(&self, id: MeetingId) -> bool {
        self.read_notified().contains(id)
    }

    fn read_notified(&self) -> RwLockReadGuard<'_, NotifiedSet> {
        self.notified.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, id: MeetingId) {
        self.notified
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    fn publish(&self, roster: &PartyResolverCache) {
        let snapshot = EngineSnapshot {
            notified: self.read_notified().len(),
            roster_size: roster.len(),
            roster_refreshed_at: roster.last_refresh(),
        };
        self.published.send_if_modified(|current| {
            let changed = *current != snapshot;
            *current = snapshot;
            changed
        });
    }

    /// Runs a cycle, waiting for any in-flight cycle to finish first.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut state = self.state.lock().await;
        self.cycle(&mut state).await
    }

    /// Runs a cycle unless one is already in flight, in which case this
    /// tick is skipped.
    pub async fn try_run_cycle(&self) -> Option<CycleReport> {
        let Ok(mut state) = self.state.try_lock() else {
            warn!("previous poll cycle still running; skipping this tick");
            return None;
        };
        Some(self.cycle(&mut state).await)
    }

    async fn cycle(&self, state: &mut CycleState) -> CycleReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %run_id);
        async move {
            let started_at = self.clock.now();
            let cutoff = self.clock.day_start(started_at);

            let windows = plan_windows(cutoff, self.settings.horizon, self.settings.chunk);
            let mut fetched = Vec::new();
            for window in &windows {
                let batch = self.meetings.fetch_meetings(window).await;
                debug!(start = %window.start, end = %window.end, count = batch.len(), "window fetched");
                fetched.extend(batch);
            }
            let fetched_count = fetched.len();

            let candidates = {
                let notified = self.read_notified();
                select_new_meetings(fetched, cutoff, &notified)
            };
            let mut report = CycleReport {
                run_id,
                started_at,
                finished_at: started_at,
                cutoff,
                windows: windows.len(),
                fetched: fetched_count,
                candidates: candidates.len(),
                delivered: 0,
                skipped: 0,
                failed: 0,
            };

            for meeting in &candidates {
                match self.notify_one(state, meeting).await {
                    MeetingOutcome::Delivered => report.delivered += 1,
                    MeetingOutcome::Skipped => report.skipped += 1,
                    MeetingOutcome::Failed => report.failed += 1,
                }
            }

            self.publish(&state.roster);
            report.finished_at = self.clock.now();
            info!(
                windows = report.windows,
                fetched = report.fetched,
                candidates = report.candidates,
                delivered = report.delivered,
                skipped = report.skipped,
                failed = report.failed,
                "poll cycle complete"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Resolve, format, deliver, then commit the id. The commit step is
    /// skipped when delivery fails so the meeting is retried next cycle.
    async fn notify_one(&self, state: &mut CycleState, meeting: &MeetingRecord) -> MeetingOutcome {
        let now = self.clock.now();
        let lead_setter = state.roster.resolve(meeting.client_id, now).await;
        self.publish(&state.roster);
        let text = self.formatter.appointment_message(meeting, lead_setter.as_deref());

        let outcome = match self.sink.deliver(&text).await {
            Ok(DeliveryOutcome::Delivered) => MeetingOutcome::Delivered,
            Ok(DeliveryOutcome::Skipped) => MeetingOutcome::Skipped,
            Err(err) => {
                error!(
                    meeting_id = meeting.id,
                    error = %err,
                    "delivery failed; meeting will be retried next cycle"
                );
                return MeetingOutcome::Failed;
            }
        };

        self.commit(meeting.id);
        self.publish(&state.roster);
        info!(meeting_id = meeting.id, outcome = ?outcome, "meeting notified");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 4, 0, 0).unwrap()
    }

    #[test]
    fn horizon_of_120_days_in_30_day_chunks_is_four_adjacent_windows() {
        let windows = plan_windows(origin(), Duration::days(120), Duration::days(30));
        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0].start, origin());
        assert_eq!(windows[3].end, origin() + Duration::days(120));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!(windows.iter().all(|w| w.span() == Duration::days(30)));
    }

    #[test]
    fn last_window_is_truncated_to_horizon() {
        let windows = plan_windows(origin(), Duration::days(100), Duration::days(31));
        assert_eq!(windows.len(), 4);
        assert_eq!(windows[3].span(), Duration::days(7));
        assert_eq!(windows[3].end, origin() + Duration::days(100));
    }

    #[test]
    fn degenerate_spans_plan_nothing() {
        assert!(plan_windows(origin(), Duration::zero(), Duration::days(30)).is_empty());
        assert!(plan_windows(origin(), Duration::days(30), Duration::zero()).is_empty());
    }

    fn created(id: MeetingId, at: DateTime<Utc>) -> MeetingRecord {
        let mut meeting = MeetingRecord::new(id);
        meeting.created_time = Some(at);
        meeting
    }

    #[test]
    fn filter_uses_creation_time_against_cutoff() {
        let cutoff = origin();
        let meetings = vec![
            created(1, cutoff - Duration::minutes(1)),
            created(2, cutoff),
            MeetingRecord::new(3),
        ];
        let ids = select_new_meetings(meetings, cutoff, &NotifiedSet::default())
            .into_iter()
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn filter_ignores_start_time() {
        let cutoff = origin();
        let mut far_future = created(1, cutoff + Duration::hours(5));
        far_future.start_time = Some(cutoff + Duration::days(300));
        let mut today_but_old = created(2, cutoff - Duration::days(1));
        today_but_old.start_time = Some(cutoff + Duration::hours(10));

        let kept = select_new_meetings(vec![far_future, today_but_old], cutoff, &NotifiedSet::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, 1);
    }

    #[test]
    fn filter_drops_notified_and_repeated_ids_keeping_order() {
        let cutoff = origin();
        let mut notified = NotifiedSet::default();
        notified.insert(2);
        let meetings = vec![
            created(3, cutoff),
            created(2, cutoff),
            created(1, cutoff),
            created(3, cutoff + Duration::minutes(1)),
        ];
        let ids = select_new_meetings(meetings, cutoff, &notified)
            .into_iter()
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 1]);
    }
}
