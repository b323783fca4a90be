use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use crate::cache_manager::CacheHandle;
use crate::config::OverlapPolicy;
use crate::detector::{self, CycleReport, Policy};
use crate::notify::Notifier;
use crate::unifi::SnapshotSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollerState {
    NotStarted,
    Seeding,
    Polling,
    Stopped,
}

/// Drives evaluation cycles: one silent seed run, then one cycle per tick.
#[derive(Clone)]
pub struct Poller {
    source: Arc<dyn SnapshotSource>,
    cache: CacheHandle,
    notifier: Notifier,
    policy: Policy,
    state: Arc<watch::Sender<PollerState>>,
    busy: Arc<AtomicBool>,
    cycles: TaskTracker,
}

impl Poller {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        cache: CacheHandle,
        notifier: Notifier,
        policy: Policy,
    ) -> (Self, watch::Receiver<PollerState>) {
        let (state_tx, state_rx) = watch::channel(PollerState::NotStarted);
        let poller = Self {
            source,
            cache,
            notifier,
            policy,
            state: Arc::new(state_tx),
            busy: Arc::new(AtomicBool::new(false)),
            cycles: TaskTracker::new(),
        };
        (poller, state_rx)
    }

    /// Establish the baseline without announcing anyone
    pub async fn seed(&self) -> Option<CycleReport> {
        self.set_state(PollerState::Seeding);
        let report = self.cycle(true).await;
        if report.is_none() {
            tracing::warn!("Seed run failed; clients seen on the first poll will be announced");
        }
        report
    }

    /// Fetch one snapshot, publish a heartbeat and classify it.
    /// Returns `None` when the fetch failed and the cycle was skipped.
    pub async fn cycle(&self, seeding: bool) -> Option<CycleReport> {
        let snapshot = match self.source.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Failed to fetch clients: {}", e);
                return None;
            }
        };

        let now = Utc::now();
        self.notifier.heartbeat(now, snapshot.len()).await;

        let report =
            detector::evaluate(&snapshot, now, &self.cache, self.policy, seeding, &self.notifier)
                .await;
        tracing::debug!(
            seeding,
            discovered = report.discovered,
            refreshed = report.refreshed,
            evicted = report.evicted,
            ignored = report.ignored,
            invalid = report.invalid,
            expired = report.expired,
            "Evaluated clients"
        );
        Some(report)
    }

    /// Spawn a cycle every `period` until `cancel` fires, then wait for
    /// running cycles and pending notifications.
    pub async fn run(&self, period: Duration, overlap: OverlapPolicy, cancel: CancellationToken) {
        self.set_state(PollerState::Polling);

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.spawn_cycle(overlap),
                _ = cancel.cancelled() => {
                    tracing::info!("Poller shutting down");
                    break;
                }
            }
        }

        self.cycles.close();
        self.cycles.wait().await;
        self.notifier.drain().await;
        self.set_state(PollerState::Stopped);
    }

    fn spawn_cycle(&self, overlap: OverlapPolicy) {
        let exclusive = overlap == OverlapPolicy::SkipIfBusy;
        if exclusive && self.busy.swap(true, Ordering::AcqRel) {
            tracing::debug!("Previous cycle still running; skipping tick");
            return;
        }

        let guard = exclusive.then(|| BusyGuard(self.busy.clone()));
        let poller = self.clone();
        self.cycles.spawn(async move {
            let _guard = guard;
            poller.cycle(false).await;
        });
    }

    fn set_state(&self, state: PollerState) {
        tracing::info!(?state, "Poller state changed");
        self.state.send_replace(state);
    }
}

/// Clears the busy flag when the cycle task ends, including by panic
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::cache::store::PresenceCache;
    use crate::config::LifespanBoundary;
    use crate::error::FetchError;
    use crate::notify::testing::{test_target, RecordingPublisher, StalledPublisher};
    use crate::notify::Publisher;
    use crate::unifi::station::Station;
    use crate::unifi::Observation;
    use shared::types::MacAddress;
    use super::*;

    /// Source replaying scripted fetch results, then repeating `fallback`
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<Station>, FetchError>>>,
        fallback: Vec<Station>,
        delay: Option<Duration>,
        fetches: AtomicUsize,
        /// Panic on the next fetch
        panic_once: AtomicBool,
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self) -> Result<Vec<Observation>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.panic_once.swap(false, Ordering::SeqCst) {
                panic!("source blew up");
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            let stations = next.unwrap_or_else(|| Ok(self.fallback.clone()))?;
            Ok(stations.into_iter().map(Ok).collect())
        }
    }

    fn fresh_station(last_octet: u8) -> Station {
        Station {
            mac: Some(format!("02:00:00:00:00:{last_octet:02x}")),
            hostname: Some(format!("host-{last_octet}")),
            last_seen: Some(Utc::now().timestamp()),
            ..Station::default()
        }
    }

    fn build(source: ScriptedSource) -> (Poller, Arc<RecordingPublisher>, Arc<ScriptedSource>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let (poller, source) = build_with(source, publisher.clone());
        (poller, publisher, source)
    }

    fn build_with(
        source: ScriptedSource,
        publisher: Arc<dyn Publisher>,
    ) -> (Poller, Arc<ScriptedSource>) {
        let (count_tx, _) = watch::channel(0);
        let source = Arc::new(source);
        let (poller, _) = Poller::new(
            source.clone(),
            CacheHandle::spawn(PresenceCache::new(), count_tx),
            Notifier::new(publisher, test_target()),
            Policy {
                lifespan: chrono::Duration::seconds(3600),
                boundary: LifespanBoundary::Inclusive,
            },
        );
        (poller, source)
    }

    #[tokio::test]
    async fn test_seed_then_cycle() {
        let source = ScriptedSource {
            script: Mutex::new(VecDeque::from([
                Ok(vec![fresh_station(1)]),
                Ok(vec![fresh_station(1), fresh_station(2)]),
            ])),
            ..ScriptedSource::default()
        };
        let (poller, publisher, _) = build(source);

        poller.seed().await.unwrap();
        let report = poller.cycle(false).await.unwrap();
        poller.notifier.drain().await;

        assert_eq!(report.discovered, 1);
        assert_eq!(report.refreshed, 1);

        let heartbeats: Vec<usize> = publisher.heartbeats().iter().map(|h| h.clients).collect();
        assert_eq!(heartbeats, vec![1, 2]);

        let discoveries = publisher.discoveries();
        assert_eq!(discoveries.len(), 1);
        assert_eq!(discoveries[0].hostname, "host-2");
    }

    #[tokio::test]
    async fn test_failed_fetch_skips_cycle() {
        let source = ScriptedSource {
            script: Mutex::new(VecDeque::from([
                Err(FetchError::Auth("session expired".to_string())),
                Ok(vec![]),
            ])),
            ..ScriptedSource::default()
        };
        let (poller, publisher, _) = build(source);

        assert!(poller.cycle(false).await.is_none());
        assert!(publisher.heartbeats().is_empty());

        // The next cycle recovers
        assert!(poller.cycle(false).await.is_some());
        let heartbeats = publisher.heartbeats();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].clients, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_counts_invalid_stations() {
        let source = ScriptedSource {
            fallback: vec![Station::default(), fresh_station(1)],
            ..ScriptedSource::default()
        };
        let (poller, publisher, _) = build(source);

        let report = poller.cycle(false).await.unwrap();

        assert_eq!(report.invalid, 1);
        assert_eq!(publisher.heartbeats()[0].clients, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_publisher_does_not_block_cycle() {
        let source = ScriptedSource {
            fallback: vec![fresh_station(1), fresh_station(2)],
            ..ScriptedSource::default()
        };
        let (poller, _) = build_with(source, Arc::new(StalledPublisher));

        let report = poller.cycle(false).await.unwrap();
        assert_eq!(report.discovered, 2);

        // Pending discoveries give up after the publish timeout
        poller.notifier.drain().await;
        assert!(poller.cache.lookup(MacAddress::new([2, 0, 0, 0, 0, 2])).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_panicking_cycle_releases_busy_flag() {
        let source = ScriptedSource {
            panic_once: AtomicBool::new(true),
            ..ScriptedSource::default()
        };
        let (poller, _, source) = build(source);

        poller.spawn_cycle(OverlapPolicy::SkipIfBusy);
        poller.cycles.close();
        poller.cycles.wait().await;
        poller.cycles.reopen();
        assert!(!poller.busy.load(Ordering::SeqCst));

        poller.spawn_cycle(OverlapPolicy::SkipIfBusy);
        poller.cycles.close();
        poller.cycles.wait().await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let source = ScriptedSource {
            fallback: vec![fresh_station(1)],
            ..ScriptedSource::default()
        };
        let (poller, publisher, source) = build(source);
        let mut state = poller.state.subscribe();

        poller.seed().await;
        assert_eq!(*state.borrow_and_update(), PollerState::Seeding);

        let cancel = CancellationToken::new();
        let runner = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                poller
                    .run(Duration::from_millis(30), OverlapPolicy::Concurrent, cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        runner.await.unwrap();

        assert_eq!(*state.borrow(), PollerState::Stopped);
        assert!(source.fetches.load(Ordering::SeqCst) >= 3);
        // Seeded client is never announced
        assert!(publisher.discoveries().is_empty());
    }

    async fn fetches_with_slow_source(overlap: OverlapPolicy) -> usize {
        let source = ScriptedSource {
            delay: Some(Duration::from_millis(300)),
            ..ScriptedSource::default()
        };
        let (poller, _, source) = build(source);

        let cancel = CancellationToken::new();
        let runner = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(Duration::from_millis(40), overlap, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(220)).await;
        cancel.cancel();
        runner.await.unwrap();

        source.fetches.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_overlap_spawns_every_tick() {
        // Every tick before cancellation starts a fetch while earlier ones still run
        assert!(fetches_with_slow_source(OverlapPolicy::Concurrent).await >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_if_busy_skips_ticks() {
        assert_eq!(fetches_with_slow_source(OverlapPolicy::SkipIfBusy).await, 1);
    }
}
