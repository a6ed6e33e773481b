//! Scheduler loop
//!
//! Drives the whole cycle: enumerate tracked targets, fetch each one,
//! compute novelty against persisted state, commit the updated state, then
//! fan notifications out to the subscriber snapshot. One target's failure
//! never aborts the cycle for the others; state is committed before any
//! fan-out so a crash mid-delivery can only under-deliver, never duplicate.

use crate::error::Result;
use crate::fetch::FetchAdapter;
use crate::notify::{notify_all, render_sound_message, render_video_message, Notifier};
use crate::novelty::{compute_novelty, NoveltyCaps};
use crate::store::{RunStatus, TargetType, TrackedTarget, WatchDb};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Stats for one full pass over all targets
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub targets_polled: usize,
    pub targets_failed: usize,
    pub new_items: usize,
    pub deliveries_ok: usize,
    pub deliveries_failed: usize,
}

/// Outcome of polling a single target
#[derive(Debug, Clone, Default)]
struct TargetOutcome {
    new_items: usize,
    deliveries_ok: usize,
    deliveries_failed: usize,
}

/// The polling scheduler
pub struct Scheduler {
    db: WatchDb,
    fetcher: Arc<dyn FetchAdapter>,
    notifier: Arc<dyn Notifier>,
    /// Live interval in seconds, shared with /set_interval
    interval_secs: Arc<AtomicU64>,
    caps: NoveltyCaps,
    admin_chat_id: Option<i64>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        db: WatchDb,
        fetcher: Arc<dyn FetchAdapter>,
        notifier: Arc<dyn Notifier>,
        interval_secs: Arc<AtomicU64>,
        caps: NoveltyCaps,
        admin_chat_id: Option<i64>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            fetcher,
            notifier,
            interval_secs,
            caps,
            admin_chat_id,
            shutdown,
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run cycles until shutdown is signalled
    pub async fn run(&mut self) {
        info!("Scheduler started");

        loop {
            if self.stopping() {
                break;
            }

            match self.run_cycle().await {
                Ok(stats) => debug!(
                    polled = stats.targets_polled,
                    failed = stats.targets_failed,
                    new_items = stats.new_items,
                    "Cycle complete"
                ),
                Err(e) => {
                    error!("Cycle failed: {}", e);
                    self.report_admin(&format!("scheduler cycle failed: {}", e)).await;
                }
            }

            let interval = Duration::from_secs(self.interval_secs.load(Ordering::Relaxed).max(1));
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Scheduler stopped");
    }

    /// One full pass over all targets. Per-target failures are isolated and
    /// reported; only a failure to enumerate targets aborts the cycle.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let targets = self.db.list_targets().await?;
        let mut stats = CycleStats::default();

        for target in targets {
            // Checked between targets, not mid-fetch: shutdown latency stays
            // bounded by one fetch timeout.
            if self.stopping() {
                debug!("Shutdown requested, ending cycle early");
                break;
            }

            match self.poll_target(&target).await {
                Ok(outcome) => {
                    stats.targets_polled += 1;
                    stats.new_items += outcome.new_items;
                    stats.deliveries_ok += outcome.deliveries_ok;
                    stats.deliveries_failed += outcome.deliveries_failed;
                }
                Err(e) => {
                    stats.targets_failed += 1;
                    warn!(target = %target.label(), "Poll failed: {}", e);
                    self.report_admin(&format!("poll failed for {}: {}", target.label(), e))
                        .await;
                }
            }
        }

        Ok(stats)
    }

    /// Poll one target: fetch, dedup, commit, fan out.
    async fn poll_target(&self, target: &TrackedTarget) -> Result<TargetOutcome> {
        let target_type = target.get_type()?;
        let run = self.db.start_poll_run(target_type, &target.target_id).await?;

        let batch = match self.fetcher.fetch(target_type, &target.target_id).await {
            Ok(batch) => batch,
            Err(e) => {
                self.db
                    .complete_poll_run(&run.id, RunStatus::Failed, 0, 0, 0, 0, Some(e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        let novelty = compute_novelty(&batch.items, &target.state(), &self.caps);

        // Commit before fan-out: a crash from here on can only lose
        // deliveries, never repeat them next cycle.
        self.db
            .commit_state(
                target_type,
                &target.target_id,
                &novelty.state,
                batch.remote_title.as_deref(),
            )
            .await?;

        let chats = self.db.subscribers(target_type, &target.target_id).await?;

        let mut outcome = TargetOutcome {
            new_items: novelty.new_items.len(),
            ..TargetOutcome::default()
        };

        if !chats.is_empty() && !novelty.new_items.is_empty() {
            let title = batch.remote_title.as_deref().or(target.title.as_deref());
            for item in &novelty.new_items {
                let text = match target_type {
                    TargetType::Sound => render_video_message(&target.target_id, title, item),
                    TargetType::Hashtag => render_sound_message(&target.target_id, item),
                };
                for delivery in notify_all(self.notifier.as_ref(), &chats, &text).await {
                    if delivery.ok() {
                        outcome.deliveries_ok += 1;
                    } else {
                        outcome.deliveries_failed += 1;
                    }
                }
            }
        }

        self.db
            .complete_poll_run(
                &run.id,
                RunStatus::Completed,
                batch.items.len(),
                outcome.new_items,
                outcome.deliveries_ok,
                outcome.deliveries_failed,
                None,
            )
            .await?;

        Ok(outcome)
    }

    async fn report_admin(&self, text: &str) {
        if let Some(chat_id) = self.admin_chat_id {
            if let Err(e) = self.notifier.send(chat_id, text).await {
                warn!("Failed to notify admin chat: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fetch::{FetchedBatch, Item};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use tempfile::TempDir;

    enum Scripted {
        Batch(Vec<Item>, Option<String>),
        Fail(String),
    }

    /// Fetch adapter returning scripted per-target responses, with optional
    /// side effects fired while a fetch is "in flight"
    struct ScriptedFetcher {
        responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
        /// Subscribe this chat to the fetched target during the fetch
        subscribe_during_fetch: Option<(WatchDb, i64)>,
        /// Flip the shutdown flag during the fetch
        stop_during_fetch: Option<watch::Sender<bool>>,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                subscribe_during_fetch: None,
                stop_during_fetch: None,
            }
        }

        fn script(self, target_id: &str, response: Scripted) -> Self {
            self.responses
                .lock()
                .unwrap()
                .entry(target_id.to_string())
                .or_default()
                .push_back(response);
            self
        }
    }

    #[async_trait]
    impl FetchAdapter for ScriptedFetcher {
        async fn fetch(&self, target_type: TargetType, target_id: &str) -> Result<FetchedBatch> {
            if let Some((db, chat_id)) = &self.subscribe_during_fetch {
                db.subscribe(*chat_id, target_type, target_id).await.unwrap();
            }
            if let Some(stop) = &self.stop_during_fetch {
                let _ = stop.send(true);
            }

            let next = self
                .responses
                .lock()
                .unwrap()
                .get_mut(target_id)
                .and_then(VecDeque::pop_front);
            match next {
                Some(Scripted::Batch(items, remote_title)) => {
                    Ok(FetchedBatch { items, remote_title })
                }
                Some(Scripted::Fail(message)) => Err(Error::Fetch(message)),
                None => Ok(FetchedBatch::default()),
            }
        }
    }

    struct FakeNotifier {
        sent: Mutex<Vec<(i64, String)>>,
        failing: HashSet<i64>,
    }

    impl FakeNotifier {
        fn new(failing: &[i64]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failing: failing.iter().copied().collect(),
            }
        }

        fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
            if self.failing.contains(&chat_id) {
                return Err(Error::Delivery(format!("chat {} unreachable", chat_id)));
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    fn item(id: &str, ts: i64) -> Item {
        Item {
            id: id.to_string(),
            created_at: ts,
            author: "alice".to_string(),
            description: format!("video {}", id),
            cover: None,
        }
    }

    struct Harness {
        db: WatchDb,
        notifier: Arc<FakeNotifier>,
        _shutdown_tx: watch::Sender<bool>,
        _tmp: TempDir,
    }

    async fn setup(fetcher: ScriptedFetcher, failing_chats: &[i64]) -> (Scheduler, Harness) {
        let tmp = TempDir::new().unwrap();
        let db = WatchDb::new(&tmp.path().join("test.db")).await.unwrap();
        let notifier = Arc::new(FakeNotifier::new(failing_chats));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            db.clone(),
            Arc::new(fetcher),
            notifier.clone(),
            Arc::new(AtomicU64::new(180)),
            NoveltyCaps::default(),
            None,
            shutdown_rx,
        );

        let harness = Harness {
            db,
            notifier,
            _shutdown_tx: shutdown_tx,
            _tmp: tmp,
        };
        (scheduler, harness)
    }

    async fn track(db: &WatchDb, target_type: TargetType, target_id: &str, chats: &[i64]) {
        db.upsert_target(&TrackedTarget::new(target_type, target_id.to_string(), None))
            .await
            .unwrap();
        for &chat in chats {
            db.subscribe(chat, target_type, target_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn new_item_is_delivered_and_state_advances() {
        let fetcher = ScriptedFetcher::new()
            .script("123", Scripted::Batch(vec![item("a", 150)], Some("Song".into())));
        let (scheduler, h) = setup(fetcher, &[]).await;
        track(&h.db, TargetType::Sound, "123", &[42]).await;

        // Pre-advance state so the first-poll cap does not apply
        h.db.commit_state(
            TargetType::Sound,
            "123",
            &crate::store::TargetState { last_ts: 100, last_ids: vec![] },
            None,
        )
        .await
        .unwrap();

        let stats = scheduler.run_cycle().await.unwrap();
        assert_eq!(stats.targets_polled, 1);
        assert_eq!(stats.new_items, 1);
        assert_eq!(stats.deliveries_ok, 1);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert!(sent[0].1.contains("video a"));

        let target = h.db.get_target(TargetType::Sound, "123").await.unwrap().unwrap();
        assert_eq!(target.last_ts, 150);
        assert_eq!(target.state().last_ids, vec!["a".to_string()]);
        assert_eq!(target.title, Some("Song".to_string()));

        let run = h.db.latest_run(TargetType::Sound, "123").await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.new_items, 1);
    }

    #[tokio::test]
    async fn unchanged_fetch_delivers_nothing_twice() {
        let fetcher = ScriptedFetcher::new()
            .script("123", Scripted::Batch(vec![item("a", 150)], None))
            .script("123", Scripted::Batch(vec![item("a", 150)], None));
        let (scheduler, h) = setup(fetcher, &[]).await;
        track(&h.db, TargetType::Sound, "123", &[42]).await;

        let stats = scheduler.run_cycle().await.unwrap();
        assert_eq!(stats.new_items, 1);

        let stats = scheduler.run_cycle().await.unwrap();
        assert_eq!(stats.new_items, 0);
        assert_eq!(stats.deliveries_ok, 0);

        // Exactly one notification ever, despite two cycles seeing the item
        assert_eq!(h.notifier.sent().len(), 1);

        let target = h.db.get_target(TargetType::Sound, "123").await.unwrap().unwrap();
        assert_eq!(target.last_ts, 150);
    }

    #[tokio::test]
    async fn one_target_failure_does_not_abort_cycle() {
        let fetcher = ScriptedFetcher::new()
            .script("bad", Scripted::Fail("connection reset".into()))
            .script("good", Scripted::Batch(vec![item("a", 150)], None));
        let (scheduler, h) = setup(fetcher, &[]).await;
        track(&h.db, TargetType::Sound, "bad", &[42]).await;
        track(&h.db, TargetType::Sound, "good", &[42]).await;

        let stats = scheduler.run_cycle().await.unwrap();

        assert_eq!(stats.targets_failed, 1);
        assert_eq!(stats.targets_polled, 1);
        assert_eq!(h.notifier.sent().len(), 1);

        // The failed target keeps its state and records the error
        let bad = h.db.get_target(TargetType::Sound, "bad").await.unwrap().unwrap();
        assert_eq!(bad.last_ts, 0);
        let run = h.db.latest_run(TargetType::Sound, "bad").await.unwrap().unwrap();
        assert_eq!(run.status, "failed");
        assert!(run.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn per_subscriber_failure_does_not_block_siblings() {
        let fetcher = ScriptedFetcher::new()
            .script("123", Scripted::Batch(vec![item("a", 150)], None));
        let (scheduler, h) = setup(fetcher, &[1]).await;
        track(&h.db, TargetType::Sound, "123", &[1, 2]).await;

        let stats = scheduler.run_cycle().await.unwrap();

        assert_eq!(stats.targets_failed, 0, "delivery failures are not poll failures");
        assert_eq!(stats.deliveries_ok, 1);
        assert_eq!(stats.deliveries_failed, 1);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 2);

        let run = h.db.latest_run(TargetType::Sound, "123").await.unwrap().unwrap();
        assert_eq!(run.deliveries_ok, 1);
        assert_eq!(run.deliveries_failed, 1);
    }

    #[tokio::test]
    async fn first_poll_is_capped() {
        let fetcher = ScriptedFetcher::new().script(
            "123",
            Scripted::Batch(
                vec![
                    item("e", 50),
                    item("d", 40),
                    item("c", 30),
                    item("b", 20),
                    item("a", 10),
                ],
                None,
            ),
        );
        let (scheduler, h) = setup(fetcher, &[]).await;
        track(&h.db, TargetType::Sound, "123", &[42]).await;

        let stats = scheduler.run_cycle().await.unwrap();

        assert_eq!(stats.new_items, 3);
        // Delivered in ascending publication order
        let sent = h.notifier.sent();
        assert!(sent[0].1.contains("video c"));
        assert!(sent[1].1.contains("video d"));
        assert!(sent[2].1.contains("video e"));
    }

    #[tokio::test]
    async fn zero_subscriber_target_still_polled() {
        let fetcher = ScriptedFetcher::new()
            .script("123", Scripted::Batch(vec![item("a", 150)], None));
        let (scheduler, h) = setup(fetcher, &[]).await;
        track(&h.db, TargetType::Sound, "123", &[]).await;

        let stats = scheduler.run_cycle().await.unwrap();

        assert_eq!(stats.targets_polled, 1);
        assert_eq!(stats.new_items, 1);
        assert!(h.notifier.sent().is_empty());

        // State stays fresh so a later subscriber is not flooded
        let target = h.db.get_target(TargetType::Sound, "123").await.unwrap().unwrap();
        assert_eq!(target.last_ts, 150);
    }

    #[tokio::test]
    async fn subscriber_snapshot_taken_after_commit() {
        // A chat subscribing while the fetch is in flight lands before the
        // snapshot, so it receives the batch; the snapshot boundary is the
        // state commit, not the cycle start.
        let tmp = TempDir::new().unwrap();
        let db = WatchDb::new(&tmp.path().join("test.db")).await.unwrap();

        let mut fetcher = ScriptedFetcher::new()
            .script("123", Scripted::Batch(vec![item("a", 150)], None));
        fetcher.subscribe_during_fetch = Some((db.clone(), 99));

        let notifier = Arc::new(FakeNotifier::new(&[]));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            db.clone(),
            Arc::new(fetcher),
            notifier.clone(),
            Arc::new(AtomicU64::new(180)),
            NoveltyCaps::default(),
            None,
            shutdown_rx,
        );

        db.upsert_target(&TrackedTarget::new(TargetType::Sound, "123".to_string(), None))
            .await
            .unwrap();

        scheduler.run_cycle().await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 99);
    }

    #[tokio::test]
    async fn shutdown_checked_between_targets() {
        let tmp = TempDir::new().unwrap();
        let db = WatchDb::new(&tmp.path().join("test.db")).await.unwrap();
        let notifier = Arc::new(FakeNotifier::new(&[]));

        // The fetcher trips the shutdown flag while the first fetch is in
        // flight
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut fetcher = ScriptedFetcher::new()
            .script("first", Scripted::Batch(vec![], None))
            .script("second", Scripted::Batch(vec![], None));
        fetcher.stop_during_fetch = Some(shutdown_tx);

        let scheduler = Scheduler::new(
            db.clone(),
            Arc::new(fetcher),
            notifier,
            Arc::new(AtomicU64::new(180)),
            NoveltyCaps::default(),
            None,
            shutdown_rx,
        );

        track(&db, TargetType::Sound, "first", &[]).await;
        track(&db, TargetType::Sound, "second", &[]).await;

        let stats = scheduler.run_cycle().await.unwrap();

        // The in-flight target completes; the next one is never started
        assert_eq!(stats.targets_polled, 1);
        assert!(db.latest_run(TargetType::Sound, "second").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hashtag_discovery_flows_through_id_dedup() {
        let sound = |id: &str, title: &str| Item {
            id: id.to_string(),
            created_at: 0,
            author: String::new(),
            description: title.to_string(),
            cover: None,
        };
        let fetcher = ScriptedFetcher::new()
            .script("fyp", Scripted::Batch(vec![sound("m1", "Song 1")], None))
            .script(
                "fyp",
                Scripted::Batch(vec![sound("m1", "Song 1"), sound("m2", "Song 2")], None),
            );
        let (scheduler, h) = setup(fetcher, &[]).await;
        track(&h.db, TargetType::Hashtag, "fyp", &[42]).await;

        scheduler.run_cycle().await.unwrap();
        scheduler.run_cycle().await.unwrap();

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.contains("Song 1"));
        assert!(sent[1].1.contains("Song 2"));
    }
}
