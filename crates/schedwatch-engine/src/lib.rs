//! Check pipeline and dispatch loop for schedwatch.
//!
//! One check cycle per due target: fetch, hash, compare to the latest
//! snapshot, classify, persist, reconcile target state, maybe notify. The
//! dispatch loop claims due targets (advancing their next-check time in the
//! same operation) and hands them to an injected work queue, so execution
//! and due-marking stay decoupled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schedwatch_core::{MonitoredTarget, ScheduleSnapshot, SnapshotSummary, TargetSummary};
use schedwatch_oracle::{OpenAiOracle, OracleConfig, ScheduleAnalysis, ScheduleOracle};
use schedwatch_store::{sha256_hex, HttpClientConfig, HttpFetcher, PageFetcher, WatchStore};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "schedwatch-engine";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub oracle_base_url: String,
    pub oracle_api_key: String,
    pub oracle_model: String,
    /// Six-field cron expression driving the dispatch tick.
    pub dispatch_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("SCHEDWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            oracle_base_url: std::env::var("SCHEDWATCH_ORACLE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            oracle_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            oracle_model: std::env::var("SCHEDWATCH_ORACLE_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            dispatch_cron: std::env::var("SCHEDWATCH_DISPATCH_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            user_agent: std::env::var("SCHEDWATCH_USER_AGENT")
                .unwrap_or_else(|_| "schedwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("SCHEDWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

/// Outbound notification transport. Delivery is best-effort: the pipeline
/// logs a failure and completes the cycle regardless.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn schedule_now_available(
        &self,
        target: &MonitoredTarget,
        snapshot: &ScheduleSnapshot,
    ) -> Result<()>;

    async fn schedule_changed(
        &self,
        target: &MonitoredTarget,
        new_snapshot: &ScheduleSnapshot,
        prior_snapshot: &ScheduleSnapshot,
    ) -> Result<()>;
}

/// Transport that only logs. Stands in until a mail transport is wired up.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn schedule_now_available(
        &self,
        target: &MonitoredTarget,
        snapshot: &ScheduleSnapshot,
    ) -> Result<()> {
        info!(
            target_name = %target.name,
            recipient = %target.recipient(),
            snapshot_id = %snapshot.id,
            "schedule now available"
        );
        Ok(())
    }

    async fn schedule_changed(
        &self,
        target: &MonitoredTarget,
        new_snapshot: &ScheduleSnapshot,
        prior_snapshot: &ScheduleSnapshot,
    ) -> Result<()> {
        info!(
            target_name = %target.name,
            recipient = %target.recipient(),
            new_snapshot_id = %new_snapshot.id,
            prior_snapshot_id = %prior_snapshot.id,
            "schedule changed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    NowAvailable,
    Changed,
}

/// Terminal result of one check cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed {
        snapshot_id: Uuid,
        changes_detected: bool,
        notified: Option<NotificationKind>,
    },
    /// Fetch failed; the cycle was abandoned with no state mutation. The
    /// next cadence tick retries naturally.
    FetchFailed,
    /// Target missing or inactive at execution time.
    Skipped,
}

/// Strict hash-gated change flag: the classifier alone never sets it, a
/// hash difference alone never sets it. Flags only real semantic
/// transitions: a changed schedule, or availability flipping on.
fn changes_detected(
    hash_changed: bool,
    is_first_check: bool,
    prior_available: bool,
    analysis: &ScheduleAnalysis,
) -> bool {
    hash_changed
        && (analysis.schedule_changed
            || (is_first_check && analysis.schedule_available)
            || (!is_first_check && analysis.schedule_available && !prior_available))
}

/// Runs one check cycle for one target.
pub struct CheckPipeline {
    store: Arc<WatchStore>,
    fetcher: Arc<dyn PageFetcher>,
    oracle: Arc<dyn ScheduleOracle>,
    notifier: Arc<dyn Notifier>,
}

impl CheckPipeline {
    pub fn new(
        store: Arc<WatchStore>,
        fetcher: Arc<dyn PageFetcher>,
        oracle: Arc<dyn ScheduleOracle>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            fetcher,
            oracle,
            notifier,
        }
    }

    pub async fn run_check(&self, target_id: Uuid, now: DateTime<Utc>) -> Result<CheckOutcome> {
        let Some(target) = self.store.get_target(target_id).await? else {
            return Ok(CheckOutcome::Skipped);
        };
        if !target.active {
            return Ok(CheckOutcome::Skipped);
        }

        let page = match self.fetcher.fetch(&target.url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url = %target.url, error = %err, "fetch failed, cycle abandoned");
                return Ok(CheckOutcome::FetchFailed);
            }
        };

        let content_hash = sha256_hex(&page.body);
        let content = String::from_utf8_lossy(&page.body).into_owned();

        let prior = self.store.latest_snapshot(target.id).await?;
        let is_first_check = prior.is_none();
        let hash_changed = prior
            .as_ref()
            .map(|s| s.content_hash != content_hash)
            .unwrap_or(true);

        let analysis = self
            .oracle
            .analyze(&content, prior.as_ref().map(|s| s.content.as_str()))
            .await;

        let snapshot = ScheduleSnapshot {
            id: Uuid::new_v4(),
            target_id: target.id,
            content,
            content_hash,
            summary: analysis.summary.clone(),
            games: analysis.games.clone(),
            checked_at: now,
            changes_detected: changes_detected(
                hash_changed,
                is_first_check,
                target.schedule_available,
                &analysis,
            ),
        };
        // Atomic commit point: everything before this is discardable.
        self.store
            .append_snapshot(&snapshot)
            .await
            .context("persisting snapshot")?;

        self.store
            .update_target(target.id, |t| {
                t.last_checked_at = Some(now);
                t.schedule_available = analysis.schedule_available;
                t.updated_at = now;
            })
            .await
            .context("reconciling target")?;

        let mut notified = None;
        if is_first_check && analysis.schedule_available {
            if let Err(err) = self.notifier.schedule_now_available(&target, &snapshot).await {
                warn!(target_name = %target.name, error = %err, "notification delivery failed");
            }
            notified = Some(NotificationKind::NowAvailable);
        } else if !is_first_check && analysis.schedule_changed {
            if let Some(prior) = prior.as_ref() {
                if let Err(err) = self
                    .notifier
                    .schedule_changed(&target, &snapshot, prior)
                    .await
                {
                    warn!(target_name = %target.name, error = %err, "notification delivery failed");
                }
                notified = Some(NotificationKind::Changed);
            }
        }

        Ok(CheckOutcome::Completed {
            snapshot_id: snapshot.id,
            changes_detected: snapshot.changes_detected,
            notified,
        })
    }
}

/// Capability to schedule one check cycle for later execution, at least
/// once. Injected into the dispatcher so it never touches a process-wide
/// queue directly.
pub trait WorkQueue: Send + Sync {
    fn enqueue(&self, target_id: Uuid);
}

/// Queue that runs each check as a detached tokio task.
pub struct TokioWorkQueue {
    pipeline: Arc<CheckPipeline>,
}

impl TokioWorkQueue {
    pub fn new(pipeline: Arc<CheckPipeline>) -> Self {
        Self { pipeline }
    }
}

impl WorkQueue for TokioWorkQueue {
    fn enqueue(&self, target_id: Uuid) {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            if let Err(err) = pipeline.run_check(target_id, Utc::now()).await {
                error!(%target_id, error = %err, "check cycle failed");
            }
        });
    }
}

/// Periodic driver: claims due targets and enqueues one check each.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<WatchStore>,
    queue: Arc<dyn WorkQueue>,
}

impl Dispatcher {
    pub fn new(store: Arc<WatchStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// One dispatch pass. Claiming advances each target's `next_check_at`
    /// before its check runs, so a later tick cannot enqueue the same
    /// target for the same due window.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let claimed = self.store.claim_due_targets(now).await?;
        for target in &claimed {
            self.queue.enqueue(target.id);
        }
        if !claimed.is_empty() {
            info!(count = claimed.len(), "enqueued due targets");
        }
        Ok(claimed.len())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub fetch_failed: usize,
    pub skipped: usize,
    pub errored: usize,
}

/// Claim everything due and run the cycles inline. Per-target failures are
/// logged and counted, never propagated: the claim already advanced the
/// failing target's `next_check_at`, so it neither stops the pass nor
/// spins the loop.
pub async fn run_due_inline(
    store: &WatchStore,
    pipeline: &CheckPipeline,
    now: DateTime<Utc>,
) -> Result<DispatchSummary> {
    let claimed = store.claim_due_targets(now).await?;
    let mut summary = DispatchSummary {
        claimed: claimed.len(),
        ..Default::default()
    };
    for target in claimed {
        match pipeline.run_check(target.id, now).await {
            Ok(CheckOutcome::Completed { .. }) => summary.completed += 1,
            Ok(CheckOutcome::FetchFailed) => summary.fetch_failed += 1,
            Ok(CheckOutcome::Skipped) => summary.skipped += 1,
            Err(err) => {
                error!(target_id = %target.id, error = %err, "check cycle failed");
                summary.errored += 1;
            }
        }
    }
    Ok(summary)
}

/// Wires store, fetcher, oracle, notifier and dispatcher together for the
/// binary. Tests assemble the pieces directly instead.
pub struct Engine {
    config: EngineConfig,
    store: Arc<WatchStore>,
    pipeline: Arc<CheckPipeline>,
    dispatcher: Dispatcher,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(WatchStore::new(config.data_dir.clone()));
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let oracle = Arc::new(OpenAiOracle::new(OracleConfig {
            base_url: config.oracle_base_url.clone(),
            api_key: config.oracle_api_key.clone(),
            model: config.oracle_model.clone(),
            ..Default::default()
        })?);
        let pipeline = Arc::new(CheckPipeline::new(
            Arc::clone(&store),
            fetcher,
            oracle,
            Arc::new(LogNotifier),
        ));
        let queue = Arc::new(TokioWorkQueue::new(Arc::clone(&pipeline)));
        let dispatcher = Dispatcher::new(Arc::clone(&store), queue);
        Ok(Self {
            config,
            store,
            pipeline,
            dispatcher,
        })
    }

    pub fn store(&self) -> &Arc<WatchStore> {
        &self.store
    }

    /// One dispatch pass with the claimed checks run inline, awaited to
    /// completion. Used by the CLI tick and by anything that wants a
    /// synchronous pass; the cron path enqueues detached tasks instead.
    pub async fn run_due_once(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        run_due_inline(&self.store, &self.pipeline, now).await
    }

    pub async fn tick_now(&self) -> Result<DispatchSummary> {
        self.run_due_once(Utc::now()).await
    }

    pub async fn seed_from_file(&self, path: &Path) -> Result<Vec<MonitoredTarget>> {
        import_targets(&self.store, path, Utc::now()).await
    }

    pub async fn target_summaries(&self) -> Result<Vec<TargetSummary>> {
        Ok(self
            .store
            .list_targets()
            .await?
            .iter()
            .map(TargetSummary::from)
            .collect())
    }

    /// Check history for one target, newest first.
    pub async fn snapshot_summaries(&self, target_id: Uuid) -> Result<Vec<SnapshotSummary>> {
        Ok(self
            .store
            .snapshots_for(target_id)
            .await?
            .iter()
            .map(SnapshotSummary::from)
            .collect())
    }

    /// Cron-driven dispatch loop. The returned scheduler must be started
    /// by the caller.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = Arc::clone(self);
        let cron = self.config.dispatch_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                if let Err(err) = engine.dispatcher.tick(Utc::now()).await {
                    error!(error = %err, "dispatch tick failed");
                }
            })
        })
        .with_context(|| format!("creating dispatch job for cron {cron}"))?;
        sched.add(job).await.context("adding dispatch job")?;
        Ok(sched)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSeedFile {
    pub targets: Vec<TargetSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSeed {
    pub url: String,
    pub name: String,
    pub owner_email: String,
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default)]
    pub target_date: Option<chrono::NaiveDate>,
}

/// Import targets from a YAML seed file, skipping URLs already present.
/// Each new target gets creation defaults and a computed first check time.
pub async fn import_targets(
    store: &WatchStore,
    path: &Path,
    now: DateTime<Utc>,
) -> Result<Vec<MonitoredTarget>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let seed: TargetSeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let existing: Vec<String> = store
        .list_targets()
        .await?
        .into_iter()
        .map(|t| t.url)
        .collect();

    let mut imported = Vec::new();
    for entry in seed.targets {
        if existing.iter().any(|url| url == &entry.url) {
            info!(url = %entry.url, "seed target already present, skipping");
            continue;
        }
        let mut target =
            MonitoredTarget::new(entry.url, entry.name, entry.owner_email, entry.target_date, now);
        target.notification_email = entry.notification_email;
        store.insert_target(&target).await?;
        imported.push(target);
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use schedwatch_core::CHECK_TZ;
    use schedwatch_store::{FetchError, FetchedPage};
    use tempfile::tempdir;

    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<&'static str, u16>>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<&'static str, u16>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            let next = self
                .responses
                .lock()
                .expect("fetcher lock")
                .pop_front()
                .expect("scripted response available");
            match next {
                Ok(body) => Ok(FetchedPage {
                    status: reqwest::StatusCode::OK,
                    final_url: url.to_string(),
                    body: body.as_bytes().to_vec(),
                }),
                Err(status) => Err(FetchError::HttpStatus {
                    status,
                    url: url.to_string(),
                }),
            }
        }
    }

    struct ScriptedOracle {
        replies: Mutex<VecDeque<ScheduleAnalysis>>,
        saw_previous: Mutex<Vec<bool>>,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<ScheduleAnalysis>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                saw_previous: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ScheduleOracle for ScriptedOracle {
        async fn analyze(&self, _current: &str, previous: Option<&str>) -> ScheduleAnalysis {
            self.saw_previous
                .lock()
                .expect("oracle lock")
                .push(previous.is_some());
            self.replies
                .lock()
                .expect("oracle lock")
                .pop_front()
                .expect("scripted reply available")
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(NotificationKind, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn schedule_now_available(
            &self,
            target: &MonitoredTarget,
            _snapshot: &ScheduleSnapshot,
        ) -> Result<()> {
            self.events
                .lock()
                .expect("notifier lock")
                .push((NotificationKind::NowAvailable, target.recipient().to_string()));
            Ok(())
        }

        async fn schedule_changed(
            &self,
            target: &MonitoredTarget,
            _new_snapshot: &ScheduleSnapshot,
            _prior_snapshot: &ScheduleSnapshot,
        ) -> Result<()> {
            self.events
                .lock()
                .expect("notifier lock")
                .push((NotificationKind::Changed, target.recipient().to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        ids: Mutex<Vec<Uuid>>,
    }

    impl WorkQueue for RecordingQueue {
        fn enqueue(&self, target_id: Uuid) {
            self.ids.lock().expect("queue lock").push(target_id);
        }
    }

    fn analysis(available: bool, changed: bool, summary: &str) -> ScheduleAnalysis {
        ScheduleAnalysis {
            schedule_available: available,
            schedule_changed: changed,
            summary: summary.to_string(),
            games: None,
        }
    }

    fn upcoming_target(store_now: DateTime<Utc>) -> MonitoredTarget {
        let today = store_now.with_timezone(&CHECK_TZ).date_naive();
        MonitoredTarget::new(
            "https://example.com/tournament",
            "Spring Classic",
            "owner@example.com",
            Some(today + ChronoDuration::days(10)),
            store_now,
        )
    }

    fn pipeline(
        store: Arc<WatchStore>,
        fetcher: Arc<ScriptedFetcher>,
        oracle: Arc<ScriptedOracle>,
        notifier: Arc<RecordingNotifier>,
    ) -> CheckPipeline {
        CheckPipeline::new(store, fetcher, oracle, notifier)
    }

    #[test]
    fn changes_detected_is_hash_gated() {
        let available = analysis(true, false, "");
        let changed = analysis(true, true, "");
        let nothing = analysis(false, false, "");

        // Hash unchanged: never flagged, whatever the classifier says.
        assert!(!changes_detected(false, false, false, &changed));
        assert!(!changes_detected(false, false, false, &available));

        // First check: flagged only when a schedule is present.
        assert!(changes_detected(true, true, false, &available));
        assert!(!changes_detected(true, true, false, &nothing));

        // Availability flipping on is a transition even without a
        // classifier "changed" verdict.
        assert!(changes_detected(true, false, false, &available));
        // Already available and not changed: churn only.
        assert!(!changes_detected(true, false, true, &available));

        assert!(changes_detected(true, false, true, &changed));
    }

    #[tokio::test]
    async fn first_check_with_schedule_notifies_once() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let target = upcoming_target(now);
        store.insert_target(&target).await.expect("insert");

        let notifier = Arc::new(RecordingNotifier::default());
        let oracle = ScriptedOracle::new(vec![analysis(true, false, "12 games posted")]);
        let p = pipeline(
            Arc::clone(&store),
            ScriptedFetcher::new(vec![Ok("<html>games</html>")]),
            Arc::clone(&oracle),
            Arc::clone(&notifier),
        );

        let outcome = p.run_check(target.id, now).await.expect("check");
        match outcome {
            CheckOutcome::Completed {
                changes_detected,
                notified,
                ..
            } => {
                assert!(changes_detected);
                assert_eq!(notified, Some(NotificationKind::NowAvailable));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let events = notifier.events.lock().expect("notifier lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], (NotificationKind::NowAvailable, "owner@example.com".to_string()));
        drop(events);

        let reloaded = store
            .get_target(target.id)
            .await
            .expect("get")
            .expect("present");
        assert!(reloaded.schedule_available);
        assert_eq!(reloaded.last_checked_at, Some(now));

        let snapshot = store
            .latest_snapshot(target.id)
            .await
            .expect("latest")
            .expect("present");
        assert!(snapshot.changes_detected);
        assert_eq!(snapshot.summary, "12 games posted");

        // The oracle had nothing to compare against.
        assert_eq!(*oracle.saw_previous.lock().expect("oracle lock"), vec![false]);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_state_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let target = upcoming_target(now);
        store.insert_target(&target).await.expect("insert");

        let notifier = Arc::new(RecordingNotifier::default());
        let p = pipeline(
            Arc::clone(&store),
            ScriptedFetcher::new(vec![Err(503)]),
            ScriptedOracle::new(vec![]),
            Arc::clone(&notifier),
        );

        let outcome = p.run_check(target.id, now).await.expect("check");
        assert_eq!(outcome, CheckOutcome::FetchFailed);

        let reloaded = store
            .get_target(target.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(reloaded, target);
        assert!(store
            .latest_snapshot(target.id)
            .await
            .expect("latest")
            .is_none());
        assert!(notifier.events.lock().expect("notifier lock").is_empty());
    }

    #[tokio::test]
    async fn unchanged_hash_never_flags_changes() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let target = upcoming_target(now);
        store.insert_target(&target).await.expect("insert");

        let notifier = Arc::new(RecordingNotifier::default());
        let oracle = ScriptedOracle::new(vec![
            analysis(true, false, "schedule posted"),
            // Classifier claims a change, but the bytes are identical.
            analysis(true, true, "noise verdict"),
        ]);
        let p = pipeline(
            Arc::clone(&store),
            ScriptedFetcher::new(vec![Ok("<html>same</html>"), Ok("<html>same</html>")]),
            Arc::clone(&oracle),
            Arc::clone(&notifier),
        );

        p.run_check(target.id, now).await.expect("first check");
        let outcome = p
            .run_check(target.id, now + ChronoDuration::hours(3))
            .await
            .expect("second check");

        match outcome {
            CheckOutcome::Completed {
                changes_detected,
                notified,
                ..
            } => {
                assert!(!changes_detected);
                // Notification follows the classifier verdict; the history
                // flag stays hash-gated.
                assert_eq!(notified, Some(NotificationKind::Changed));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*oracle.saw_previous.lock().expect("oracle lock"), vec![false, true]);
    }

    #[tokio::test]
    async fn availability_flip_with_new_content_is_a_change() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let target = upcoming_target(now);
        store.insert_target(&target).await.expect("insert");

        let notifier = Arc::new(RecordingNotifier::default());
        let p = pipeline(
            Arc::clone(&store),
            ScriptedFetcher::new(vec![Ok("<html>coming soon</html>"), Ok("<html>games!</html>")]),
            ScriptedOracle::new(vec![
                analysis(false, false, "not released yet"),
                analysis(true, false, "schedule appeared"),
            ]),
            Arc::clone(&notifier),
        );

        p.run_check(target.id, now).await.expect("first check");
        let outcome = p
            .run_check(target.id, now + ChronoDuration::hours(3))
            .await
            .expect("second check");

        match outcome {
            CheckOutcome::Completed {
                changes_detected, ..
            } => assert!(changes_detected),
            other => panic!("unexpected outcome {other:?}"),
        }

        let history = store.snapshots_for(target.id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert!(history[0].changes_detected);
        assert!(!history[1].changes_detected);
    }

    #[tokio::test]
    async fn degraded_oracle_result_still_persists_a_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let target = upcoming_target(now);
        store.insert_target(&target).await.expect("insert");

        let notifier = Arc::new(RecordingNotifier::default());
        let p = pipeline(
            Arc::clone(&store),
            ScriptedFetcher::new(vec![Ok("<html>page</html>")]),
            ScriptedOracle::new(vec![ScheduleAnalysis::degraded("timeout")]),
            Arc::clone(&notifier),
        );

        p.run_check(target.id, now).await.expect("check");
        let snapshot = store
            .latest_snapshot(target.id)
            .await
            .expect("latest")
            .expect("present");
        assert_eq!(snapshot.summary, "Error analyzing schedule: timeout");
        assert!(!snapshot.changes_detected);
        assert!(notifier.events.lock().expect("notifier lock").is_empty());
    }

    #[tokio::test]
    async fn inactive_target_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let mut target = upcoming_target(now);
        target.active = false;
        store.insert_target(&target).await.expect("insert");

        let p = pipeline(
            Arc::clone(&store),
            ScriptedFetcher::new(vec![]),
            ScriptedOracle::new(vec![]),
            Arc::new(RecordingNotifier::default()),
        );

        assert_eq!(
            p.run_check(target.id, now).await.expect("check"),
            CheckOutcome::Skipped
        );
        assert_eq!(
            p.run_check(Uuid::new_v4(), now).await.expect("check"),
            CheckOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn dispatcher_claims_once_per_due_window() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let mut target = upcoming_target(now);
        target.next_check_at = Some(now - ChronoDuration::minutes(1));
        store.insert_target(&target).await.expect("insert");

        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&queue) as Arc<dyn WorkQueue>);

        assert_eq!(dispatcher.tick(now).await.expect("tick"), 1);
        // Second tick before any pipeline ran: the claim already advanced
        // next_check_at, so nothing is re-enqueued.
        assert_eq!(dispatcher.tick(now).await.expect("tick"), 0);
        assert_eq!(queue.ids.lock().expect("queue lock").as_slice(), &[target.id]);
    }

    #[tokio::test]
    async fn seed_import_skips_known_urls() {
        let dir = tempdir().expect("tempdir");
        let store = WatchStore::new(dir.path().join("data"));
        let now = Utc::now();

        let seed_path = dir.path().join("targets.yaml");
        let seed_yaml = concat!(
            "targets:\n",
            "  - url: https://example.com/spring\n",
            "    name: Spring Classic\n",
            "    owner_email: owner@example.com\n",
            "    notification_email: coach@example.com\n",
            "    target_date: 2099-06-20\n",
            "  - url: https://example.com/fall\n",
            "    name: Fall Cup\n",
            "    owner_email: owner@example.com\n",
        );
        std::fs::write(&seed_path, seed_yaml).expect("write seed");

        let imported = import_targets(&store, &seed_path, now).await.expect("import");
        assert_eq!(imported.len(), 2);
        let spring = imported
            .iter()
            .find(|t| t.name == "Spring Classic")
            .expect("spring imported");
        assert_eq!(spring.recipient(), "coach@example.com");
        assert!(spring.next_check_at.is_some());
        // No target date means no adaptive cadence.
        let fall = imported.iter().find(|t| t.name == "Fall Cup").expect("fall imported");
        assert!(fall.next_check_at.is_none());

        let again = import_targets(&store, &seed_path, now).await.expect("reimport");
        assert!(again.is_empty());
        assert_eq!(store.list_targets().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn persistence_failure_is_contained_per_target() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(WatchStore::new(dir.path()));
        let now = Utc::now();
        let today = now.with_timezone(&CHECK_TZ).date_naive();

        let mut healthy = MonitoredTarget::new(
            "https://example.com/alpha",
            "alpha-open",
            "owner@example.com",
            Some(today + ChronoDuration::days(10)),
            now,
        );
        healthy.next_check_at = Some(now - ChronoDuration::minutes(1));
        let mut poisoned = MonitoredTarget::new(
            "https://example.com/bravo",
            "bravo-cup",
            "owner@example.com",
            Some(today + ChronoDuration::days(10)),
            now,
        );
        poisoned.next_check_at = Some(now - ChronoDuration::minutes(1));
        store.insert_target(&healthy).await.expect("insert");
        store.insert_target(&poisoned).await.expect("insert");

        // A plain file where the snapshot directory belongs makes every
        // snapshot write for this target fail.
        let snapshots_root = store.root().join("snapshots");
        std::fs::create_dir_all(&snapshots_root).expect("snapshots root");
        std::fs::write(snapshots_root.join(poisoned.id.to_string()), b"in the way")
            .expect("poison snapshot dir");

        let notifier = Arc::new(RecordingNotifier::default());
        let p = pipeline(
            Arc::clone(&store),
            ScriptedFetcher::new(vec![Ok("<html>alpha</html>"), Ok("<html>bravo</html>")]),
            ScriptedOracle::new(vec![
                analysis(false, false, "nothing yet"),
                analysis(false, false, "nothing yet"),
            ]),
            Arc::clone(&notifier),
        );

        let summary = run_due_inline(&store, &p, now).await.expect("pass completes");
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.fetch_failed, 0);

        assert!(store
            .latest_snapshot(healthy.id)
            .await
            .expect("latest")
            .is_some());
        // The poisoned target's history is unreadable, not silently empty.
        assert!(store.latest_snapshot(poisoned.id).await.is_err());

        // The claim advanced the failing target too, so it cannot spin.
        let reloaded = store
            .get_target(poisoned.id)
            .await
            .expect("get")
            .expect("present");
        assert!(reloaded.next_check_at.expect("next check computed") > now);
        assert!(store.claim_due_targets(now).await.expect("reclaim").is_empty());
    }
}
