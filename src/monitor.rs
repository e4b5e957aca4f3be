//! Background monitoring loop
//!
//! Owns a tokio runtime so callers need no async context of their own.
//! Each tick rebuilds the full usage picture from disk and publishes it
//! to registered callbacks; a failed tick is logged and retried on the
//! next interval.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::aggregator::{self, PeriodUsage, Totals};
use crate::blocks::{self, BurnRate, SessionBlockBuilder};
use crate::config::MonitorConfig;
use crate::limits;
use crate::models::SessionBlock;
use crate::reader::{self, ReaderError};

/// Immutable view of usage state published on each refresh tick.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub computed_at: DateTime<Utc>,
    /// Effective session token limit (override, estimate, or plan default).
    pub token_limit: u64,
    /// All session and gap blocks, oldest first.
    pub blocks: Vec<SessionBlock>,
    /// Consumption rate over the trailing hour.
    pub burn_rate: BurnRate,
    /// Minutes until the current session window resets.
    pub minutes_to_reset: i64,
    /// Daily aggregate rows, most recent first.
    pub daily: Vec<PeriodUsage>,
    pub totals: Totals,
}

impl MonitorSnapshot {
    /// The block currently receiving usage, if any.
    pub fn active_block(&self) -> Option<&SessionBlock> {
        self.blocks.iter().find(|b| b.is_active)
    }
}

/// Session boundary crossed between two consecutive snapshots.
///
/// When one session replaces another within a single tick, the end of
/// the old session is always delivered before the start of the new one.
#[derive(Debug, Clone, Serialize)]
pub enum SessionTransition {
    Start { id: String, block: SessionBlock },
    End { id: String },
}

type UpdateCallback = Arc<dyn Fn(&MonitorSnapshot) + Send + Sync>;
type SessionCallback = Arc<dyn Fn(&SessionTransition) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Idle,
    Running,
    Stopped,
}

struct Lifecycle {
    state: LifecycleState,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    update_callbacks: Vec<UpdateCallback>,
    session_callbacks: Vec<SessionCallback>,
    last_snapshot: Option<MonitorSnapshot>,
    active_block_id: Option<String>,
}

/// Drives the periodic refresh loop and callback dispatch.
///
/// Lifecycle is Idle -> Running -> Stopped; a stopped orchestrator does
/// not restart. `start` and `stop` are both idempotent.
pub struct MonitoringOrchestrator {
    config: MonitorConfig,
    runtime: Runtime,
    shared: Arc<Mutex<Shared>>,
    ready_tx: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
}

impl MonitoringOrchestrator {
    pub fn new(config: MonitorConfig) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()?;
        let (ready_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            runtime,
            shared: Arc::new(Mutex::new(Shared::default())),
            ready_tx,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Idle,
                stop_tx: None,
                task: None,
            }),
        })
    }

    /// Register a callback invoked with every published snapshot.
    pub fn register_update_callback(
        &self,
        callback: impl Fn(&MonitorSnapshot) + Send + Sync + 'static,
    ) {
        lock(&self.shared).update_callbacks.push(Arc::new(callback));
    }

    /// Register a callback invoked on session start and end events.
    pub fn register_session_callback(
        &self,
        callback: impl Fn(&SessionTransition) + Send + Sync + 'static,
    ) {
        lock(&self.shared).session_callbacks.push(Arc::new(callback));
    }

    /// Begin the background refresh loop.
    ///
    /// Fails when the data directory is missing or holds no usage
    /// files, so an absent data source is reported once instead of on
    /// every tick. Calling `start` while already running is a no-op.
    pub fn start(&self) -> Result<(), ReaderError> {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            LifecycleState::Running => {
                warn!("monitoring already running");
                return Ok(());
            }
            LifecycleState::Stopped => {
                warn!("monitoring was stopped; not restarting");
                return Ok(());
            }
            LifecycleState::Idle => {}
        }

        reader::discover_usage_files(&self.config.data_dir)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = self.runtime.spawn(run_loop(
            self.config.clone(),
            Arc::clone(&self.shared),
            self.ready_tx.clone(),
            stop_rx,
        ));

        lifecycle.state = LifecycleState::Running;
        lifecycle.stop_tx = Some(stop_tx);
        lifecycle.task = Some(task);
        info!(
            "monitoring started for {:?} every {:?}",
            self.config.data_dir, self.config.refresh_interval
        );
        Ok(())
    }

    /// Stop the refresh loop and wait for it to exit.
    ///
    /// After `stop` returns no further callbacks are invoked. Stopping
    /// an idle or already stopped orchestrator is a no-op.
    pub fn stop(&self) {
        let (stop_tx, task) = {
            let mut lifecycle = lock(&self.lifecycle);
            let was_running = lifecycle.state == LifecycleState::Running;
            lifecycle.state = LifecycleState::Stopped;
            if !was_running {
                return;
            }
            (lifecycle.stop_tx.take(), lifecycle.task.take())
        };

        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = task {
            if let Err(e) = self.runtime.block_on(task) {
                error!("monitoring loop terminated abnormally: {}", e);
            }
        }
        info!("monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.lifecycle).state == LifecycleState::Running
    }

    /// Block until the first snapshot has been published.
    ///
    /// Returns `false` if no snapshot arrived within `timeout`.
    pub fn wait_for_initial_data(&self, timeout: Duration) -> bool {
        let mut ready_rx = self.ready_tx.subscribe();
        self.runtime
            .block_on(async move {
                tokio::time::timeout(timeout, ready_rx.wait_for(|ready| *ready))
                    .await
                    .map(|result| result.is_ok())
            })
            .unwrap_or(false)
    }

    /// Most recently published snapshot, if any tick has completed.
    pub fn latest_snapshot(&self) -> Option<MonitorSnapshot> {
        lock(&self.shared).last_snapshot.clone()
    }

    /// Compute and publish a snapshot immediately, outside the tick
    /// cadence. Unlike a background tick, read errors are returned.
    ///
    /// Once the orchestrator is stopped the snapshot is still computed
    /// and returned, but not published: no callbacks fire after `stop`.
    pub fn force_refresh(&self) -> Result<MonitorSnapshot, ReaderError> {
        let snapshot = compute_snapshot(&self.config, Utc::now())?;

        // Holding the lifecycle lock across publish so a concurrent
        // `stop` cannot return while callbacks are still running.
        let lifecycle = lock(&self.lifecycle);
        if lifecycle.state != LifecycleState::Stopped {
            publish(&self.shared, &self.ready_tx, snapshot.clone());
        }
        Ok(snapshot)
    }
}

impl Drop for MonitoringOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    config: MonitorConfig,
    shared: Arc<Mutex<Shared>>,
    ready_tx: watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let tick_config = config.clone();
        let now = Utc::now();
        match tokio::task::spawn_blocking(move || compute_snapshot(&tick_config, now)).await {
            Ok(Ok(snapshot)) => publish(&shared, &ready_tx, snapshot),
            Ok(Err(e)) => warn!("refresh failed, retrying next tick: {}", e),
            Err(e) => error!("refresh task failed: {}", e),
        }
    }
}

/// Rebuild the full usage picture from disk.
///
/// Always reads fresh; the file cache is reserved for one-shot reports
/// so session transitions are derived from current data.
fn compute_snapshot(
    config: &MonitorConfig,
    now: DateTime<Utc>,
) -> Result<MonitorSnapshot, ReaderError> {
    let cutoff = reader::read_cutoff(config, now);
    let entries = reader::read_entries(&config.data_dir, cutoff)?;

    let builder = SessionBlockBuilder::new();
    let blocks = builder.build(entries.clone(), now);
    let token_limit =
        limits::estimate_token_limit(config.plan, &blocks, config.token_limit_override);
    let burn_rate = blocks::hourly_burn_rate(&blocks, now);
    let minutes_to_reset = blocks::minutes_to_reset(&blocks, now, builder.window());
    let daily = aggregator::aggregate_daily(&entries, config.timezone);
    let totals = aggregator::calculate_totals(&daily);

    Ok(MonitorSnapshot {
        computed_at: now,
        token_limit,
        blocks,
        burn_rate,
        minutes_to_reset,
        daily,
        totals,
    })
}

fn publish(shared: &Mutex<Shared>, ready_tx: &watch::Sender<bool>, snapshot: MonitorSnapshot) {
    let mut transitions: Vec<SessionTransition> = Vec::new();

    let (update_callbacks, session_callbacks) = {
        let mut guard = lock(shared);

        let new_active = snapshot.active_block().map(|b| b.id.clone());
        if guard.active_block_id != new_active {
            if let Some(old_id) = guard.active_block_id.take() {
                transitions.push(SessionTransition::End { id: old_id });
            }
            if let Some(id) = &new_active {
                if let Some(block) = snapshot.blocks.iter().find(|b| &b.id == id) {
                    transitions.push(SessionTransition::Start {
                        id: id.clone(),
                        block: block.clone(),
                    });
                }
            }
        }
        guard.active_block_id = new_active;
        guard.last_snapshot = Some(snapshot.clone());

        (
            guard.update_callbacks.clone(),
            guard.session_callbacks.clone(),
        )
    };

    // Callbacks run outside the lock so a slow observer cannot block
    // registration or snapshot reads.
    for transition in &transitions {
        for callback in &session_callbacks {
            callback(transition);
        }
    }
    for callback in &update_callbacks {
        callback(&snapshot);
    }

    ready_tx.send_replace(true);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(ts: &str, input: i64, msg: &str) -> String {
        format!(
            r#"{{"type":"assistant","timestamp":"{ts}","costUSD":0.01,"requestId":"r-{msg}","message":{{"id":"{msg}","model":"claude-3-5-sonnet","usage":{{"input_tokens":{input},"output_tokens":5}}}}}}"#
        )
    }

    fn write_usage(dir: &std::path::Path, lines: &[String]) {
        let mut file = File::create(dir.join("session.jsonl")).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    fn recent_record(minutes_ago: i64, msg: &str) -> String {
        let ts = (Utc::now() - chrono::Duration::minutes(minutes_ago))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        record(&ts, 100, msg)
    }

    fn snapshot_with_active(id: Option<&str>) -> MonitorSnapshot {
        let blocks = id
            .map(|id| {
                vec![SessionBlock {
                    id: id.to_string(),
                    start_time: Utc::now(),
                    end_time: None,
                    actual_end_time: None,
                    entries: vec![],
                    token_counts: Default::default(),
                    cost_usd: 0.0,
                    models: vec![],
                    is_active: true,
                    is_gap: false,
                }]
            })
            .unwrap_or_default();
        MonitorSnapshot {
            computed_at: Utc::now(),
            token_limit: 1,
            blocks,
            burn_rate: BurnRate::default(),
            minutes_to_reset: 300,
            daily: vec![],
            totals: Totals::default(),
        }
    }

    #[test]
    fn test_start_fails_without_data_source() {
        let orchestrator =
            MonitoringOrchestrator::new(MonitorConfig::new("/no/such/dir")).unwrap();
        let err = orchestrator.start().unwrap_err();
        assert!(err.is_not_found());
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_start_and_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        write_usage(dir.path(), &[recent_record(10, "m1")]);

        let config = MonitorConfig::new(dir.path())
            .with_refresh_interval(Duration::from_millis(100));
        let orchestrator = MonitoringOrchestrator::new(config).unwrap();

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updates);
        orchestrator.register_update_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        orchestrator.start().unwrap();
        assert!(orchestrator.is_running());
        assert!(orchestrator.wait_for_initial_data(Duration::from_secs(5)));
        assert!(updates.load(Ordering::SeqCst) >= 1);

        let snapshot = orchestrator.latest_snapshot().unwrap();
        assert!(snapshot.active_block().is_some());
        assert_eq!(snapshot.totals.entries_count, 1);
        assert!(snapshot.burn_rate.tokens_per_minute > 0.0);
        assert!(snapshot.minutes_to_reset > 0 && snapshot.minutes_to_reset <= 300);

        orchestrator.stop();
        assert!(!orchestrator.is_running());

        // No callbacks fire once stop has returned.
        let after = updates.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(350));
        assert_eq!(updates.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_start_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_usage(dir.path(), &[recent_record(5, "m1")]);

        let config = MonitorConfig::new(dir.path())
            .with_refresh_interval(Duration::from_millis(100));
        let orchestrator = MonitoringOrchestrator::new(config).unwrap();

        orchestrator.start().unwrap();
        orchestrator.start().unwrap();
        assert!(orchestrator.is_running());
        orchestrator.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_terminal() {
        let dir = tempfile::tempdir().unwrap();
        write_usage(dir.path(), &[recent_record(5, "m1")]);

        let config = MonitorConfig::new(dir.path())
            .with_refresh_interval(Duration::from_millis(100));
        let orchestrator = MonitoringOrchestrator::new(config).unwrap();

        orchestrator.stop();
        orchestrator.stop();
        assert!(!orchestrator.is_running());

        // Stopped is terminal: start after stop does not resume.
        orchestrator.start().unwrap();
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_wait_for_initial_data_times_out_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        write_usage(dir.path(), &[recent_record(5, "m1")]);

        let orchestrator =
            MonitoringOrchestrator::new(MonitorConfig::new(dir.path())).unwrap();
        assert!(!orchestrator.wait_for_initial_data(Duration::from_millis(100)));
    }

    #[test]
    fn test_force_refresh_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_usage(dir.path(), &[recent_record(5, "m1")]);

        let orchestrator =
            MonitoringOrchestrator::new(MonitorConfig::new(dir.path())).unwrap();

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        orchestrator.register_session_callback(move |transition| {
            let label = match transition {
                SessionTransition::Start { id, .. } => format!("start:{id}"),
                SessionTransition::End { id } => format!("end:{id}"),
            };
            sink.lock().unwrap().push(label);
        });

        let snapshot = orchestrator.force_refresh().unwrap();
        assert!(snapshot.active_block().is_some());
        assert_eq!(orchestrator.latest_snapshot().unwrap().token_limit, snapshot.token_limit);

        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("start:"));
    }

    #[test]
    fn test_force_refresh_after_stop_fires_no_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        write_usage(dir.path(), &[recent_record(5, "m1")]);

        let orchestrator =
            MonitoringOrchestrator::new(MonitorConfig::new(dir.path())).unwrap();

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updates);
        orchestrator.register_update_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        orchestrator.stop();
        let snapshot = orchestrator.force_refresh().unwrap();

        // The snapshot is still computed, but nothing is published.
        assert!(snapshot.active_block().is_some());
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert!(orchestrator.latest_snapshot().is_none());
    }

    #[test]
    fn test_session_end_delivered_before_start() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (ready_tx, _ready_rx) = watch::channel(false);

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        lock(&shared)
            .session_callbacks
            .push(Arc::new(move |transition: &SessionTransition| {
                let label = match transition {
                    SessionTransition::Start { id, .. } => format!("start:{id}"),
                    SessionTransition::End { id } => format!("end:{id}"),
                };
                sink.lock().unwrap().push(label);
            }));

        publish(&shared, &ready_tx, snapshot_with_active(Some("block-a")));
        publish(&shared, &ready_tx, snapshot_with_active(Some("block-b")));
        publish(&shared, &ready_tx, snapshot_with_active(None));

        let seen = events.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["start:block-a", "end:block-a", "start:block-b", "end:block-b"]
        );
    }

    #[test]
    fn test_unchanged_active_block_emits_no_transition() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (ready_tx, _ready_rx) = watch::channel(false);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        lock(&shared)
            .session_callbacks
            .push(Arc::new(move |_: &SessionTransition| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        publish(&shared, &ready_tx, snapshot_with_active(Some("block-a")));
        publish(&shared, &ready_tx, snapshot_with_active(Some("block-a")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
