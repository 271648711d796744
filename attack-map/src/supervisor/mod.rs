//! Zone worker supervision.
//!
//! The [`Supervisor`] owns one task per zone in a `JoinSet`. A task that
//! ends while the process is still running (error return, panic or an
//! early `Ok`) is treated as a crash. The first crashes inside the failure
//! window restart at once; later ones wait on the restart [`BackoffPolicy`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::Result;
use crate::ingest::ZoneRunner;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay for crashes past `immediate_restarts`. `max_retries` is ignored,
    /// workers are always restarted.
    pub restart_backoff: BackoffPolicy,
    /// Crashes older than this are forgotten.
    pub failure_window: Duration,
    /// Crashes inside the window that restart without waiting.
    pub immediate_restarts: u32,
    /// How long workers get to stop before they are aborted.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff: BackoffPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                ..BackoffPolicy::default()
            },
            failure_window: Duration::from_secs(60),
            immediate_restarts: 1,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct PendingRestart {
    zone: String,
    restart_at: Instant,
}

/// What happened when a worker task finished.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCompletionAction {
    /// Stopped because of shutdown.
    Stopped { zone: String },
    /// Crashed; a restart is queued.
    RestartScheduled { zone: String, backoff: Duration },
    /// Finished task that was not tracked.
    Unknown,
}

/// Report from [`Supervisor::shutdown`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    pub total_workers: usize,
    pub graceful_stops: usize,
    pub forced_terminations: usize,
}

pub struct Supervisor {
    runner: Arc<dyn ZoneRunner>,
    tasks: JoinSet<Result<()>>,
    zones_by_task: HashMap<Id, String>,
    /// Recent crash times per zone, oldest first.
    crashes: HashMap<String, VecDeque<Instant>>,
    pending_restarts: Vec<PendingRestart>,
    config: SupervisorConfig,
    token: CancellationToken,
}

impl Supervisor {
    pub fn new(runner: Arc<dyn ZoneRunner>, token: CancellationToken) -> Self {
        Self::with_config(runner, token, SupervisorConfig::default())
    }

    pub fn with_config(
        runner: Arc<dyn ZoneRunner>,
        token: CancellationToken,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            runner,
            tasks: JoinSet::new(),
            zones_by_task: HashMap::new(),
            crashes: HashMap::new(),
            pending_restarts: Vec::new(),
            config,
            token,
        }
    }

    /// Start a worker for `zone`. Returns `false` if one is already running
    /// or waiting to restart.
    pub fn spawn_zone(&mut self, zone: impl Into<String>) -> bool {
        let zone = zone.into();
        if self.is_tracked(&zone) {
            return false;
        }
        self.spawn_unchecked(zone);
        true
    }

    fn spawn_unchecked(&mut self, zone: String) {
        let worker = self.runner.run_zone(zone.clone(), self.token.child_token());
        let handle = self.tasks.spawn(worker);
        debug!(zone = %zone, task_id = %handle.id(), "Spawned zone worker");
        self.zones_by_task.insert(handle.id(), zone);
    }

    fn is_tracked(&self, zone: &str) -> bool {
        self.zones_by_task.values().any(|z| z == zone)
            || self.pending_restarts.iter().any(|r| r.zone == zone)
    }

    /// Zones with a live task, sorted.
    pub fn running_zones(&self) -> Vec<String> {
        let mut zones: Vec<_> = self.zones_by_task.values().cloned().collect();
        zones.sort();
        zones
    }

    pub fn next_restart_time(&self) -> Option<Instant> {
        self.pending_restarts.iter().map(|r| r.restart_at).min()
    }

    /// Classify a finished task and queue a restart if it crashed.
    pub fn handle_task_completion(
        &mut self,
        joined: std::result::Result<(Id, Result<()>), JoinError>,
    ) -> TaskCompletionAction {
        let (id, failure) = match joined {
            Ok((id, Ok(()))) => (id, None),
            Ok((id, Err(e))) => (id, Some(e.to_string())),
            Err(e) if e.is_panic() => (e.id(), Some("worker panicked".to_string())),
            Err(e) => (e.id(), Some(e.to_string())),
        };

        let Some(zone) = self.zones_by_task.remove(&id) else {
            return TaskCompletionAction::Unknown;
        };

        if self.token.is_cancelled() {
            debug!(zone = %zone, "Zone worker stopped");
            return TaskCompletionAction::Stopped { zone };
        }

        let reason = failure.unwrap_or_else(|| "worker exited unexpectedly".to_string());
        let (recent_crashes, backoff) = self.record_crash(&zone);
        error!(
            zone = %zone,
            error = %reason,
            recent_crashes,
            backoff_ms = backoff.as_millis() as u64,
            "Zone worker crashed"
        );

        self.pending_restarts.push(PendingRestart {
            zone: zone.clone(),
            restart_at: Instant::now() + backoff,
        });
        TaskCompletionAction::RestartScheduled { zone, backoff }
    }

    /// Note a crash of `zone` and work out how long to wait before restarting
    /// it. Returns the crash count inside the window, this one included.
    fn record_crash(&mut self, zone: &str) -> (u32, Duration) {
        let now = Instant::now();
        let window = self.config.failure_window;
        let crashes = self.crashes.entry(zone.to_string()).or_default();
        while crashes
            .front()
            .is_some_and(|&at| now.duration_since(at) >= window)
        {
            crashes.pop_front();
        }
        crashes.push_back(now);

        let recent = u32::try_from(crashes.len()).unwrap_or(u32::MAX);
        let backoff = match recent.checked_sub(self.config.immediate_restarts.saturating_add(1)) {
            Some(attempt) => self.config.restart_backoff.delay_for_attempt(attempt),
            None => Duration::ZERO,
        };
        (recent, backoff)
    }

    /// Restart every worker whose backoff has elapsed. Returns how many.
    pub fn process_pending_restarts(&mut self) -> usize {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .pending_restarts
            .drain(..)
            .partition(|r| r.restart_at <= now);
        self.pending_restarts = waiting;

        for restart in &due {
            info!(zone = %restart.zone, "Restarting zone worker");
            self.spawn_unchecked(restart.zone.clone());
        }
        due.len()
    }

    /// Spawn `zones` and supervise them until the token is cancelled, then
    /// shut down.
    pub async fn run(mut self, zones: Vec<String>) -> ShutdownReport {
        for zone in zones {
            if !self.spawn_zone(zone.clone()) {
                warn!(zone = %zone, "Duplicate zone ignored");
            }
        }
        info!(zones = self.zones_by_task.len(), "Supervisor started");

        loop {
            let wake_at = self
                .next_restart_time()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.handle_task_completion(joined);
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    self.process_pending_restarts();
                }
            }
        }

        self.shutdown().await
    }

    /// Cancel all workers, wait up to the shutdown timeout, then abort
    /// whatever is left.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let total_workers = self.tasks.len();
        info!(
            workers = total_workers,
            timeout_secs = self.config.shutdown_timeout.as_secs(),
            "Stopping zone workers"
        );

        self.token.cancel();
        self.pending_restarts.clear();

        let mut report = ShutdownReport {
            total_workers,
            ..Default::default()
        };
        let deadline = Instant::now() + self.config.shutdown_timeout;

        while !self.tasks.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    report.forced_terminations = self.tasks.len();
                    warn!(remaining = report.forced_terminations, "Shutdown timeout reached, aborting workers");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
                joined = self.tasks.join_next_with_id() => match joined {
                    Some(Ok((id, _))) => {
                        self.zones_by_task.remove(&id);
                        report.graceful_stops += 1;
                    }
                    Some(Err(e)) => {
                        self.zones_by_task.remove(&e.id());
                        report.forced_terminations += 1;
                    }
                    None => break,
                },
            }
        }

        self.zones_by_task.clear();
        info!(
            total = report.total_workers,
            graceful = report.graceful_stops,
            forced = report.forced_terminations,
            "Supervisor shutdown complete"
        );
        report
    }
}
