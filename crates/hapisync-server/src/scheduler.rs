//! Periodic background jobs.
//!
//! The daemon runs one scheduler for full syncs of every connected user and
//! one for push-channel renewal. Each scheduler supports:
//! - Configurable intervals with jitter so processes sharing a database
//!   drift apart
//! - Exponential backoff while the job keeps failing
//! - Commands from a [`SchedulerHandle`] to run immediately or stop

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

/// Timing for one periodic job.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Job name used in log lines.
    pub name: &'static str,
    /// Delay between healthy runs, before jitter.
    pub interval: Duration,
    /// Jitter bound as a share of `interval`, clamped to `0.0..=1.0`.
    pub jitter_fraction: f64,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound for the failure delay.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Consecutive failures after which every failure is logged as an error.
    pub failure_alert_threshold: u32,
    /// Run the job once as soon as the scheduler starts.
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "sync",
            interval: Duration::from_secs(900),     // 15 minutes
            jitter_fraction: 0.1,                   // 10% jitter
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(1800), // 30 minutes
            backoff_multiplier: 2.0,
            failure_alert_threshold: 5,
            run_on_start: true,
        }
    }
}

impl SchedulerConfig {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    /// Interval for the next healthy run, jittered both ways.
    pub fn next_delay(&self) -> Duration {
        let base = self.interval.as_secs_f64();
        let jitter = rand_jitter(base * self.jitter_fraction);
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    /// Delay after `consecutive_failures` failed runs in a row. Zero means
    /// the last run succeeded.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff.as_secs_f64();
        let exponent = i32::try_from(consecutive_failures - 1).unwrap_or(i32::MAX);
        let delay = base * self.backoff_multiplier.powi(exponent);
        let max = self.max_backoff.as_secs_f64();

        Duration::from_secs_f64(delay.min(max))
    }
}

/// A value in [-range, range].
fn rand_jitter(range: f64) -> f64 {
    if range <= 0.0 {
        return 0.0;
    }
    rand::rng().random_range(-range..=range)
}

/// Messages accepted by a running [`Scheduler`].
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Runs the job immediately. The next timer tick is rescheduled from
    /// the end of this run.
    RunNow,
    Stop,
}

/// Run history of one job, readable through a [`SchedulerHandle`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    /// Reset to zero by the next successful run.
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Number of completed runs, successful or not.
    pub runs: u64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
        self.last_attempt = self.last_success;
        self.last_error = None;
        self.runs += 1;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures += 1;
        self.last_attempt = Some(Utc::now());
        self.last_error = Some(error.into());
        self.runs += 1;
    }
}

type SharedSchedulerState = Arc<RwLock<SchedulerState>>;

fn new_scheduler_state() -> SharedSchedulerState {
    Arc::new(RwLock::new(SchedulerState::new()))
}

/// Runs one job periodically.
pub struct Scheduler {
    config: SchedulerConfig,
    state: SharedSchedulerState,
    command_tx: mpsc::Sender<SchedulerCommand>,
    command_rx: Option<mpsc::Receiver<SchedulerCommand>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            config,
            state: new_scheduler_state(),
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    /// Handles stay valid after [`Scheduler::run`] consumes the scheduler.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            command_tx: self.command_tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Drives `job` until a `Stop` arrives or every handle is dropped.
    ///
    /// A job reports failure as a message, which lands in
    /// [`SchedulerState::last_error`] and switches the loop to backoff.
    pub async fn run<F, Fut>(mut self, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send,
    {
        let name = self.config.name;
        let Some(mut command_rx) = self.command_rx.take() else {
            return;
        };
        info!(
            job = name,
            interval_secs = self.config.interval.as_secs(),
            "scheduler started"
        );

        if self.config.run_on_start {
            self.run_job(&job).await;
        }

        loop {
            let delay = self.calculate_next_delay().await;
            debug!(job = name, delay_secs = delay.as_secs(), "scheduling next run");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.run_job(&job).await;
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::RunNow) => {
                            debug!(job = name, "received RunNow command");
                            self.run_job(&job).await;
                        }
                        Some(SchedulerCommand::Stop) | None => {
                            info!(job = name, "scheduler stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn calculate_next_delay(&self) -> Duration {
        let state = self.state.read().await;
        if state.consecutive_failures > 0 {
            let backoff = self.config.backoff_delay(state.consecutive_failures);
            debug!(
                job = self.config.name,
                failures = state.consecutive_failures,
                backoff_secs = backoff.as_secs(),
                "using backoff delay"
            );
            return backoff;
        }
        self.config.next_delay()
    }

    async fn run_job<F, Fut>(&self, job: &F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let name = self.config.name;
        debug!(job = name, "starting run");
        match job().await {
            Ok(()) => {
                debug!(job = name, "run completed");
                self.state.write().await.record_success();
            }
            Err(e) => {
                let mut state = self.state.write().await;
                state.record_failure(e.clone());
                if state.consecutive_failures >= self.config.failure_alert_threshold {
                    error!(job = name, failures = state.consecutive_failures, error = %e, "job keeps failing");
                } else {
                    warn!(job = name, error = %e, "run failed");
                }
            }
        }
    }
}

/// Cloneable remote control for a [`Scheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    state: SharedSchedulerState,
}

impl SchedulerHandle {
    pub async fn run_now(&self) -> Result<(), mpsc::error::SendError<SchedulerCommand>> {
        self.command_tx.send(SchedulerCommand::RunNow).await
    }

    /// The loop exits after the run in progress, if any, completes.
    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<SchedulerCommand>> {
        self.command_tx.send(SchedulerCommand::Stop).await
    }

    /// Snapshot of the run history.
    pub async fn state(&self) -> SchedulerState {
        self.state.read().await.clone()
    }
}
