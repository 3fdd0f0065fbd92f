//! Balancer service
//!
//! Runs one balancer per configured option set on an interval or when
//! triggered, and hands each cycle's actions to the executor without waiting
//! for them. Triggers that arrive while a cycle runs collapse into a single
//! follow-up cycle.
//!
//! All balancers record into one pending task tracker, so a tablet never has
//! conflicting tasks from two option sets in flight.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::balancer::{Balancer, PassReport};
use crate::config::{BalancerConfig, ConfigError};
use crate::executor::{ActionExecutor, ExecutionResult, ExecutorError};
use crate::pending::SharedTracker;
use crate::source::ClusterDataSource;

/// Requests an extra pass; any number of fires before the next cycle starts
/// produce one cycle
#[derive(Debug, Clone, Default)]
pub struct PassTrigger {
    notify: Arc<Notify>,
}

impl PassTrigger {
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

pub struct BalancerService<S: ClusterDataSource + ?Sized + 'static> {
    source: Arc<S>,
    config: BalancerConfig,
    balancers: Vec<Balancer<S>>,
    tracker: SharedTracker,
    executor: Arc<ActionExecutor>,
    trigger: PassTrigger,
    cancel: CancellationToken,
    dispatches: Vec<JoinHandle<ExecutionResult>>,
    cycles: u64,
}

impl<S: ClusterDataSource + ?Sized + 'static> BalancerService<S> {
    pub fn new(source: Arc<S>, config: BalancerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = ActionExecutor::new(config.executor.clone());
        Ok(Self::with_executor(source, config, executor))
    }

    /// Build the service around an existing executor, e.g. one with a progress channel
    pub fn with_executor(source: Arc<S>, config: BalancerConfig, executor: ActionExecutor) -> Self {
        let tracker = SharedTracker::default();
        let balancers = config
            .passes
            .iter()
            .map(|options| Balancer::with_tracker(source.clone(), options.clone(), tracker.clone()))
            .collect();

        Self {
            source,
            config,
            balancers,
            tracker,
            executor: Arc::new(executor),
            trigger: PassTrigger::default(),
            cancel: CancellationToken::new(),
            dispatches: Vec::new(),
            cycles: 0,
        }
    }

    pub fn trigger(&self) -> PassTrigger {
        self.trigger.clone()
    }

    /// Token that stops the service and abandons the running pass
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn balancers(&self) -> &[Balancer<S>] {
        &self.balancers
    }

    /// Cycles completed so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run every balancer once and dispatch what they committed
    pub async fn run_cycle(&mut self) -> Vec<PassReport> {
        self.reap_dispatches().await;

        let mut reports = Vec::new();
        let mut actions = Vec::new();

        for balancer in &mut self.balancers {
            match balancer.run_pass(&self.cancel).await {
                Ok(report) => {
                    if self.config.dry_run {
                        info!(report = %report, "Dry run, not dispatching");
                        balancer.forget_actions(&report.actions);
                    } else {
                        actions.extend(report.actions.iter().cloned());
                    }
                    reports.push(report);
                }
                Err(e) => {
                    error!(error = %e, "Balancing pass failed");
                }
            }
        }
        self.cycles += 1;

        if !actions.is_empty() {
            let executor = self.executor.clone();
            let source = self.source.clone();
            self.dispatches
                .push(tokio::spawn(async move { executor.execute(actions, source).await }));
        }

        reports
    }

    /// Wait for every outstanding dispatch to finish
    pub async fn wait_for_dispatch(&mut self) -> Vec<ExecutionResult> {
        let mut results = Vec::new();
        let handles: Vec<_> = self.dispatches.drain(..).collect();
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    self.release_rejected(&result);
                    results.push(result);
                }
                Err(e) => error!(error = %e, "Dispatch task failed"),
            }
        }
        results
    }

    /// Collect dispatches that already finished
    async fn reap_dispatches(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .dispatches
            .drain(..)
            .partition(|handle| handle.is_finished());
        self.dispatches = running;

        for handle in finished {
            match handle.await {
                Ok(result) => self.release_rejected(&result),
                Err(e) => error!(error = %e, "Dispatch task failed"),
            }
        }
    }

    /// Free the tablets of actions the nodes refused
    ///
    /// Timed out actions stay tracked since they may still land.
    fn release_rejected(&self, result: &ExecutionResult) {
        if result.failed.is_empty() {
            return;
        }
        warn!(summary = %result.summary(), "Dispatch finished with failures");

        let mut tracker = self.tracker.lock();
        for task in &result.failed {
            if matches!(task.error, Some(ExecutorError::DispatchFailed(_))) {
                debug!(action = %task.action, "Releasing rejected action");
                tracker.forget(&task.action.tablet_id, task.action.kind);
            }
        }
    }

    /// Run cycles until cancelled or `max_cycles` have completed
    pub async fn run(&mut self, max_cycles: Option<u64>) -> u64 {
        let interval = self.config.pass_interval();
        info!(
            pass_interval = ?interval,
            passes = self.balancers.len(),
            dry_run = self.config.dry_run,
            "Balancer service started"
        );

        while !self.cancel.is_cancelled() {
            self.run_cycle().await;
            if max_cycles.map(|max| self.cycles >= max).unwrap_or(false) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.trigger.notified() => {
                    debug!("Pass triggered");
                }
                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received");
                }
            }
        }

        self.wait_for_dispatch().await;
        self.executor.shutdown();
        info!(cycles = self.cycles, "Balancer service stopped");

        self.cycles
    }
}
