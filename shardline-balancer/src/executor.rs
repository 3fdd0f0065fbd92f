//! Action Executor
//!
//! Dispatches the actions of a pass through the data source with:
//! - Parallel dispatch across nodes
//! - Bounded concurrency globally and per target node
//! - Timeouts and retries
//! - Progress tracking
//!
//! Completion is never reported back to the balancer; the next pass observes
//! it in the catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shardline_core::{Action, NodeId};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::source::ClusterDataSource;

/// Executor errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Timeout during dispatch")]
    Timeout,

    #[error("Executor shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Result of dispatching a single action
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub action: Action,
    pub success: bool,
    pub error: Option<ExecutorError>,
    pub attempts: u32,
    pub duration: Duration,
}

/// Overall execution result
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Actions the nodes accepted
    pub succeeded: Vec<TaskResult>,
    /// Actions that failed after all retries
    pub failed: Vec<TaskResult>,
    /// Total execution time
    pub duration: Duration,
    /// Actions not dispatched because of shutdown
    pub skipped: usize,
}

impl ExecutionResult {
    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded.len() + self.failed.len();
        if total == 0 {
            100.0
        } else {
            (self.succeeded.len() as f64 / total as f64) * 100.0
        }
    }

    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped in {:?} ({:.1}% success rate)",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped,
            self.duration,
            self.success_rate()
        )
    }
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum concurrent dispatches
    pub max_concurrent: usize,
    /// Maximum concurrent dispatches per target node
    pub max_per_node: usize,
    /// Timeout per dispatch attempt in milliseconds
    pub dispatch_timeout_ms: u64,
    /// Number of retries for failed dispatches
    pub max_retries: u32,
    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
    /// Enable progress reporting
    pub report_progress: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_per_node: 3,
            dispatch_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            report_progress: true,
        }
    }
}

impl ExecutorConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Progress update for an action
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub action: Action,
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressStatus {
    Pending,
    Running,
    Completed,
    Failed(String),
    Retrying(u32),
}

/// Action executor
pub struct ActionExecutor {
    config: ExecutorConfig,
    /// Semaphore for global concurrency
    global_semaphore: Arc<Semaphore>,
    /// Per-node semaphores
    node_semaphores: Arc<RwLock<HashMap<NodeId, Arc<Semaphore>>>>,
    /// Progress channel
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    shutdown: CancellationToken,
}

impl ActionExecutor {
    /// Create a new executor
    pub fn new(config: ExecutorConfig) -> Self {
        let global_semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Self {
            config,
            global_semaphore,
            node_semaphores: Arc::new(RwLock::new(HashMap::new())),
            progress_tx: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create executor with progress channel
    pub fn with_progress(config: ExecutorConfig) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(100);
        let mut executor = Self::new(config);
        if executor.config.report_progress {
            executor.progress_tx = Some(tx);
        }
        (executor, rx)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Dispatch every action through `source`
    #[instrument(skip(self, actions, source), fields(actions = actions.len()))]
    pub async fn execute<S>(&self, actions: Vec<Action>, source: Arc<S>) -> ExecutionResult
    where
        S: ClusterDataSource + ?Sized + 'static,
    {
        let start = Instant::now();
        let mut result = ExecutionResult::default();

        if actions.is_empty() {
            return result;
        }

        info!(actions = actions.len(), "Dispatching actions");

        let mut handles = Vec::new();

        for action in actions {
            if self.shutdown.is_cancelled() {
                result.skipped += 1;
                continue;
            }

            let executor = self.clone_for_task();
            let source = source.clone();

            let handle =
                tokio::spawn(async move { executor.execute_action(action, source.as_ref()).await });

            handles.push(handle);
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(task_result) => {
                    if task_result.success {
                        result.succeeded.push(task_result);
                    } else {
                        result.failed.push(task_result);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Dispatch task panicked");
                }
            }
        }

        result.duration = start.elapsed();

        info!(summary = %result.summary(), "Dispatch complete");

        result
    }

    /// Dispatch one action with retries
    async fn execute_action<S>(&self, action: Action, source: &S) -> TaskResult
    where
        S: ClusterDataSource + ?Sized,
    {
        let start = Instant::now();

        self.report_progress(&action, ProgressStatus::Pending).await;

        let _global_permit = match self.global_semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return Self::failed(action, ExecutorError::Shutdown, 0, start),
        };

        let node_sem = self.get_node_semaphore(&action.target_node).await;
        let _node_permit = match node_sem.acquire().await {
            Ok(p) => p,
            Err(_) => return Self::failed(action, ExecutorError::Shutdown, 0, start),
        };

        self.report_progress(&action, ProgressStatus::Running).await;

        let mut last_error = None;
        let mut attempts = 0;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.report_progress(&action, ProgressStatus::Retrying(attempt))
                    .await;

                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay()) => {}
                    _ = self.shutdown.cancelled() => {
                        last_error = Some(ExecutorError::Shutdown);
                        break;
                    }
                }
            }
            attempts += 1;

            match timeout(self.config.dispatch_timeout(), source.send_action(&action)).await {
                Ok(Ok(())) => {
                    last_error = None;
                    break;
                }
                Ok(Err(e)) => {
                    warn!(action = %action, attempt, error = %e, "Dispatch attempt failed");
                    last_error = Some(ExecutorError::DispatchFailed(e.to_string()));
                }
                Err(_) => {
                    warn!(action = %action, attempt, "Dispatch attempt timed out");
                    last_error = Some(ExecutorError::Timeout);
                }
            }
        }

        let success = last_error.is_none();
        let status = match &last_error {
            None => ProgressStatus::Completed,
            Some(e) => ProgressStatus::Failed(e.to_string()),
        };
        self.report_progress(&action, status).await;

        TaskResult {
            action,
            success,
            error: last_error,
            attempts,
            duration: start.elapsed(),
        }
    }

    fn failed(action: Action, error: ExecutorError, attempts: u32, start: Instant) -> TaskResult {
        TaskResult {
            action,
            success: false,
            error: Some(error),
            attempts,
            duration: start.elapsed(),
        }
    }

    /// Get or create node semaphore
    async fn get_node_semaphore(&self, node_id: &str) -> Arc<Semaphore> {
        let semaphores = self.node_semaphores.read().await;
        if let Some(sem) = semaphores.get(node_id) {
            return sem.clone();
        }
        drop(semaphores);

        let mut semaphores = self.node_semaphores.write().await;
        semaphores
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_node.max(1))))
            .clone()
    }

    async fn report_progress(&self, action: &Action, status: ProgressStatus) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx
                .send(ProgressUpdate {
                    action: action.clone(),
                    status,
                })
                .await;
        }
    }

    /// Clone executor state for spawning task
    fn clone_for_task(&self) -> Self {
        Self {
            config: self.config.clone(),
            global_semaphore: self.global_semaphore.clone(),
            node_semaphores: self.node_semaphores.clone(),
            progress_tx: self.progress_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Signal shutdown; queued actions are skipped and retries stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("Executor shutdown signaled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ClusterState, InMemoryCluster};
    use shardline_core::{CloudInfo, NodeDescriptor, TabletDescriptor};

    fn cluster() -> Arc<InMemoryCluster> {
        let node = |id: &str| NodeDescriptor {
            id: id.to_string(),
            cloud_info: CloudInfo::new("c", "r", "z1"),
            placement_uuid: String::new(),
            is_live: true,
            reported_replicas: 0,
            reported_leaders: 0,
        };
        Arc::new(InMemoryCluster::new(ClusterState {
            nodes: vec![node("n1"), node("n2"), node("n3")],
            tablets: vec![TabletDescriptor {
                id: "a".to_string(),
                table_id: "t1".to_string(),
                replicas: vec!["n1".to_string(), "n2".to_string()],
                leader: Some("n1".to_string()),
                split_in_progress: false,
            }],
            ..Default::default()
        }))
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            max_retries: 1,
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_executor_config_default() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(30));
        assert!(config.report_progress);
    }

    #[test]
    fn test_execution_result_success_rate() {
        let mut result = ExecutionResult::default();
        assert_eq!(result.success_rate(), 100.0);

        let action = Action::add_replica("t1", "a", "n3");
        result.succeeded.push(TaskResult {
            action: action.clone(),
            success: true,
            error: None,
            attempts: 1,
            duration: Duration::from_millis(1),
        });
        result.failed.push(TaskResult {
            action,
            success: false,
            error: Some(ExecutorError::Timeout),
            attempts: 2,
            duration: Duration::from_millis(1),
        });

        assert_eq!(result.success_rate(), 50.0);
    }

    #[tokio::test]
    async fn test_execute_empty() {
        let executor = ActionExecutor::new(ExecutorConfig::default());
        let result = executor.execute(Vec::new(), cluster()).await;
        assert!(result.succeeded.is_empty());
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn test_execute_applies_actions() {
        let source = cluster();
        let executor = ActionExecutor::new(fast_config());

        let result = executor
            .execute(vec![Action::add_replica("t1", "a", "n3")], source.clone())
            .await;

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].attempts, 1);
        assert_eq!(source.replicas_on("n3"), 1);
    }

    #[tokio::test]
    async fn test_execute_retries_then_fails() {
        let source = cluster();
        source.reject_actions_for("n3");
        let executor = ActionExecutor::new(fast_config());

        let result = executor
            .execute(
                vec![
                    Action::add_replica("t1", "a", "n3"),
                    Action::step_down("t1", "a", "n1", "n2"),
                ],
                source.clone(),
            )
            .await;

        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].attempts, 2);
        assert!(matches!(
            result.failed[0].error,
            Some(ExecutorError::DispatchFailed(_))
        ));
        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(source.leaders_on("n2"), 1);
    }

    #[tokio::test]
    async fn test_progress_reported() {
        let (executor, mut rx) = ActionExecutor::with_progress(fast_config());
        let result = executor
            .execute(vec![Action::add_replica("t1", "a", "n3")], cluster())
            .await;
        assert_eq!(result.succeeded.len(), 1);

        let mut statuses = Vec::new();
        while let Ok(update) = rx.try_recv() {
            statuses.push(update.status);
        }
        assert_eq!(
            statuses,
            vec![
                ProgressStatus::Pending,
                ProgressStatus::Running,
                ProgressStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_skips_dispatch() {
        let source = cluster();
        let executor = ActionExecutor::new(fast_config());
        executor.shutdown();

        let result = executor
            .execute(vec![Action::add_replica("t1", "a", "n3")], source.clone())
            .await;
        assert_eq!(result.skipped, 1);
        assert!(source.sent_actions().is_empty());
    }
}
