//! Per-tenant bounded worker pool running connector tasks.
//!
//! Submissions go into one FIFO queue drained by `pool_size` worker tasks. There is no
//! priority and no mid-task cancellation: a job that was picked up always runs to the end.
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::metrics::{ExecutorMetrics, MetricsRegistry, MetricsSnapshot};
use super::task::{ConnectorError, ConnectorOutputs, ConnectorParameters, ConnectorResult, ConnectorTask, ExecutionContext};
use crate::persistence::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Created,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("connector executor of tenant {tenant_id} is {state:?}, not running")]
    NotRunning { tenant_id: TenantId, state: ExecutorState },
    #[error("connector queue of tenant {tenant_id} is full ({capacity} pending)")]
    QueueFull { tenant_id: TenantId, capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub pool_size: usize,
    /// Maximum pending submissions, unbounded when `None`.
    pub queue_capacity: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            queue_capacity: None,
        }
    }
}

type Reply = Result<ConnectorResult, ConnectorError>;

struct Job {
    task: Box<dyn ConnectorTask>,
    parameters: ConnectorParameters,
    context: ExecutionContext,
    reply: oneshot::Sender<Reply>,
}

/// Resolves once the submitted connector finished. Dropping it does not cancel the job.
#[must_use = "the connector keeps running, but its result is lost if the handle is dropped"]
pub struct ConnectorHandle {
    rx: oneshot::Receiver<Reply>,
}

impl Future for ConnectorHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped sender means the job was discarded by a pause
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(ConnectorError::Cancelled)))
    }
}

impl fmt::Debug for ConnectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectorHandle")
    }
}

struct Pool {
    sender: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    metrics: Arc<ExecutorMetrics>,
}

struct Inner {
    state: ExecutorState,
    pool: Option<Pool>,
}

pub struct TaskExecutor {
    tenant_id: TenantId,
    config: ExecutorConfig,
    registry: Arc<dyn MetricsRegistry>,
    inner: Mutex<Inner>,
    // serializes start/stop/pause/resume; never held by `execute`
    lifecycle: tokio::sync::Mutex<()>,
}

impl TaskExecutor {
    pub fn new(tenant_id: TenantId, config: ExecutorConfig, registry: Arc<dyn MetricsRegistry>) -> Self {
        Self {
            tenant_id,
            config,
            registry,
            inner: Mutex::new(Inner {
                state: ExecutorState::Created,
                pool: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    pub fn state(&self) -> ExecutorState {
        self.lock().state
    }

    /// Counters of the current pool generation, all zero while no pool exists.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.lock()
            .pool
            .as_ref()
            .map(|p| p.metrics.snapshot())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn start(&self) {
        let _guard = self.lifecycle.lock().await;
        let mut inner = self.lock();
        match inner.state {
            ExecutorState::Created | ExecutorState::Stopped => {
                inner.pool = Some(self.spawn_pool());
                inner.state = ExecutorState::Running;
                info!(
                    "connector executor of tenant {} started with {} workers",
                    self.tenant_id, self.config.pool_size
                );
            }
            state => debug!("connector executor of tenant {} already {:?}", self.tenant_id, state),
        }
    }

    /// Waits for every queued and running job to finish before returning.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let pool = {
            let mut inner = self.lock();
            inner.state = ExecutorState::Stopped;
            inner.pool.take()
        };
        if let Some(Pool { sender, tracker, .. }) = pool {
            // closing the queue lets the workers drain it and exit
            drop(sender);
            tracker.wait().await;
            ExecutorMetrics::unregister(self.registry.as_ref(), self.tenant_id);
        }
        info!("connector executor of tenant {} stopped", self.tenant_id);
    }

    /// Discards queued jobs, waits for the running ones and drops the metric instruments.
    /// Counters do not survive a pause.
    pub async fn pause(&self) {
        let _guard = self.lifecycle.lock().await;
        let pool = {
            let mut inner = self.lock();
            if inner.state != ExecutorState::Running {
                debug!("connector executor of tenant {} is {:?}, nothing to pause", self.tenant_id, inner.state);
                return;
            }
            inner.state = ExecutorState::Paused;
            inner.pool.take()
        };
        if let Some(Pool {
            sender,
            cancel,
            tracker,
            metrics,
        }) = pool
        {
            let discarded = metrics.pending();
            cancel.cancel();
            drop(sender);
            tracker.wait().await;
            ExecutorMetrics::unregister(self.registry.as_ref(), self.tenant_id);
            info!(
                "connector executor of tenant {} paused, {} queued connector(s) discarded",
                self.tenant_id, discarded
            );
        }
    }

    /// Builds a fresh pool of the configured size, counters start from zero.
    pub async fn resume(&self) {
        let _guard = self.lifecycle.lock().await;
        let mut inner = self.lock();
        if inner.state != ExecutorState::Paused {
            debug!("connector executor of tenant {} is {:?}, nothing to resume", self.tenant_id, inner.state);
            return;
        }
        inner.pool = Some(self.spawn_pool());
        inner.state = ExecutorState::Running;
        info!("connector executor of tenant {} resumed", self.tenant_id);
    }

    /// Queues a connector and returns immediately. Fails without queueing anything unless running.
    pub fn execute(
        &self,
        task: Box<dyn ConnectorTask>,
        parameters: ConnectorParameters,
        context: ExecutionContext,
    ) -> Result<ConnectorHandle, ExecutorError> {
        let inner = self.lock();
        let pool = match (&inner.state, inner.pool.as_ref()) {
            (ExecutorState::Running, Some(pool)) => pool,
            (state, _) => {
                warn!("rejecting connector for tenant {}: executor is {:?}", self.tenant_id, state);
                return Err(ExecutorError::NotRunning {
                    tenant_id: self.tenant_id,
                    state: *state,
                });
            }
        };
        if let Some(capacity) = self.config.queue_capacity {
            if pool.metrics.pending() >= capacity as u64 {
                return Err(ExecutorError::QueueFull {
                    tenant_id: self.tenant_id,
                    capacity,
                });
            }
        }

        let (reply, rx) = oneshot::channel();
        pool.metrics.on_submitted();
        let job = Job {
            task,
            parameters,
            context,
            reply,
        };
        if pool.sender.send(job).is_err() {
            pool.metrics.on_withdrawn();
            return Err(ExecutorError::NotRunning {
                tenant_id: self.tenant_id,
                state: inner.state,
            });
        }
        Ok(ConnectorHandle { rx })
    }

    /// The task's own failure is returned unchanged.
    pub async fn disconnect(&self, task: &mut dyn ConnectorTask) -> Result<(), ConnectorError> {
        disconnect(task).await
    }

    pub async fn disconnect_silently(&self, task: &mut dyn ConnectorTask) {
        disconnect_silently(task).await
    }

    fn spawn_pool(&self) -> Pool {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let metrics = ExecutorMetrics::new();
        metrics.register(self.registry.as_ref(), self.tenant_id);

        for worker in 0..self.config.pool_size.max(1) {
            tracker.spawn(worker_loop(
                worker,
                self.tenant_id,
                Arc::clone(&receiver),
                cancel.clone(),
                Arc::clone(&metrics),
            ));
        }
        tracker.close();

        Pool {
            sender,
            cancel,
            tracker,
            metrics,
        }
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("tenant_id", &self.tenant_id)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("metrics", &self.metrics())
            .finish()
    }
}

async fn worker_loop(
    worker: usize,
    tenant_id: TenantId,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    cancel: CancellationToken,
    metrics: Arc<ExecutorMetrics>,
) {
    loop {
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = queue.recv() => job,
            }
        };
        match job {
            Some(job) => run_job(job, &metrics, tenant_id).await,
            None => break,
        }
    }
    debug!("connector worker {} of tenant {} exited", worker, tenant_id);
}

async fn run_job(job: Job, metrics: &ExecutorMetrics, tenant_id: TenantId) {
    let Job {
        mut task,
        parameters,
        context,
        reply,
    } = job;

    metrics.on_started();
    let started = Instant::now();
    let outcome = AssertUnwindSafe(run_task(task.as_mut(), parameters))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ConnectorError::Execution("connector panicked".to_string())));
    let elapsed_millis = started.elapsed().as_millis() as u64;
    metrics.on_finished();

    match &outcome {
        Ok(_) => debug!(
            tenant_id,
            definition = ?context.connector_definition,
            process_instance = ?context.process_instance_id,
            elapsed_millis,
            "connector executed"
        ),
        Err(e) => warn!(
            tenant_id,
            definition = ?context.connector_definition,
            process_instance = ?context.process_instance_id,
            elapsed_millis,
            "connector failed: {}",
            e
        ),
    }

    // the caller may have dropped its handle
    let _ = reply.send(outcome.map(|outputs| ConnectorResult {
        outputs,
        elapsed_millis,
    }));
}

async fn run_task(task: &mut dyn ConnectorTask, parameters: ConnectorParameters) -> Result<ConnectorOutputs, ConnectorError> {
    task.set_input_parameters(parameters);
    let outputs = match connect_and_execute(task).await {
        Ok(outputs) => outputs,
        Err(e) => {
            disconnect_silently(task).await;
            return Err(e);
        }
    };
    disconnect(task).await?;
    Ok(outputs)
}

async fn connect_and_execute(task: &mut dyn ConnectorTask) -> Result<ConnectorOutputs, ConnectorError> {
    task.validate()?;
    task.connect().await?;
    task.execute().await
}

pub async fn disconnect(task: &mut dyn ConnectorTask) -> Result<(), ConnectorError> {
    task.disconnect().await
}

pub async fn disconnect_silently(task: &mut dyn ConnectorTask) {
    if let Err(e) = task.disconnect().await {
        warn!("an error occurred while disconnecting the connector {:?}: {}", task, e);
    }
}
