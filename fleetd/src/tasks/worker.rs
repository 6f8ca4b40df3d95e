//! The worker pool itself: polls `pending` tasks, loads the provider's
//! adapter from the registry, and dispatches (spec §4.G).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_utils::{retry_with_backoff, Classify, ErrorKind, TaskId};
use serde::Deserialize;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{error, info, warn};

use crate::context::{Clock, ShutdownContext};
use crate::db::models::{Instance, InstanceKind, Task, TaskStatus, TaskType};
use crate::db::Storage;
use crate::error::AdapterError;
use crate::provider::{CreateInstanceRequest, ProgressReporter, ProviderAdapter};
use crate::registry::Registry;

/// How often the worker polls even without a trigger, so a task enqueued by
/// something other than the limiter is never stuck waiting forever.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on tasks processed concurrently ("a small worker pool", spec
/// §4.G/§5).
const WORKER_POOL_SIZE: usize = 4;
/// How often a running task's `can_force_stop` flag is polled.
const FORCE_STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize, Default)]
struct CreateTaskData {
    name: String,
    kind: InstanceKind,
    image: String,
    cpu: Option<u32>,
    memory: Option<String>,
    disk: Option<String>,
}

pub struct TaskEngine {
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownContext,
    notify: Notify,
}

impl TaskEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            registry,
            clock,
            shutdown,
            notify: Notify::new(),
        })
    }

    /// `TriggerTaskProcessing` (spec §4.G): wakes the poll loop immediately
    /// instead of waiting up to `POLL_INTERVAL`. The caller must have
    /// already committed the task row before calling this, so the loop
    /// never races the insertion (spec §5 ordering guarantee).
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!("task engine started");
        let semaphore = Arc::new(Semaphore::new(WORKER_POOL_SIZE));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("task engine shutting down");
                    break;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let pending = match self.storage.list_pending_tasks().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(error = %e, "failed to list pending tasks");
                    continue;
                }
            };

            for task in pending {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break, // pool is full this tick; pick the rest up on the next poll
                };
                let this = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    this.process(task).await;
                });
            }
        }
    }

    async fn process(&self, mut task: Task) {
        let now = self.clock.now();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        let mark_running = retry_with_backoff(|| self.storage.update_task(task.clone())).await;
        if let Err(e) = mark_running {
            error!(task_id = ?task.id, error = %e, "failed to mark task running");
            return;
        }

        let Some(adapter) = self.adapter_for(&task).await else {
            self.finish(
                task,
                TaskStatus::Failed,
                "provider adapter unavailable".to_string(),
            )
            .await;
            return;
        };

        let reporter = TaskProgressReporter {
            storage: self.storage.clone(),
            task_id: task.id,
            snapshot: Mutex::new(task.clone()),
        };

        let result = tokio::select! {
            r = self.dispatch(&task, adapter.as_ref(), &reporter) => r,
            e = self.watch_timeout_and_force_stop(&task) => Err(e),
        };

        let mut task = reporter.snapshot.into_inner();
        match result {
            Ok(status_message) => {
                self.finish(task, TaskStatus::Succeeded, status_message).await;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyInState => {
                self.finish(task, TaskStatus::Succeeded, "already in requested state".into()).await;
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                task.can_force_stop = false;
                self.finish(task, TaskStatus::Cancelled, "force-stopped".into()).await;
            }
            Err(AdapterError::Timeout) => {
                self.finish(task, TaskStatus::Failed, "timeout".into()).await;
            }
            Err(e) => {
                warn!(task_id = ?task.id, error = %e, "task failed");
                self.finish(task, TaskStatus::Failed, e.to_string()).await;
            }
        }
    }

    async fn adapter_for(&self, task: &Task) -> Option<Arc<dyn ProviderAdapter>> {
        if let Some(adapter) = self.registry.get(task.provider_id) {
            return Some(adapter);
        }
        // Adapter was evicted (provider frozen/removed then re-registered);
        // reload the registry once and try again (spec §4.G).
        if self.registry.refresh().await.is_err() {
            return None;
        }
        self.registry.get(task.provider_id)
    }

    /// Resolves once the task should be aborted — either because it ran
    /// past `timeout_seconds`, or because an administrator flipped
    /// `can_force_stop` (spec §4.G). Does not itself cancel the in-flight
    /// adapter call (no per-operation cancellation token is threaded down
    /// yet); reconciliation of whatever the remote host ends up in is left
    /// to the next health check, per spec §9.
    async fn watch_timeout_and_force_stop(&self, task: &Task) -> AdapterError {
        loop {
            tokio::time::sleep(FORCE_STOP_POLL_INTERVAL).await;
            if task.has_timed_out(self.clock.now()) {
                return AdapterError::Timeout;
            }
            if let Ok(fresh) = self.storage.get_task(task.id).await {
                if fresh.can_force_stop {
                    return AdapterError::Cancelled;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        task: &Task,
        adapter: &dyn ProviderAdapter,
        reporter: &TaskProgressReporter,
    ) -> Result<String, AdapterError> {
        match task.task_type {
            TaskType::Create => {
                let data: CreateTaskData = serde_json::from_value(task.task_data.clone())
                    .map_err(|e| AdapterError::Validation(e.to_string()))?;
                let instance_id = task.instance_id.ok_or_else(|| {
                    AdapterError::Validation("create task missing instance_id".into())
                })?;
                let instance = self.storage.get_instance(instance_id).await?;
                let ports = self.storage.list_ports(instance_id).await?;
                let req = CreateInstanceRequest {
                    name: data.name,
                    kind: data.kind,
                    image: data.image,
                    cpu: data.cpu,
                    memory: data.memory,
                    disk: data.disk,
                    ports,
                };
                let updated = adapter.create_instance(instance, req, reporter).await?;
                self.storage.update_instance(updated).await?;
                Ok("created".into())
            }
            TaskType::Start => {
                let name = self.instance_name(task).await?;
                adapter.start_instance(&name).await?;
                Ok("started".into())
            }
            TaskType::Stop => {
                let name = self.instance_name(task).await?;
                adapter.stop_instance(&name).await?;
                Ok("stopped".into())
            }
            TaskType::Restart => {
                let name = self.instance_name(task).await?;
                adapter.restart_instance(&name).await?;
                Ok("restarted".into())
            }
            TaskType::Delete => {
                let name = self.instance_name(task).await?;
                adapter.delete_instance(&name).await?;
                if let Some(id) = task.instance_id {
                    self.storage.soft_delete_instance(id, self.clock.now()).await?;
                }
                Ok("deleted".into())
            }
            TaskType::ResetPassword => {
                let name = self.instance_name(task).await?;
                let password = adapter.reset_instance_password(&name).await?;
                if let Some(id) = task.instance_id {
                    let mut instance = self.storage.get_instance(id).await?;
                    instance.password = Some(password);
                    self.storage.update_instance(instance).await?;
                }
                Ok("password reset".into())
            }
            TaskType::Configure => self.handle_configure(task).await,
            TaskType::MonitorAction => Ok("no-op".into()),
        }
    }

    /// Resource-limit changes are written to the instance row immediately
    /// and take effect the next time the instance is (re)started — there is
    /// no live-resize path common to all four hypervisors, so this avoids
    /// pretending one exists.
    async fn handle_configure(&self, task: &Task) -> Result<String, AdapterError> {
        let id = task
            .instance_id
            .ok_or_else(|| AdapterError::Validation("configure task missing instance_id".into()))?;
        let mut instance = self.storage.get_instance(id).await?;
        if let Some(cpu) = task.task_data.get("cpu").and_then(|v| v.as_u64()) {
            instance.cpu = cpu as u32;
        }
        if let Some(memory_mb) = task.task_data.get("memory_mb").and_then(|v| v.as_u64()) {
            instance.memory_mb = memory_mb;
        }
        if let Some(disk_mb) = task.task_data.get("disk_mb").and_then(|v| v.as_u64()) {
            instance.disk_mb = disk_mb;
        }
        self.storage.update_instance(instance).await?;
        Ok("applied; effective on next restart".into())
    }

    async fn instance_name(&self, task: &Task) -> Result<String, AdapterError> {
        let id = task
            .instance_id
            .ok_or_else(|| AdapterError::Validation("task missing instance_id".into()))?;
        let instance: Instance = self.storage.get_instance(id).await?;
        Ok(instance.name)
    }

    async fn finish(&self, mut task: Task, status: TaskStatus, message: String) {
        task.status = status;
        task.status_message = message;
        task.finished_at = Some(self.clock.now());
        if status == TaskStatus::Succeeded {
            task.progress = 100;
        }
        if let Err(e) = retry_with_backoff(|| self.storage.update_task(task.clone())).await {
            error!(task_id = ?task.id, error = %e, "failed to persist task completion");
        }
    }
}

/// Writes progress updates straight through to storage. `snapshot` tracks
/// the mutated fields so the caller can pick the final state back up after
/// `dispatch` returns without a second storage round-trip.
struct TaskProgressReporter {
    storage: Arc<dyn Storage>,
    task_id: TaskId,
    snapshot: Mutex<Task>,
}

#[async_trait]
impl ProgressReporter for TaskProgressReporter {
    async fn report(&self, progress: u8, message: &str) {
        let mut task = self.snapshot.lock().await;
        task.progress = progress;
        task.status_message = message.to_string();
        if let Err(e) = self.storage.update_task(task.clone()).await {
            warn!(task_id = ?self.task_id, error = %e, "failed to persist task progress");
        }
    }
}
