//! Task runtime port and the in-process implementation.
//!
//! An execution is one scheduled run of a job closure. Its id is the opaque handle the
//! control channel stores on the queue entry; stopping is cooperative through the
//! `CancellationToken` handed to the job.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RuntimeSettings,
    domain::{new_id, TaskId},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for its start delay.
    Pending,
    Running,
    /// Failed with a retryable error; waiting for the next attempt.
    Retrying,
    Terminal,
}

impl TaskState {
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

/// What a running job gets to see of its execution.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub attempt: u32,
    pub max_attempts: u32,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type TaskFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// A job the runtime can run (and re-run on retry).
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub run: TaskFn,
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(TaskContext) -> TaskFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(run),
        }
    }
}

#[async_trait]
pub trait TaskRuntime: Send + Sync {
    async fn schedule(&self, spec: TaskSpec, delay: Duration) -> Result<TaskId>;

    /// `None` when the runtime has never heard of this id.
    async fn state(&self, id: &TaskId) -> Option<TaskState>;

    /// Ask a live execution to stop. Returns `false` when it is unknown or terminal.
    async fn signal_stop(&self, id: &TaskId) -> bool;
}

/// Finished execution ids remembered so `state` can still answer `Terminal`.
const FINISHED_HISTORY: usize = 1024;

/// Tokio-backed runtime: one spawned task per execution, bounded retries of
/// retryable errors.
///
/// Live executions are tracked until they finish. After that only the id is kept, in
/// a bounded history; older ids report `None`.
#[derive(Clone)]
pub struct LocalTaskRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    settings: RuntimeSettings,
    tasks: tokio::sync::Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    live: HashMap<TaskId, TaskEntry>,
    finished: VecDeque<TaskId>,
}

impl Tasks {
    fn finish(&mut self, id: &TaskId) {
        if self.live.remove(id).is_none() {
            return;
        }
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(id.clone());
    }

    fn state(&self, id: &TaskId) -> Option<TaskState> {
        match self.live.get(id) {
            Some(t) => Some(t.state),
            None if self.finished.contains(id) => Some(TaskState::Terminal),
            None => None,
        }
    }
}

struct TaskEntry {
    name: String,
    state: TaskState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LocalTaskRuntime {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                settings,
                tasks: tokio::sync::Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Wait for an execution to finish. Returns immediately for unknown or finished
    /// ids.
    pub async fn join(&self, id: &TaskId) {
        let handle = {
            let mut tasks = self.inner.tasks.lock().await;
            tasks.live.get_mut(id).and_then(|t| t.handle.take())
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Signal every live execution and wait for them to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().await;
            tasks
                .live
                .values_mut()
                .filter_map(|t| {
                    t.cancel.cancel();
                    t.handle.take()
                })
                .collect()
        };
        tracing::info!(tasks = handles.len(), "stopping task runtime");
        for h in handles {
            let _ = h.await;
        }
    }
}

impl RuntimeInner {
    async fn set_state(&self, id: &TaskId, state: TaskState) {
        if let Some(t) = self.tasks.lock().await.live.get_mut(id) {
            t.state = state;
        }
    }

    async fn finish(&self, id: &TaskId) {
        self.tasks.lock().await.finish(id);
    }

    async fn drive(
        self: Arc<Self>,
        id: TaskId,
        spec: TaskSpec,
        delay: Duration,
        cancel: CancellationToken,
    ) {
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(task = %id, name = %spec.name, "task stopped before start");
                    self.finish(&id).await;
                    return;
                }
                _ = sleep(delay) => {}
            }
        }

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.set_state(&id, TaskState::Running).await;
            let ctx = TaskContext {
                task_id: id.clone(),
                attempt,
                max_attempts,
                cancel: cancel.clone(),
            };

            match (spec.run)(ctx).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < max_attempts && !cancel.is_cancelled() => {
                    tracing::warn!(
                        task = %id,
                        name = %spec.name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "task failed; retrying"
                    );
                    self.set_state(&id, TaskState::Retrying).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.settings.retry_backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(task = %id, name = %spec.name, attempt, error = %e, "task failed");
                    break;
                }
            }
        }

        self.finish(&id).await;
    }
}

#[async_trait]
impl TaskRuntime for LocalTaskRuntime {
    async fn schedule(&self, spec: TaskSpec, delay: Duration) -> Result<TaskId> {
        let id = TaskId(new_id());
        let cancel = CancellationToken::new();

        // Hold the map lock across spawn so the task cannot update its state before
        // the entry exists.
        let mut tasks = self.inner.tasks.lock().await;
        let name = spec.name.clone();
        let handle = tokio::spawn(Arc::clone(&self.inner).drive(
            id.clone(),
            spec,
            delay,
            cancel.clone(),
        ));
        tasks.live.insert(
            id.clone(),
            TaskEntry {
                name,
                state: TaskState::Pending,
                cancel,
                handle: Some(handle),
            },
        );
        tracing::debug!(task = %id, delay_ms = delay.as_millis() as u64, "task scheduled");
        Ok(id)
    }

    async fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.inner.tasks.lock().await.state(id)
    }

    async fn signal_stop(&self, id: &TaskId) -> bool {
        let tasks = self.inner.tasks.lock().await;
        match tasks.live.get(id) {
            Some(t) if t.state.is_live() => {
                t.cancel.cancel();
                tracing::info!(task = %id, name = %t.name, state = ?t.state, "stop signalled");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::errors::Error;

    fn settings(max_attempts: u32) -> RuntimeSettings {
        RuntimeSettings {
            max_attempts,
            retry_backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_task_can_be_stopped_before_it_starts() {
        let rt = LocalTaskRuntime::new(settings(1));
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let id = rt
            .schedule(
                TaskSpec::new("noop", move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(()) })
                }),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(rt.state(&id).await, Some(TaskState::Pending));
        assert!(rt.signal_stop(&id).await);
        rt.join(&id).await;
        assert_eq!(rt.state(&id).await, Some(TaskState::Terminal));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!rt.signal_stop(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_are_retried_up_to_the_limit() {
        let rt = LocalTaskRuntime::new(settings(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let id = rt
            .schedule(
                TaskSpec::new("flaky", move |ctx| {
                    a.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async move {
                        if ctx.is_final_attempt() {
                            Ok(())
                        } else {
                            Err(Error::Storage("db down".to_string()))
                        }
                    })
                }),
                Duration::ZERO,
            )
            .await
            .unwrap();
        rt.join(&id).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(rt.state(&id).await, Some(TaskState::Terminal));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_end_the_task() {
        let rt = LocalTaskRuntime::new(settings(3));
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let id = rt
            .schedule(
                TaskSpec::new("bad", move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Err(Error::Validation("nope".to_string())) })
                }),
                Duration::ZERO,
            )
            .await
            .unwrap();
        rt.join(&id).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_executions_are_released() {
        let rt = LocalTaskRuntime::new(settings(1));
        let mut ids = Vec::new();
        for _ in 0..FINISHED_HISTORY + 10 {
            let id = rt
                .schedule(
                    TaskSpec::new("noop", |_| Box::pin(async { Ok(()) })),
                    Duration::ZERO,
                )
                .await
                .unwrap();
            rt.join(&id).await;
            ids.push(id);
        }

        {
            let tasks = rt.inner.tasks.lock().await;
            assert!(tasks.live.is_empty(), "{} executions still tracked", tasks.live.len());
            assert_eq!(tasks.finished.len(), FINISHED_HISTORY);
        }
        assert_eq!(rt.state(ids.last().unwrap()).await, Some(TaskState::Terminal));
        assert_eq!(rt.state(&ids[0]).await, None);
        assert!(!rt.signal_stop(ids.last().unwrap()).await);
    }

    #[tokio::test]
    async fn unknown_ids_have_no_state() {
        let rt = LocalTaskRuntime::new(RuntimeSettings::default());
        let id = TaskId::from("missing");
        assert_eq!(rt.state(&id).await, None);
        assert!(!rt.signal_stop(&id).await);
    }
}
