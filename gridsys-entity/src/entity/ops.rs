// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// Layer 3: Internal module imports
use super::context::EntityContext;
use super::traits::Entity;
use crate::message::RoutedEnvelope;

/// The entity shut down before a queued operation could start.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("entity shut down before the operation ran")]
pub struct OpCancelled;

/// A background task handed to [`EntityContext::continue_with`] failed.
#[derive(Debug, Error, Clone)]
#[error("background task failed: {message}")]
pub struct TaskError {
    /// Failure description; panic payloads are unwrapped to their message.
    pub message: String,
}

impl TaskError {
    pub(crate) fn from_join(err: JoinError) -> Self {
        if err.is_panic() {
            let panic = err.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            Self { message }
        } else {
            Self { message: "task was cancelled".to_string() }
        }
    }
}

/// A unit of work executed on an entity's own task, between handlers.
///
/// Deferred execution, delayed execution, and background-task continuations
/// all flow through this trait; the runner awaits `run` to completion before
/// taking the next mailbox item, so tasks see the same serialization
/// guarantee as message handlers.
#[async_trait]
pub trait EntityTask<E>: Send + 'static {
    /// Execute on the entity's task.
    async fn run(self: Box<Self>, entity: &mut E, ctx: &mut EntityContext<E>);

    /// Called instead of [`EntityTask::run`] when the entity shuts down
    /// before the task starts. The default drops the task, which is enough
    /// for tasks whose callers watch a channel.
    fn cancelled(self: Box<Self>) {}
}

/// Everything an entity's runner can receive on its op queue.
pub(crate) enum EntityOp<E> {
    /// A routed message for dispatch.
    Deliver(RoutedEnvelope),
    /// Deferred execution, from the context or an [`super::EntityHandle`].
    Execute(Box<dyn EntityTask<E>>),
    /// Delayed execution; lands in the runner's task queue.
    Schedule { at: Instant, task: Box<dyn EntityTask<E>>, cancel: CancellationToken },
    /// Coalesced persist request (persisted kinds only).
    SchedulePersist,
    /// Gate passed its suspend point; run the suspend hook.
    Suspend,
    /// Delivery re-opened; run the resume hook.
    Resume,
    /// Throttled shutdown reached this entity.
    Shutdown,
}

/// Adapter running a plain closure as an [`EntityTask`], optionally
/// reporting its result through a oneshot.
pub(crate) struct ExecuteTask<F, R> {
    f: Option<F>,
    reply: Option<oneshot::Sender<R>>,
}

impl<F, R> ExecuteTask<F, R> {
    /// Task plus the receiver resolving when it ran. Dropping the task
    /// (shutdown) drops the sender, which the caller observes as
    /// [`OpCancelled`].
    pub fn pair(f: F) -> (Self, oneshot::Receiver<R>) {
        let (tx, rx) = oneshot::channel();
        (Self { f: Some(f), reply: Some(tx) }, rx)
    }
}

impl<F> ExecuteTask<F, ()> {
    /// Fire-and-forget task.
    pub fn detached(f: F) -> Self {
        Self { f: Some(f), reply: None }
    }
}

#[async_trait]
impl<E, F, R> EntityTask<E> for ExecuteTask<F, R>
where
    E: Entity,
    F: FnOnce(&mut E, &mut EntityContext<E>) -> R + Send + 'static,
    R: Send + 'static,
{
    async fn run(mut self: Box<Self>, entity: &mut E, ctx: &mut EntityContext<E>) {
        if let Some(f) = self.f.take() {
            let result = f(entity, ctx);
            if let Some(reply) = self.reply.take() {
                let _ = reply.send(result);
            }
        }
    }
}

/// Adapter delivering a finished background task's outcome to a
/// continuation on the entity's task.
pub(crate) struct ContinueTask<F, T> {
    outcome: Option<Result<T, TaskError>>,
    f: Option<F>,
}

impl<F, T> ContinueTask<F, T> {
    pub fn new(outcome: Result<T, TaskError>, f: F) -> Self {
        Self { outcome: Some(outcome), f: Some(f) }
    }
}

#[async_trait]
impl<E, F, T> EntityTask<E> for ContinueTask<F, T>
where
    E: Entity,
    F: FnOnce(&mut E, &mut EntityContext<E>, Result<T, TaskError>) + Send + 'static,
    T: Send + 'static,
{
    async fn run(mut self: Box<Self>, entity: &mut E, ctx: &mut EntityContext<E>) {
        if let (Some(f), Some(outcome)) = (self.f.take(), self.outcome.take()) {
            f(entity, ctx, outcome);
        }
    }
}
