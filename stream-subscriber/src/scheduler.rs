//! Timers, task spawning and the shared runtime handed to subscriptions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::parser::Parsers;
use crate::transport::Transport;

/// Clock and task executor used by the state machine.
pub trait Scheduler: Send + Sync {
    fn now(&self) -> Instant;

    /// Run `task` in the background.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Run `task` after `delay` unless the returned token is cancelled first.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> CancellationToken;
}

/// [`Scheduler`] backed by the ambient tokio runtime. Honours tokio's paused
/// test clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }

    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
        token
    }
}

/// Monotonic generator of reference ids, shared by every subscription on a
/// streaming context so ids never collide.
#[derive(Debug, Default)]
pub struct ReferenceIds {
    last: AtomicU64,
}

impl ReferenceIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        (self.last.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

/// Collaborators shared by every subscription of one streaming connection.
#[derive(Clone)]
pub struct Runtime {
    pub transport: Arc<dyn Transport>,
    pub parsers: Arc<Parsers>,
    pub ids: Arc<ReferenceIds>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl Runtime {
    /// A runtime with the default parser registry, a fresh id generator and
    /// the tokio scheduler.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            parsers: Arc::new(Parsers::new()),
            ids: Arc::new(ReferenceIds::new()),
            scheduler: Arc::new(TokioScheduler),
        }
    }
}
