//! Subscription registry: every live subscription and the task consuming it,
//! so shutdown can reach all of them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use courier_broker::SubscriptionHandle;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::runner::{Lifecycle, RunnerState};

struct Tracked {
    handle: SubscriptionHandle,
    task: Option<JoinHandle<()>>,
    lifecycle: Option<Arc<Lifecycle>>,
}

/// Outcome of [`SubscriptionRegistry::drain_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Subscriptions drained gracefully.
    pub drained: usize,
    /// Subscriptions whose drain failed and were force-unsubscribed.
    pub forced: usize,
    /// Tasks that ended with a panic or were aborted.
    pub failed_tasks: usize,
}

/// Set of live subscriptions, keyed by subscription id.
///
/// Runner loops unregister themselves when they end; that may happen at any
/// time, including while [`drain_all`](Self::drain_all) is running.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<u64, Tracked>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a subscription that has no dedicated task.
    pub fn register(&self, handle: SubscriptionHandle) {
        self.entries.lock().insert(
            handle.id(),
            Tracked {
                handle,
                task: None,
                lifecycle: None,
            },
        );
    }

    /// Spawn `work` as the task consuming `handle` and track both.
    ///
    /// The entry is complete before `work` first runs, so a concurrent
    /// [`drain_all`](Self::drain_all) always sees the task and a loop that
    /// ends at once still finds its entry to remove.
    pub(crate) fn spawn_tracked<F>(
        &self,
        handle: SubscriptionHandle,
        lifecycle: Option<Arc<Lifecycle>>,
        work: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let (start, gate) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if gate.await.is_ok() {
                work.await;
            }
        });
        self.entries.lock().insert(
            handle.id(),
            Tracked {
                handle,
                task: Some(task),
                lifecycle,
            },
        );
        let _ = start.send(());
    }

    /// Stop tracking subscription `id`.  Returns whether it was tracked.
    pub fn unregister(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Subjects of every tracked subscription, sorted.
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .entries
            .lock()
            .values()
            .map(|t| t.handle.subject().to_string())
            .collect();
        subjects.sort();
        subjects
    }

    /// Drain every subscription, falling back to a forced unsubscribe when
    /// draining fails, then wait for every consuming task to finish.
    ///
    /// In-flight handler invocations complete before this returns.
    pub async fn drain_all(&self) -> DrainReport {
        let entries: Vec<Tracked> = self.entries.lock().drain().map(|(_, t)| t).collect();
        let mut report = DrainReport::default();
        let mut tasks = Vec::new();

        for entry in entries {
            if let Some(lc) = &entry.lifecycle {
                lc.set(RunnerState::Draining);
            }
            match entry.handle.drain().await {
                Ok(()) => report.drained += 1,
                Err(e) => {
                    tracing::warn!(
                        subject = %entry.handle.subject(),
                        error = %e,
                        "drain failed, forcing unsubscribe"
                    );
                    if let Err(e) = entry.handle.unsubscribe().await {
                        tracing::warn!(
                            subject = %entry.handle.subject(),
                            error = %e,
                            "forced unsubscribe failed"
                        );
                    }
                    report.forced += 1;
                }
            }
            tasks.push((entry.task, entry.lifecycle));
        }

        let (handles, lifecycles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let joins = handles.into_iter().flatten();
        for result in futures_util::future::join_all(joins).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "subscription task ended abnormally");
                report.failed_tasks += 1;
            }
        }
        for lc in lifecycles.into_iter().flatten() {
            lc.set(RunnerState::Closed);
        }

        tracing::info!(
            drained = report.drained,
            forced = report.forced,
            "subscriptions drained"
        );
        report
    }

    /// Force-unsubscribe everything without waiting for handlers.  Returns
    /// the number of subscriptions released.
    pub async fn unsubscribe_all(&self) -> usize {
        let entries: Vec<Tracked> = self.entries.lock().drain().map(|(_, t)| t).collect();
        let count = entries.len();
        for entry in entries {
            if let Err(e) = entry.handle.unsubscribe().await {
                tracing::warn!(subject = %entry.handle.subject(), error = %e, "unsubscribe failed");
            }
            if let Some(task) = entry.task {
                task.abort();
            }
            if let Some(lc) = entry.lifecycle {
                lc.set(RunnerState::Closed);
            }
        }
        count
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("len", &self.len())
            .finish()
    }
}
