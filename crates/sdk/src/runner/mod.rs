//! Service runners: one task per registered method, consuming a private
//! subscription and dispatching each message to the handler.
//!
//! ```text
//!  Provisioning ──► Subscribing ──► Running ──► Draining ──► Closed
//!  (durable only)
//! ```

mod durable;
mod ephemeral;

use std::fmt;

use courier_broker::SubscriptionHandle;
use parking_lot::Mutex;

pub(crate) use durable::{spawn_durable, DurableDeps, DurableSpec};
pub(crate) use ephemeral::{spawn_ephemeral, EphemeralSpec};

/// Where a runner is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerState {
    Provisioning,
    Subscribing,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Provisioning => "provisioning",
            RunnerState::Subscribing => "subscribing",
            RunnerState::Running => "running",
            RunnerState::Draining => "draining",
            RunnerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Shared, observable state of one runner.
#[derive(Debug)]
pub struct Lifecycle {
    service: String,
    method: String,
    state: Mutex<RunnerState>,
}

impl Lifecycle {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            state: Mutex::new(RunnerState::Provisioning),
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    /// Move to `next`.  `Closed` is terminal.
    pub fn set(&self, next: RunnerState) {
        let mut state = self.state.lock();
        let current = *state;
        if current == RunnerState::Closed || current == next {
            return;
        }
        tracing::debug!(
            service = %self.service,
            method = %self.method,
            from = %current,
            to = %next,
            "runner state"
        );
        *state = next;
    }
}

/// Returned by method registration; observes the runner it started.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    service: String,
    method: String,
    subject: String,
    lifecycle: std::sync::Arc<Lifecycle>,
    subscription: SubscriptionHandle,
}

impl ServiceHandle {
    pub(crate) fn new(
        subject: &courier_protocol::Subject,
        lifecycle: std::sync::Arc<Lifecycle>,
        subscription: SubscriptionHandle,
    ) -> Self {
        Self {
            service: subject.service().to_string(),
            method: subject.method().to_string(),
            subject: subject.as_str().to_string(),
            lifecycle,
            subscription,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn state(&self) -> RunnerState {
        self.lifecycle.state()
    }

    /// Id of the underlying subscription.
    pub fn subscription_id(&self) -> u64 {
        self.subscription.id()
    }
}
