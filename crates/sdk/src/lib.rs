//! `courier-sdk`: RPC and durable job delivery over a publish/subscribe
//! broker.
//!
//! Services register handlers for `service.method` subjects; callers invoke
//! them either directly (request/reply, retried while nobody is listening)
//! or persistently (the request is stored in a stream first and processed
//! by a durable consumer, at least once).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Courier                                                  │
//! │                                                           │
//! │   register_method ──────► ephemeral runner ─┐             │
//! │   register_durable_method ► durable runner ─┤             │
//! │   subscribe ────────────► event task ───────┤             │
//! │                                             ▼             │
//! │                              SubscriptionRegistry         │
//! │                              (drain / close)              │
//! │                                                           │
//! │   call ─────────────────► RequestClient (retry/backoff)   │
//! │   call_persistent/enqueue ► StreamProvisioner             │
//! │                             └► PersistentClient           │
//! └──────────────┬──────────────────────────┬─────────────────┘
//!                │ Broker                   │ LogBroker
//!                ▼                          ▼
//!        publish/subscribe            streams + durable consumers
//! ```
//!
//! # Wire format
//!
//! - Requests are a JSON array of positional arguments.
//! - Replies are `{"status":"ok","result":…}` or
//!   `{"status":"error","message":…,"kind":…,"detail":…}`.
//! - Subjects are `"{service}.{method}"`; each method's stream and durable
//!   consumer are named deterministically from it.
//!
//! # Failure handling
//!
//! - Timeouts are never retried; "no responders" is retried with jittered
//!   exponential back-off.
//! - A durable job is acknowledged after its reply is sent, whether the
//!   handler succeeded or not, unless the service opts into
//!   [`FailurePolicy::Nak`].
//! - Undecodable requests are answered with a `malformed_payload` error and
//!   never reach the handler.

pub mod backoff;
pub mod builder;
pub mod client;
pub mod config;
pub mod courier;
mod dispatch;
pub mod events;
pub mod handler;
pub mod persistent;
pub mod provisioner;
pub mod registry;
pub mod runner;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use backoff::RetryBackoff;
pub use builder::CourierBuilder;
pub use client::{decode_reply, RequestClient};
pub use config::{
    CallOptions, Config, ConsumerSettings, FailurePolicy, LimitsConfig, ServiceOptions,
    StreamSettings,
};
pub use courier::Courier;
pub use dispatch::{MALFORMED_KIND, PANIC_KIND};
pub use events::EventSubscription;
pub use handler::{args, event_fn, handler_fn, Event, EventHandler, Handler};
pub use persistent::PersistentClient;
pub use provisioner::StreamProvisioner;
pub use registry::{DrainReport, SubscriptionRegistry};
pub use runner::{Lifecycle, RunnerState, ServiceHandle};
pub use types::{HandlerError, HandlerResult, RequestContext, RpcError};

// Re-export the wire and transport types so services rarely need the
// lower crates directly.
pub use courier_broker::{Broker, BrokerError, LogBroker, MemoryBroker, PublishAck};
pub use courier_protocol::{subject_for, Subject};
