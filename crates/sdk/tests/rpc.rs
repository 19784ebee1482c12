//! Direct request/reply path: handler dispatch, error classification, retry
//! and timeout policy, queue-group balancing and events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_broker::{Broker, BrokerError, Message, MemoryBroker, Subscription};
use courier_sdk::{
    args, event_fn, handler_fn, CallOptions, Courier, Event, HandlerError, RpcError,
    ServiceOptions, MALFORMED_KIND, PANIC_KIND,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ── Helpers ─────────────────────────────────────────────────────────────

/// Delegates to a [`MemoryBroker`] and counts `request` calls.
struct CountingBroker {
    inner: MemoryBroker,
    requests: AtomicUsize,
}

impl CountingBroker {
    fn new(inner: MemoryBroker) -> Arc<Self> {
        Arc::new(Self {
            inner,
            requests: AtomicUsize::new(0),
        })
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Subscription, BrokerError> {
        self.inner.subscribe(subject, queue).await
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.inner.publish(subject, payload, reply).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, BrokerError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.inner.request(subject, payload, timeout).await
    }

    fn new_reply_address(&self) -> String {
        self.inner.new_reply_address()
    }
}

fn courier(broker: &MemoryBroker) -> Courier {
    Courier::builder().memory(broker.clone()).build().unwrap()
}

fn counting_courier(broker: Arc<CountingBroker>, options: CallOptions) -> Courier {
    Courier::builder()
        .broker(broker)
        .call_options(options)
        .build()
        .unwrap()
}

async fn add_service(courier: &Courier) {
    courier
        .register_method(
            "math",
            "add",
            handler_fn(|_ctx, a: Vec<Value>| async move {
                let x: i64 = args::arg(&a, 0)?;
                let y: i64 = args::arg(&a, 1)?;
                Ok::<_, HandlerError>(json!(x + y))
            }),
        )
        .await
        .unwrap();
}

// ── Replies ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn ok_reply_returns_result() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    add_service(&courier).await;

    let result = courier.call("math", "add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(result, json!(5));
}

#[tokio::test]
async fn handler_error_becomes_remote() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    courier
        .register_method(
            "orders",
            "create",
            handler_fn(|_ctx, _args| async move {
                Err::<Value, _>(
                    HandlerError::new("out of stock")
                        .with_kind("conflict")
                        .with_detail(json!({"sku": "A-1"})),
                )
            }),
        )
        .await
        .unwrap();

    match courier.call("orders", "create", vec![]).await.unwrap_err() {
        RpcError::Remote {
            subject,
            message,
            kind,
            detail,
        } => {
            assert_eq!(subject, "orders.create");
            assert_eq!(message, "out of stock");
            assert_eq!(kind.as_deref(), Some("conflict"));
            assert_eq!(detail, Some(json!({"sku": "A-1"})));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_arguments_are_reported_remotely() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    add_service(&courier).await;

    let err = courier
        .call("math", "add", vec![json!("two"), json!(3)])
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { kind, message, .. } => {
            assert_eq!(kind.as_deref(), Some("invalid_args"));
            assert!(message.starts_with("argument 0"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn panicking_handler_replies_with_error_and_keeps_serving() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    courier
        .register_method(
            "fragile",
            "op",
            handler_fn(|_ctx, a: Vec<Value>| async move {
                if a.is_empty() {
                    panic!("no arguments");
                }
                Ok::<_, HandlerError>(json!("fine"))
            }),
        )
        .await
        .unwrap();

    match courier.call("fragile", "op", vec![]).await.unwrap_err() {
        RpcError::Remote { kind, message, .. } => {
            assert_eq!(kind.as_deref(), Some(PANIC_KIND));
            assert!(message.contains("no arguments"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        courier.call("fragile", "op", vec![json!(1)]).await.unwrap(),
        json!("fine")
    );
}

#[tokio::test]
async fn raw_reply_is_returned_unchanged() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);

    // A responder that does not speak the envelope format.
    let mut sub = broker.subscribe("legacy.echo", None).await.unwrap();
    let responder = broker.clone();
    tokio::spawn(async move {
        if let Some(msg) = sub.next().await {
            let reply = msg.reply.unwrap();
            responder
                .publish(&reply, br#"{"hello":"world"}"#.to_vec(), None)
                .await
                .unwrap();
        }
    });

    let result = courier.call("legacy", "echo", vec![]).await.unwrap();
    assert_eq!(result, json!({"hello": "world"}));
}

#[tokio::test]
async fn undecodable_request_gets_malformed_reply_without_invoking_handler() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    courier
        .register_method(
            "svc",
            "op",
            handler_fn(move |_ctx, _args| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            }),
        )
        .await
        .unwrap();

    let reply = broker
        .request("svc.op", b"{not json".to_vec(), Duration::from_secs(1))
        .await
        .unwrap();
    let err = courier_sdk::decode_reply("svc.op", &reply.payload).unwrap_err();
    match err {
        RpcError::Remote { kind, .. } => assert_eq!(kind.as_deref(), Some(MALFORMED_KIND)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_service_name_is_rejected_locally() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let err = courier.call("bad.service", "op", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_subject");
}

// ── Retry and timeout policy ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn no_responders_retries_with_backoff_then_fails() {
    let broker = CountingBroker::new(MemoryBroker::new());
    let courier = counting_courier(
        broker.clone(),
        CallOptions::default()
            .with_retries(2)
            .with_retry_delay(Duration::from_millis(100)),
    );

    let started = tokio::time::Instant::now();
    let err = courier.call("absent", "op", vec![]).await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        RpcError::NoResponders { subject, attempts } => {
            assert_eq!(subject, "absent.op");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(broker.requests(), 3);
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    // 100ms + 200ms, each with at most 10% jitter.
    assert!(elapsed <= Duration::from_millis(330), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn zero_retries_fails_after_one_attempt() {
    let broker = CountingBroker::new(MemoryBroker::new());
    let courier = counting_courier(broker.clone(), CallOptions::default().with_retries(0));

    let err = courier.call("absent", "op", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::NoResponders { attempts: 1, .. }));
    assert_eq!(broker.requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_responder_is_reached_by_retry() {
    let memory = MemoryBroker::new();
    let broker = CountingBroker::new(memory.clone());
    let caller = counting_courier(
        broker.clone(),
        CallOptions::default()
            .with_retries(5)
            .with_retry_delay(Duration::from_millis(100)),
    );

    let service = courier(&memory);
    let starter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        add_service(&service).await;
        service
    });

    let result = caller.call("math", "add", vec![json!(1), json!(1)]).await.unwrap();
    assert_eq!(result, json!(2));
    assert!(broker.requests() >= 2);
    drop(starter.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn silent_responder_times_out_without_retry() {
    let memory = MemoryBroker::new();
    let broker = CountingBroker::new(memory.clone());
    let courier = counting_courier(
        broker.clone(),
        CallOptions::default()
            .with_timeout(Duration::from_millis(50))
            .with_retries(3),
    );
    // Subscribed, never answers.
    let _silent = memory.subscribe("slow.op", None).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = courier.call("slow", "op", vec![]).await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        RpcError::Timeout {
            subject,
            timeout_ms,
        } => {
            assert_eq!(subject, "slow.op");
            assert_eq!(timeout_ms, 50);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(broker.requests(), 1);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
}

#[tokio::test]
async fn closed_connection_is_a_transport_error() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    broker.close();
    let err = courier.call("math", "add", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport(BrokerError::Closed)));
}

// ── Queue groups ────────────────────────────────────────────────────────

#[tokio::test]
async fn instances_of_a_service_share_requests() {
    let broker = MemoryBroker::new();
    let instances: Vec<Courier> = (0..2).map(|_| courier(&broker)).collect();
    for (i, instance) in instances.iter().enumerate() {
        instance
            .register_method(
                "pool",
                "whoami",
                handler_fn(move |_ctx, _args| async move { Ok::<_, HandlerError>(json!(i)) }),
            )
            .await
            .unwrap();
    }

    let caller = courier(&broker);
    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(caller.call("pool", "whoami", vec![]).await.unwrap());
    }
    assert!(seen.contains(&json!(0)));
    assert!(seen.contains(&json!(1)));
    assert_eq!(broker.interest("pool.whoami"), 2);
}

#[tokio::test]
async fn custom_queue_group() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let handle = courier
        .register_method_with(
            "math",
            "mul",
            handler_fn(|_ctx, a: Vec<Value>| async move {
                let x: i64 = args::arg(&a, 0)?;
                let y: i64 = args::arg(&a, 1)?;
                Ok::<_, HandlerError>(json!(x * y))
            }),
            ServiceOptions::new().queue("math-workers"),
        )
        .await
        .unwrap();
    assert_eq!(handle.subject(), "math.mul");
    assert_eq!(
        courier.call("math", "mul", vec![json!(6), json!(7)]).await.unwrap(),
        json!(42)
    );
}

// ── Events ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn emitted_events_reach_subscribers_until_unsubscribed() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let sub = courier
        .subscribe(
            "orders.*",
            event_fn(move |ev: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(ev);
                }
            }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(courier.active_subscriptions(), 1);

    courier
        .emit("orders.created", &json!({"id": 1}))
        .await
        .unwrap();
    let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.subject, "orders.created");
    assert_eq!(ev.payload, json!({"id": 1}));

    sub.unsubscribe().await.unwrap();
    assert_eq!(courier.active_subscriptions(), 0);
    courier.emit("orders.created", &json!({"id": 2})).await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
        .await
        .map(|ev| ev.is_none())
        .unwrap_or(true));
}

#[tokio::test]
async fn emit_without_listeners_is_fine() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    courier.emit("nobody.listens", &Value::Null).await.unwrap();
}
