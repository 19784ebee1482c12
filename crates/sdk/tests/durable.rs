//! Log-backed path: persistent calls, at-least-once delivery, settle policy,
//! backlog processing and shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, ConsumerInfo, LogBroker, MemoryBroker};
use courier_protocol::{durable_name_for, stream_name_for};
use courier_sdk::{
    args, handler_fn, CallOptions, Courier, FailurePolicy, Handler, HandlerError, RequestContext,
    RpcError, RunnerState, ServiceOptions, StreamSettings, MALFORMED_KIND,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn courier(broker: &MemoryBroker) -> Courier {
    Courier::builder().memory(broker.clone()).build().unwrap()
}

async fn consumer(broker: &MemoryBroker, service: &str, method: &str) -> ConsumerInfo {
    let stream = stream_name_for(&format!("{service}.{method}"));
    broker
        .consumer_info(&stream, &durable_name_for(service, method))
        .await
        .unwrap()
}

/// Poll the durable consumer until `done` holds.
async fn wait_for(
    broker: &MemoryBroker,
    service: &str,
    method: &str,
    done: impl Fn(&ConsumerInfo) -> bool,
) -> ConsumerInfo {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let info = consumer(broker, service, method).await;
        if done(&info) {
            return info;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "consumer never reached expected state: {info:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handler that reports every delivery on a channel, then fails while the
/// delivery count is below `succeed_from`.
fn recording(
    succeed_from: u32,
) -> (impl Handler, mpsc::UnboundedReceiver<RequestContext>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |ctx: RequestContext, _args: Vec<Value>| {
        let tx = tx.clone();
        async move {
            let delivered = ctx.delivered.unwrap_or(0);
            let _ = tx.send(ctx);
            if delivered < succeed_from {
                Err(HandlerError::new(format!("attempt {delivered} failed")))
            } else {
                Ok(json!("done"))
            }
        }
    });
    (handler, rx)
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<RequestContext>) -> RequestContext {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler not invoked")
        .expect("handler dropped")
}

// ── Persistent calls ────────────────────────────────────────────────────

#[tokio::test]
async fn persistent_call_roundtrip() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let handle = courier
        .register_durable_method(
            "billing",
            "charge",
            handler_fn(|ctx: RequestContext, a: Vec<Value>| async move {
                assert_eq!(ctx.delivered, Some(1));
                assert!(ctx.sequence.is_some());
                let cents: u64 = args::arg(&a, 0)?;
                Ok::<_, HandlerError>(json!({"charged": cents}))
            }),
        )
        .await
        .unwrap();
    assert_eq!(handle.state(), RunnerState::Running);

    let result = courier
        .call_persistent("billing", "charge", vec![json!(1250)])
        .await
        .unwrap();
    assert_eq!(result, json!({"charged": 1250}));

    let info = wait_for(&broker, "billing", "charge", |i| i.acked == 1).await;
    assert_eq!(info.num_ack_pending, 0);
    assert_eq!(broker.stream_names(), vec![stream_name_for("billing.charge")]);
}

#[tokio::test]
async fn stream_acks_never_stand_in_for_the_reply() {
    let broker = MemoryBroker::new();
    let service = courier(&broker);
    let caller = courier(&broker);

    // The service owns the stream and wants publish acks; the caller runs
    // with the default settings, which do not.
    let acked = StreamSettings {
        no_ack: false,
        ..StreamSettings::default()
    };
    service
        .register_durable_method_with(
            "ledger",
            "post",
            handler_fn(|_ctx, _args| async move { Ok::<_, HandlerError>(json!("posted")) }),
            ServiceOptions::new().streams(acked),
        )
        .await
        .unwrap();
    let info = broker
        .stream_info(&stream_name_for("ledger.post"))
        .await
        .unwrap();
    assert!(!info.config.no_ack);

    for _ in 0..2 {
        let result = caller.call_persistent("ledger", "post", vec![]).await.unwrap();
        assert_eq!(result, json!("posted"));
    }
    wait_for(&broker, "ledger", "post", |i| i.acked == 2).await;
}

#[tokio::test]
async fn failing_handler_is_acked_and_replies_with_error() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let (handler, mut rx) = recording(u32::MAX);
    courier
        .register_durable_method("jobs", "fail", handler)
        .await
        .unwrap();

    match courier.call_persistent("jobs", "fail", vec![]).await.unwrap_err() {
        RpcError::Remote { message, .. } => assert_eq!(message, "attempt 1 failed"),
        other => panic!("unexpected {other:?}"),
    }

    let info = wait_for(&broker, "jobs", "fail", |i| i.acked == 1).await;
    assert_eq!(info.delivered, 1);
    assert_eq!(info.num_redelivery, 0);
    assert_eq!(info.num_ack_pending, 0);

    next_delivery(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "failed job must not be redelivered");
}

#[tokio::test]
async fn malformed_job_is_acked_without_invoking_handler() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let invoked = Arc::new(AtomicUsize::new(0));
    let seen = invoked.clone();
    courier
        .register_durable_method(
            "jobs",
            "parse",
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

    let inbox = broker.new_reply_address();
    let mut replies = broker.subscribe(&inbox, None).await.unwrap();
    broker
        .publish_to_log("jobs.parse", b"{definitely not json".to_vec(), Some(&inbox))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .unwrap()
        .unwrap();
    match courier_sdk::decode_reply("jobs.parse", &reply.payload).unwrap_err() {
        RpcError::Remote { kind, .. } => assert_eq!(kind.as_deref(), Some(MALFORMED_KIND)),
        other => panic!("unexpected {other:?}"),
    }

    let info = wait_for(&broker, "jobs", "parse", |i| i.acked == 1).await;
    assert_eq!(info.num_redelivery, 0);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn persistent_call_times_out_but_job_survives() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let options = CallOptions::default().with_timeout(Duration::from_millis(30));

    let err = courier
        .call_persistent_with("report", "build", vec![json!(1)], &options)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { timeout_ms: 30, .. }));
    assert_eq!(courier.active_subscriptions(), 0, "reply inbox released");

    // The job is still in the log and gets processed once a worker shows up.
    let (handler, mut rx) = recording(1);
    courier
        .register_durable_method("report", "build", handler)
        .await
        .unwrap();
    let ctx = next_delivery(&mut rx).await;
    assert!(ctx.reply.is_some());
    wait_for(&broker, "report", "build", |i| i.acked == 1).await;
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn backlog_is_processed_after_late_registration() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    for i in 0..3 {
        let ack = courier.enqueue("mail", "send", vec![json!(i)]).await.unwrap();
        assert_eq!(ack.sequence, i as u64 + 1);
        assert_eq!(ack.stream, stream_name_for("mail.send"));
    }

    let (handler, mut rx) = recording(1);
    courier
        .register_durable_method("mail", "send", handler)
        .await
        .unwrap();

    for expected in 1..=3u64 {
        let ctx = next_delivery(&mut rx).await;
        assert_eq!(ctx.sequence, Some(expected));
        assert!(ctx.reply.is_none());
    }
    wait_for(&broker, "mail", "send", |i| i.acked == 3).await;
}

#[tokio::test]
async fn nak_policy_redelivers_failed_jobs() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let (handler, mut rx) = recording(2);
    courier
        .register_durable_method_with(
            "sync",
            "pull",
            handler,
            ServiceOptions::new().failure_policy(FailurePolicy::Nak),
        )
        .await
        .unwrap();

    courier.enqueue("sync", "pull", vec![]).await.unwrap();

    let first = next_delivery(&mut rx).await;
    let second = next_delivery(&mut rx).await;
    assert_eq!(first.delivered, Some(1));
    assert_eq!(second.delivered, Some(2));
    assert_eq!(first.sequence, second.sequence);

    let info = wait_for(&broker, "sync", "pull", |i| i.acked == 1).await;
    assert_eq!(info.delivered, 2);
}

#[tokio::test]
async fn instances_share_one_durable_consumer() {
    let broker = MemoryBroker::new();
    let a = courier(&broker);
    let b = courier(&broker);
    let options = ServiceOptions::new().queue("resize");
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

    for (name, instance) in [("a", &a), ("b", &b)] {
        let tx = tx.clone();
        instance
            .register_durable_method_with(
                "images",
                "resize",
                handler_fn(move |_ctx, _args| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(name);
                        Ok::<_, HandlerError>(Value::Null)
                    }
                }),
                options.clone(),
            )
            .await
            .unwrap();
    }
    let stream = stream_name_for("images.resize");
    assert_eq!(
        broker.durable_subscribers(&stream, &durable_name_for("images", "resize")),
        2
    );

    for _ in 0..4 {
        a.enqueue("images", "resize", vec![]).await.unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert!(seen.contains(&"a") && seen.contains(&"b"), "{seen:?}");
    wait_for(&broker, "images", "resize", |i| i.acked == 4).await;
}

// ── Registration ────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_registration_reports_each_method() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let ok: Arc<dyn Handler> = Arc::new(handler_fn(|_ctx, _args| async move {
        Ok::<_, HandlerError>(json!("ok"))
    }));

    let results = courier
        .register_durable_methods(
            "batch",
            vec![
                ("first".to_string(), ok.clone()),
                ("bad.name".to_string(), ok.clone()),
                ("second".to_string(), ok),
            ],
            ServiceOptions::default(),
        )
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(RpcError::InvalidSubject(_))));
    assert!(results[2].1.is_ok());
    assert_eq!(
        courier.call_persistent("batch", "second", vec![]).await.unwrap(),
        json!("ok")
    );
}

#[tokio::test]
async fn durable_operations_need_a_log() {
    let courier = Courier::builder()
        .broker(Arc::new(MemoryBroker::new()))
        .build()
        .unwrap();
    let (handler, _rx) = recording(1);

    assert!(matches!(
        courier.register_durable_method("a", "b", handler).await,
        Err(RpcError::Config(_))
    ));
    assert!(matches!(
        courier.call_persistent("a", "b", vec![]).await,
        Err(RpcError::Config(_))
    ));
    assert!(matches!(
        courier.enqueue("a", "b", vec![]).await,
        Err(RpcError::Config(_))
    ));
}

// ── Shutdown ────────────────────────────────────────────────────────────

#[tokio::test]
async fn drain_waits_for_in_flight_handlers() {
    let broker = MemoryBroker::new();
    let courier = courier(&broker);
    let finished = Arc::new(AtomicBool::new(false));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();

    let done = finished.clone();
    let durable = courier
        .register_durable_method(
            "slow",
            "work",
            handler_fn(move |_ctx, _args| {
                let done = done.clone();
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    done.store(true, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            }),
        )
        .await
        .unwrap();
    let (handler, _rx) = recording(1);
    let direct = courier.register_method("slow", "ping", handler).await.unwrap();
    assert_eq!(courier.active_subscriptions(), 2);

    courier.enqueue("slow", "work", vec![]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let report = courier.drain().await;
    assert_eq!(report.drained, 2);
    assert_eq!(report.forced, 0);
    assert!(finished.load(Ordering::SeqCst), "drain returned before the handler finished");
    assert_eq!(durable.state(), RunnerState::Closed);
    assert_eq!(direct.state(), RunnerState::Closed);
    assert_eq!(courier.active_subscriptions(), 0);

    // The in-flight job was still acknowledged.
    let info = consumer(&broker, "slow", "work").await;
    assert_eq!(info.acked, 1);
}

#[tokio::test]
async fn close_requeues_unfinished_jobs_for_the_next_worker() {
    let broker = MemoryBroker::new();
    let first = courier(&broker);
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    first
        .register_durable_method(
            "video",
            "encode",
            handler_fn(move |_ctx, _args| {
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, HandlerError>(Value::Null)
                }
            }),
        )
        .await
        .unwrap();

    first.enqueue("video", "encode", vec![]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.close().await, 1);

    let second = courier(&broker);
    let (handler, mut rx) = recording(1);
    second
        .register_durable_method("video", "encode", handler)
        .await
        .unwrap();
    let ctx = next_delivery(&mut rx).await;
    assert_eq!(ctx.delivered, Some(2));
}
