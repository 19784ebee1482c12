//! Reference "hello-world" for Courier.
//!
//! Runs a service and a caller against one in-process broker and exercises
//! every path:
//!
//! - `greeter.hello`: direct call, `Ok` reply
//! - `greeter.fail`: direct call, handler error
//! - `absent.op`: nobody listening, retried then `NoResponders`
//! - `mailer.send`: durable jobs, backlog processed on registration,
//!   then a persistent call
//! - `audit.*`: fire-and-forget events
//!
//! Usage:
//!   courier-hello [--config courier.toml] [--json-logs] [demo|config]
//!
//! Env vars:
//!   RUST_LOG: log filter (default: "info")

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use courier_broker::MemoryBroker;
use courier_sdk::{
    args, event_fn, handler_fn, CallOptions, Config, Courier, Event, HandlerError,
    RequestContext, ServiceOptions,
};
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Courier demo: RPC and durable jobs over an in-memory broker.
#[derive(Debug, Parser)]
#[command(name = "courier-hello", version, about)]
struct Cli {
    /// TOML configuration file; a missing file means defaults.
    #[arg(long, global = true, default_value = "courier.toml")]
    config: PathBuf,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the demo (default when no subcommand is given).
    Demo,
    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = Config::load(&cli.config)?;
    match cli.command.unwrap_or(Command::Demo) {
        Command::Demo => run_demo(config).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_demo(config: Config) -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let service = Courier::builder()
        .memory(broker.clone())
        .config(config.clone())
        .build()?;
    let caller = Courier::builder().memory(broker.clone()).config(config).build()?;

    // ── Direct methods ───────────────────────────────────────────────
    service
        .register_method(
            "greeter",
            "hello",
            handler_fn(|_ctx, a: Vec<Value>| async move {
                let name: Option<String> = args::arg(&a, 0)?;
                let name = name.unwrap_or_else(|| "world".into());
                Ok::<_, HandlerError>(json!(format!("hello, {name}")))
            }),
        )
        .await?;
    service
        .register_method(
            "greeter",
            "fail",
            handler_fn(|_ctx, _args| async move {
                Err::<Value, _>(HandlerError::new("greeter is grumpy").with_kind("grumpy"))
            }),
        )
        .await?;

    let greeting = caller.call("greeter", "hello", vec![json!("courier")]).await?;
    tracing::info!(result = %greeting, "greeter.hello");

    match caller.call("greeter", "fail", vec![]).await {
        Ok(v) => tracing::warn!(result = %v, "greeter.fail unexpectedly succeeded"),
        Err(e) => tracing::info!(kind = e.kind(), error = %e, "greeter.fail"),
    }

    let impatient = CallOptions::default()
        .with_retries(1)
        .with_retry_delay(Duration::from_millis(50));
    if let Err(e) = caller.call_with("absent", "op", vec![], &impatient).await {
        tracing::info!(kind = e.kind(), error = %e, "absent.op");
    }

    // ── Durable jobs ─────────────────────────────────────────────────
    for to in ["ada@example.com", "linus@example.com"] {
        let ack = caller.enqueue("mailer", "send", vec![json!(to)]).await?;
        tracing::info!(stream = %ack.stream, seq = ack.sequence, "job queued before any worker");
    }

    let mailer = service
        .register_durable_method_with(
            "mailer",
            "send",
            handler_fn(|ctx: RequestContext, a: Vec<Value>| async move {
                let to: String = args::arg(&a, 0)?;
                tracing::info!(
                    to = %to,
                    seq = ?ctx.sequence,
                    delivered = ?ctx.delivered,
                    "sending mail"
                );
                Ok::<_, HandlerError>(json!({"sent_to": to}))
            }),
            ServiceOptions::new().queue("mailers"),
        )
        .await?;
    tracing::info!(subject = mailer.subject(), state = %mailer.state(), "mailer running");

    let receipt = caller
        .call_persistent("mailer", "send", vec![json!("grace@example.com")])
        .await?;
    tracing::info!(result = %receipt, "mailer.send");

    // ── Events ───────────────────────────────────────────────────────
    let audit = service
        .subscribe(
            "audit.*",
            event_fn(|ev: Event| async move {
                tracing::info!(subject = %ev.subject, payload = %ev.payload, "audit event");
            }),
            None,
        )
        .await?;
    caller
        .emit("audit.greeted", &json!({"who": "courier"}))
        .await?;

    // Let the backlog and the event settle before shutting down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    audit.unsubscribe().await?;

    let caller_report = caller.drain().await;
    let service_report = service.drain().await;
    tracing::info!(
        drained = caller_report.drained + service_report.drained,
        forced = caller_report.forced + service_report.forced,
        mailer_state = %mailer.state(),
        "demo complete"
    );
    broker.close();
    Ok(())
}
