//! Handler traits for service methods and event subscriptions.

use std::future::Future;
use std::marker::PhantomData;

use serde_json::Value;

use crate::types::{HandlerResult, RequestContext};

/// Implement this trait to serve a method.
///
/// Each request's arguments arrive as one positional list, decoded from the
/// JSON array on the wire.  Use [`args::arg`] to pull typed values out of it.
///
/// # Example
///
/// ```rust,no_run
/// use courier_sdk::{args, Handler, HandlerResult, RequestContext};
///
/// struct Add;
///
/// #[async_trait::async_trait]
/// impl Handler for Add {
///     async fn call(&self, _ctx: RequestContext, args: Vec<serde_json::Value>) -> HandlerResult {
///         let a: i64 = args::arg(&args, 0)?;
///         let b: i64 = args::arg(&args, 1)?;
///         Ok(serde_json::json!(a + b))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: RequestContext, args: Vec<Value>) -> HandlerResult;
}

/// [`Handler`] backed by an async closure.  Built by [`handler_fn`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(RequestContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(RequestContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: RequestContext, args: Vec<Value>) -> HandlerResult {
        (self.f)(ctx, args).await
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// A fire-and-forget message received on an event subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub subject: String,
    /// Decoded JSON body; `Null` for an empty payload.
    pub payload: Value,
}

/// Receives events from [`Courier::subscribe`](crate::Courier::subscribe).
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event);
}

/// [`EventHandler`] backed by an async closure.  Built by [`event_fn`].
pub struct FnEventHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

pub fn event_fn<F, Fut>(f: F) -> FnEventHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnEventHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: Event) {
        (self.f)(event).await
    }
}

/// Positional argument helpers.
pub mod args {
    use serde::de::DeserializeOwned;
    use serde_json::Value;

    use crate::types::HandlerError;

    /// Deserialize argument `index`.  A missing argument is read as `null`,
    /// so `Option<T>` parameters may be omitted by the caller.
    pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, HandlerError> {
        let value = args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| HandlerError::invalid_args(format!("argument {index}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HandlerError;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext {
            subject: "math.add".into(),
            service: "math".into(),
            method: "add".into(),
            reply: None,
            sequence: None,
            delivered: None,
        }
    }

    #[tokio::test]
    async fn closure_handler() {
        let h = handler_fn(|ctx: RequestContext, args: Vec<Value>| async move {
            assert_eq!(ctx.method, "add");
            let a: i64 = args::arg(&args, 0)?;
            let b: i64 = args::arg(&args, 1)?;
            Ok::<_, HandlerError>(json!(a + b))
        });
        assert_eq!(h.call(ctx(), vec![json!(2), json!(3)]).await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn closure_handler_failure() {
        let h = handler_fn(|_ctx, _args| async move { Err::<Value, _>(HandlerError::new("nope")) });
        let err = h.call(ctx(), vec![]).await.unwrap_err();
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn missing_argument_reads_as_null() {
        let args = vec![json!("x")];
        let s: String = args::arg(&args, 0).unwrap();
        assert_eq!(s, "x");
        let missing: Option<u32> = args::arg(&args, 3).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn wrong_type_is_invalid_args() {
        let args = vec![json!("x")];
        let err = args::arg::<u32>(&args, 0).unwrap_err();
        assert_eq!(err.kind.as_deref(), Some("invalid_args"));
        assert!(err.message.starts_with("argument 0:"));
    }

    #[tokio::test]
    async fn event_closure() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let h = event_fn(move |ev: Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ev.subject);
            }
        });
        h.handle(Event {
            subject: "orders.created".into(),
            payload: Value::Null,
        })
        .await;
        assert_eq!(rx.recv().await.as_deref(), Some("orders.created"));
    }
}
