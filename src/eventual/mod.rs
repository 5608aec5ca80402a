//! Deferred values — futures that may already be settled.
//!
//! [`Eventual<T>`] is the settlement type flowing through the whole crate. A
//! handler chain where every step settles synchronously produces a
//! [`Eventual::Ready`] value that can be inspected without an executor, which
//! is what makes zero-latency cache reads possible. As soon as any step needs
//! real I/O the chain degrades gracefully to [`Eventual::Pending`] and behaves
//! like an ordinary boxed future.
//!
//! ## Core items
//!
//! - [`Eventual`] — tagged union of `Ready(Result<T, Error>)` and
//!   `Pending(future)`.
//! - [`Eventual::and_then`] — uniform combinator; chaining on a ready value
//!   runs the continuation immediately and stays ready if the continuation
//!   settles synchronously.
//! - [`Error`] — the crate-wide failure type; clonable so one rejection can be
//!   observed by every caller sharing a coalesced request.

use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error as ThisError;

/// Failure type carried by every [`Eventual`].
///
/// All variants are cheap to clone: coalesced requests share one settlement
/// through [`futures::future::Shared`], which hands each waiter a clone of the
/// outcome.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// A pipeline handler reported a failure.
    #[error("{0}")]
    Handler(String),

    /// A wrapped source error from a transport or storage adapter.
    #[error(transparent)]
    Adapter(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Build a [`Error::Handler`] from any displayable message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Wrap a source error from an adapter without losing its chain.
    pub fn adapter(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Adapter(Arc::new(source))
    }
}

/// A value that is either already settled or still being produced.
///
/// `Ready` holds a settled `Result` that can be inspected synchronously via
/// [`peek`](Self::peek) / [`is_fulfilled`](Self::is_fulfilled). `Pending`
/// holds a boxed future and exposes no value before settlement. Both variants
/// can be `.await`ed uniformly through the [`IntoFuture`] impl.
///
/// # Examples
///
/// ```
/// use recache::Eventual;
///
/// let ready = Eventual::ok(41).and_then(|n| Eventual::ok(n + 1));
/// assert!(ready.is_fulfilled());
/// assert_eq!(ready.peek().unwrap().as_ref().ok(), Some(&42));
/// ```
pub enum Eventual<T> {
    /// Settled: the result is available for immediate synchronous inspection.
    Ready(Result<T, Error>),
    /// Unsettled: adopts the eventual outcome of the wrapped future.
    Pending(BoxFuture<'static, Result<T, Error>>),
}

impl<T> Eventual<T> {
    /// A fulfilled ready value.
    pub fn ok(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    /// A rejected ready value.
    pub fn err(error: Error) -> Self {
        Self::Ready(Err(error))
    }

    /// Adopt a future's eventual outcome.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self::Pending(Box::pin(future))
    }

    /// Returns `true` when settled (fulfilled or rejected).
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Returns `true` when settled with a value.
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Ready(Ok(_)))
    }

    /// Inspect the settled result without suspending.
    ///
    /// Returns `None` while pending — a pending value exposes nothing before
    /// settlement.
    pub fn peek(&self) -> Option<&Result<T, Error>> {
        match self {
            Self::Ready(result) => Some(result),
            Self::Pending(_) => None,
        }
    }

    /// Extract the settled result, if any.
    pub fn into_ready(self) -> Option<Result<T, Error>> {
        match self {
            Self::Ready(result) => Some(result),
            Self::Pending(_) => None,
        }
    }
}

impl<T: Send + 'static> Eventual<T> {
    /// Chain a continuation, staying synchronous when possible.
    ///
    /// On `Ready(Ok)` the continuation runs immediately; if it settles
    /// synchronously the combined value is again `Ready`, so a chain of
    /// synchronous steps never touches an executor. On `Ready(Err)` the
    /// rejection short-circuits. On `Pending` the continuation runs after the
    /// underlying future settles, in attachment order.
    ///
    /// Continuations signal failure by returning [`Eventual::err`]; a
    /// rejection never escapes `and_then` as anything but a rejected value.
    pub fn and_then<U, F>(self, f: F) -> Eventual<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Eventual<U> + Send + 'static,
    {
        match self {
            Self::Ready(Ok(value)) => f(value),
            Self::Ready(Err(error)) => Eventual::Ready(Err(error)),
            Self::Pending(future) => Eventual::Pending(Box::pin(async move {
                let value = future.await?;
                f(value).await
            })),
        }
    }

    /// Map the fulfilled value, staying synchronous when possible.
    pub fn map<U, F>(self, f: F) -> Eventual<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(|value| Eventual::ok(f(value)))
    }
}

impl<T: Send + 'static> IntoFuture for Eventual<T> {
    type Output = Result<T, Error>;
    type IntoFuture = BoxFuture<'static, Result<T, Error>>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Self::Ready(result) => Box::pin(std::future::ready(result)),
            Self::Pending(future) => future,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Eventual<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Ready values ──────────────────────────────────────────────────────────

    #[test]
    fn ok_is_fulfilled() {
        let e = Eventual::ok(7);
        assert!(e.is_ready());
        assert!(e.is_fulfilled());
        assert_eq!(e.peek().unwrap().as_ref().ok(), Some(&7));
    }

    #[test]
    fn err_is_ready_but_not_fulfilled() {
        let e: Eventual<i32> = Eventual::err(Error::handler("boom"));
        assert!(e.is_ready());
        assert!(!e.is_fulfilled());
        assert!(e.peek().unwrap().is_err());
    }

    #[test]
    fn sync_chain_stays_ready() {
        let e = Eventual::ok(1)
            .and_then(|n| Eventual::ok(n + 1))
            .map(|n| n * 10);
        assert_eq!(e.into_ready().unwrap().unwrap(), 20);
    }

    #[test]
    fn rejection_short_circuits_chain() {
        let e: Eventual<i32> = Eventual::ok(1)
            .and_then(|_| Eventual::<i32>::err(Error::handler("stop")))
            .and_then(|_| -> Eventual<i32> {
                panic!("continuation after rejection must not run")
            });
        assert!(matches!(e.into_ready(), Some(Err(Error::Handler(_)))));
    }

    #[test]
    fn continuation_can_go_pending() {
        let e = Eventual::ok(1).and_then(|n| Eventual::from_future(async move { Ok(n + 1) }));
        assert!(!e.is_ready());
    }

    // ── Pending values ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pending_settles_through_await() {
        let e = Eventual::from_future(async { Ok("body") });
        assert!(!e.is_ready());
        assert!(e.peek().is_none());
        assert_eq!(e.await.unwrap(), "body");
    }

    #[tokio::test]
    async fn pending_chain_runs_in_attachment_order() {
        let e = Eventual::from_future(async { Ok(vec![1]) })
            .and_then(|mut v| {
                v.push(2);
                Eventual::ok(v)
            })
            .and_then(|mut v| {
                v.push(3);
                Eventual::ok(v)
            });
        assert_eq!(e.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pending_rejection_propagates() {
        let e: Eventual<i32> = Eventual::from_future(async { Err(Error::handler("io down")) });
        assert!(e.await.is_err());
    }

    #[tokio::test]
    async fn ready_awaits_immediately() {
        let e = Eventual::ok(5);
        assert_eq!(e.await.unwrap(), 5);
    }
}
