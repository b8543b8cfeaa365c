//! # The Callable Composition Root
//!
//! A [`UnaryCallable`] is an immutable value representing a deferred unary
//! RPC. It is built from a primitive — anything that can perform one call
//! against a transport — and decorated by stacking orthogonal behaviors on
//! top: channel binding, retrying, paging, and bundling. Each decorator
//! application yields a new callable with the same shape, so the layers
//! compose in any combination.
//!
//! ```rust
//! use sidecall::{CallContext, UnaryCallable};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> sidecall::Result<()> {
//! let callable = UnaryCallable::from_fn(|request: u32, _ctx: CallContext| async move {
//!     Ok(request * 2)
//! });
//!
//! assert_eq!(callable.call(21).await?, 42);
//! # Ok(())
//! # }
//! ```
//!
//! The asynchronous entry point, [`UnaryCallable::future_call`], submits the
//! request *synchronously* and returns a future of the response. Submission
//! eagerness matters for bundling: two `future_call`s land in the same open
//! bundle even before either future is polled.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tower::{Service, ServiceExt};
use tracing::debug;

use crate::bundling::{BundlerFactory, BundlingCallable, BundlingDescriptor};
use crate::context::{CallContext, Channel};
use crate::error::{BoxError, Error, Result, StatusCode};
use crate::paging::{PageDescriptor, PagedCallable};
use crate::retry::{RetrySettings, RetryingCallable};
use crate::scheduler::{Clock, Scheduler};

/// A primitive or decorated unary call: given a request and a call context,
/// yield a future of the response.
///
/// Implementations must submit synchronously where submission has side
/// effects (bundling enqueues on submission, not on first poll) and complete
/// the returned future with either the response or a failure. A failure
/// carrying no recognized status code anywhere in its `source()` chain is
/// classified as [`StatusCode::Unknown`] at the surface boundary.
pub trait FutureCallable<Req, Resp>: Send + Sync {
    fn future_call(
        &self,
        request: Req,
        context: CallContext,
    ) -> BoxFuture<'static, std::result::Result<Resp, BoxError>>;
}

/// Adapter turning an async closure into a primitive callable.
pub struct FnCallable<F> {
    f: F,
}

impl<F> FnCallable<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<Req, Resp, F, Fut> FutureCallable<Req, Resp> for FnCallable<F>
where
    F: Fn(Req, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Resp, BoxError>> + Send + 'static,
{
    fn future_call(
        &self,
        request: Req,
        context: CallContext,
    ) -> BoxFuture<'static, std::result::Result<Resp, BoxError>> {
        Box::pin((self.f)(request, context))
    }
}

/// Adapter driving a [`tower::Service`] as a primitive callable.
///
/// The service is shared behind a lock and driven through
/// `ServiceExt::ready`, so backpressure-aware transports (connection pools,
/// rate-limited clients) compose without extra glue. The call context is not
/// interpreted here; a transport that honors deadlines or channels should be
/// wrapped with [`FnCallable`] instead.
pub struct ServiceCallable<S> {
    inner: Arc<tokio::sync::Mutex<S>>,
}

impl<S> ServiceCallable<S> {
    pub fn new(service: S) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(service)),
        }
    }
}

impl<S, Req, Resp> FutureCallable<Req, Resp> for ServiceCallable<S>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    S: Service<Req, Response = Resp, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    fn future_call(
        &self,
        request: Req,
        _context: CallContext,
    ) -> BoxFuture<'static, std::result::Result<Resp, BoxError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().await;
            ServiceExt::ready(&mut *guard).await?.call(request).await
        })
    }
}

/// Composition root for a unary RPC.
///
/// Immutable after construction; every builder method returns a new value.
/// The bound channel and the declared retryable-code set survive decorator
/// stacking.
pub struct UnaryCallable<Req, Resp> {
    inner: Arc<dyn FutureCallable<Req, Resp>>,
    channel: Option<Channel>,
    retryable_codes: Arc<BTreeSet<StatusCode>>,
}

impl<Req, Resp> Clone for UnaryCallable<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            channel: self.channel.clone(),
            retryable_codes: self.retryable_codes.clone(),
        }
    }
}

impl<Req, Resp> UnaryCallable<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    /// Base callable over a primitive.
    pub fn create(primitive: Arc<dyn FutureCallable<Req, Resp>>) -> Self {
        Self {
            inner: primitive,
            channel: None,
            retryable_codes: Arc::new(BTreeSet::new()),
        }
    }

    /// Base callable over an async closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, BoxError>> + Send + 'static,
    {
        Self::create(Arc::new(FnCallable::new(f)))
    }

    /// Base callable over a [`tower::Service`].
    pub fn from_service<S>(service: S) -> Self
    where
        S: Service<Req, Response = Resp, Error = BoxError> + Send + 'static,
        S::Future: Send + 'static,
    {
        Self::create(Arc::new(ServiceCallable::new(service)))
    }

    /// Pre-bind a channel: every underlying invocation — direct, after a
    /// retry, a page fetch, or a bundle flush — observes it in its context
    /// unless the caller supplied an explicit channel of their own.
    pub fn bind(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Declare the set of status codes the retry engine may re-issue on.
    pub fn retryable_on(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.retryable_codes = Arc::new(codes.into_iter().collect());
        self
    }

    /// Wrap with the retry engine, using the code set declared via
    /// [`retryable_on`](Self::retryable_on).
    pub fn retrying(
        self,
        settings: RetrySettings,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retrying = RetryingCallable::new(
            self.inner,
            settings,
            self.retryable_codes.clone(),
            scheduler,
            clock,
        );
        Self {
            inner: Arc::new(retrying),
            channel: self.channel,
            retryable_codes: self.retryable_codes,
        }
    }

    /// Wrap with the bundling engine.
    ///
    /// The descriptor computes partition keys for incoming requests; the
    /// factory owns the open bundles, thresholds, and flush lifecycle. When
    /// the factory's settings disable bundling, every request bypasses the
    /// engine and the descriptor is never consulted.
    pub fn bundling(
        self,
        descriptor: Arc<dyn BundlingDescriptor<Req, Resp>>,
        factory: Arc<BundlerFactory<Req, Resp>>,
    ) -> Self {
        let bundling = BundlingCallable::new(self.inner, descriptor, factory);
        Self {
            inner: Arc::new(bundling),
            channel: self.channel,
            retryable_codes: self.retryable_codes,
        }
    }

    /// Wrap with the paging engine; the resulting callable's `call` yields a
    /// [`PagedListResponse`](crate::paging::PagedListResponse).
    pub fn page_streaming<D>(self, descriptor: Arc<D>) -> PagedCallable<D>
    where
        D: PageDescriptor<Request = Req, Response = Resp>,
        Resp: Sync,
    {
        PagedCallable::new(self, descriptor)
    }

    /// Asynchronous call: submit now, resolve later.
    pub fn future_call(&self, request: Req) -> BoxFuture<'static, Result<Resp>> {
        self.future_call_with(request, CallContext::new())
    }

    /// Asynchronous call with an explicit context.
    pub fn future_call_with(
        &self,
        request: Req,
        context: CallContext,
    ) -> BoxFuture<'static, Result<Resp>> {
        let context = match &self.channel {
            Some(channel) if context.channel().is_none() => context.with_channel(channel.clone()),
            _ => context,
        };
        // Submit before returning: bundling relies on enqueue-on-submission.
        let fut = self.inner.future_call(request, context);
        Box::pin(async move {
            fut.await.map_err(|e| {
                let err = Error::from_box(e);
                debug!(error = %err, "unary call failed");
                err
            })
        })
    }

    /// Perform the call and wait for its outcome.
    pub async fn call(&self, request: Req) -> Result<Resp> {
        self.future_call(request).await
    }

    /// Perform the call with an explicit context and wait for its outcome.
    pub async fn call_with(&self, request: Req, context: CallContext) -> Result<Resp> {
        self.future_call_with(request, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcStatus;
    use std::sync::Mutex;

    /// Records the context each invocation observed.
    struct StashCallable {
        seen: Mutex<Vec<CallContext>>,
    }

    impl StashCallable {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn contexts(&self) -> Vec<CallContext> {
            self.seen.lock().expect("stash lock").clone()
        }
    }

    impl FutureCallable<u32, u32> for StashCallable {
        fn future_call(
            &self,
            request: u32,
            context: CallContext,
        ) -> BoxFuture<'static, std::result::Result<u32, BoxError>> {
            self.seen.lock().expect("stash lock").push(context);
            Box::pin(async move { Ok(request) })
        }
    }

    #[tokio::test]
    async fn bind_injects_channel_into_primitive_context() {
        let channel = Channel::new("chan".to_string());
        let stash = StashCallable::new();
        let callable = UnaryCallable::create(stash.clone()).bind(channel.clone());

        callable.call(0).await.expect("call succeeds");

        let seen = stash.contexts();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].channel().expect("channel observed").same(&channel));
    }

    #[tokio::test]
    async fn explicit_channel_wins_over_bound_channel() {
        let bound = Channel::new(1u8);
        let explicit = Channel::new(2u8);
        let stash = StashCallable::new();
        let callable = UnaryCallable::create(stash.clone()).bind(bound);

        callable
            .call_with(0, CallContext::new().with_channel(explicit.clone()))
            .await
            .expect("call succeeds");

        assert!(stash.contexts()[0]
            .channel()
            .expect("channel observed")
            .same(&explicit));
    }

    #[tokio::test]
    async fn known_status_code_surfaces_on_api_error() {
        let callable = UnaryCallable::from_fn(|_req: u32, _ctx| async {
            Err::<u32, BoxError>(Box::new(
                RpcStatus::new(StatusCode::FailedPrecondition).with_message("known"),
            ))
        })
        .retryable_on([StatusCode::Unavailable]);

        let err = callable.call(1).await.expect_err("call fails");
        assert_eq!(err.code(), Some(StatusCode::FailedPrecondition));
        assert_eq!(err.to_string(), "FAILED_PRECONDITION: known");
    }

    #[tokio::test]
    async fn uncoded_failure_surfaces_as_unknown() {
        let callable = UnaryCallable::from_fn(|_req: u32, _ctx| async {
            Err::<u32, BoxError>("unknown".into())
        });

        let err = callable.call(1).await.expect_err("call fails");
        assert_eq!(err.code(), Some(StatusCode::Unknown));
        assert_eq!(err.to_string(), "unknown");
    }

    #[tokio::test]
    async fn tower_service_drives_as_primitive() {
        let service = tower::service_fn(|req: u32| async move {
            Ok::<u32, BoxError>(req + 1)
        });
        let callable = UnaryCallable::from_service(service);

        assert_eq!(callable.call(1).await.expect("service call"), 2);
    }
}
