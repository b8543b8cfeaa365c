//! # Request Bundling
//!
//! The bundling decorator coalesces many small requests that share a
//! partition key into fewer underlying calls. Submissions accumulate in an
//! open [`Bundle`] per key; when a threshold fires — element count, byte
//! count, or the age of the oldest entry — the bundle is detached and
//! flushed: its requests are merged into one call and the response (or
//! failure) is fanned back out to every submitter in submission order.
//!
//! ## Roles
//!
//! - **[`BundlingDescriptor`]**: stateless strategy describing how requests
//!   partition, merge, and how a merged response splits back across the
//!   originating requests.
//! - **[`RequestIssuer`]**: per-entry handle the descriptor completes with
//!   exactly one response slice or one failure.
//! - **[`BundlerFactory`]**: owns the open bundles, thresholds, and flush
//!   lifecycle. Closing it flushes everything and rejects further
//!   submissions.
//! - **[`BundlingSettings`]**: immutable thresholds, builder-constructed.
//!
//! Flushes run on the injected scheduler's executor; a positive
//! `blocking_call_count_threshold` bounds the number of in-flight flushed
//! bundles with a semaphore. Bundling requires a tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use crate::callable::FutureCallable;
use crate::context::CallContext;
use crate::error::{ApiError, BoxError, Error, Result, SharedError, StatusCode};
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};

/// Immutable bundling thresholds.
#[derive(Debug, Clone)]
pub struct BundlingSettings {
    element_count_threshold: usize,
    request_byte_threshold: usize,
    delay_threshold: Duration,
    blocking_call_count_threshold: usize,
    is_enabled: bool,
}

impl BundlingSettings {
    pub fn builder() -> BundlingSettingsBuilder {
        BundlingSettingsBuilder::default()
    }

    /// Flush once a bundle's accumulated element count reaches this.
    pub fn element_count_threshold(&self) -> usize {
        self.element_count_threshold
    }

    /// Flush once a bundle's accumulated byte count reaches this; 0 turns
    /// the byte trigger off.
    pub fn request_byte_threshold(&self) -> usize {
        self.request_byte_threshold
    }

    /// Flush once the oldest request in a bundle has waited this long.
    pub fn delay_threshold(&self) -> Duration {
        self.delay_threshold
    }

    /// Bound on in-flight flushed bundles; 0 means unbounded.
    pub fn blocking_call_count_threshold(&self) -> usize {
        self.blocking_call_count_threshold
    }

    /// When false, bundling is bypassed entirely: each request calls the
    /// underlying callable directly and the descriptor is never consulted.
    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }
}

/// Fluent builder for [`BundlingSettings`].
#[derive(Debug, Clone)]
pub struct BundlingSettingsBuilder {
    element_count_threshold: usize,
    request_byte_threshold: usize,
    delay_threshold: Duration,
    blocking_call_count_threshold: usize,
    is_enabled: bool,
}

impl Default for BundlingSettingsBuilder {
    fn default() -> Self {
        Self {
            element_count_threshold: 1,
            request_byte_threshold: 0,
            delay_threshold: Duration::from_millis(10),
            blocking_call_count_threshold: 0,
            is_enabled: true,
        }
    }
}

impl BundlingSettingsBuilder {
    pub fn element_count_threshold(mut self, threshold: usize) -> Self {
        self.element_count_threshold = threshold;
        self
    }

    pub fn request_byte_threshold(mut self, threshold: usize) -> Self {
        self.request_byte_threshold = threshold;
        self
    }

    pub fn delay_threshold(mut self, delay: Duration) -> Self {
        self.delay_threshold = delay;
        self
    }

    pub fn blocking_call_count_threshold(mut self, threshold: usize) -> Self {
        self.blocking_call_count_threshold = threshold;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    pub fn build(self) -> Result<BundlingSettings> {
        if self.element_count_threshold == 0 {
            return Err(Error::validation(
                "element count threshold must be at least 1",
            ));
        }
        Ok(BundlingSettings {
            element_count_threshold: self.element_count_threshold,
            request_byte_threshold: self.request_byte_threshold,
            delay_threshold: self.delay_threshold,
            blocking_call_count_threshold: self.blocking_call_count_threshold,
            is_enabled: self.is_enabled,
        })
    }
}

/// Stateless strategy for partitioning, merging, and splitting bundled
/// requests.
///
/// Requests with equal partition keys may share a bundle; distinct keys
/// never do. `split_response` receives the issuers in submission order and
/// is responsible for mapping positional slices of the bundle response back
/// to each of them.
pub trait BundlingDescriptor<Req, Resp>: Send + Sync {
    fn bundle_partition_key(&self, request: &Req) -> String;

    fn merge_requests(&self, requests: &[Req]) -> Req;

    /// Deliver exactly one `set_response` to every issuer.
    fn split_response(&self, response: &Resp, batch: &mut [RequestIssuer<Req, Resp>]);

    /// Deliver exactly one `set_exception` to every issuer.
    fn split_exception(&self, error: SharedError, batch: &mut [RequestIssuer<Req, Resp>]);

    fn count_elements(&self, request: &Req) -> usize;

    fn count_bytes(&self, request: &Req) -> usize;
}

/// Per-entry handle within a bundle: the original request plus a one-shot
/// sink delivering the outcome to the submitter's future.
pub struct RequestIssuer<Req, Resp> {
    request: Req,
    sink: Option<oneshot::Sender<std::result::Result<Resp, SharedError>>>,
}

impl<Req, Resp> RequestIssuer<Req, Resp> {
    fn new(request: Req, sink: oneshot::Sender<std::result::Result<Resp, SharedError>>) -> Self {
        Self {
            request,
            sink: Some(sink),
        }
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    /// Complete this entry with its slice of the bundle response.
    pub fn set_response(&mut self, response: Resp) {
        match self.sink.take() {
            Some(sink) => {
                let _ = sink.send(Ok(response));
            }
            None => warn!("bundled request completed twice"),
        }
    }

    /// Complete this entry with the bundle's failure.
    pub fn set_exception(&mut self, error: SharedError) {
        match self.sink.take() {
            Some(sink) => {
                let _ = sink.send(Err(error));
            }
            None => warn!("bundled request completed twice"),
        }
    }

    fn is_complete(&self) -> bool {
        self.sink.is_none()
    }
}

/// An open accumulation of same-partition requests awaiting flush.
struct Bundle<Req, Resp> {
    id: u64,
    context: CallContext,
    inner: Arc<dyn FutureCallable<Req, Resp>>,
    issuers: Vec<RequestIssuer<Req, Resp>>,
    element_count: usize,
    byte_count: usize,
    timer: Option<TimerHandle>,
}

struct BundlerState<Req, Resp> {
    open: HashMap<String, Bundle<Req, Resp>>,
    next_id: u64,
    closed: bool,
}

/// Owns the partition-key → open-bundle map and the flush lifecycle.
///
/// All mutation of the map and the bundles happens under the factory's
/// lock; flushes run detached on the injected scheduler. [`close`] flushes
/// every open bundle and completes every pending future before returning;
/// submissions after close fail immediately with
/// [`Error::BundlerClosed`].
///
/// [`close`]: BundlerFactory::close
pub struct BundlerFactory<Req, Resp> {
    descriptor: Arc<dyn BundlingDescriptor<Req, Resp>>,
    settings: BundlingSettings,
    scheduler: Arc<dyn Scheduler>,
    inflight: Option<Arc<Semaphore>>,
    state: Mutex<BundlerState<Req, Resp>>,
}

impl<Req, Resp> BundlerFactory<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        descriptor: Arc<dyn BundlingDescriptor<Req, Resp>>,
        settings: BundlingSettings,
    ) -> Self {
        Self::with_scheduler(descriptor, settings, Arc::new(TokioScheduler::new()))
    }

    pub fn with_scheduler(
        descriptor: Arc<dyn BundlingDescriptor<Req, Resp>>,
        settings: BundlingSettings,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let inflight = match settings.blocking_call_count_threshold() {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            descriptor,
            settings,
            scheduler,
            inflight,
            state: Mutex::new(BundlerState {
                open: HashMap::new(),
                next_id: 0,
                closed: false,
            }),
        }
    }

    pub fn settings(&self) -> &BundlingSettings {
        &self.settings
    }

    /// Enqueue one request under `key`, flushing inline when a threshold
    /// fires. Returns the submitter's future.
    pub(crate) fn submit(
        self: &Arc<Self>,
        inner: Arc<dyn FutureCallable<Req, Resp>>,
        key: String,
        request: Req,
        context: CallContext,
    ) -> BoxFuture<'static, std::result::Result<Resp, BoxError>> {
        let elements = self.descriptor.count_elements(&request);
        let bytes = self.descriptor.count_bytes(&request);
        let (tx, rx) = oneshot::channel();

        let detached = {
            let mut state = self.state.lock().expect("bundler lock");
            if state.closed {
                return Box::pin(async { Err(Box::new(Error::BundlerClosed) as BoxError) });
            }

            if !state.open.contains_key(&key) {
                state.next_id += 1;
                let id = state.next_id;
                let timer = self.scheduler.schedule(
                    self.settings.delay_threshold(),
                    Self::deferred_flush(Arc::downgrade(self), key.clone(), id),
                );
                state.open.insert(
                    key.clone(),
                    Bundle {
                        id,
                        context: context.clone(),
                        inner: inner.clone(),
                        issuers: Vec::new(),
                        element_count: 0,
                        byte_count: 0,
                        timer: Some(timer),
                    },
                );
            }

            let bundle = state.open.get_mut(&key).expect("bundle just ensured");
            bundle.issuers.push(RequestIssuer::new(request, tx));
            bundle.element_count += elements;
            bundle.byte_count += bytes;

            let byte_threshold = self.settings.request_byte_threshold();
            let should_flush = bundle.element_count >= self.settings.element_count_threshold()
                || (byte_threshold > 0 && bundle.byte_count >= byte_threshold);
            if should_flush {
                state.open.remove(&key)
            } else {
                None
            }
        };

        if let Some(mut bundle) = detached {
            if let Some(timer) = bundle.timer.take() {
                timer.cancel();
            }
            debug!(%key, elements = bundle.element_count, "bundle reached threshold, flushing");
            self.dispatch_flush(bundle);
        }

        Box::pin(async move {
            match rx.await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(Box::new(ApiError::from_shared(error)) as BoxError),
                Err(_) => Err(Box::new(ApiError::new(
                    StatusCode::Unknown,
                    "bundle dropped before completion",
                )) as BoxError),
            }
        })
    }

    fn deferred_flush(factory: Weak<Self>, key: String, id: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(factory) = factory.upgrade() else {
                return;
            };
            let bundle = {
                let mut state = factory.state.lock().expect("bundler lock");
                // A threshold flush may already have detached this bundle
                // and a successor taken its key; flush only the bundle the
                // timer was armed for.
                let armed_for = state.open.get(&key).map_or(false, |bundle| bundle.id == id);
                if armed_for {
                    state.open.remove(&key)
                } else {
                    None
                }
            };
            if let Some(mut bundle) = bundle {
                bundle.timer.take();
                debug!(%key, "delay threshold reached, flushing bundle");
                Self::flush_bundle(
                    factory.descriptor.clone(),
                    factory.inflight.clone(),
                    bundle,
                )
                .await;
            }
        })
    }

    fn dispatch_flush(&self, bundle: Bundle<Req, Resp>) {
        let fut = Self::flush_bundle(self.descriptor.clone(), self.inflight.clone(), bundle);
        self.scheduler.schedule(Duration::ZERO, Box::pin(fut));
    }

    /// Merge, call once, and fan the outcome back out.
    async fn flush_bundle(
        descriptor: Arc<dyn BundlingDescriptor<Req, Resp>>,
        inflight: Option<Arc<Semaphore>>,
        mut bundle: Bundle<Req, Resp>,
    ) {
        let _permit = match &inflight {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        let requests: Vec<Req> = bundle
            .issuers
            .iter()
            .map(|issuer| issuer.request().clone())
            .collect();
        let merged = descriptor.merge_requests(&requests);

        match bundle.inner.future_call(merged, bundle.context.clone()).await {
            Ok(response) => descriptor.split_response(&response, &mut bundle.issuers),
            Err(error) => {
                let shared: SharedError = Arc::from(error);
                descriptor.split_exception(shared, &mut bundle.issuers);
            }
        }

        for issuer in &mut bundle.issuers {
            if !issuer.is_complete() {
                warn!("descriptor left a bundled request uncompleted");
                issuer.set_exception(Arc::new(ApiError::new(
                    StatusCode::Internal,
                    "bundled request left uncompleted by descriptor",
                )));
            }
        }
    }

    /// Flush all open bundles and complete every pending future, then
    /// reject further submissions.
    pub async fn close(&self) {
        let bundles: Vec<Bundle<Req, Resp>> = {
            let mut state = self.state.lock().expect("bundler lock");
            state.closed = true;
            state.open.drain().map(|(_, bundle)| bundle).collect()
        };

        let mut flushes = Vec::new();
        for mut bundle in bundles {
            if let Some(timer) = bundle.timer.take() {
                timer.cancel();
            }
            flushes.push(Self::flush_bundle(
                self.descriptor.clone(),
                self.inflight.clone(),
                bundle,
            ));
        }
        futures::future::join_all(flushes).await;
    }
}

impl<Req, Resp> Drop for BundlerFactory<Req, Resp> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            if !state.closed && !state.open.is_empty() {
                warn!(
                    open_bundles = state.open.len(),
                    "bundler factory dropped with open bundles; close() flushes them"
                );
            }
        }
    }
}

/// The bundling decorator over an inner callable.
pub struct BundlingCallable<Req, Resp> {
    inner: Arc<dyn FutureCallable<Req, Resp>>,
    descriptor: Arc<dyn BundlingDescriptor<Req, Resp>>,
    factory: Arc<BundlerFactory<Req, Resp>>,
}

impl<Req, Resp> BundlingCallable<Req, Resp> {
    pub(crate) fn new(
        inner: Arc<dyn FutureCallable<Req, Resp>>,
        descriptor: Arc<dyn BundlingDescriptor<Req, Resp>>,
        factory: Arc<BundlerFactory<Req, Resp>>,
    ) -> Self {
        Self {
            inner,
            descriptor,
            factory,
        }
    }
}

impl<Req, Resp> FutureCallable<Req, Resp> for BundlingCallable<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn future_call(
        &self,
        request: Req,
        context: CallContext,
    ) -> BoxFuture<'static, std::result::Result<Resp, BoxError>> {
        if !self.factory.settings().is_enabled() {
            return self.inner.future_call(request, context);
        }
        let key = self.descriptor.bundle_partition_key(&request);
        self.factory
            .submit(self.inner.clone(), key, request, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::UnaryCallable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    struct LabeledIntList {
        label: String,
        ints: Vec<i32>,
    }

    impl LabeledIntList {
        fn new(label: &str, ints: Vec<i32>) -> Self {
            Self {
                label: label.to_string(),
                ints,
            }
        }
    }

    struct SquarerDescriptor;

    impl BundlingDescriptor<LabeledIntList, Vec<i32>> for SquarerDescriptor {
        fn bundle_partition_key(&self, request: &LabeledIntList) -> String {
            request.label.clone()
        }

        fn merge_requests(&self, requests: &[LabeledIntList]) -> LabeledIntList {
            let label = requests
                .first()
                .map(|r| r.label.clone())
                .unwrap_or_default();
            let ints = requests.iter().flat_map(|r| r.ints.clone()).collect();
            LabeledIntList { label, ints }
        }

        fn split_response(
            &self,
            response: &Vec<i32>,
            batch: &mut [RequestIssuer<LabeledIntList, Vec<i32>>],
        ) {
            let mut index = 0;
            for issuer in batch {
                let count = issuer.request().ints.len();
                let slice = response[index..index + count].to_vec();
                index += count;
                issuer.set_response(slice);
            }
        }

        fn split_exception(
            &self,
            error: SharedError,
            batch: &mut [RequestIssuer<LabeledIntList, Vec<i32>>],
        ) {
            for issuer in batch {
                issuer.set_exception(error.clone());
            }
        }

        fn count_elements(&self, request: &LabeledIntList) -> usize {
            request.ints.len()
        }

        fn count_bytes(&self, request: &LabeledIntList) -> usize {
            request.ints.len() * std::mem::size_of::<i32>()
        }
    }

    /// Panics if bundling consults the descriptor while disabled.
    struct DisabledDescriptor;

    impl BundlingDescriptor<LabeledIntList, Vec<i32>> for DisabledDescriptor {
        fn bundle_partition_key(&self, _request: &LabeledIntList) -> String {
            unreachable!("partition key requested while bundling is disabled")
        }

        fn merge_requests(&self, _requests: &[LabeledIntList]) -> LabeledIntList {
            unreachable!("merge requested while bundling is disabled")
        }

        fn split_response(
            &self,
            _response: &Vec<i32>,
            _batch: &mut [RequestIssuer<LabeledIntList, Vec<i32>>],
        ) {
            unreachable!("split requested while bundling is disabled")
        }

        fn split_exception(
            &self,
            _error: SharedError,
            _batch: &mut [RequestIssuer<LabeledIntList, Vec<i32>>],
        ) {
            unreachable!("split requested while bundling is disabled")
        }

        fn count_elements(&self, _request: &LabeledIntList) -> usize {
            unreachable!("element count requested while bundling is disabled")
        }

        fn count_bytes(&self, _request: &LabeledIntList) -> usize {
            unreachable!("byte count requested while bundling is disabled")
        }
    }

    fn squarer() -> (UnaryCallable<LabeledIntList, Vec<i32>>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callable = UnaryCallable::from_fn(move |request: LabeledIntList, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<Vec<i32>, BoxError>(request.ints.iter().map(|i| i * i).collect()) }
        });
        (callable, calls)
    }

    fn settings(element_count_threshold: usize, delay: Duration) -> BundlingSettings {
        BundlingSettings::builder()
            .element_count_threshold(element_count_threshold)
            .delay_threshold(delay)
            .build()
            .expect("valid bundling settings")
    }

    #[tokio::test]
    async fn same_key_submissions_share_a_bundle() {
        let (transport, calls) = squarer();
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            settings(2, Duration::from_secs(1)),
        ));
        let callable = transport.bundling(Arc::new(SquarerDescriptor), factory.clone());

        let f1 = callable.future_call(LabeledIntList::new("one", vec![1, 2]));
        let f2 = callable.future_call(LabeledIntList::new("one", vec![3, 4]));

        assert_eq!(f1.await.expect("first split"), vec![1, 4]);
        assert_eq!(f2.await.expect("second split"), vec![9, 16]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        factory.close().await;
    }

    #[tokio::test]
    async fn submission_is_eager_so_joined_futures_fill_one_bundle() {
        let (transport, calls) = squarer();
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            settings(2, Duration::from_secs(60)),
        ));
        let callable = transport.bundling(Arc::new(SquarerDescriptor), factory.clone());

        // Both submissions land in the open bundle before either future is
        // polled; the element threshold then flushes them as one call.
        let f1 = callable.future_call(LabeledIntList::new("one", vec![1]));
        let f2 = callable.future_call(LabeledIntList::new("one", vec![3]));
        let (r1, r2) = tokio::join!(f1, f2);

        assert_eq!(r1.expect("first split"), vec![1]);
        assert_eq!(r2.expect("second split"), vec![9]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        factory.close().await;
    }

    #[tokio::test]
    async fn distinct_keys_never_share_a_bundle() {
        let (transport, calls) = squarer();
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            settings(1, Duration::from_secs(1)),
        ));
        let callable = transport.bundling(Arc::new(SquarerDescriptor), factory.clone());

        let f1 = callable.future_call(LabeledIntList::new("one", vec![2]));
        let f2 = callable.future_call(LabeledIntList::new("two", vec![3]));

        assert_eq!(f1.await.expect("first bundle"), vec![4]);
        assert_eq!(f2.await.expect("second bundle"), vec![9]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        factory.close().await;
    }

    #[tokio::test]
    async fn byte_threshold_triggers_flush() {
        let (transport, calls) = squarer();
        let bundling_settings = BundlingSettings::builder()
            .element_count_threshold(100)
            .request_byte_threshold(2 * std::mem::size_of::<i32>())
            .delay_threshold(Duration::from_secs(60))
            .build()
            .expect("valid bundling settings");
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            bundling_settings,
        ));
        let callable = transport.bundling(Arc::new(SquarerDescriptor), factory.clone());

        let f1 = callable.future_call(LabeledIntList::new("one", vec![1]));
        let f2 = callable.future_call(LabeledIntList::new("one", vec![2]));

        assert_eq!(f1.await.expect("first split"), vec![1]);
        assert_eq!(f2.await.expect("second split"), vec![4]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        factory.close().await;
    }

    #[tokio::test]
    async fn delay_threshold_flushes_a_partial_bundle() {
        let (transport, calls) = squarer();
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            settings(100, Duration::from_millis(5)),
        ));
        let callable = transport.bundling(Arc::new(SquarerDescriptor), factory.clone());

        let response = callable
            .future_call(LabeledIntList::new("one", vec![1, 2]))
            .await
            .expect("deferred flush completes");
        assert_eq!(response, vec![1, 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        factory.close().await;
    }

    #[tokio::test]
    async fn failures_fan_out_to_every_submitter() {
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            settings(2, Duration::from_secs(1)),
        ));
        let callable = UnaryCallable::from_fn(|_request: LabeledIntList, _ctx| async {
            Err::<Vec<i32>, BoxError>("I FAIL!!".into())
        })
        .bundling(Arc::new(SquarerDescriptor), factory.clone());

        let f1 = callable.future_call(LabeledIntList::new("one", vec![1, 2]));
        let f2 = callable.future_call(LabeledIntList::new("one", vec![3, 4]));

        let e1 = f1.await.expect_err("merged call fails");
        let e2 = f2.await.expect_err("merged call fails");
        assert_eq!(e1.code(), Some(StatusCode::Unknown));
        assert!(e1.to_string().contains("I FAIL!!"));
        assert!(e2.to_string().contains("I FAIL!!"));

        factory.close().await;
    }

    #[tokio::test]
    async fn disabled_bundling_bypasses_the_descriptor() {
        let (transport, calls) = squarer();
        let bundling_settings = BundlingSettings::builder()
            .enabled(false)
            .build()
            .expect("valid bundling settings");
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(DisabledDescriptor),
            bundling_settings,
        ));
        let callable = transport.bundling(Arc::new(DisabledDescriptor), factory.clone());

        let f1 = callable.future_call(LabeledIntList::new("one", vec![1, 2]));
        let f2 = callable.future_call(LabeledIntList::new("one", vec![3, 4]));

        assert_eq!(f1.await.expect("direct call"), vec![1, 4]);
        assert_eq!(f2.await.expect("direct call"), vec![9, 16]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        factory.close().await;
    }

    #[tokio::test]
    async fn close_flushes_open_bundles_and_rejects_new_submissions() {
        let (transport, calls) = squarer();
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            settings(100, Duration::from_secs(3600)),
        ));
        let callable = transport.bundling(Arc::new(SquarerDescriptor), factory.clone());

        let f1 = callable.future_call(LabeledIntList::new("one", vec![1]));
        let f2 = callable.future_call(LabeledIntList::new("one", vec![2]));

        factory.close().await;

        assert_eq!(f1.await.expect("flushed on close"), vec![1]);
        assert_eq!(f2.await.expect("flushed on close"), vec![4]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let rejected = callable
            .future_call(LabeledIntList::new("one", vec![3]))
            .await
            .expect_err("closed factory rejects");
        assert!(matches!(rejected, Error::BundlerClosed));
    }

    #[tokio::test]
    async fn blocking_call_count_threshold_bounds_inflight_flushes() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current_in, peak_in) = (current.clone(), peak.clone());

        let transport = UnaryCallable::from_fn(move |request: LabeledIntList, _ctx| {
            let current = current_in.clone();
            let peak = peak_in.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<Vec<i32>, BoxError>(request.ints.iter().map(|i| i * i).collect())
            }
        });

        let bundling_settings = BundlingSettings::builder()
            .element_count_threshold(1)
            .delay_threshold(Duration::from_secs(1))
            .blocking_call_count_threshold(1)
            .build()
            .expect("valid bundling settings");
        let factory = Arc::new(BundlerFactory::new(
            Arc::new(SquarerDescriptor),
            bundling_settings,
        ));
        let callable = transport.bundling(Arc::new(SquarerDescriptor), factory.clone());

        let futures = vec![
            callable.future_call(LabeledIntList::new("a", vec![1])),
            callable.future_call(LabeledIntList::new("b", vec![2])),
            callable.future_call(LabeledIntList::new("c", vec![3])),
        ];
        for f in futures {
            f.await.expect("flush completes");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        factory.close().await;
    }
}
