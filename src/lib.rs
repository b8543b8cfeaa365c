//! # sidecall
//!
//! Composable client-side middleware for unary RPCs. The crate wraps a raw
//! request→response call in a stack of decorators offering retry with
//! exponential backoff, automatic pagination, and request bundling, in any
//! combination. The transport itself stays outside: anything that can
//! perform one call — an async closure, a [`tower::Service`], a hand-rolled
//! client — plugs in at the bottom of the stack.
//!
//! ## Core Concepts
//!
//! - **[`UnaryCallable`]**: the composition root. An immutable value
//!   representing a deferred unary RPC; builder-style methods stack
//!   decorators, each yielding a new callable of the same shape.
//! - **[`CallContext`]**: immutable per-invocation parameters (channel
//!   handle, deadline, transport options) threaded through every layer.
//! - **[`RetrySettings`]**: the backoff schedule and total deadline consumed
//!   by [`UnaryCallable::retrying`].
//! - **[`PageDescriptor`]**: strategy describing how responses paginate;
//!   [`UnaryCallable::page_streaming`] turns a list call into a
//!   [`PagedListResponse`] with element, page, and fixed-size views.
//! - **[`BundlingDescriptor`]** and **[`BundlerFactory`]**: strategy and
//!   lifecycle owner behind [`UnaryCallable::bundling`], which coalesces
//!   same-partition requests into fewer calls.
//! - **[`Scheduler`] and [`Clock`]**: injectable timer and time source; the
//!   engines never sleep or read wall time directly, which makes them
//!   deterministic under test (see the [`testing`] module).
//!
//! ## Getting Started
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sidecall::{
//!     RetrySettings, StatusCode, SystemClock, TokioScheduler, UnaryCallable,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> sidecall::Result<()> {
//! let callable = UnaryCallable::from_fn(|request: u32, _ctx| async move {
//!     Ok(request + 1)
//! })
//! .retryable_on([StatusCode::Unavailable])
//! .retrying(
//!     RetrySettings::builder()
//!         .total_timeout(Duration::from_secs(5))
//!         .build()?,
//!     Arc::new(TokioScheduler::new()),
//!     Arc::new(SystemClock::new()),
//! );
//!
//! assert_eq!(callable.call(1).await?, 2);
//! # Ok(())
//! # }
//! ```
//!
//! [`tower::Service`]: tower::Service

pub mod bundling;
pub mod callable;
pub mod config;
pub mod context;
pub mod error;
pub mod paging;
pub mod retry;
pub mod scheduler;
pub mod testing;

// Re-export core types for convenience
pub use bundling::{
    BundlerFactory, BundlingCallable, BundlingDescriptor, BundlingSettings, RequestIssuer,
};
pub use callable::{FnCallable, FutureCallable, ServiceCallable, UnaryCallable};
pub use config::ClientConfig;
pub use context::{CallContext, CallOptions, Channel};
pub use error::{ApiError, BoxError, Error, Result, RpcStatus, SharedError, StatusCode};
pub use paging::{FixedSizeCollection, Page, PageDescriptor, PagedCallable, PagedListResponse};
pub use retry::{RetrySettings, RetryingCallable, DEADLINE_SLEEP_DURATION};
pub use scheduler::{Clock, Scheduler, SystemClock, TimerHandle, TokioScheduler};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_imports() {
        // Verify that the public surface compiles together.
        let _ = std::mem::size_of::<StatusCode>();
    }
}
