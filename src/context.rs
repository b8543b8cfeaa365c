//! Per-invocation call parameters threaded through every decorator layer.
//!
//! A [`CallContext`] is an immutable value created at invocation time and
//! cloned-with-overrides as layers adjust it (the retry engine tightens the
//! deadline per attempt, channel binding injects the transport handle). The
//! context observed by the primitive callable reflects all composed
//! overrides; no layer ever mutates a context another layer can still see.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Opaque transport handle carried by a [`CallContext`].
///
/// The crate never interprets a channel; it only threads the handle through
/// to the primitive callable. Handles are compared by identity and can be
/// recovered by type through [`Channel::downcast`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<dyn Any + Send + Sync>,
}

impl Channel {
    pub fn new<T: Any + Send + Sync>(transport: T) -> Self {
        Self {
            inner: Arc::new(transport),
        }
    }

    /// Identity comparison: true iff both handles refer to the same channel.
    pub fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Recover the concrete transport behind this handle.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Optional transport options: opaque metadata handed to the transport
/// adapter alongside the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    metadata: Vec<(String, String)>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }
}

/// Immutable per-invocation parameters.
///
/// The deadline is an absolute reading on the library's monotonic
/// [`Clock`](crate::scheduler::Clock): an attempt must complete before the
/// clock reads that value.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    channel: Option<Channel>,
    deadline: Option<Duration>,
    options: CallOptions,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this context bound to `channel`.
    pub fn with_channel(&self, channel: Channel) -> Self {
        Self {
            channel: Some(channel),
            ..self.clone()
        }
    }

    /// A copy of this context with the deadline replaced.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// A copy of this context with the transport options replaced.
    pub fn with_options(&self, options: CallOptions) -> Self {
        Self {
            options,
            ..self.clone()
        }
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }
}
