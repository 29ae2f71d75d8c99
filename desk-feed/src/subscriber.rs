//! Subscriber callback sets
//!
//! A subscriber registers closures for the events it cares about; it owns no
//! transport resource. Dispatch isolates each invocation so one misbehaving
//! subscriber cannot break the fan-out loop for the others.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use desk_core::FeedMessage;

type OpenFn = Box<dyn Fn() + Send + Sync>;
type MessageFn = Box<dyn Fn(&FeedMessage) + Send + Sync>;
type CloseFn = Box<dyn Fn(CloseEvent) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&str) + Send + Sync>;

/// Why the transport went down
#[derive(Debug, Clone, Copy)]
pub struct CloseEvent {
    /// True for a clean normal closure (manual disconnect or a
    /// normal-closure frame from the server)
    pub normal: bool,
}

/// Callback set registered by one subscriber. All callbacks are optional.
#[derive(Default)]
pub struct FeedCallbacks {
    pub(crate) open: Option<OpenFn>,
    pub(crate) message: Option<MessageFn>,
    pub(crate) close: Option<CloseFn>,
    pub(crate) error: Option<ErrorFn>,
}

impl FeedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.open = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&FeedMessage) + Send + Sync + 'static) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(CloseEvent) + Send + Sync + 'static) -> Self {
        self.close = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for FeedCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCallbacks")
            .field("open", &self.open.is_some())
            .field("message", &self.message.is_some())
            .field("close", &self.close.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Run one subscriber callback, catching a panic so the dispatch loop
/// continues with the remaining subscribers.
pub(crate) fn isolate(subscriber_id: u64, event: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(
            subscriber_id,
            event, "subscriber callback panicked; continuing fan-out"
        );
    }
}
