//! Dependencies shared by every component

use std::fmt;
use std::sync::Arc;

use tutor_core::{Clock, ResourceStore, RetryPolicy};
use uuid::Uuid;

/// Store, clock and retry policy handed to each component
#[derive(Clone)]
pub struct ServiceContext {
    /// The shared store
    pub store: Arc<dyn ResourceStore>,
    /// Time source for every timestamp the service writes
    pub clock: Arc<dyn Clock>,
    /// Conflict retry policy
    pub retry: RetryPolicy,
}

impl ServiceContext {
    /// Bundle the shared dependencies
    pub fn new(store: Arc<dyn ResourceStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Current time in microseconds
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now_micros()
    }

    /// Fresh identifier for a generated key segment
    #[must_use]
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("clock", &self.clock)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
