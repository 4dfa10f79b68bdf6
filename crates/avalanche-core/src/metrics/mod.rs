//! Metrics and observability infrastructure.
//!
//! - `events`: the `InternalEvent` trait and storage-level events
//! - `server`: Prometheus recorder and optional HTTP endpoint

pub mod events;
pub mod server;

pub use server::{init_global, init_test, render};

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding metric and a trace-level log line.
///
/// # Example
///
/// ```ignore
/// use avalanche_core::emit;
/// use avalanche_core::metrics::events::{StorageOperation, StorageRequest, RequestStatus};
///
/// emit!(StorageRequest { operation: StorageOperation::Get, status: RequestStatus::Success });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use crate::emit;
