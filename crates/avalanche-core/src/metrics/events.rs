//! Internal events for storage-level metrics.
//!
//! Each event struct represents a measurable occurrence. Events implement the
//! `InternalEvent` trait which records the corresponding metric. Pipeline-level
//! events live in the `avalanche` crate and implement the same trait.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    GetRange,
    Head,
    Put,
    Delete,
    List,
    Rename,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::GetRange => "get_range",
            StorageOperation::Head => "head",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
            StorageOperation::List => "list",
            StorageOperation::Rename => "rename",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    NotFound,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::NotFound => "not_found",
            RequestStatus::Error => "error",
        }
    }

    /// Classify an object store result.
    pub fn of<T>(result: &Result<T, object_store::Error>) -> Self {
        match result {
            Ok(_) => RequestStatus::Success,
            Err(object_store::Error::NotFound { .. }) => RequestStatus::NotFound,
            Err(_) => RequestStatus::Error,
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis() as u64,
            "Storage request"
        );
        counter!(
            "avalanche_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "avalanche_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
