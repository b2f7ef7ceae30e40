//! OpenTelemetry metrics for the accounting extension
//!
//! Provides:
//! - Extension operations (duration, errors by class)
//! - Cache refreshes (outcome, snapshot size)
//!
//! Instruments are registered against the global meter provider, so they are
//! exported once telemetry installed an OTLP reader and are no-ops otherwise.

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

use crate::controller::Operation;
use crate::Error;

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("gardener-extension-accounting"));

/// Histogram of Extension operation duration
///
/// Labels:
/// - `operation`: reconcile, delete, restore, migrate, force-delete
/// - `result`: success, error
pub static OPERATION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("accounting_extension_operation_duration_seconds")
        .with_description("Duration of Extension operations in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed Extension operations
///
/// Labels:
/// - `operation`: reconcile, delete, restore, migrate, force-delete
/// - `error_type`: transient, permanent
pub static OPERATION_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("accounting_extension_operation_errors_total")
        .with_description("Total number of failed Extension operations")
        .with_unit("{errors}")
        .build()
});

/// Counter of cache snapshot refreshes
///
/// Labels:
/// - `result`: success, error
pub static CACHE_REFRESHES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("accounting_cache_refreshes_total")
        .with_description("Total number of cache snapshot refreshes")
        .with_unit("{refreshes}")
        .build()
});

/// Histogram of entries in each successfully fetched cache snapshot
pub static CACHE_ENTRIES: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("accounting_cache_snapshot_entries")
        .with_description("Number of entries in a fetched cache snapshot")
        .with_unit("{entries}")
        .build()
});

/// Whether a failure is worth retrying
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried without user action
    Transient,
    /// Needs a change before it can succeed
    Permanent,
}

impl ErrorClass {
    /// Classify an operation error
    pub fn of(error: &Error) -> Self {
        if error.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }

    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

/// Outcome of a cache refresh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshResult {
    /// A new snapshot was stored
    Success,
    /// The fetch failed and the old snapshot was kept
    Error,
}

impl RefreshResult {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshResult::Success => "success",
            RefreshResult::Error => "error",
        }
    }
}

/// Times one Extension operation
pub struct OperationTimer {
    operation: Operation,
    start: std::time::Instant,
}

impl OperationTimer {
    /// Start timing `operation`
    pub fn start(operation: Operation) -> Self {
        Self {
            operation,
            start: std::time::Instant::now(),
        }
    }

    /// Record the outcome of the operation
    pub fn finish(self, result: &Result<(), Error>) {
        let duration = self.start.elapsed().as_secs_f64();
        let operation = KeyValue::new("operation", self.operation.as_str());
        match result {
            Ok(()) => OPERATION_DURATION.record(
                duration,
                &[operation, KeyValue::new("result", "success")],
            ),
            Err(e) => {
                OPERATION_DURATION.record(
                    duration,
                    &[operation.clone(), KeyValue::new("result", "error")],
                );
                OPERATION_ERRORS.add(
                    1,
                    &[operation, KeyValue::new("error_type", ErrorClass::of(e).as_str())],
                );
            }
        }
    }
}

/// Record a cache refresh; `entries` is the snapshot size on success
pub fn record_cache_refresh(result: RefreshResult, entries: Option<usize>) {
    CACHE_REFRESHES.add(1, &[KeyValue::new("result", result.as_str())]);
    if let Some(entries) = entries {
        CACHE_ENTRIES.record(entries as u64, &[]);
    }
}
