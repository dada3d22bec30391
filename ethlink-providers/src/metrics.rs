//! Opaque event sink for transport observability.
//!
//! Every hook has an empty default body, so a no-op sink costs one virtual
//! call per event and implementors only override what they record. Hooks may
//! be invoked concurrently from the I/O task and from callers; they must not
//! block and must never panic.

use std::{fmt::Debug, sync::Arc, time::Duration};

/// Event sink invoked by the transports at interesting points of a request's
/// life cycle.
pub trait Metrics: Debug + Send + Sync {
    /// A request frame was handed to the transport.
    fn on_request_started(&self, _method: &str) {}

    /// A success response arrived for a pending request.
    fn on_request_completed(&self, _method: &str, _latency: Duration) {}

    /// The timeout sweeper expired a pending request.
    fn on_request_timeout(&self, _method: &str, _id: u64) {}

    /// A request failed with an error response or a transport error.
    fn on_request_failed(&self, _method: &str, _error: &str) {}

    /// The pending-request table is at capacity and a request was rejected.
    fn on_backpressure(&self, _pending: usize, _max: usize) {}

    /// The producer-side send queue is full and a producer is waiting.
    fn on_send_queue_saturation(&self, _capacity: usize) {}

    /// The socket went away outside of a user-initiated close.
    fn on_connection_lost(&self) {}

    /// A reconnection attempt succeeded.
    fn on_reconnect(&self) {}

    /// A notification was routed to a subscription listener.
    fn on_subscription_notification(&self, _id: u64) {}

    /// A subscription listener could not accept a notification; the
    /// subscription is dropped, other listeners are unaffected.
    fn on_subscription_callback_error(&self, _id: u64, _error: &str) {}

    /// An inbound frame could not be routed to any pending request or
    /// subscription.
    fn on_orphaned_response(&self, _reason: &str) {}
}

/// The default [`Metrics`] sink: records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// A [`Metrics`] sink that forwards every event to [`tracing`], for setups
/// that want transport telemetry in the log stream rather than a metrics
/// backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn on_request_completed(&self, method: &str, latency: Duration) {
        tracing::debug!(method, ?latency, "request completed");
    }

    fn on_request_timeout(&self, method: &str, id: u64) {
        tracing::warn!(method, id, "request timed out");
    }

    fn on_request_failed(&self, method: &str, error: &str) {
        tracing::debug!(method, error, "request failed");
    }

    fn on_backpressure(&self, pending: usize, max: usize) {
        tracing::warn!(pending, max, "pending-request table is full");
    }

    fn on_send_queue_saturation(&self, capacity: usize) {
        tracing::debug!(capacity, "send queue saturated");
    }

    fn on_connection_lost(&self) {
        tracing::warn!("connection lost");
    }

    fn on_reconnect(&self) {
        tracing::info!("reconnected");
    }

    fn on_subscription_callback_error(&self, id: u64, error: &str) {
        tracing::warn!(id, error, "subscription listener error");
    }

    fn on_orphaned_response(&self, reason: &str) {
        tracing::debug!(reason, "orphaned inbound frame");
    }
}

pub(crate) fn noop() -> Arc<dyn Metrics> {
    Arc::new(NoopMetrics)
}
