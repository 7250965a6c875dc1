//! Admission control for inbound requests.
//!
//! Admission runs on the connection's read task, before a request is
//! handed to the worker pool. A rejected request never consumes a worker
//! slot; it is answered immediately with an `admission-rejected` response.
//!
//! - [`AllowAll`] admits everything.
//! - [`ConcurrencyLimit`] caps the number of admitted requests that have not
//!   yet been answered, using a lock-free counter and an RAII permit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{HighwayError, Result};
use crate::protocol::RequestHeader;

/// Pluggable pre-queue check.
pub trait AdmissionControl: Send + Sync + 'static {
    /// Admit or reject a request.
    ///
    /// The returned permit is held until the response has been handed to
    /// the writer. Rejections should use
    /// [`HighwayError::AdmissionRejected`].
    fn admit(&self, header: &RequestHeader) -> Result<AdmissionPermit>;
}

/// Proof of admission. Dropping it releases whatever the check reserved.
#[must_use = "dropping the permit releases the admission slot"]
pub struct AdmissionPermit {
    _guard: Option<Box<dyn Send + Sync>>,
}

impl AdmissionPermit {
    /// A permit that reserves nothing.
    pub fn unbounded() -> Self {
        Self { _guard: None }
    }

    /// A permit that drops `guard` on release.
    pub fn with_guard(guard: impl Send + Sync + 'static) -> Self {
        Self {
            _guard: Some(Box::new(guard)),
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("guarded", &self._guard.is_some())
            .finish()
    }
}

/// Admits every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AdmissionControl for AllowAll {
    fn admit(&self, _header: &RequestHeader) -> Result<AdmissionPermit> {
        Ok(AdmissionPermit::unbounded())
    }
}

/// Caps in-flight requests across every connection sharing this limit.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

impl ConcurrencyLimit {
    /// Allow at most `max_in_flight` admitted, unanswered requests.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight,
        }
    }

    /// Current in-flight count.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Configured limit.
    #[inline]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

impl AdmissionControl for ConcurrencyLimit {
    fn admit(&self, header: &RequestHeader) -> Result<AdmissionPermit> {
        let max = self.max_in_flight;
        let reserved = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            });

        match reserved {
            Ok(_) => Ok(AdmissionPermit::with_guard(InFlightGuard {
                in_flight: self.in_flight.clone(),
            })),
            Err(current) => Err(HighwayError::AdmissionRejected(format!(
                "{} has {} requests in flight (limit {})",
                header.qualified_name(),
                current,
                max
            ))),
        }
    }
}

struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Release);
    }
}
