use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::StatusCode;

use crate::error::SdkError;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub clock_skew_corrections: u64,
    pub quota_denials: u64,
    pub cancellations: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Option<Arc<ClientMetricsInner>>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    clock_skew_corrections: AtomicU64,
    quota_denials: AtomicU64,
    cancellations: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<ClientMetricsInner>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl ClientMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(ClientMetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_started(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_attempt(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clock_skew_correction(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.clock_skew_corrections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_quota_denial(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.quota_denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts every response seen, successful or not.
    pub(crate) fn record_status(&self, status: StatusCode) {
        self.add_status_count(status.as_u16());
    }

    pub(crate) fn record_request_succeeded(&self, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub(crate) fn record_request_failed(&self, error: &SdkError, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        if error.kind() == crate::error::ErrorKind::Cancelled {
            inner.cancellations.fetch_add(1, Ordering::Relaxed);
        }
        self.record_latency(latency);
        self.add_error_count(error.kind().as_str().to_owned());
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return ClientMetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        ClientMetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            clock_skew_corrections: inner.clock_skew_corrections.load(Ordering::Relaxed),
            quota_denials: inner.quota_denials.load(Ordering::Relaxed),
            cancellations: inner.cancellations.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        let latency_ms = latency.as_millis().min(u64::MAX as u128) as u64;
        inner.latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn add_status_count(&self, status: u16) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut counts = lock_unpoisoned(&inner.status_counts);
        *counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, code: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut counts = lock_unpoisoned(&inner.error_counts);
        *counts.entry(code).or_insert(0) += 1;
    }
}
