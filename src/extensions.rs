use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use crate::Outcome;
use crate::error::SdkError;
use crate::util::lock_unpoisoned;

/// Supplies the base endpoint (scheme + host [+ base path]) for an attempt.
pub trait EndpointResolver: Send + Sync {
    fn resolve_endpoint(&self, operation: &str) -> Outcome<String>;
}

#[derive(Clone, Debug)]
pub struct StaticEndpoint {
    endpoint: String,
}

impl StaticEndpoint {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl EndpointResolver for StaticEndpoint {
    fn resolve_endpoint(&self, _operation: &str) -> Outcome<String> {
        Ok(self.endpoint.clone())
    }
}

#[derive(Debug)]
pub struct RoundRobinEndpointResolver {
    endpoints: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobinEndpointResolver {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints = endpoints.into_iter().map(Into::into).collect();
        Self {
            endpoints,
            next: AtomicUsize::new(0),
        }
    }
}

impl EndpointResolver for RoundRobinEndpointResolver {
    fn resolve_endpoint(&self, operation: &str) -> Outcome<String> {
        if self.endpoints.is_empty() {
            return Err(SdkError::configuration(format!(
                "no endpoints configured for operation {operation}"
            )));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(self.endpoints[index % self.endpoints.len()].clone())
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to. Useful for simulating a local
/// clock that disagrees with the server.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: SystemTime) {
        *lock_unpoisoned(&self.now) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock_unpoisoned(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *lock_unpoisoned(&self.now)
    }
}
