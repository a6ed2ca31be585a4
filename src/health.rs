//! Health gating for freshly spawned services.
//!
//! A [`HealthGate`] polls a readiness probe until it passes, the startup
//! window elapses, the process dies, or the caller cancels. Liveness is
//! checked before every probe so a crashed service is reported as dead
//! immediately instead of burning the whole timeout.
use std::{
    net::{TcpStream, ToSocketAddrs},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use tracing::{debug, info};

use crate::{
    constants::{CANCEL_POLL_SLICE, HEALTH_POLL_INTERVAL},
    error::OrchestratorError,
};

/// Anything whose process liveness can be polled without blocking.
pub trait Liveness {
    fn is_alive(&mut self) -> bool;
}

/// Terminal verdict of one gate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The probe passed while the process was alive.
    Healthy,
    /// The gate stopped before a verdict, e.g. on cancellation.
    Unhealthy,
    /// The process died while the gate was still waiting.
    ProcessDead,
    /// The window elapsed with the process alive but the probe failing.
    Timeout,
}

/// Outcome of [`HealthGate::wait_until_healthy`].
#[derive(Debug, Clone, Copy)]
pub struct HealthResult {
    pub status: HealthStatus,
    pub elapsed: Duration,
    /// Set when the wait ended because the shutdown flag flipped.
    pub cancelled: bool,
}

/// Polls a probe at a fixed interval until it settles.
pub struct HealthGate {
    interval: Duration,
}

impl Default for HealthGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthGate {
    pub fn new() -> Self {
        Self {
            interval: HEALTH_POLL_INTERVAL,
        }
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }

    /// Blocks until `probe` passes, `handle` dies, `timeout` elapses, or
    /// `cancel` flips. Liveness is checked before each probe attempt, and
    /// `Timeout` is only reported when the process is still alive at the
    /// deadline.
    pub fn wait_until_healthy<L, P>(
        &self,
        handle: &mut L,
        probe: &mut P,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> HealthResult
    where
        L: Liveness,
        P: FnMut() -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return HealthResult {
                    status: HealthStatus::Unhealthy,
                    elapsed: started.elapsed(),
                    cancelled: true,
                };
            }

            if !handle.is_alive() {
                return HealthResult {
                    status: HealthStatus::ProcessDead,
                    elapsed: started.elapsed(),
                    cancelled: false,
                };
            }

            if probe() {
                return HealthResult {
                    status: HealthStatus::Healthy,
                    elapsed: started.elapsed(),
                    cancelled: false,
                };
            }

            if Instant::now() >= deadline {
                return HealthResult {
                    status: HealthStatus::Timeout,
                    elapsed: started.elapsed(),
                    cancelled: false,
                };
            }

            if self.sleep_cancellable(cancel) {
                return HealthResult {
                    status: HealthStatus::Unhealthy,
                    elapsed: started.elapsed(),
                    cancelled: true,
                };
            }
        }
    }

    /// Sleeps one poll interval in short slices, returning `true` as soon
    /// as the cancel flag flips.
    fn sleep_cancellable(&self, cancel: &AtomicBool) -> bool {
        let mut remaining = self.interval;
        while remaining > Duration::ZERO {
            if cancel.load(Ordering::SeqCst) {
                return true;
            }
            let slice = remaining.min(CANCEL_POLL_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        cancel.load(Ordering::SeqCst)
    }
}

/// A single readiness check against a service endpoint.
pub enum HealthProbe {
    /// HTTP GET that must come back with a 2xx status.
    Http { client: Client, url: String },
    /// Plain TCP connect within a timeout.
    Tcp { addr: String, timeout: Duration },
}

impl HealthProbe {
    /// HTTP probe with a per-request timeout.
    pub fn http(
        service: &str,
        url: String,
        request_timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| OrchestratorError::InvalidServiceConfig {
                service: service.to_string(),
                reason: format!("failed to build health check client: {err}"),
            })?;
        Ok(HealthProbe::Http { client, url })
    }

    /// TCP connect probe against `host:port`.
    pub fn tcp(addr: String, timeout: Duration) -> Self {
        HealthProbe::Tcp { addr, timeout }
    }

    /// Runs the probe once. Failures are reported at debug level only;
    /// the gate decides what repeated failure means.
    pub fn check(&self) -> bool {
        match self {
            HealthProbe::Http { client, url } => match client.get(url).send() {
                Ok(response) => {
                    let healthy = response.status().is_success();
                    if !healthy {
                        debug!("Health check on {url} returned {}", response.status());
                    }
                    healthy
                }
                Err(err) => {
                    debug!("Health check on {url} failed: {err}");
                    false
                }
            },
            HealthProbe::Tcp { addr, timeout } => {
                let Some(resolved) = addr
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut candidates| candidates.next())
                else {
                    debug!("Health check address {addr} did not resolve");
                    return false;
                };
                match TcpStream::connect_timeout(&resolved, *timeout) {
                    Ok(_) => true,
                    Err(err) => {
                        debug!("TCP health check on {addr} failed: {err}");
                        false
                    }
                }
            }
        }
    }

    /// Logs a one-line description at probe setup.
    pub fn announce(&self, service: &str) {
        match self {
            HealthProbe::Http { url, .. } => {
                info!("Waiting for '{service}' to answer on {url}");
            }
            HealthProbe::Tcp { addr, .. } => {
                info!("Waiting for '{service}' to accept connections on {addr}");
            }
        }
    }
}
