//! Port reclamation.
//!
//! [`ProcessReaper`] frees a wanted port by escalating against whatever
//! holds it: graceful SIGTERM with a grace window, then SIGKILL, and for
//! zombie bindings a ladder of port-scoped measures (kill-by-port, then a
//! network-stack exclusion toggle). Every rung re-verifies before the next
//! one fires, and a process the probe cannot identify is never signalled
//! directly.
use std::{collections::HashSet, thread, time::Duration};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{
        FORCE_KILL_WAIT, PORT_RELEASE_WAIT, RECLAIM_ATTEMPTS, RECLAIM_BACKOFF_FACTOR,
        RECLAIM_BACKOFF_INITIAL, TERMINATION_GRACE, TERMINATION_POLL_INTERVAL,
    },
    ports::{PortBinding, PortClassification, PortProbe},
};

/// Result of a reclamation pass.
#[derive(Debug, Clone)]
pub enum ReclaimOutcome {
    /// The port came free.
    Freed,
    /// The port is still held after all attempts; the binding names the
    /// holder for error reporting.
    StillHeld(PortBinding),
}

impl ReclaimOutcome {
    pub fn is_freed(&self) -> bool {
        matches!(self, ReclaimOutcome::Freed)
    }
}

/// Frees ports by terminating or out-maneuvering their holders.
#[derive(Clone)]
pub struct ProcessReaper {
    probe: PortProbe,
}

impl ProcessReaper {
    pub fn new(probe: PortProbe) -> Self {
        Self { probe }
    }

    /// Attempts to free `port`, retrying up to [`RECLAIM_ATTEMPTS`] times
    /// with increasing backoff. `force` skips the graceful SIGTERM pass and
    /// goes straight to SIGKILL. Idempotent: a port that is already free
    /// returns [`ReclaimOutcome::Freed`] without side effects.
    pub fn free_port(
        &self,
        port: u16,
        force: bool,
        owned_pids: &HashSet<u32>,
    ) -> ReclaimOutcome {
        for attempt in 0..RECLAIM_ATTEMPTS {
            // The bind check is the ground truth for "free": it holds even
            // when the process table cannot be read.
            if self.probe.is_free(port) {
                return ReclaimOutcome::Freed;
            }
            let binding = self.probe.find_owner(port, owned_pids);
            match binding.classification {
                PortClassification::Free => {
                    // The bind check above failed, so an empty connection
                    // table means the holder is invisible to the tooling,
                    // not gone. Re-verify, then fall through to the
                    // port-scoped rungs against an unnamed occupant.
                    if self.probe.is_free(port) {
                        return ReclaimOutcome::Freed;
                    }
                    let unseen = PortBinding::unknown_owner(port);
                    if let Some(outcome) = self.evict_occupant(port, &unseen, force, attempt) {
                        return outcome;
                    }
                }
                PortClassification::OccupiedBySelf => {
                    // Our own supervised process holds it. Terminating that
                    // is the orchestrator's job, not the reaper's.
                    warn!(
                        "Port {port} is held by supervised process {binding}; refusing to reclaim"
                    );
                    return ReclaimOutcome::StillHeld(binding);
                }
                PortClassification::Zombie => {
                    info!("Port {port} is held by {binding}; running zombie ladder");
                    if let Some(outcome) = self.run_zombie_ladder(port) {
                        return outcome;
                    }
                }
                PortClassification::OccupiedByOther => {
                    if let Some(outcome) = self.evict_occupant(port, &binding, force, attempt) {
                        return outcome;
                    }
                }
            }

            if attempt + 1 < RECLAIM_ATTEMPTS {
                let backoff = backoff_for(attempt);
                debug!(
                    "Port {port} still held after attempt {}; backing off {backoff:?}",
                    attempt + 1
                );
                thread::sleep(backoff);
            }
        }

        // The verdict is the bind check's alone; the connection table only
        // names the holder for the report.
        if self.probe.is_free(port) {
            return ReclaimOutcome::Freed;
        }
        let last = match self.probe.find_owner(port, owned_pids) {
            binding if binding.is_free() => PortBinding::unknown_owner(port),
            binding => binding,
        };
        warn!("Port {port} is still held by {last} after all reclamation attempts");
        ReclaimOutcome::StillHeld(last)
    }

    /// One eviction round against an identified or unknown occupant.
    /// Returns `Some` when the round settled the outcome, `None` to let the
    /// caller back off and retry.
    fn evict_occupant(
        &self,
        port: u16,
        binding: &PortBinding,
        force: bool,
        attempt: usize,
    ) -> Option<ReclaimOutcome> {
        let Some(pid) = binding.pid else {
            // No PID to signal. Port-scoped measures are still fair game,
            // but only once the graceful window has passed.
            if force || attempt > 0 {
                info!("Port {port} has an unidentifiable holder; trying kill-by-port");
                if self.probe.inspector().kill_by_port(port)
                    && self.wait_for_release(port, PORT_RELEASE_WAIT)
                {
                    return Some(ReclaimOutcome::Freed);
                }
            }
            return None;
        };

        if pid == std::process::id() {
            // The holder is this very process (typically a test harness or
            // the CLI itself). Signalling it would be self-destruction.
            warn!("Port {port} is held by this process (pid {pid}); refusing to reclaim");
            return Some(ReclaimOutcome::StillHeld(binding.clone()));
        }

        if !force && attempt == 0 {
            info!("Sending SIGTERM to {binding} holding port {port}");
            if send_signal(pid, Signal::SIGTERM)
                && self.wait_for_release(port, TERMINATION_GRACE)
            {
                return Some(ReclaimOutcome::Freed);
            }
        } else {
            info!("Sending SIGKILL to {binding} holding port {port}");
            send_signal(pid, Signal::SIGKILL);
            if self.wait_for_release(port, FORCE_KILL_WAIT) {
                return Some(ReclaimOutcome::Freed);
            }
        }

        None
    }

    /// The two-rung ladder for bindings with no live owner: a port-scoped
    /// kill command first, then the network-stack exclusion toggle. Returns
    /// `Some(Freed)` when a rung released the port, `None` otherwise.
    fn run_zombie_ladder(&self, port: u16) -> Option<ReclaimOutcome> {
        if self.probe.inspector().kill_by_port(port)
            && self.wait_for_release(port, PORT_RELEASE_WAIT)
        {
            info!("Kill-by-port released port {port}");
            return Some(ReclaimOutcome::Freed);
        }

        if self.probe.inspector().toggle_port_exclusion(port)
            && self.wait_for_release(port, PORT_RELEASE_WAIT)
        {
            info!("Exclusion-range toggle released port {port}");
            return Some(ReclaimOutcome::Freed);
        }

        None
    }

    /// Polls the bind check until the port comes free or the window elapses.
    /// The connection table gets no say here: only a successful bind proves
    /// release.
    fn wait_for_release(&self, port: u16, window: Duration) -> bool {
        let deadline = std::time::Instant::now() + window;
        loop {
            if self.probe.is_free(port) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(TERMINATION_POLL_INTERVAL.min(window));
        }
    }
}

fn backoff_for(attempt: usize) -> Duration {
    let factor = RECLAIM_BACKOFF_FACTOR.powi(attempt as i32);
    RECLAIM_BACKOFF_INITIAL.mul_f64(factor)
}

/// Sends `sig` to `pid`. A process that is already gone counts as success;
/// a permission failure is logged and counts as failure.
fn send_signal(pid: u32, sig: Signal) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => true,
        Err(err) => {
            warn!("Failed to send {sig} to pid {pid}: {err}");
            false
        }
    }
}
