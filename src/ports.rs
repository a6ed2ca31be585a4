//! Port probing and ownership classification.
//!
//! [`PortProbe`] answers two questions the orchestrator keeps asking: can
//! this port be bound right now (`is_free`, a bind-and-release on the
//! loopback), and who holds it (`find_owner`, the platform inspector's
//! connection-table view joined with the process table). Results are
//! computed on demand and never cached.
use std::{collections::HashSet, fmt, net::TcpListener, sync::Arc};

use tracing::debug;

use crate::inspect::{self, ProcessInspector, ProcessState};

/// How a port is held, as far as this run is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortClassification {
    /// The connection table shows no owner.
    Free,
    /// Held by a process this run spawned.
    OccupiedBySelf,
    /// Held by a process outside this run, or by an owner the lookup
    /// tooling could not name.
    OccupiedByOther,
    /// The connection table names a PID the process table cannot resolve
    /// to a live process.
    Zombie,
}

/// A point-in-time view of who holds a port.
#[derive(Debug, Clone)]
pub struct PortBinding {
    /// The inspected port.
    pub port: u16,
    /// Owning PID, when the connection table reported one.
    pub pid: Option<u32>,
    /// Owning process name, when the process table could resolve it.
    pub process: Option<String>,
    /// The classification callers pattern-match on.
    pub classification: PortClassification,
}

impl PortBinding {
    fn free(port: u16) -> Self {
        Self {
            port,
            pid: None,
            process: None,
            classification: PortClassification::Free,
        }
    }

    pub(crate) fn unknown_owner(port: u16) -> Self {
        Self {
            port,
            pid: None,
            process: None,
            classification: PortClassification::OccupiedByOther,
        }
    }

    /// True when the binding does not block the port.
    pub fn is_free(&self) -> bool {
        self.classification == PortClassification::Free
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.classification, self.pid, self.process.as_deref()) {
            (PortClassification::Free, ..) => write!(f, "nothing"),
            (PortClassification::Zombie, Some(pid), _) => {
                write!(f, "a zombie binding (stale pid {pid})")
            }
            (PortClassification::Zombie, None, _) => write!(f, "a zombie binding"),
            (_, Some(pid), Some(name)) => write!(f, "pid {pid} ({name})"),
            (_, Some(pid), None) => write!(f, "pid {pid}"),
            (_, None, _) => write!(f, "an unknown owner"),
        }
    }
}

/// Probes port availability and ownership.
#[derive(Clone)]
pub struct PortProbe {
    inspector: Arc<dyn ProcessInspector>,
}

impl Default for PortProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProbe {
    /// Probe backed by the platform inspector.
    pub fn new() -> Self {
        Self {
            inspector: inspect::platform_inspector(),
        }
    }

    /// Probe backed by a caller-supplied inspector.
    pub fn with_inspector(inspector: Arc<dyn ProcessInspector>) -> Self {
        Self { inspector }
    }

    /// Access to the underlying inspector, for the reaper's escalation rungs.
    pub fn inspector(&self) -> &Arc<dyn ProcessInspector> {
        &self.inspector
    }

    /// Bind-and-release check on the loopback. Returns `true` only when the
    /// bind succeeds; a listener already present, a permission error, and
    /// any other bind failure all count as occupied.
    pub fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Resolves who holds `port`. `owned_pids` are the PIDs this run
    /// spawned, used to tell our own services from strangers.
    ///
    /// Lookup tooling being unavailable degrades to `OccupiedByOther` with
    /// an unknown PID so reclamation paths still get attempted; it never
    /// raises.
    pub fn find_owner(&self, port: u16, owned_pids: &HashSet<u32>) -> PortBinding {
        let pid = match self.inspector.owner_of(port) {
            Ok(Some(pid)) => pid,
            Ok(None) => return PortBinding::free(port),
            Err(err) => {
                debug!("Port owner lookup unavailable for {port}: {err}");
                return PortBinding::unknown_owner(port);
            }
        };

        let process = inspect::process_name(pid);
        let classification = match inspect::process_state(pid) {
            ProcessState::Running => {
                if owned_pids.contains(&pid) {
                    PortClassification::OccupiedBySelf
                } else {
                    PortClassification::OccupiedByOther
                }
            }
            // The connection table names an owner the process table cannot
            // resolve to anything live: a stale kernel-level entry.
            ProcessState::Zombie | ProcessState::Missing => PortClassification::Zombie,
        };

        PortBinding {
            port,
            pid: Some(pid),
            process,
            classification,
        }
    }
}
