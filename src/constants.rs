//! Constants and timing defaults for the stagehand orchestrator.
//!
//! This module centralizes the magic numbers used across port resolution,
//! health gating, process termination, and reclamation so that every bounded
//! wait in the orchestration path is declared in one place.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the run state file stored in the state directory.
/// Records the orchestrator PID and the per-service PID/port bindings.
pub const STATE_FILE_NAME: &str = "state.json";

/// Directory under the state directory holding per-run scratch space.
pub const RUN_DIR_NAME: &str = "run";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing service commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// Network Defaults
// ============================================================================

/// Host a service binds when its configuration does not name one.
pub const DEFAULT_HOST: &str = "127.0.0.1";

// ============================================================================
// Health Gating
// ============================================================================

/// Interval between health probe attempts while a service is starting.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-request timeout for a single HTTP or TCP probe attempt.
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Startup window granted to a service that does not configure its own.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Slice used when sleeping inside cancellable waits. Bounds how long a
/// shutdown request can go unobserved mid-wait.
pub const CANCEL_POLL_SLICE: Duration = Duration::from_millis(100);

// ============================================================================
// Process Termination
// ============================================================================

/// Grace period between the terminate signal and the forced kill.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Interval between liveness checks while waiting out the grace period.
pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settle time after a forced kill before the port is re-verified.
pub const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Port Reclamation
// ============================================================================

/// Number of full escalation rounds before a port is declared unreclaimable.
pub const RECLAIM_ATTEMPTS: usize = 3;

/// Backoff before the second reclamation round. Grows by
/// [`RECLAIM_BACKOFF_FACTOR`] on each subsequent round.
pub const RECLAIM_BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Multiplier applied to the reclamation backoff between rounds.
pub const RECLAIM_BACKOFF_FACTOR: f64 = 1.5;

/// Settle time after a kill-by-port or exclusion-range rung before the
/// binding is re-resolved.
pub const PORT_RELEASE_WAIT: Duration = Duration::from_millis(200);

// ============================================================================
// Ready Watch
// ============================================================================

/// Interval between child liveness sweeps while the stack is READY.
pub const READY_WATCH_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Output Capture
// ============================================================================

/// Maximum number of captured lines retained in memory per output stream.
pub const OUTPUT_TAIL_LINES: usize = 200;

/// Number of trailing stderr lines embedded in diagnostics when a service
/// dies during its health check.
pub const STDERR_TAIL_LINES: usize = 20;
