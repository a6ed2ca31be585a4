//! Error handling for stagehand.
use thiserror::Error;

use crate::ports::PortBinding;

/// Defines all possible errors that can occur while orchestrating a stack.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Error for a malformed duration value in the configuration.
    #[error("Invalid duration '{value}' for '{field}' in service '{service}': {reason}")]
    InvalidDuration {
        /// The service whose configuration is malformed.
        service: String,
        /// The field holding the bad value.
        field: String,
        /// The literal value that failed to parse.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Error for a service definition that fails validation.
    #[error("Invalid configuration for service '{service}': {reason}")]
    InvalidServiceConfig {
        /// The service whose configuration is invalid.
        service: String,
        /// Why the definition was rejected.
        reason: String,
    },

    /// Error when a dependency reference is undefined in the configuration.
    #[error("Service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// Error when the dependency graph contains a cycle.
    #[error("Detected dependency cycle: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },

    /// Every candidate port for a service was occupied and unreclaimable.
    #[error("No available port for service '{service}': exhausted {ports:?}")]
    PortUnavailable {
        /// The service that could not be bound.
        service: String,
        /// Every port that was attempted, desired first.
        ports: Vec<u16>,
    },

    /// The OS process for a service could not be created. Fatal; never retried.
    #[error("Failed to spawn service '{service}': {source}")]
    ProcessSpawnFailure {
        /// The service that failed to spawn.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A service stayed alive but never passed its health probe in time.
    #[error("Service '{service}' did not become healthy within {timeout_secs}s")]
    HealthTimeout {
        /// The service that timed out.
        service: String,
        /// The startup window that elapsed.
        timeout_secs: u64,
    },

    /// A service exited while the health gate was still waiting on its probe.
    #[error("Service '{service}' exited during its health check{}", render_tail(.stderr_tail))]
    ProcessDiedDuringHealthCheck {
        /// The service that died.
        service: String,
        /// The last captured stderr lines, oldest first.
        stderr_tail: Vec<String>,
    },

    /// A port could not be freed after every escalation step.
    #[error("Failed to reclaim port {port}: still held by {holder}")]
    ReclamationFailure {
        /// The port that stayed occupied.
        port: u16,
        /// The binding observed after the final attempt.
        holder: PortBinding,
    },

    /// A service exited while the stack was READY.
    #[error("Service '{service}' exited unexpectedly ({status}){}", render_tail(.stderr_tail))]
    ServiceExited {
        /// The service that exited.
        service: String,
        /// Exit status description.
        status: String,
        /// The last captured stderr lines, oldest first.
        stderr_tail: Vec<String>,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A previous run's state file names an orchestrator that is still alive.
    #[error("Another run (pid {pid}) appears to be active; refusing to start")]
    ActiveRunDetected {
        /// The PID recorded by the live run.
        pid: u32,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error for the run state file.
    #[error("Run state error: {0}")]
    StateFileError(#[from] StateFileError),

    /// Error raised by a process signal operation.
    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into an `OrchestratorError`.
impl<T> From<std::sync::PoisonError<T>> for OrchestratorError {
    /// Converts a `std::sync::PoisonError` into an `OrchestratorError`.
    fn from(err: std::sync::PoisonError<T>) -> Self {
        OrchestratorError::MutexPoisonError(err.to_string())
    }
}

/// Formats a captured stderr tail for embedding in an error message.
fn render_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("; last stderr:\n  {}", tail.join("\n  "))
    }
}

/// Error type for run state operations (the state file and run directories).
#[derive(Debug, Error)]
pub enum StateFileError {
    /// Error reading or writing run state on disk.
    #[error("Failed to access run state: {0}")]
    IoError(#[from] std::io::Error),

    /// Error parsing JSON contents of the state file.
    #[error("Failed to parse run state file: {0}")]
    ParseError(#[from] serde_json::Error),
}
