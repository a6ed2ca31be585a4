//! Spawning and terminating supervised service processes.
//!
//! Each service runs as `sh -c <command>` in its own process group so the
//! whole tree can be signalled at once. On Linux the kernel additionally
//! delivers SIGTERM to the child if the supervisor dies first. Stdout and
//! stderr are drained into ring buffers from the moment of spawn.
use std::{
    collections::HashMap,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use crate::{
    constants::{FORCE_KILL_WAIT, STDERR_TAIL_LINES, TERMINATION_POLL_INTERVAL},
    error::OrchestratorError,
    health::Liveness,
    output::{self, OutputBuffer},
};

/// Lifecycle of a supervised process. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ServiceState {
    Spawning,
    Running,
    Healthy,
    Failed,
    Stopping,
    Stopped,
}

impl ServiceState {
    fn rank(self) -> u8 {
        match self {
            ServiceState::Spawning => 0,
            ServiceState::Running => 1,
            ServiceState::Healthy | ServiceState::Failed => 2,
            ServiceState::Stopping => 3,
            ServiceState::Stopped => 4,
        }
    }
}

/// Everything needed to launch one service: the fully substituted command,
/// its resolved environment, and where output should land.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub command: String,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub run_dir: Option<PathBuf>,
    pub port: u16,
}

/// A live supervised process and its captured output.
pub struct ServiceHandle {
    name: String,
    port: u16,
    child: Child,
    pgid: i32,
    state: ServiceState,
    stdout: Arc<Mutex<OutputBuffer>>,
    stderr: Arc<Mutex<OutputBuffer>>,
    exit_status: Option<ExitStatus>,
}

impl ServiceHandle {
    /// Launches the service described by `spec`.
    ///
    /// The child is placed in its own process group before exec. A spawn
    /// failure is fatal for the service and is never retried.
    pub fn spawn(spec: LaunchSpec) -> Result<Self, OrchestratorError> {
        debug!(
            "Launching service '{}' with command: `{}`",
            spec.name, spec.command
        );

        let mut cmd = Command::new(crate::constants::DEFAULT_SHELL);
        cmd.arg(crate::constants::SHELL_COMMAND_FLAG).arg(&spec.command);
        cmd.current_dir(&spec.working_dir);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        if !spec.env.is_empty() {
            let keys: Vec<_> = spec.env.keys().cloned().collect();
            debug!("Setting environment variables: {keys:?}");
            cmd.envs(&spec.env);
        }

        unsafe {
            cmd.pre_exec(move || {
                // Place each service in its own process group so the entire
                // tree can be signalled without touching the supervisor's.
                if libc::setpgid(0, 0) < 0 {
                    let err = std::io::Error::last_os_error();
                    eprintln!("stagehand pre_exec: setpgid(0, 0) failed: {err:?}");
                    return Err(err);
                }

                // Ensure the service gets killed on parent death (Linux only).
                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        let err = std::io::Error::last_os_error();
                        eprintln!("stagehand pre_exec: prctl PR_SET_PDEATHSIG failed: {err:?}");
                        return Err(err);
                    }
                }

                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| {
            OrchestratorError::ProcessSpawnFailure {
                service: spec.name.clone(),
                source,
            }
        })?;

        let pid = child.id();
        info!("Service '{}' started with PID {pid}", spec.name);

        let stdout = match child.stdout.take() {
            Some(stream) => output::spawn_capture(
                &spec.name,
                "stdout",
                stream,
                spec.run_dir.as_ref().map(|dir| dir.join("stdout.log")),
            ),
            None => Arc::new(Mutex::new(OutputBuffer::default())),
        };
        let stderr = match child.stderr.take() {
            Some(stream) => output::spawn_capture(
                &spec.name,
                "stderr",
                stream,
                spec.run_dir.as_ref().map(|dir| dir.join("stderr.log")),
            ),
            None => Arc::new(Mutex::new(OutputBuffer::default())),
        };

        let mut handle = Self {
            name: spec.name,
            port: spec.port,
            child,
            pgid: pid as i32,
            state: ServiceState::Spawning,
            stdout,
            stderr,
            exit_status: None,
        };
        handle.advance(ServiceState::Running);
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The port this service was launched against.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Moves the lifecycle forward. A transition that would go backwards is
    /// ignored, so terminal states stick.
    pub fn advance(&mut self, next: ServiceState) {
        if next.rank() > self.state.rank() {
            debug!(
                "Service '{}' state {} -> {}",
                self.name,
                self.state.as_ref(),
                next.as_ref()
            );
            self.state = next;
        }
    }

    /// Non-blocking exit poll. Caches the status once the child is reaped.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Service '{}' exited with {status}", self.name);
                    self.exit_status = Some(status);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("Failed to poll service '{}': {err}", self.name);
                }
            }
        }
        self.exit_status
    }

    /// Whether the direct child is still running. Never blocks.
    pub fn is_alive(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// The last `n` captured stderr lines, for diagnostics.
    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        OutputBuffer::tail_of(&self.stderr, n)
    }

    /// The last `n` captured stdout lines.
    pub fn stdout_tail(&self, n: usize) -> Vec<String> {
        OutputBuffer::tail_of(&self.stdout, n)
    }

    /// Default-sized stderr tail used when building failure reports.
    pub fn failure_tail(&self) -> Vec<String> {
        self.stderr_tail(STDERR_TAIL_LINES)
    }

    /// Stops the service and its process tree: SIGTERM to the group, up to
    /// `grace` to exit, then SIGKILL. Idempotent; returns once the direct
    /// child is reaped or the bounded force-kill wait elapses.
    pub fn terminate(&mut self, grace: Duration) -> Result<(), OrchestratorError> {
        if self.state == ServiceState::Stopped {
            return Ok(());
        }
        self.advance(ServiceState::Stopping);

        if self.exit_status().is_none() {
            info!(
                "Stopping service '{}' (pid {}, process group {})",
                self.name,
                self.child.id(),
                self.pgid
            );
            self.signal_group(Signal::SIGTERM)?;

            let deadline = Instant::now() + grace;
            while self.exit_status().is_none() && Instant::now() < deadline {
                thread::sleep(TERMINATION_POLL_INTERVAL);
            }

            if self.exit_status().is_none() {
                warn!(
                    "Service '{}' did not exit within {grace:?}; sending SIGKILL",
                    self.name
                );
                self.signal_group(Signal::SIGKILL)?;
                match wait_with_timeout(&mut self.child, FORCE_KILL_WAIT) {
                    Ok(Some(status)) => self.exit_status = Some(status),
                    Ok(None) => {
                        warn!(
                            "Service '{}' was not reaped within {FORCE_KILL_WAIT:?} of SIGKILL",
                            self.name
                        );
                    }
                    Err(err) => {
                        warn!("Failed waiting on service '{}': {err}", self.name);
                    }
                }
            }
        } else {
            debug!("Service '{}' had already exited before stop", self.name);
        }

        self.advance(ServiceState::Stopped);
        info!("Service '{}' stopped", self.name);
        Ok(())
    }

    /// Signals the whole process group, falling back to the direct child
    /// when group delivery is not permitted.
    fn signal_group(&self, sig: Signal) -> Result<(), OrchestratorError> {
        let kill_result = unsafe { libc::killpg(self.pgid, sig as libc::c_int) };
        if kill_result < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::ESRCH => {}
                Some(code) if code == libc::EPERM => {
                    warn!(
                        "Insufficient permissions to signal process group {} for '{}'; falling back to direct signal",
                        self.pgid, self.name
                    );
                    if let Err(errno) =
                        signal::kill(Pid::from_raw(self.child.id() as i32), sig)
                        && errno != Errno::ESRCH
                    {
                        return Err(OrchestratorError::ServiceStopError {
                            service: self.name.clone(),
                            source: nix_error_to_io(errno),
                        });
                    }
                }
                _ => {
                    return Err(OrchestratorError::ServiceStopError {
                        service: self.name.clone(),
                        source: err,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Liveness for ServiceHandle {
    fn is_alive(&mut self) -> bool {
        ServiceHandle::is_alive(self)
    }
}

/// Waits for a child with a timeout, returning `Ok(None)` on timeout.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn nix_error_to_io(err: Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}
