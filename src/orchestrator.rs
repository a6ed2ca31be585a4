//! The orchestration engine.
//!
//! Drives a stack through `init -> resolving_ports -> starting -> ready ->
//! shutting_down -> stopped`: stale runs are swept, every service gets a
//! bindable port (reclaiming or falling back as needed), services start in
//! dependency order behind their health gates, and teardown walks the stack
//! in reverse through a single code path shared by failure, Ctrl-C, and
//! normal shutdown.
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, ServiceConfig, substitute_placeholders},
    constants::{HEALTH_POLL_INTERVAL, READY_WATCH_INTERVAL, TERMINATION_GRACE},
    error::{OrchestratorError, StateFileError},
    health::{HealthGate, HealthProbe, HealthStatus},
    inspect::{self, ProcessInspector, ProcessState},
    ports::PortProbe,
    reaper::{ProcessReaper, ReclaimOutcome},
    runtime,
    service::{LaunchSpec, ServiceHandle, ServiceState},
};

/// Lifecycle of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum OrchestratorState {
    Init,
    ResolvingPorts,
    /// Starting the service at this position of the start order.
    Starting(usize),
    Ready,
    Failed,
    ShuttingDown,
    Stopped,
}

/// Snapshot of a live run, persisted on reaching READY. Used for stale-run
/// recovery at the next startup and by the `status` subcommand.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunState {
    /// PID of the orchestrator that wrote the record.
    pub pid: u32,
    /// When the stack reached READY.
    pub started_at: DateTime<Utc>,
    /// Per-service bindings. Adopted services carry no PID because their
    /// process belongs to someone else.
    pub services: HashMap<String, RunServiceEntry>,
}

/// One service's binding inside a [`RunState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunServiceEntry {
    pub pid: Option<u32>,
    pub port: u16,
}

impl RunState {
    /// Reads the state file. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>, StateFileError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Writes the record and takes an exclusive lock that lives as long as
    /// the returned file handle.
    pub fn save(&self, path: &Path) -> Result<File, StateFileError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.try_lock_exclusive()?;
        serde_json::to_writer_pretty(&file, self)?;
        Ok(file)
    }
}

/// Supervises one stack: resolves ports, starts services behind their
/// health gates, holds the run, and tears everything down again.
pub struct Orchestrator {
    config: Config,
    order: Vec<String>,
    probe: PortProbe,
    reaper: ProcessReaper,
    /// Spawned handles in start order; teardown walks this in reverse.
    handles: Vec<ServiceHandle>,
    /// Resolved port per service, fallback or not.
    bound_ports: HashMap<String, u16>,
    /// Services satisfied by an already-healthy instance we did not spawn.
    adopted: HashSet<String>,
    /// Ports bound by processes this run spawned; swept during cleanup.
    run_ports: Vec<u16>,
    /// PIDs this run spawned, for self-classification in the probe.
    owned_pids: HashSet<u32>,
    run_dirs: Vec<PathBuf>,
    state: OrchestratorState,
    shutdown: Arc<AtomicBool>,
    /// Exclusive lock on the state file while the run lives.
    state_lock: Option<File>,
}

impl Orchestrator {
    /// Builds an orchestrator for `config`, validating it and fixing the
    /// start order up front.
    pub fn new(config: Config) -> Result<Self, OrchestratorError> {
        Self::with_probe(config, PortProbe::new())
    }

    /// Same as [`Orchestrator::new`] with a caller-supplied inspector, used
    /// by tests to script port ownership.
    pub fn with_inspector(
        config: Config,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self, OrchestratorError> {
        Self::with_probe(config, PortProbe::with_inspector(inspector))
    }

    fn with_probe(config: Config, probe: PortProbe) -> Result<Self, OrchestratorError> {
        let order = config.validate()?;
        let reaper = ProcessReaper::new(probe.clone());
        Ok(Self {
            config,
            order,
            probe,
            reaper,
            handles: Vec::new(),
            bound_ports: HashMap::new(),
            adopted: HashSet::new(),
            run_ports: Vec::new(),
            owned_pids: HashSet::new(),
            run_dirs: Vec::new(),
            state: OrchestratorState::Init,
            shutdown: Arc::new(AtomicBool::new(false)),
            state_lock: None,
        })
    }

    /// The flag a signal handler flips to request shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// The start order computed from `depends_on`.
    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    /// The port a service was resolved to, once known.
    pub fn bound_port(&self, service: &str) -> Option<u16> {
        self.bound_ports.get(service).copied()
    }

    /// Brings the whole stack up. `Ok(true)` means READY; `Ok(false)` means
    /// shutdown was requested before READY and the partial stack was torn
    /// down; `Err` means a failure, also after teardown.
    pub fn initialize(&mut self) -> Result<bool, OrchestratorError> {
        match self.state {
            OrchestratorState::Init => {}
            other => {
                warn!("initialize() called in state {}; ignoring", other.as_ref());
                return Ok(matches!(other, OrchestratorState::Ready));
            }
        }

        match self.startup() {
            Ok(ready) => {
                if !ready {
                    self.cleanup()?;
                }
                Ok(ready)
            }
            Err(err) => {
                self.state = OrchestratorState::Failed;
                warn!("Startup failed: {err}; tearing down");
                if let Err(cleanup_err) = self.cleanup() {
                    warn!("Teardown after failure also failed: {cleanup_err}");
                }
                Err(err)
            }
        }
    }

    /// The startup sequence proper. Returns `Ok(false)` when interrupted by
    /// the shutdown flag; the caller owns the teardown either way.
    fn startup(&mut self) -> Result<bool, OrchestratorError> {
        self.state = OrchestratorState::ResolvingPorts;
        info!("Resolving ports for {} services", self.order.len());

        self.sweep_stale_run()?;

        let order = self.order.clone();
        for name in &order {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested during port resolution");
                return Ok(false);
            }
            let Some(spec) = self.config.services.get(name).cloned() else {
                continue;
            };
            let port = self.resolve_port(name, &spec)?;
            info!("Service '{name}' will use port {port}");
            self.bound_ports.insert(name.clone(), port);
        }

        for (index, name) in order.iter().enumerate() {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested before service '{name}' started");
                return Ok(false);
            }
            self.state = OrchestratorState::Starting(index);
            if self.adopted.contains(name) {
                info!("Service '{name}' is adopted; skipping spawn");
                continue;
            }
            let Some(spec) = self.config.services.get(name).cloned() else {
                continue;
            };
            let Some(port) = self.bound_port(name) else {
                continue;
            };
            if !self.start_service(name, &spec, port)? {
                info!("Shutdown requested while '{name}' was starting");
                return Ok(false);
            }
        }

        self.state = OrchestratorState::Ready;
        self.persist_run_state()?;
        info!("All services are healthy; stack is ready");
        Ok(true)
    }

    /// Brings the stack up and holds it until shutdown is requested or a
    /// service dies. Either way the stack is torn down before returning.
    pub fn run(&mut self) -> Result<(), OrchestratorError> {
        if !self.initialize()? {
            return Ok(());
        }

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown signal received");
                return self.cleanup();
            }

            for index in 0..self.handles.len() {
                let handle = &mut self.handles[index];
                if handle.is_alive() {
                    continue;
                }
                let service = handle.name().to_string();
                let status = handle
                    .exit_status()
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "unknown status".to_string());
                let stderr_tail = handle.failure_tail();
                warn!("Service '{service}' exited while the stack was ready ({status})");
                self.state = OrchestratorState::Failed;
                if let Err(cleanup_err) = self.cleanup() {
                    warn!("Teardown after exit also failed: {cleanup_err}");
                }
                return Err(OrchestratorError::ServiceExited {
                    service,
                    status,
                    stderr_tail,
                });
            }

            thread::sleep(READY_WATCH_INTERVAL);
        }
    }

    /// Tears the stack down: reverse-order termination, a sweep of every
    /// port this run bound, run directory removal, and state file removal.
    /// Idempotent; later calls return immediately.
    pub fn cleanup(&mut self) -> Result<(), OrchestratorError> {
        if self.state == OrchestratorState::Stopped {
            debug!("Cleanup already completed");
            return Ok(());
        }
        self.state = OrchestratorState::ShuttingDown;
        info!("Shutting down stack ({} spawned services)", self.handles.len());

        let mut first_error = None;
        for handle in self.handles.iter_mut().rev() {
            if let Err(err) = handle.terminate(TERMINATION_GRACE) {
                warn!("Failed to stop service '{}': {err}", handle.name());
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        // The spawned processes are gone; their ports must come back before
        // the run counts as torn down.
        self.owned_pids.clear();
        for port in self.run_ports.clone() {
            match self.reaper.free_port(port, true, &self.owned_pids) {
                ReclaimOutcome::Freed => debug!("Port {port} verified free"),
                ReclaimOutcome::StillHeld(holder) => {
                    warn!("Port {port} is still held by {holder} after the sweep");
                }
            }
        }
        self.run_ports.clear();

        for dir in self.run_dirs.drain(..) {
            if let Err(err) = fs::remove_dir_all(&dir)
                && err.kind() != ErrorKind::NotFound
            {
                warn!("Failed to remove run directory {}: {err}", dir.display());
            }
        }

        self.release_run_state();
        self.state = OrchestratorState::Stopped;
        info!("Stack stopped");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Finds a bindable port for `name`: the desired port first, then each
    /// fallback. A candidate already promised to another service in this run
    /// is skipped outright. An occupied candidate is adopted when the
    /// service's own health probe already passes against it; otherwise it
    /// goes through the reaper before being skipped.
    fn resolve_port(
        &mut self,
        name: &str,
        spec: &ServiceConfig,
    ) -> Result<u16, OrchestratorError> {
        let candidates = spec.candidate_ports();
        for &port in &candidates {
            // Ports resolve before anything spawns, so a grant to an earlier
            // service is not visible to the bind check yet.
            if self.bound_ports.values().any(|&granted| granted == port) {
                debug!("Port {port} is already promised to another service; skipping for '{name}'");
                continue;
            }

            if self.probe.is_free(port) {
                return Ok(port);
            }

            if let Some(health_probe) = self.build_probe(name, spec, port)?
                && health_probe.check()
            {
                info!(
                    "Service '{name}' already answers healthy on port {port}; adopting the running instance"
                );
                self.adopted.insert(name.to_string());
                return Ok(port);
            }

            let binding = self.probe.find_owner(port, &self.owned_pids);
            info!("Port {port} is held by {binding}; attempting reclamation for '{name}'");
            match self.reaper.free_port(port, false, &self.owned_pids) {
                ReclaimOutcome::Freed => {
                    if self.probe.is_free(port) {
                        return Ok(port);
                    }
                    warn!("Port {port} reported freed but is still unbindable; trying next candidate");
                }
                ReclaimOutcome::StillHeld(holder) => {
                    warn!("Could not reclaim port {port} from {holder}; trying next candidate");
                }
            }
        }

        Err(OrchestratorError::PortUnavailable {
            service: name.to_string(),
            ports: candidates,
        })
    }

    /// Spawns one service and waits behind its health gate. Returns
    /// `Ok(false)` when the wait was cancelled by the shutdown flag.
    fn start_service(
        &mut self,
        name: &str,
        spec: &ServiceConfig,
        port: u16,
    ) -> Result<bool, OrchestratorError> {
        let run_dir = runtime::ensure_dir(runtime::run_dir(name))
            .map_err(StateFileError::IoError)?;
        self.run_dirs.push(run_dir.clone());

        let context = self.substitution_context(name, spec, port, &run_dir);
        let command = substitute_placeholders(&spec.command, &context);
        let working_dir = self.resolve_working_dir(spec, &context);
        let env = self.resolve_service_env(spec, &context);

        let timeout = spec.startup_timeout(name)?;
        let interval = match &spec.health_check {
            Some(check) => check.interval(name)?,
            None => HEALTH_POLL_INTERVAL,
        };
        let health_probe = self.build_probe(name, spec, port)?;

        let mut handle = ServiceHandle::spawn(LaunchSpec {
            name: name.to_string(),
            command,
            working_dir,
            env,
            run_dir: Some(run_dir),
            port,
        })?;
        self.owned_pids.insert(handle.pid());
        self.run_ports.push(port);

        if let Some(probe) = &health_probe {
            probe.announce(name);
        }
        let mut check = || health_probe.as_ref().map(HealthProbe::check).unwrap_or(true);
        let cancel = Arc::clone(&self.shutdown);
        let gate = HealthGate::with_interval(interval);
        let result = gate.wait_until_healthy(&mut handle, &mut check, timeout, &cancel);

        match result.status {
            HealthStatus::Healthy => {
                info!(
                    "Service '{name}' is healthy on port {port} after {:.1}s",
                    result.elapsed.as_secs_f64()
                );
                handle.advance(ServiceState::Healthy);
                self.handles.push(handle);
                Ok(true)
            }
            HealthStatus::ProcessDead => {
                let stderr_tail = handle.failure_tail();
                handle.advance(ServiceState::Failed);
                self.handles.push(handle);
                Err(OrchestratorError::ProcessDiedDuringHealthCheck {
                    service: name.to_string(),
                    stderr_tail,
                })
            }
            HealthStatus::Timeout => {
                handle.advance(ServiceState::Failed);
                self.handles.push(handle);
                Err(OrchestratorError::HealthTimeout {
                    service: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            HealthStatus::Unhealthy => {
                // Only ever reached through cancellation.
                self.handles.push(handle);
                Ok(false)
            }
        }
    }

    /// Builds the configured health probe against a concrete port, or
    /// `None` when the service declares no health check.
    fn build_probe(
        &self,
        name: &str,
        spec: &ServiceConfig,
        port: u16,
    ) -> Result<Option<HealthProbe>, OrchestratorError> {
        let Some(check) = &spec.health_check else {
            return Ok(None);
        };
        let run_dir = runtime::run_dir(name);
        let context = self.substitution_context(name, spec, port, &run_dir);
        let request_timeout = check.request_timeout(name)?;
        if let Some(url) = &check.url {
            let url = substitute_placeholders(url, &context);
            Ok(Some(HealthProbe::http(name, url, request_timeout)?))
        } else if let Some(tcp) = &check.tcp {
            let addr = substitute_placeholders(tcp, &context);
            Ok(Some(HealthProbe::tcp(addr, request_timeout)))
        } else {
            Ok(None)
        }
    }

    /// The spawn-time substitution context: the service's own `PORT`,
    /// `HOST`, and `RUN_DIR`, plus `<service>_PORT` / `<service>_HOST` for
    /// every service resolved so far.
    fn substitution_context(
        &self,
        name: &str,
        spec: &ServiceConfig,
        port: u16,
        run_dir: &Path,
    ) -> HashMap<String, String> {
        let mut context = HashMap::new();
        context.insert("PORT".to_string(), port.to_string());
        context.insert("HOST".to_string(), spec.host().to_string());
        context.insert("RUN_DIR".to_string(), run_dir.display().to_string());
        for (other, other_port) in &self.bound_ports {
            if other == name {
                continue;
            }
            let host = self
                .config
                .services
                .get(other)
                .map(|s| s.host().to_string())
                .unwrap_or_else(|| crate::constants::DEFAULT_HOST.to_string());
            context.insert(format!("{other}_PORT"), other_port.to_string());
            context.insert(format!("{other}_HOST"), host);
        }
        context
    }

    fn project_root(&self) -> PathBuf {
        self.config
            .project_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn resolve_working_dir(
        &self,
        spec: &ServiceConfig,
        context: &HashMap<String, String>,
    ) -> PathBuf {
        match &spec.working_dir {
            Some(dir) => {
                let dir = PathBuf::from(substitute_placeholders(dir, context));
                if dir.is_absolute() {
                    dir
                } else {
                    self.project_root().join(dir)
                }
            }
            None => self.project_root(),
        }
    }

    /// Collects the child environment: the env file first, inline vars on
    /// top, and the resolved-binding context exported last.
    fn resolve_service_env(
        &self,
        spec: &ServiceConfig,
        context: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut resolved = HashMap::new();
        if let Some(env_config) = &spec.env {
            if let Some(path) = env_config.path(&self.project_root()) {
                match fs::read_to_string(&path) {
                    Ok(content) => {
                        for raw_line in content.lines() {
                            let line = raw_line.trim();
                            if line.is_empty() || line.starts_with('#') {
                                continue;
                            }
                            if let Some((key, value)) = line.split_once('=') {
                                let mut value = value.trim();
                                if value.starts_with('"')
                                    && value.ends_with('"')
                                    && value.len() >= 2
                                {
                                    value = &value[1..value.len() - 1];
                                }
                                resolved.insert(key.trim().to_string(), value.to_string());
                            }
                        }
                    }
                    Err(err) => {
                        warn!("Failed to read env file {}: {err}", path.display());
                    }
                }
            }
            if let Some(vars) = &env_config.vars {
                for (key, value) in vars {
                    resolved.insert(key.clone(), substitute_placeholders(value, context));
                }
            }
        }
        for (key, value) in context {
            resolved.insert(key.clone(), value.clone());
        }
        resolved
    }

    /// Sweeps ports left behind by a crashed run. A state file naming a
    /// still-running orchestrator aborts startup instead.
    fn sweep_stale_run(&mut self) -> Result<(), OrchestratorError> {
        let path = runtime::state_file_path();
        let previous = match RunState::load(&path) {
            Ok(None) => return Ok(()),
            Ok(Some(previous)) => previous,
            Err(StateFileError::ParseError(err)) => {
                warn!("Run state file is corrupt ({err}); removing it");
                remove_if_present(&path);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if previous.pid != std::process::id()
            && inspect::process_state(previous.pid) == ProcessState::Running
        {
            return Err(OrchestratorError::ActiveRunDetected { pid: previous.pid });
        }

        info!(
            "Found stale run state from pid {} (started {}); sweeping {} ports",
            previous.pid,
            previous.started_at,
            previous.services.len()
        );
        for (name, entry) in &previous.services {
            // Adopted services were never ours to kill.
            if entry.pid.is_none() {
                continue;
            }
            debug!("Sweeping stale port {} held for '{name}'", entry.port);
            match self.reaper.free_port(entry.port, false, &self.owned_pids) {
                ReclaimOutcome::Freed => {}
                ReclaimOutcome::StillHeld(holder) => {
                    warn!(
                        "Stale port {} is still held by {holder}; resolution will work around it",
                        entry.port
                    );
                }
            }
        }
        remove_if_present(&path);
        Ok(())
    }

    /// Persists the run record and holds its lock for the life of the run.
    fn persist_run_state(&mut self) -> Result<(), OrchestratorError> {
        runtime::ensure_dir(runtime::state_dir()).map_err(StateFileError::IoError)?;

        let mut services = HashMap::new();
        for handle in &self.handles {
            services.insert(
                handle.name().to_string(),
                RunServiceEntry {
                    pid: Some(handle.pid()),
                    port: handle.port(),
                },
            );
        }
        for name in &self.adopted {
            if let Some(port) = self.bound_ports.get(name) {
                services.insert(
                    name.clone(),
                    RunServiceEntry {
                        pid: None,
                        port: *port,
                    },
                );
            }
        }

        let record = RunState {
            pid: std::process::id(),
            started_at: Utc::now(),
            services,
        };
        let lock = record
            .save(&runtime::state_file_path())
            .map_err(OrchestratorError::StateFileError)?;
        self.state_lock = Some(lock);
        Ok(())
    }

    /// Releases the state file lock and removes the file, when this run
    /// wrote one.
    fn release_run_state(&mut self) {
        if let Some(file) = self.state_lock.take() {
            if let Err(err) = fs2::FileExt::unlock(&file) {
                debug!("Failed to unlock run state file: {err}");
            }
            remove_if_present(&runtime::state_file_path());
        }
    }
}

fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {err}", path.display());
    }
}
