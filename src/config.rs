//! Configuration management for stagehand.
//!
//! A stack is described in YAML: one entry per service with its command,
//! desired port, fallback ports, health check, and dependencies. `${VAR}`
//! references are expanded from the process environment when the file is
//! loaded; the runtime placeholders `${PORT}`, `${HOST}`, `${RUN_DIR}` and
//! `${<service>_PORT}` / `${<service>_HOST}` are left intact and substituted
//! at spawn time once actual bindings are known.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    constants::{DEFAULT_HOST, DEFAULT_STARTUP_TIMEOUT},
    error::OrchestratorError,
};

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Map of service names to their respective configurations.
    pub services: HashMap<String, ServiceConfig>,
    /// Root directory from which relative paths are resolved.
    pub project_dir: Option<String>,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Command used to start the service. Runtime placeholders are allowed.
    pub command: String,
    /// Working directory for the service process.
    pub working_dir: Option<String>,
    /// Optional environment variables for the service.
    pub env: Option<EnvConfig>,
    /// Host the service binds. Defaults to the loopback.
    pub host: Option<String>,
    /// Port the service should bind.
    pub port: u16,
    /// Alternate ports attempted, in order, when the desired port cannot be
    /// secured.
    pub fallback_ports: Option<Vec<u16>>,
    /// Readiness probe; a service without one is gated on liveness only.
    pub health_check: Option<HealthCheckConfig>,
    /// Window the service is given to pass its health check (e.g. "30s").
    pub startup_timeout: Option<String>,
    /// List of services that must be healthy before this service starts.
    pub depends_on: Option<Vec<String>>,
}

impl ServiceConfig {
    /// Host the service binds, falling back to the loopback default.
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    /// Candidate ports in attempt order: the desired port, then each
    /// fallback, duplicates removed.
    pub fn candidate_ports(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        let mut ports = vec![self.port];
        seen.insert(self.port);
        for &port in self.fallback_ports.iter().flatten() {
            if seen.insert(port) {
                ports.push(port);
            }
        }
        ports
    }

    /// Parsed startup window for this service.
    pub fn startup_timeout(&self, service: &str) -> Result<Duration, OrchestratorError> {
        match &self.startup_timeout {
            None => Ok(DEFAULT_STARTUP_TIMEOUT),
            Some(raw) => {
                parse_duration(raw).map_err(|reason| OrchestratorError::InvalidDuration {
                    service: service.to_string(),
                    field: "startup_timeout".to_string(),
                    value: raw.clone(),
                    reason,
                })
            }
        }
    }
}

/// Represents environment variables for a service.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() || path.exists() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// Readiness probe definition: an HTTP URL or a bare TCP connect target.
#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    /// HTTP endpoint probed with GET; any 2xx response counts as healthy.
    pub url: Option<String>,
    /// `host:port` target probed with a TCP connect.
    pub tcp: Option<String>,
    /// Interval between probe attempts (default 1s).
    pub interval: Option<String>,
    /// Timeout for a single probe attempt (default 2s).
    pub request_timeout: Option<String>,
}

impl HealthCheckConfig {
    fn parse_field(
        raw: &Option<String>,
        service: &str,
        field: &str,
        default: Duration,
    ) -> Result<Duration, OrchestratorError> {
        match raw {
            None => Ok(default),
            Some(value) => {
                parse_duration(value).map_err(|reason| OrchestratorError::InvalidDuration {
                    service: service.to_string(),
                    field: field.to_string(),
                    value: value.clone(),
                    reason,
                })
            }
        }
    }

    /// Parsed probe interval.
    pub fn interval(&self, service: &str) -> Result<Duration, OrchestratorError> {
        Self::parse_field(
            &self.interval,
            service,
            "health_check.interval",
            crate::constants::HEALTH_POLL_INTERVAL,
        )
    }

    /// Parsed per-attempt timeout.
    pub fn request_timeout(&self, service: &str) -> Result<Duration, OrchestratorError> {
        Self::parse_field(
            &self.request_timeout,
            service,
            "health_check.request_timeout",
            crate::constants::PROBE_REQUEST_TIMEOUT,
        )
    }
}

impl Config {
    /// Validates the stack definition and returns the dependency-ordered
    /// start list.
    pub fn validate(&self) -> Result<Vec<String>, OrchestratorError> {
        for (name, service) in &self.services {
            if service.command.trim().is_empty() {
                return Err(OrchestratorError::InvalidServiceConfig {
                    service: name.clone(),
                    reason: "command is empty".to_string(),
                });
            }
            if service.port == 0 {
                return Err(OrchestratorError::InvalidServiceConfig {
                    service: name.clone(),
                    reason: "port must be nonzero".to_string(),
                });
            }
            if let Some(check) = &service.health_check {
                match (&check.url, &check.tcp) {
                    (Some(_), Some(_)) => {
                        return Err(OrchestratorError::InvalidServiceConfig {
                            service: name.clone(),
                            reason: "health_check declares both url and tcp".to_string(),
                        });
                    }
                    (None, None) => {
                        return Err(OrchestratorError::InvalidServiceConfig {
                            service: name.clone(),
                            reason: "health_check declares neither url nor tcp".to_string(),
                        });
                    }
                    _ => {}
                }
                check.interval(name)?;
                check.request_timeout(name)?;
            }
            service.startup_timeout(name)?;
        }
        self.start_order()
    }

    /// Computes the order services start in: a topological sort of the
    /// `depends_on` graph, visiting names alphabetically so the result is
    /// deterministic for a given file.
    pub fn start_order(&self) -> Result<Vec<String>, OrchestratorError> {
        fn visit(
            name: &str,
            services: &HashMap<String, ServiceConfig>,
            path: &mut Vec<String>,
            done: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) -> Result<(), OrchestratorError> {
            if done.contains(name) {
                return Ok(());
            }
            if let Some(pos) = path.iter().position(|n| n == name) {
                let mut cycle: Vec<&str> = path[pos..].iter().map(String::as_str).collect();
                cycle.push(name);
                return Err(OrchestratorError::DependencyCycle {
                    cycle: cycle.join(" -> "),
                });
            }
            let Some(spec) = services.get(name) else {
                return Ok(());
            };
            path.push(name.to_string());
            let mut deps: Vec<&String> = spec.depends_on.iter().flatten().collect();
            deps.sort();
            for dep in deps {
                if !services.contains_key(dep) {
                    return Err(OrchestratorError::UnknownDependency {
                        service: name.to_string(),
                        dependency: dep.clone(),
                    });
                }
                visit(dep, services, path, done, order)?;
            }
            path.pop();
            done.insert(name.to_string());
            order.push(name.to_string());
            Ok(())
        }

        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();

        let mut order = Vec::with_capacity(self.services.len());
        let mut done = HashSet::new();
        let mut path = Vec::new();
        for name in names {
            visit(name, &self.services, &mut path, &mut done, &mut order)?;
        }
        Ok(order)
    }
}

/// Parses a human-readable duration: `"500ms"`, `"5s"`, `"2m"`, `"1h"`, or a
/// bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        None => (value, "s"),
        Some(idx) => value.split_at(idx),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("expected a number, got '{digits}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        other => Err(format!("unknown unit '{other}'")),
    }
}

/// Names reserved for spawn-time substitution. Load-time expansion never
/// touches these even when a same-named process environment variable exists.
fn is_runtime_placeholder(name: &str) -> bool {
    matches!(name, "PORT" | "HOST" | "RUN_DIR")
        || name.ends_with("_PORT")
        || name.ends_with("_HOST")
}

/// Expands `${VAR}` references from the process environment.
///
/// Runtime placeholders and references to unset variables are left intact:
/// the former are filled at spawn time, the latter are the service shell's
/// business.
fn expand_env_vars(input: &str) -> String {
    let re = placeholder_regex();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        if is_runtime_placeholder(var_name) {
            return caps[0].to_string();
        }
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => caps[0].to_string(),
        }
    })
    .to_string()
}

/// Substitutes runtime placeholders from a resolved-binding context.
/// References not present in the context are left untouched.
pub fn substitute_placeholders(input: &str, context: &HashMap<String, String>) -> String {
    let re = placeholder_regex();
    re.replace_all(input, |caps: &regex::Captures| {
        match context.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        }
    })
    .to_string()
}

fn placeholder_regex() -> Regex {
    Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap()
}

/// Loads an `.env` file and sets environment variables.
fn load_env_file(path: &str) -> Result<(), OrchestratorError> {
    let content = fs::read_to_string(path).map_err(OrchestratorError::ConfigReadError)?;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();

            if value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }

            unsafe {
                env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, OrchestratorError> {
    let config_path = config_path.map(Path::new).unwrap_or_else(|| {
        if Path::new("stagehand.yaml").exists() {
            Path::new("stagehand.yaml")
        } else {
            Path::new("stack.yaml")
        }
    });

    let content = fs::read_to_string(config_path).map_err(|e| {
        OrchestratorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let config: Config =
        serde_yaml::from_str(&content).map_err(OrchestratorError::ConfigParseError)?;

    let base_path = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    for service in config.services.values() {
        if let Some(env_config) = &service.env
            && let Some(resolved_path) = env_config.path(&base_path)
        {
            load_env_file(&resolved_path.to_string_lossy())?;
        }
    }

    let expanded_content = expand_env_vars(&content);

    let mut config: Config = serde_yaml::from_str(&expanded_content)
        .map_err(OrchestratorError::ConfigParseError)?;

    config.project_dir = Some(base_path.to_string_lossy().to_string());
    Ok(config)
}
