//! Platform process inspection.
//!
//! Everything OS-specific about resolving and evicting port owners lives
//! behind [`ProcessInspector`]: connection-table lookup (which PID listens on
//! a port), the kill-by-port command, and the network-stack exclusion-range
//! toggle used as the last rung against zombie bindings. One implementation
//! per platform is selected once at startup; no other module branches on the
//! operating system.
use std::{io, process::Command, sync::Arc};

use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

#[cfg(not(target_os = "linux"))]
use nix::sys::signal;
#[cfg(not(target_os = "linux"))]
use nix::unistd::Pid;
#[cfg(target_os = "linux")]
use std::{fs, path::Path};

/// Liveness of a PID as the process table sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The process exists and is schedulable.
    Running,
    /// The process table still carries the entry but the process is defunct.
    Zombie,
    /// No such process.
    Missing,
}

/// OS-specific capability for resolving and evicting port owners.
pub trait ProcessInspector: Send + Sync {
    /// Returns the PID listening on `port`, or `None` when nothing is found.
    /// `Err` means the lookup tooling itself was unavailable.
    fn owner_of(&self, port: u16) -> io::Result<Option<u32>>;

    /// Evicts whatever holds `port` with an OS-level by-port command.
    /// Returns `true` when the command ran and claims to have acted.
    fn kill_by_port(&self, port: u16) -> bool;

    /// Blocks and immediately unblocks `port` at the network stack, forcing
    /// the kernel to drop a stale binding. Returns `false` when the platform
    /// offers no such mechanism or the toggle could not be applied.
    fn toggle_port_exclusion(&self, port: u16) -> bool;
}

/// Returns the inspector for the current platform.
#[cfg(target_os = "linux")]
pub fn platform_inspector() -> Arc<dyn ProcessInspector> {
    Arc::new(LinuxInspector)
}

/// Returns the inspector for the current platform.
#[cfg(not(target_os = "linux"))]
pub fn platform_inspector() -> Arc<dyn ProcessInspector> {
    Arc::new(MacInspector)
}

/// Inspector backed by lsof/fuser and the ip_local_reserved_ports sysctl.
#[cfg(target_os = "linux")]
pub struct LinuxInspector;

#[cfg(target_os = "linux")]
impl ProcessInspector for LinuxInspector {
    fn owner_of(&self, port: u16) -> io::Result<Option<u32>> {
        match lsof_listener_pid(port) {
            Ok(pid) => Ok(pid),
            // lsof missing entirely; fuser reads the same kernel tables.
            Err(err) if err.kind() == io::ErrorKind::NotFound => fuser_pid(port),
            Err(err) => Err(err),
        }
    }

    fn kill_by_port(&self, port: u16) -> bool {
        let ran = Command::new("fuser")
            .arg("-k")
            .arg("-KILL")
            .arg(format!("{port}/tcp"))
            .output();
        match ran {
            Ok(output) if output.status.success() => true,
            Ok(_) => false,
            Err(_) => kill_all_on_port(port),
        }
    }

    fn toggle_port_exclusion(&self, port: u16) -> bool {
        // Writes the port into ip_local_reserved_ports, then restores the
        // previous set.
        const RESERVED: &str = "/proc/sys/net/ipv4/ip_local_reserved_ports";
        if !Path::new(RESERVED).exists() {
            return false;
        }
        let previous = match fs::read_to_string(RESERVED) {
            Ok(value) => value.trim().to_string(),
            Err(_) => return false,
        };
        let reserved = if previous.is_empty() {
            port.to_string()
        } else {
            format!("{previous},{port}")
        };
        if let Err(err) = fs::write(RESERVED, &reserved) {
            debug!("Exclusion toggle unavailable for port {port}: {err}");
            return false;
        }
        if let Err(err) = fs::write(RESERVED, &previous) {
            warn!("Failed to restore reserved port set after toggling {port}: {err}");
        }
        true
    }
}

/// Inspector backed by lsof; the exclusion rung has no macOS equivalent.
#[cfg(not(target_os = "linux"))]
pub struct MacInspector;

#[cfg(not(target_os = "linux"))]
impl ProcessInspector for MacInspector {
    fn owner_of(&self, port: u16) -> io::Result<Option<u32>> {
        lsof_listener_pid(port)
    }

    fn kill_by_port(&self, port: u16) -> bool {
        kill_all_on_port(port)
    }

    fn toggle_port_exclusion(&self, _port: u16) -> bool {
        false
    }
}

/// Asks lsof for the PID listening on `port`.
///
/// The port spec must stay attached to `-i`; a detached `:{port}` would be
/// read as a file operand. lsof exits nonzero when nothing matches; that is
/// "no owner", not a tool failure.
fn lsof_listener_pid(port: u16) -> io::Result<Option<u32>> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .output()?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(first_pid(&output.stdout))
}

/// Asks fuser for any PID attached to `port`.
#[cfg(target_os = "linux")]
fn fuser_pid(port: u16) -> io::Result<Option<u32>> {
    let output = Command::new("fuser").arg(format!("{port}/tcp")).output()?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(first_pid(&output.stdout))
}

/// Force-kills every process lsof reports on `port` in any TCP state,
/// sparing our own PID. Used where no dedicated by-port kill exists.
fn kill_all_on_port(port: u16) -> bool {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-t"])
        .output();
    let Ok(output) = output else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    let own = std::process::id();
    let mut acted = false;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Ok(pid) = line.trim().parse::<u32>()
            && pid != own
        {
            debug!("Force-killing pid {pid} holding port {port}");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::SIGKILL,
            );
            acted = true;
        }
    }
    acted
}

/// Parses the first PID out of a tool's stdout.
fn first_pid(stdout: &[u8]) -> Option<u32> {
    String::from_utf8_lossy(stdout)
        .split_whitespace()
        .find_map(|token| token.parse::<u32>().ok())
}

/// Classifies a PID against the process table.
pub fn process_state(pid: u32) -> ProcessState {
    #[cfg(target_os = "linux")]
    {
        let proc_path = format!("/proc/{pid}");
        if !Path::new(&proc_path).exists() {
            return ProcessState::Missing;
        }

        if let Some(state) = read_proc_state(pid)
            && matches!(state, 'Z' | 'X')
        {
            return ProcessState::Zombie;
        }

        ProcessState::Running
    }

    #[cfg(not(target_os = "linux"))]
    {
        let target = Pid::from_raw(pid as i32);
        match signal::kill(target, None) {
            Ok(_) => ProcessState::Running,
            Err(err) => {
                if err == nix::Error::from(nix::errno::Errno::ESRCH) {
                    ProcessState::Missing
                } else {
                    ProcessState::Running
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_state(pid: u32) -> Option<char> {
    let stat_path_str = format!("/proc/{pid}/stat");
    let stat_path = Path::new(&stat_path_str);
    let contents = fs::read_to_string(stat_path).ok()?;
    let mut parts = contents.split_whitespace();
    parts.next()?; // pid
    let mut name_part = parts.next()?; // (comm)
    // The state follows the command, but command may contain spaces. The stat format ensures
    // the executable name is wrapped in parentheses, so consume until the closing ')'.
    if !name_part.ends_with(')') {
        for part in parts.by_ref() {
            name_part = part;
            if name_part.ends_with(')') {
                break;
            }
        }
    }

    parts.next()?.chars().next()
}

/// Resolves a PID to its process name through the process table.
pub fn process_name(pid: u32) -> Option<String> {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .map(|process| process.name().to_string_lossy().to_string())
}
