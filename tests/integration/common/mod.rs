#![allow(dead_code)]

use std::{
    env, fs,
    net::TcpListener,
    os::{fd::AsRawFd, unix::process::CommandExt},
    path::{Path, PathBuf},
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

use stagehand::test_utils;

/// Points `STAGEHAND_STATE_DIR` at a scratch directory for the duration of a
/// test. Holds the process-wide environment lock so tests that touch the
/// state directory cannot interleave, and restores the previous value on
/// drop.
pub struct StateDirGuard {
    previous: Option<std::ffi::OsString>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl StateDirGuard {
    pub fn set(dir: &Path) -> Self {
        let lock = test_utils::env_lock();
        let previous = env::var_os("STAGEHAND_STATE_DIR");
        unsafe {
            env::set_var("STAGEHAND_STATE_DIR", dir);
        }
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for StateDirGuard {
    fn drop(&mut self) {
        unsafe {
            match self.previous.take() {
                Some(value) => env::set_var("STAGEHAND_STATE_DIR", value),
                None => env::remove_var("STAGEHAND_STATE_DIR"),
            }
        }
    }
}

/// Writes a stack definition into `dir` and returns its path.
pub fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("stagehand.yaml");
    fs::write(&path, body).expect("failed to write config");
    path
}

/// Binds an ephemeral loopback port and returns it together with the live
/// listener, for tests that need a genuinely occupied port.
pub fn held_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    let port = listener.local_addr().expect("listener has no address").port();
    (listener, port)
}

/// Picks a port that was free a moment ago. The probe listener is dropped,
/// so the port can be handed to a service under test.
pub fn free_port() -> u16 {
    let (listener, port) = held_port();
    drop(listener);
    port
}

/// Spawns a child process that is the sole holder of a freshly-bound
/// loopback listener, for tests that need a real foreign port owner. The
/// listener is bound here and handed down through fork; once the parent copy
/// is dropped only the child keeps the port open.
pub fn spawn_port_holder() -> (Child, u16) {
    let (listener, port) = held_port();
    let fd = listener.as_raw_fd();
    let mut command = Command::new("sh");
    command.args(["-c", "exec sleep 60"]);
    unsafe {
        command.pre_exec(move || {
            // Clear close-on-exec so the inherited listener survives the
            // exec into sleep.
            if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn().expect("failed to spawn port holder");
    drop(listener);
    (child, port)
}

/// Polls `cond` until it holds, panicking after five seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if cond() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting until {what}");
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Waits for a file to appear.
pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if path.exists() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {} to exist", path.display());
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Waits for a file to disappear.
pub fn wait_for_gone(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if !path.exists() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {} to be removed", path.display());
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Waits until `path` holds exactly `expected`, one entry per line.
pub fn wait_for_lines(path: &Path, expected: &[&str]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let lines = read_lines(path);
        if lines == expected {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "Timed out waiting for {} to contain {expected:?}; last saw {lines:?}",
                path.display()
            );
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// The non-empty trimmed lines of a file; empty when the file is missing.
pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|content| {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a PID still exists in the process table (zombies count).
pub fn is_process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
