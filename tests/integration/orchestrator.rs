#[path = "common/mod.rs"]
mod common;

use std::{
    io,
    net::{TcpListener, TcpStream},
    process::Command as StdCommand,
    sync::{Arc, atomic::Ordering},
    thread,
    time::Duration,
};

use common::{
    StateDirGuard, free_port, held_port, is_process_alive, read_lines, wait_for_lines,
    wait_for_path, wait_until, write_config,
};
use stagehand::{
    config::load_config,
    inspect::ProcessInspector,
    orchestrator::{Orchestrator, OrchestratorState, RunState},
    runtime,
};
use tempfile::tempdir;

/// Inspector that reports one fixed PID as the owner of every port; the
/// signals the reaper sends under it are real.
struct PinnedOwner(u32);

impl ProcessInspector for PinnedOwner {
    fn owner_of(&self, _port: u16) -> io::Result<Option<u32>> {
        Ok(Some(self.0))
    }

    fn kill_by_port(&self, _port: u16) -> bool {
        false
    }

    fn toggle_port_exclusion(&self, _port: u16) -> bool {
        false
    }
}

/// Inspector that blames every port on the test process itself, which the
/// reaper refuses to touch.
struct SelfOwner;

impl ProcessInspector for SelfOwner {
    fn owner_of(&self, _port: u16) -> io::Result<Option<u32>> {
        Ok(Some(std::process::id()))
    }

    fn kill_by_port(&self, _port: u16) -> bool {
        false
    }

    fn toggle_port_exclusion(&self, _port: u16) -> bool {
        false
    }
}

fn reaped_pid() -> u32 {
    let mut child = StdCommand::new("true").spawn().expect("failed to spawn");
    let pid = child.id();
    child.wait().expect("failed to reap");
    pid
}

#[test]
fn stack_starts_in_order_behind_gates_and_stops_in_reverse() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let starts = dir.join("starts.log");
    let stops = dir.join("stops.log");
    let backend_gate = free_port();
    let api_gate = free_port();
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  backend:
    command: "trap 'echo backend >> {stops}; exit 0' TERM; echo backend >> {starts}; while :; do sleep 1; done"
    port: {backend_port}
    health_check:
      tcp: "127.0.0.1:{backend_gate}"
      interval: "200ms"
    startup_timeout: "15s"
  api:
    command: "trap 'echo api >> {stops}; exit 0' TERM; echo api >> {starts}; while :; do sleep 1; done"
    port: {api_port}
    depends_on: ["backend"]
    health_check:
      tcp: "127.0.0.1:{api_gate}"
      interval: "200ms"
    startup_timeout: "15s"
  ui:
    command: "trap 'echo ui >> {stops}; exit 0' TERM; echo ui >> {starts}; while :; do sleep 1; done"
    port: {ui_port}
    depends_on: ["api"]
"#,
            stops = stops.display(),
            starts = starts.display(),
            backend_port = free_port(),
            api_port = free_port(),
            ui_port = free_port(),
        ),
    );

    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");
    let starter = thread::spawn(move || {
        let mut orchestrator = orchestrator;
        let outcome = orchestrator.initialize();
        (orchestrator, outcome)
    });

    // Only backend may start until its gate passes.
    wait_for_lines(&starts, &["backend"]);
    thread::sleep(Duration::from_millis(800));
    assert_eq!(
        read_lines(&starts),
        vec!["backend"],
        "api must not start while backend is unhealthy"
    );

    let _backend_ready = TcpListener::bind(("127.0.0.1", backend_gate))
        .expect("failed to bind backend gate");
    wait_for_lines(&starts, &["backend", "api"]);
    thread::sleep(Duration::from_millis(800));
    assert_eq!(
        read_lines(&starts),
        vec!["backend", "api"],
        "ui must not start while api is unhealthy"
    );

    let _api_ready =
        TcpListener::bind(("127.0.0.1", api_gate)).expect("failed to bind api gate");
    let (mut orchestrator, outcome) = starter.join().expect("starter thread panicked");
    assert!(outcome.expect("startup failed"), "stack must reach ready");
    assert_eq!(orchestrator.state(), OrchestratorState::Ready);
    wait_for_lines(&starts, &["backend", "api", "ui"]);
    assert!(runtime::state_file_path().exists());

    orchestrator.cleanup().expect("cleanup failed");
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(
        read_lines(&stops),
        vec!["ui", "api", "backend"],
        "teardown must walk the stack in reverse"
    );
    assert!(!runtime::state_file_path().exists());
}

#[test]
fn occupied_port_is_reclaimed_before_falling_back() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let (listener, port) = held_port();
    let fallback = free_port();
    let mut holder = StdCommand::new("sh")
        .arg("-c")
        .arg("trap '' TERM; while :; do sleep 1; done")
        .spawn()
        .expect("failed to spawn holder");
    let holder_pid = holder.id();
    let watcher = thread::spawn(move || {
        let _ = holder.wait();
        drop(listener);
    });

    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  web:
    command: "while :; do sleep 1; done"
    port: {port}
    fallback_ports: [{fallback}]
"#
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::with_inspector(config, Arc::new(PinnedOwner(holder_pid)))
        .expect("failed to build orchestrator");

    assert!(orchestrator.initialize().expect("startup failed"));
    assert_eq!(
        orchestrator.bound_port("web"),
        Some(port),
        "the desired port must be reclaimed, not skipped for the fallback"
    );
    watcher.join().expect("watcher thread panicked");
    assert!(!is_process_alive(holder_pid), "the holder must be gone");

    orchestrator.cleanup().expect("cleanup failed");
}

#[test]
fn resolution_falls_back_when_the_desired_port_is_self_held() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let (_listener, port) = held_port();
    let fallback = free_port();
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  web:
    command: "while :; do sleep 1; done"
    port: {port}
    fallback_ports: [{fallback}]
"#
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::with_inspector(config, Arc::new(SelfOwner))
        .expect("failed to build orchestrator");

    assert!(orchestrator.initialize().expect("startup failed"));
    assert_eq!(orchestrator.bound_port("web"), Some(fallback));
    orchestrator.cleanup().expect("cleanup failed");
}

#[test]
fn resolved_fallback_port_flows_into_the_dependents_env() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    // backend's desired port is self-held, so it lands on the fallback; the
    // dependent must be told about the port backend actually got.
    let (_listener, desired) = held_port();
    let fallback = free_port();
    let addr_file = dir.join("addr.txt");
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  backend:
    command: "while :; do sleep 1; done"
    port: {desired}
    fallback_ports: [{fallback}]
  api:
    command: "echo \"$BACKEND_URL\" > {addr_file}; while :; do sleep 1; done"
    port: {api_port}
    depends_on: ["backend"]
    env:
      vars:
        BACKEND_URL: "http://${{backend_HOST}}:${{backend_PORT}}"
"#,
            addr_file = addr_file.display(),
            api_port = free_port(),
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::with_inspector(config, Arc::new(SelfOwner))
        .expect("failed to build orchestrator");

    assert!(orchestrator.initialize().expect("startup failed"));
    assert_eq!(orchestrator.bound_port("backend"), Some(fallback));
    wait_for_path(&addr_file);
    let addr = std::fs::read_to_string(&addr_file).expect("failed to read addr file");
    assert_eq!(
        addr.trim(),
        format!("http://127.0.0.1:{fallback}"),
        "the dependent must see the fallback binding, not the desired port"
    );
    orchestrator.cleanup().expect("cleanup failed");
}

#[test]
fn resolution_never_promises_the_same_port_twice() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    // Both services declare the same free port. All ports resolve before
    // anything spawns, so the bind check alone cannot keep them apart.
    let (shared_probe, shared) = held_port();
    let (fallback_probe, fallback) = held_port();
    drop(shared_probe);
    drop(fallback_probe);
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  alpha:
    command: "while :; do sleep 1; done"
    port: {shared}
  beta:
    command: "while :; do sleep 1; done"
    port: {shared}
    fallback_ports: [{fallback}]
"#
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::with_inspector(config, Arc::new(SelfOwner))
        .expect("failed to build orchestrator");

    assert!(orchestrator.initialize().expect("startup failed"));
    assert_eq!(orchestrator.bound_port("alpha"), Some(shared));
    assert_eq!(
        orchestrator.bound_port("beta"),
        Some(fallback),
        "beta must fall back rather than share alpha's port"
    );
    orchestrator.cleanup().expect("cleanup failed");
}

#[test]
fn startup_fails_when_no_candidate_can_be_secured() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let (_l0, p0) = held_port();
    let (_l1, p1) = held_port();
    let (_l2, p2) = held_port();
    let (_l3, p3) = held_port();
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  web:
    command: "while :; do sleep 1; done"
    port: {p0}
    fallback_ports: [{p1}, {p2}, {p3}]
"#
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::with_inspector(config, Arc::new(SelfOwner))
        .expect("failed to build orchestrator");

    let err = orchestrator.initialize().expect_err("startup must fail");
    let message = err.to_string();
    for port in [p0, p1, p2, p3] {
        assert!(
            message.contains(&port.to_string()),
            "error must name every exhausted candidate: {message}"
        );
    }
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(orchestrator.bound_port("web"), None);
}

#[test]
fn healthy_occupant_is_adopted_and_left_untouched() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let (_listener, port) = held_port();
    let spawned = dir.join("spawned.txt");
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  web:
    command: "touch {spawned}; while :; do sleep 1; done"
    port: {port}
    health_check:
      tcp: "127.0.0.1:${{PORT}}"
"#,
            spawned = spawned.display(),
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");

    assert!(orchestrator.initialize().expect("startup failed"));
    assert_eq!(orchestrator.bound_port("web"), Some(port));
    assert!(
        !spawned.exists(),
        "an adopted service must not be spawned again"
    );

    let state = RunState::load(&runtime::state_file_path())
        .expect("failed to read run state")
        .expect("run state must exist while ready");
    assert_eq!(state.services["web"].pid, None, "adopted entries carry no pid");
    assert_eq!(state.services["web"].port, port);

    orchestrator.cleanup().expect("cleanup failed");
    assert!(
        TcpStream::connect(("127.0.0.1", port)).is_ok(),
        "cleanup must leave the adopted instance running"
    );
}

#[test]
fn service_death_during_the_gate_reports_its_stderr() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let gate = free_port();
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  crasher:
    command: "echo boom >&2; sleep 0.2; exit 3"
    port: {port}
    health_check:
      tcp: "127.0.0.1:{gate}"
      interval: "200ms"
    startup_timeout: "10s"
"#,
            port = free_port(),
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");

    let err = orchestrator.initialize().expect_err("startup must fail");
    let message = err.to_string();
    assert!(message.contains("crasher"), "unexpected error: {message}");
    assert!(
        message.contains("boom"),
        "the error must carry the service's stderr: {message}"
    );
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
}

#[test]
fn gate_timeout_fails_and_tears_down_the_stack() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let gate = free_port();
    let pid_file = dir.join("service.pid");
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  slow:
    command: "echo $$ > {pid_file}; while :; do sleep 1; done"
    port: {port}
    health_check:
      tcp: "127.0.0.1:{gate}"
      interval: "500ms"
    startup_timeout: "2s"
"#,
            pid_file = pid_file.display(),
            port = free_port(),
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");

    let err = orchestrator.initialize().expect_err("startup must fail");
    let message = err.to_string();
    assert!(message.contains("slow"), "unexpected error: {message}");
    assert!(message.contains("2s"), "unexpected error: {message}");
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);

    wait_for_path(&pid_file);
    let pid: u32 = std::fs::read_to_string(&pid_file)
        .expect("failed to read pid file")
        .trim()
        .parse()
        .expect("pid file did not hold a pid");
    wait_until("the timed-out service is terminated", || {
        !is_process_alive(pid)
    });
    assert!(!runtime::state_file_path().exists());
}

#[test]
fn midstartup_shutdown_unwinds_the_partial_stack() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let _state = StateDirGuard::set(&dir.join("state"));

    let stops = dir.join("stops.log");
    let a_marker = dir.join("a.marker");
    let b_marker = dir.join("b.marker");
    let c_marker = dir.join("c.marker");
    let gate = free_port();
    let config_path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  a:
    command: "trap 'echo a >> {stops}; exit 0' TERM; touch {a_marker}; while :; do sleep 1; done"
    port: {pa}
  b:
    command: "trap 'echo b >> {stops}; exit 0' TERM; touch {b_marker}; while :; do sleep 1; done"
    port: {pb}
    depends_on: ["a"]
    health_check:
      tcp: "127.0.0.1:{gate}"
      interval: "200ms"
    startup_timeout: "20s"
  c:
    command: "touch {c_marker}; while :; do sleep 1; done"
    port: {pc}
    depends_on: ["b"]
"#,
            stops = stops.display(),
            a_marker = a_marker.display(),
            b_marker = b_marker.display(),
            c_marker = c_marker.display(),
            pa = free_port(),
            pb = free_port(),
            pc = free_port(),
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");
    let shutdown = orchestrator.shutdown_flag();

    let starter = thread::spawn(move || {
        let mut orchestrator = orchestrator;
        let outcome = orchestrator.initialize();
        (orchestrator, outcome)
    });

    // a is up, b sits in its gate; request shutdown mid-startup.
    wait_for_path(&a_marker);
    wait_for_path(&b_marker);
    shutdown.store(true, Ordering::SeqCst);

    let (orchestrator, outcome) = starter.join().expect("starter thread panicked");
    assert!(
        !outcome.expect("interrupted startup is not an error"),
        "initialize must report the stack never reached ready"
    );
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert!(!c_marker.exists(), "c must never start");
    assert_eq!(
        read_lines(&stops),
        vec!["b", "a"],
        "the partial stack must stop in reverse"
    );
    assert!(!runtime::state_file_path().exists());
}

#[test]
fn stale_run_state_is_swept_on_startup() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let state_dir = dir.join("state");
    std::fs::create_dir_all(&state_dir).expect("failed to create state dir");
    let _state = StateDirGuard::set(&state_dir);

    let stale = RunState {
        pid: reaped_pid(),
        started_at: chrono::Utc::now(),
        services: [(
            "ghost".to_string(),
            stagehand::orchestrator::RunServiceEntry {
                pid: Some(reaped_pid()),
                port: free_port(),
            },
        )]
        .into(),
    };
    let path = runtime::state_file_path();
    drop(stale.save(&path).expect("failed to write stale state"));

    let config_path = write_config(dir, "version: \"1\"\nservices: {}\n");
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");

    assert!(orchestrator.initialize().expect("startup failed"));
    let current = RunState::load(&path)
        .expect("failed to read run state")
        .expect("run state must exist while ready");
    assert_eq!(
        current.pid,
        std::process::id(),
        "the stale record must be replaced by this run's"
    );

    orchestrator.cleanup().expect("cleanup failed");
    assert!(!path.exists());
}

#[test]
fn active_run_is_refused() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let state_dir = dir.join("state");
    std::fs::create_dir_all(&state_dir).expect("failed to create state dir");
    let _state = StateDirGuard::set(&state_dir);

    let mut sleeper = StdCommand::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleeper");
    let live = RunState {
        pid: sleeper.id(),
        started_at: chrono::Utc::now(),
        services: Default::default(),
    };
    let path = runtime::state_file_path();
    drop(live.save(&path).expect("failed to write state"));

    let config_path = write_config(dir, "version: \"1\"\nservices: {}\n");
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");

    let err = orchestrator.initialize().expect_err("startup must refuse");
    assert!(
        err.to_string().contains(&sleeper.id().to_string()),
        "the error must name the live pid: {err}"
    );
    assert!(path.exists(), "a live run's record must not be removed");

    sleeper.kill().expect("failed to kill sleeper");
    sleeper.wait().expect("failed to reap sleeper");
}

#[test]
fn corrupt_state_file_is_replaced() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let state_dir = dir.join("state");
    std::fs::create_dir_all(&state_dir).expect("failed to create state dir");
    let _state = StateDirGuard::set(&state_dir);

    let path = runtime::state_file_path();
    std::fs::write(&path, "not json at all").expect("failed to write garbage");

    let config_path = write_config(dir, "version: \"1\"\nservices: {}\n");
    let config = load_config(Some(config_path.to_str().unwrap())).expect("failed to load config");
    let mut orchestrator = Orchestrator::new(config).expect("failed to build orchestrator");

    assert!(orchestrator.initialize().expect("startup failed"));
    let current = RunState::load(&path)
        .expect("failed to read run state")
        .expect("run state must exist while ready");
    assert_eq!(current.pid, std::process::id());

    orchestrator.cleanup().expect("cleanup failed");
}
