use std::{
    collections::{BTreeMap, HashSet},
    error::Error,
    process::ExitCode,
    sync::atomic::Ordering,
};

use tracing::error;
use tracing_subscriber::EnvFilter;

use stagehand::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    error::OrchestratorError,
    inspect::{self, ProcessState},
    orchestrator::{Orchestrator, RunState},
    ports::PortProbe,
    reaper::{ProcessReaper, ReclaimOutcome},
    runtime,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match dispatch(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn dispatch(command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Up { config } => run_stack(&config),
        Commands::Check { config } => check_stack(&config),
        Commands::Status => show_status(),
        Commands::FreePort { port, force } => free_port(port, force),
    }
}

/// Brings the stack up in the foreground. The first Ctrl-C requests an
/// orderly teardown; a second one force-exits.
fn run_stack(config_path: &str) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let mut orchestrator = Orchestrator::new(config)?;

    let flag = orchestrator.shutdown_flag();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            eprintln!("stagehand: forced exit");
            std::process::exit(130);
        }
        println!("stagehand: shutting down, press Ctrl-C again to force");
    })?;

    orchestrator.run()?;
    Ok(())
}

/// Validates the configuration and reports what `up` would do, touching
/// nothing.
fn check_stack(config_path: &str) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let order = config.validate()?;
    println!("Configuration OK: {} services", order.len());
    println!("Start order: {}", order.join(" -> "));

    let probe = PortProbe::new();
    let owned = HashSet::new();
    for name in &order {
        let Some(spec) = config.services.get(name) else {
            continue;
        };
        let desired = spec.port;
        if probe.is_free(desired) {
            println!("  {name}: port {desired} is free");
        } else {
            let binding = probe.find_owner(desired, &owned);
            let fallbacks = spec.candidate_ports().len() - 1;
            println!(
                "  {name}: port {desired} is held by {binding} ({fallbacks} fallback ports configured)"
            );
        }
    }
    Ok(())
}

/// Reports the last recorded run from the state file.
fn show_status() -> Result<(), Box<dyn Error>> {
    let path = runtime::state_file_path();
    let Some(state) = RunState::load(&path)? else {
        println!("No recorded run.");
        return Ok(());
    };

    let orchestrator_alive =
        matches!(inspect::process_state(state.pid), ProcessState::Running);
    println!(
        "Run recorded by pid {} (started {}): orchestrator {}",
        state.pid,
        state.started_at,
        if orchestrator_alive { "running" } else { "gone" }
    );

    let probe = PortProbe::new();
    let services: BTreeMap<_, _> = state.services.iter().collect();
    for (name, entry) in services {
        let process = match entry.pid {
            Some(pid) => match inspect::process_state(pid) {
                ProcessState::Running => format!("running (pid {pid})"),
                ProcessState::Zombie => format!("zombie (pid {pid})"),
                ProcessState::Missing => format!("dead (pid {pid})"),
            },
            None => "adopted".to_string(),
        };
        let port = if probe.is_free(entry.port) {
            format!("port {} is free", entry.port)
        } else {
            format!("port {} is in use", entry.port)
        };
        println!("  {name}: {process}, {port}");
    }
    Ok(())
}

/// Operator-invoked reclamation of a single port.
fn free_port(port: u16, force: bool) -> Result<(), Box<dyn Error>> {
    let reaper = ProcessReaper::new(PortProbe::new());
    match reaper.free_port(port, force, &HashSet::new()) {
        ReclaimOutcome::Freed => {
            println!("Port {port} is free");
            Ok(())
        }
        ReclaimOutcome::StillHeld(holder) => {
            Err(OrchestratorError::ReclamationFailure { port, holder }.into())
        }
    }
}
