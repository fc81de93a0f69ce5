use clap::CommandFactory;
use std::{
    error::Error,
    fs::OpenOptions,
    os::unix::io::IntoRawFd,
    path::Path,
    sync::{Mutex, atomic::Ordering},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use combiner::{
    cli::{Cli, Commands, parse_args},
    config::{EntryConfig, Registry, capture_env_snapshot},
    error::{PidFileError, RegistryError},
    ipc::CommandAction,
    network::StaticProbe,
    observer::Observer,
    runtime::{self, RuntimePaths},
    state::{EntrySnapshot, EntryStatus},
    supervisor::{Supervisor, SupervisorError},
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let data_dir = args.data_dir.as_deref().map(std::path::absolute).transpose()?;
    runtime::init(data_dir);
    let paths = runtime::paths();

    if args.daemon {
        return run_daemon(&args, paths);
    }

    init_logging(&args, None)?;
    match args.command {
        Some(command) => run_observer(command, Observer::new(paths)),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

fn init_logging(args: &Cli, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
    Ok(())
}

fn run_daemon(args: &Cli, paths: RuntimePaths) -> Result<(), Box<dyn Error>> {
    paths.ensure()?;
    let observer = Observer::new(paths.clone());
    if let Some(pid) = observer.daemon_pid() {
        init_logging(args, None)?;
        warn!("combiner daemon already running (PID {pid}); aborting duplicate start");
        return Ok(());
    }

    if args.detach {
        daemonize_combiner()?;
    }
    init_logging(args, Some(&paths.app_log_path()))?;

    let mut supervisor = Supervisor::new(paths, args.autostart)?;
    if args.no_network_wait {
        supervisor.set_network_probe(Box::new(StaticProbe(true)));
    }

    let shutdown = supervisor.shutdown_handle();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })?;

    match supervisor.run() {
        Ok(()) => {
            info!("combiner daemon exited cleanly");
            Ok(())
        }
        Err(SupervisorError::PidFile(PidFileError::AlreadyRunning(pid))) => {
            warn!("combiner daemon already running (PID {pid}); exiting");
            Ok(())
        }
        Err(SupervisorError::PidFile(PidFileError::Locked)) => {
            warn!("Another combiner daemon holds the lock; exiting");
            Ok(())
        }
        Err(err) => {
            error!("Supervisor exited with error: {err}");
            Err(err.into())
        }
    }
}

fn run_observer(command: Commands, observer: Observer) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Start { id, wait } => {
            send_entry_command(&observer, CommandAction::Start, &id, wait)
        }
        Commands::Stop { id, wait } => {
            send_entry_command(&observer, CommandAction::Stop, &id, wait)
        }
        Commands::Restart { id, wait } => {
            send_entry_command(&observer, CommandAction::Restart, &id, wait)
        }
        Commands::StartEnabled => send_global_command(&observer, CommandAction::StartEnabled),
        Commands::StopAll => send_global_command(&observer, CommandAction::StopAll),
        Commands::Reload => send_global_command(&observer, CommandAction::Reload),
        Commands::Status { json } => show_status(&observer, json),
        Commands::Logs { id, lines } => {
            for line in observer.logs().tail(&id, lines)? {
                println!("{line}");
            }
            Ok(())
        }
        Commands::ClearLog { id } => {
            observer.logs().clear(&id)?;
            info!("Cleared log for entry '{id}'");
            Ok(())
        }
        Commands::Add {
            name,
            cmd,
            cwd,
            args,
            enabled,
            no_autorestart,
            clear_log_on_start,
        } => {
            let mut registry = Registry::load(observer.paths().config_path())?;
            let mut entry = EntryConfig::new(name, cmd);
            entry.cwd = cwd;
            entry.args = args;
            entry.enabled = enabled;
            entry.autorestart = !no_autorestart;
            entry.clear_log_on_start = clear_log_on_start;

            let id = entry.id.clone();
            registry.add(entry)?;
            registry.maybe_update_env_snapshot(capture_env_snapshot());
            observer.paths().ensure()?;
            registry.save()?;
            println!("{id}");
            notify_reload(&observer)
        }
        Commands::Remove { id } => {
            let mut registry = Registry::load(observer.paths().config_path())?;
            let removed = registry.remove(&id, observer.last_known_status(&id))?;
            registry.save()?;
            if let Err(err) = observer.logs().remove(&id) {
                warn!("Failed to delete logs for entry '{id}': {err}");
            }
            info!("Removed entry '{}' ({})", removed.name, removed.id);
            notify_reload(&observer)
        }
    }
}

fn send_entry_command(
    observer: &Observer,
    action: CommandAction,
    id: &str,
    wait: bool,
) -> Result<(), Box<dyn Error>> {
    let registry = Registry::load(observer.paths().config_path())?;
    if registry.get(id).is_none() {
        return Err(RegistryError::NotFound(id.to_string()).into());
    }
    if !daemon_available(observer) {
        return Ok(());
    }

    if wait {
        let status = observer.send_and_wait(action, id, WAIT_TIMEOUT)?;
        println!("{id}: {status}");
    } else {
        observer.send_command(action, Some(id))?;
        info!("Sent '{action}' for entry '{id}'");
    }
    Ok(())
}

fn send_global_command(observer: &Observer, action: CommandAction) -> Result<(), Box<dyn Error>> {
    if daemon_available(observer) {
        observer.send_command(action, None)?;
        info!("Sent '{action}'");
    }
    Ok(())
}

fn notify_reload(observer: &Observer) -> Result<(), Box<dyn Error>> {
    if observer.is_daemon_running() {
        observer.send_command(CommandAction::Reload, None)?;
    }
    Ok(())
}

fn daemon_available(observer: &Observer) -> bool {
    if observer.is_daemon_running() {
        return true;
    }
    warn!("No running combiner daemon found; skipping command");
    false
}

fn show_status(observer: &Observer, json: bool) -> Result<(), Box<dyn Error>> {
    let registry = Registry::load(observer.paths().config_path())?;
    let daemon_pid = observer.daemon_pid();
    let fresh = observer.is_state_fresh();
    let snapshot = observer.snapshot().filter(|_| fresh);

    let entries: Vec<EntrySnapshot> = registry
        .entries()
        .iter()
        .map(|config| {
            snapshot
                .as_ref()
                .and_then(|snapshot| snapshot.entry(&config.id).cloned())
                .unwrap_or_else(|| EntrySnapshot {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    status: EntryStatus::Stopped,
                    os_pid: None,
                })
        })
        .collect();

    if json {
        let report = serde_json::json!({
            "daemon_pid": daemon_pid,
            "fresh": fresh,
            "updated_at": snapshot.as_ref().map(|snapshot| snapshot.updated_at),
            "entries": entries,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match daemon_pid {
        Some(pid) if fresh => println!("Daemon running (PID {pid})"),
        Some(pid) => println!("Daemon running (PID {pid}); state is stale"),
        None => println!("Daemon not running"),
    }
    if entries.is_empty() {
        println!("No entries registered");
        return Ok(());
    }

    let id_width = entries.iter().map(|entry| entry.id.len()).max().unwrap_or(2).max(2);
    let name_width = entries.iter().map(|entry| entry.name.len()).max().unwrap_or(4).max(4);
    println!("{:<id_width$}  {:<name_width$}  {:<8}  PID", "ID", "NAME", "STATUS");
    for entry in &entries {
        let pid = entry
            .os_pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<id_width$}  {:<name_width$}  {:<8}  {pid}",
            entry.id,
            entry.name,
            entry.status.to_string()
        );
    }
    Ok(())
}

fn daemonize_combiner() -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = std::fs::File::options()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}
