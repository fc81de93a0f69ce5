use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::Registry,
    constants::{
        AUTOSTART_INITIAL_DELAY, COMMAND_POLL_INTERVAL, HOUSEKEEPING_INTERVAL, LOOP_IDLE_WAIT,
        STALE_COMMAND_SLACK, STATE_PUBLISH_INTERVAL,
    },
    daemon::Daemon,
    error::PidFileError,
    finder::ProcessFinder,
    ipc::{Command, CommandAction, CommandChannel, DaemonPidFile},
    logs::LogStore,
    network::{NetworkProbe, RouteProbe},
    runtime::RuntimePaths,
    state::StatePublisher,
};

/// Errors emitted by the resident supervisor runtime.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Long-lived loop that owns the daemon, drains the command mailbox and publishes state.
pub struct Supervisor {
    paths: RuntimePaths,
    daemon: Daemon,
    channel: CommandChannel,
    publisher: StatePublisher,
    started_at: DateTime<Utc>,
    autostart: bool,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    /// Builds a supervisor over the OS process table and the default network probe.
    ///
    /// An unreadable registry is logged and treated as empty; it is never rewritten here.
    pub fn new(paths: RuntimePaths, autostart: bool) -> Result<Self, SupervisorError> {
        paths.ensure()?;
        let registry = match Registry::load(paths.config_path()) {
            Ok(registry) => registry,
            Err(err) => {
                warn!("Failed to load registry {}: {err}", paths.config_path().display());
                Registry::empty(paths.config_path())
            }
        };
        let env_snapshot = registry.env_snapshot().clone();

        let mut daemon = Daemon::new(
            registry.into_entries(),
            LogStore::new(paths.logs_dir()),
            ProcessFinder::system(),
            Box::new(RouteProbe::default()),
        );
        daemon.set_env_snapshot(env_snapshot);
        Ok(Self::with_daemon(paths, daemon, autostart))
    }

    /// Wraps an already built daemon.
    pub fn with_daemon(paths: RuntimePaths, daemon: Daemon, autostart: bool) -> Self {
        Self {
            channel: CommandChannel::new(paths.commands_dir()),
            publisher: StatePublisher::new(paths.state_path()),
            paths,
            daemon,
            started_at: Utc::now(),
            autostart,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the network readiness probe used by autostart.
    pub fn set_network_probe(&mut self, probe: Box<dyn NetworkProbe>) {
        self.daemon.set_network_probe(probe);
    }

    /// Flag that ends [`Supervisor::run`] once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    /// Runs until the shutdown flag is raised, then stops every entry.
    ///
    /// Fails with [`PidFileError::AlreadyRunning`] when another live daemon owns the
    /// data directory.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        self.paths.ensure()?;
        let pid_file = DaemonPidFile::acquire(&self.paths.pid_path(), &self.paths.lock_path())?;
        self.started_at = Utc::now();
        info!(
            "Supervisor started (PID {}) in {}",
            std::process::id(),
            self.paths.data_dir().display()
        );

        match self.channel.sweep_stale(self.started_at, STALE_COMMAND_SLACK) {
            Ok(0) => {}
            Ok(removed) => info!("Discarded {removed} stale command files"),
            Err(err) => warn!("Failed to sweep command directory: {err}"),
        }
        self.publish();

        let mut autostart_at = self
            .autostart
            .then(|| Instant::now() + AUTOSTART_INITIAL_DELAY);
        let mut next_poll = Instant::now();
        let mut next_publish = Instant::now() + STATE_PUBLISH_INTERVAL;
        let mut next_housekeeping = Instant::now() + HOUSEKEEPING_INTERVAL;

        while !self.shutdown.load(Ordering::SeqCst) {
            self.daemon.run_once(LOOP_IDLE_WAIT);
            let now = Instant::now();

            if let Some(at) = autostart_at
                && now >= at
            {
                autostart_at = None;
                self.daemon.autostart();
            }

            if now >= next_poll {
                self.poll_commands();
                next_poll = now + COMMAND_POLL_INTERVAL;
            }

            if now >= next_housekeeping {
                self.daemon.housekeeping();
                next_housekeeping = now + HOUSEKEEPING_INTERVAL;
            }

            if self.daemon.take_dirty() || now >= next_publish {
                self.publish();
                next_publish = now + STATE_PUBLISH_INTERVAL;
            }
        }

        info!("Supervisor shutting down");
        self.daemon.shutdown();
        self.publish();
        pid_file.release();
        Ok(())
    }

    /// Drains the mailbox, attempting each command once and deleting it afterwards.
    pub fn poll_commands(&mut self) {
        let pending = match self.channel.drain(self.started_at, STALE_COMMAND_SLACK) {
            Ok(pending) => pending,
            Err(err) => {
                warn!("Failed to read command directory: {err}");
                return;
            }
        };

        for item in pending {
            self.handle_command(&item.command);
            self.channel.complete(&item);
            if self.daemon.take_dirty() {
                self.publish();
            }
        }
    }

    fn handle_command(&mut self, command: &Command) {
        info!(
            "Received '{}' command {} for {}",
            command.action,
            command.id,
            command.target.as_deref().unwrap_or("all entries")
        );

        let target = command.target.as_deref().filter(|target| !target.is_empty());
        match (command.action, target) {
            (CommandAction::Start, Some(id)) => self.daemon.start_entry(id),
            (CommandAction::Stop, Some(id)) => self.daemon.stop_entry(id),
            (CommandAction::Restart, Some(id)) => self.daemon.restart_entry(id),
            (CommandAction::StartEnabled, _) => self.daemon.start_enabled(),
            (CommandAction::StopAll, _) => self.daemon.stop_all(),
            (CommandAction::Reload, _) => {
                if let Err(err) = self.daemon.reload(&self.paths.config_path()) {
                    warn!("Reload failed: {err}");
                }
            }
            (action, None) => {
                warn!("Ignoring '{action}' command {} without a target", command.id);
            }
        }
    }

    fn publish(&mut self) {
        let snapshot = self.daemon.snapshot();
        if let Err(err) = self.publisher.publish(&snapshot) {
            warn!("Failed to publish state: {err}");
        } else {
            debug!("State published at {}", snapshot.updated_at);
        }
    }
}
