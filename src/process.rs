//! Owned child processes: spawning with a merged output pipe and bounded termination.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    collections::BTreeMap,
    io::{self, Read},
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::Sender,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    constants::{FORCE_KILL_REAP_WAIT, LOG_BUFFER_SIZE, STOP_POLL_INTERVAL},
    finder::ProcessFinder,
    launch::LaunchSpec,
};

/// A chunk of merged stdout/stderr from an owned child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOutput {
    pub id: String,
    pub text: String,
}

/// A process the supervisor spawned and is responsible for reaping.
#[derive(Debug)]
pub struct OwnedChild {
    child: Child,
    pid: u32,
}

impl OwnedChild {
    /// Spawns `spec` in its own process group with stdout and stderr merged into one pipe.
    ///
    /// An empty `env` inherits the caller's environment; otherwise the child sees exactly
    /// `env`. Output is forwarded to `sink` from a background thread.
    pub fn spawn(
        id: &str,
        spec: &LaunchSpec,
        cwd: &str,
        env: &BTreeMap<String, String>,
        sink: Sender<ChildOutput>,
    ) -> io::Result<Self> {
        let (reader, writer) = io::pipe()?;
        let writer_err = writer.try_clone()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_err);
        if !env.is_empty() {
            command.env_clear().envs(env);
        }
        if !cwd.is_empty() {
            command.current_dir(cwd);
        }

        unsafe {
            command.pre_exec(|| {
                // Own process group so the whole tree can be signalled at once.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        // The parent's copies of the write end must close, or the pump never sees EOF.
        drop(command);

        let pid = child.id();
        debug!("Entry '{id}' spawned with PID {pid}");

        let id = id.to_string();
        thread::Builder::new()
            .name(format!("output-{pid}"))
            .spawn(move || pump_output(reader, id, sink))?;

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// SIGTERM to the process group, then a forced kill of the whole tree once `grace` runs out.
    ///
    /// Returns the exit status when the child was reaped; `None` if it could not be reaped
    /// even after SIGKILL.
    pub fn terminate(
        &mut self,
        grace: Duration,
        finder: &mut ProcessFinder,
    ) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(Some(status));
        }

        self.signal_group(Signal::SIGTERM);
        if let Some(status) = self.wait_for(grace)? {
            debug!("PID {} exited after SIGTERM", self.pid);
            return Ok(Some(status));
        }

        warn!(
            "PID {} did not exit within {:?}; killing process tree",
            self.pid, grace
        );
        if let Err(err) = finder.kill_tree(self.pid) {
            warn!("Failed to kill process tree of {}: {err}", self.pid);
        }
        self.signal_group(Signal::SIGKILL);
        if let Err(err) = self.child.kill()
            && err.kind() != io::ErrorKind::InvalidInput
        {
            debug!("Direct kill of {} failed: {err}", self.pid);
        }
        self.wait_for(FORCE_KILL_REAP_WAIT)
    }

    fn wait_for(&mut self, limit: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    }

    fn signal_group(&self, sig: Signal) {
        let pgid = Pid::from_raw(self.pid as i32);
        match signal::killpg(pgid, sig) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                if let Err(err) = signal::kill(pgid, sig)
                    && err != Errno::ESRCH
                {
                    debug!("Failed to send {sig} to {}: {err}", self.pid);
                }
            }
            Err(err) => {
                debug!("Failed to send {sig} to group {}: {err}", self.pid);
                let _ = signal::kill(pgid, sig);
            }
        }
    }
}

/// Forwards child output until EOF, keeping multi-byte characters intact across reads.
fn pump_output(mut reader: impl Read, id: String, sink: Sender<ChildOutput>) {
    let mut buf = [0u8; LOG_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("Output pipe for entry '{id}' closed: {err}");
                break;
            }
        };
        pending.extend_from_slice(&buf[..read]);

        let text = match std::str::from_utf8(&pending) {
            Ok(text) => {
                let text = text.to_string();
                pending.clear();
                text
            }
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
                pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                text
            }
        };

        if !text.is_empty()
            && sink
                .send(ChildOutput {
                    id: id.clone(),
                    text,
                })
                .is_err()
        {
            return;
        }
    }

    if !pending.is_empty() {
        let _ = sink.send(ChildOutput {
            id,
            text: String::from_utf8_lossy(&pending).into_owned(),
        });
    }
}
