use std::{
    io,
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use log::{debug, info, warn};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill, killpg},
    unistd::Pid,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    spawn,
    time::timeout,
};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name} has no pid, it already exited")]
    NoPid { name: String },
    #[error("failed to signal {name}: {errno}")]
    Signal { name: String, errno: Errno },
    #[error("failed to wait for {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: io::Error,
    },
}

static CHILD_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// An owned child process whose output is forwarded to the log.
///
/// When spawned as a group leader every signal is delivered to the whole process group,
/// which also reaches helpers the child forked.
pub struct ManagedChild {
    name: String,
    child: Child,
    pid: Option<Pid>,
    process_group: bool,
    exit_status: Option<ExitStatus>,
}

impl ManagedChild {
    pub fn spawn(
        name: impl Into<String>,
        mut command: Command,
        process_group: bool,
    ) -> Result<Self, ProcessError> {
        let name = name.into();

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if process_group {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            name: name.clone(),
            source,
        })?;

        let id = CHILD_COUNTER.fetch_add(1, Ordering::Relaxed);
        let log_target = format!("{name} {id}");

        if let Some(stdout) = child.stdout.take() {
            forward_lines(log_target.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(log_target.clone(), stderr);
        }

        let pid = child.id().map(|pid| Pid::from_raw(pid as i32));
        info!("[Process]: started {log_target} with pid {pid:?}");

        Ok(Self {
            name,
            child,
            pid,
            process_group,
            exit_status: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        let pid = self.pid.ok_or_else(|| ProcessError::NoPid {
            name: self.name.clone(),
        })?;

        let result = if self.process_group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };

        match result {
            Ok(()) => Ok(()),
            // Nothing left to signal
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ProcessError::Signal {
                name: self.name.clone(),
                errno,
            }),
        }
    }

    /// Sends `signal` and waits up to `grace` for the process to exit before escalating to [Self::force_stop].
    pub async fn graceful_stop(
        &mut self,
        signal: Signal,
        grace: Duration,
    ) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        debug!("[Process]: sending {signal} to {}", self.name);
        self.signal(signal)?;

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);

                // The leader exiting doesn't mean the rest of its group did
                if self.process_group {
                    self.signal(Signal::SIGKILL)?;
                }

                Ok(status)
            }
            Ok(Err(source)) => Err(ProcessError::Wait {
                name: self.name.clone(),
                source,
            }),
            Err(_) => {
                warn!(
                    "[Process]: {} didn't exit within {grace:?} after {signal}, killing it",
                    self.name
                );
                self.force_stop()?;
                self.wait().await
            }
        }
    }

    pub fn force_stop(&mut self) -> Result<(), ProcessError> {
        if self.exit_status.is_some() && !self.process_group {
            return Ok(());
        }

        self.signal(Signal::SIGKILL)
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|source| ProcessError::Wait {
                name: self.name.clone(),
                source,
            })?;
        self.exit_status = Some(status);

        info!("[Process]: {} exited with {status}", self.name);

        Ok(status)
    }
}

fn forward_lines(log_target: String, read: impl AsyncRead + Send + Unpin + 'static) {
    spawn(async move {
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            info!("{log_target}: {line}");
        }
    });
}

/// Runs a short helper command to completion and reports whether it exited successfully.
pub async fn run_helper(program: &str, args: &[&str]) -> Result<bool, ProcessError> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|source| ProcessError::Spawn {
            name: program.to_string(),
            source,
        })?;

    Ok(status.success())
}
