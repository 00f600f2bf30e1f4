// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! SSH transport.
//!
//! One authenticated master session per minion, opened lazily at login over
//! OpenSSH connection sharing. Every remote command is a fresh `ssh`
//! invocation against the shared control socket, which gives it its own
//! channel while reusing the authenticated connection. Host keys are
//! accepted on first use. Key-agent authentication is the default; when a
//! password is configured it travels to `sshpass` through the `SSHPASS`
//! environment variable, never on a command line.

use crate::{config::SshEndpoint, Error, Result};

use async_trait::async_trait;
use std::{
    path::PathBuf,
    process::Stdio,
    time::Duration,
};
use tokio::{io::AsyncWriteExt, process::Command, sync::Mutex};
use tracing::{debug, info};

/// Both streams and the exit status of one finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Exit status, `-1` when the process died to a signal.
    pub status: i32,
}

impl ShellOutput {
    /// Whether the remote command exited zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into a remote-tool error carrying both streams.
    ///
    /// # Errors
    ///
    /// - Return [`Error::RemoteTool`] when the exit status is non-zero.
    pub fn expect_success(self, program: &str) -> Result<Self> {
        if !self.success() {
            return Err(Error::RemoteTool {
                program: program.into(),
                message: self.labeled(),
            });
        }

        Ok(self)
    }

    /// Combined "stdout: .. stderr: .." labeling of both streams.
    pub fn labeled(&self) -> String {
        let mut message = String::new();
        if !self.stdout.is_empty() {
            message.push_str(&format!("stdout: {}", self.stdout));
        }
        if !self.stderr.is_empty() {
            message.push_str(&format!("stderr: {}", self.stderr));
        }

        message
    }
}

/// Remote command transport owned by one minion.
///
/// The seam keeps the minion testable: production runs [`SshSession`],
/// tests run a scripted shell.
#[async_trait]
pub trait RemoteShell: Send + Sync + 'static {
    /// Open the session. Must be idempotent under repeated calls.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Transport`] if the session cannot be established.
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<()>;

    /// Run one remote command on a fresh channel and collect both streams.
    ///
    /// A non-zero remote exit is not an error at this layer; callers decide
    /// what a given tool's exit means.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Transport`] if no session is open or the channel
    ///   cannot be spawned.
    /// - Return [`Error::Timeout`] if the configured deadline elapses; the
    ///   channel is closed.
    async fn exec(&self, command: &str) -> Result<ShellOutput>;

    /// Like [`RemoteShell::exec`], feeding `stdin` to the remote command.
    ///
    /// # Errors
    ///
    /// - Same as [`RemoteShell::exec`].
    async fn exec_with_stdin(&self, command: &str, stdin: &[u8]) -> Result<ShellOutput>;

    /// Tear the session down. A no-op when nothing is open.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Transport`] if the control channel refuses the
    ///   exit request.
    async fn disconnect(&self) -> Result<()>;
}

struct MasterSession {
    endpoint: SshEndpoint,
    control_path: PathBuf,
    master: tokio::process::Child,
}

/// Production [`RemoteShell`] backed by OpenSSH connection sharing.
pub struct SshSession {
    inner: Mutex<Option<MasterSession>>,
    deadline: Option<Duration>,
}

impl SshSession {
    /// Construct an unconnected session with an optional per-operation
    /// deadline.
    pub fn new(deadline: Option<Duration>) -> Self {
        Self { inner: Mutex::new(None), deadline }
    }

    fn base_args(endpoint: &SshEndpoint, control_path: &PathBuf) -> Vec<String> {
        let mut args = vec![
            "-S".into(),
            control_path.to_string_lossy().into_owned(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
        ];
        if endpoint.password.is_none() {
            args.push("-o".into());
            args.push("BatchMode=yes".into());
        }
        if let Some(port) = endpoint.port {
            args.push("-p".into());
            args.push(port.to_string());
        }

        args
    }

    fn channel_command(session: &MasterSession, remote: &str) -> Command {
        let endpoint = &session.endpoint;
        let mut args = Self::base_args(endpoint, &session.control_path);
        args.push(session.endpoint.destination());
        args.push("--".into());
        args.push(remote.into());

        let mut command = match &endpoint.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg("ssh").env("SSHPASS", password);
                command
            }
            None => Command::new("ssh"),
        };
        command.args(args).kill_on_drop(true);

        command
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<ShellOutput> {
        let guard = self.inner.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        let mut channel = Self::channel_command(session, command);
        debug!("Remote exec on {}: {command}", session.endpoint.host);
        drop(guard);

        let work = async move {
            let mut child = channel
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|error| Error::Transport(format!("cannot spawn ssh: {error}")))?;

            if let Some(bytes) = stdin {
                let mut handle = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Transport("ssh stdin unavailable".into()))?;
                handle
                    .write_all(bytes)
                    .await
                    .map_err(|error| Error::Transport(format!("write to ssh failed: {error}")))?;
                drop(handle);
            } else {
                drop(child.stdin.take());
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|error| Error::Transport(format!("ssh wait failed: {error}")))?;

            Ok(ShellOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                status: output.status.code().unwrap_or(-1),
            })
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, work)
                .await
                .map_err(|_| Error::Timeout(deadline))?,
            None => work.await,
        }
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            debug!("Already connected to {}", endpoint.host);
            return Ok(());
        }

        let control_path = std::env::temp_dir()
            .join(format!("expd-{}-{}.ctl", std::process::id(), endpoint.host));

        info!("Connecting to {} as {}", endpoint.host, endpoint.username);
        let mut args = Self::base_args(endpoint, &control_path);
        args.insert(0, "-M".into());
        args.insert(1, "-N".into());
        args.push(endpoint.destination());

        let mut command = match &endpoint.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg("ssh").env("SSHPASS", password);
                command
            }
            None => Command::new("ssh"),
        };
        let master = command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| Error::Transport(format!("cannot spawn ssh master: {error}")))?;

        let session = MasterSession { endpoint: endpoint.clone(), control_path, master };

        // The master authenticates in the background; wait until the control
        // socket answers before declaring the session open.
        for _ in 0..50 {
            let control = session.control_path.to_string_lossy();
            let check = Command::new("ssh")
                .args(["-S", control.as_ref(), "-O", "check"])
                .arg(session.endpoint.destination())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|error| Error::Transport(format!("cannot check ssh master: {error}")))?;
            if check.success() {
                info!("Connected to {}", endpoint.host);
                *guard = Some(session);
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Err(Error::Transport(format!("ssh master to {} never came up", endpoint.host)))
    }

    async fn exec(&self, command: &str) -> Result<ShellOutput> {
        self.run(command, None).await
    }

    async fn exec_with_stdin(&self, command: &str, stdin: &[u8]) -> Result<ShellOutput> {
        self.run(command, Some(stdin)).await
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(mut session) = guard.take() else {
            return Ok(());
        };

        let control = session.control_path.to_string_lossy().into_owned();
        let _ = Command::new("ssh")
            .args(["-S", control.as_str(), "-O", "exit"])
            .arg(session.endpoint.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let _ = session.master.kill().await;
        let _ = std::fs::remove_file(&session.control_path);
        info!("Disconnected from {}", session.endpoint.host);

        Ok(())
    }
}
