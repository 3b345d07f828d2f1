// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Starting the card daemon and watching it exit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use cardagent_assuan::BoxedConnection;
use futures::future::BoxFuture;
use tokio::io::BufReader;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Result, ScdError};
use crate::pincache::PinCache;
use crate::transaction::Transaction;

/// How the daemon process ended.
#[derive(Debug)]
pub enum DaemonExit {
    Exited(i32),
    Signaled(i32),
    /// Waiting for the process failed; its fate is unknown.
    WaitFailed(std::io::Error),
}

/// A freshly launched daemon.
pub struct SpawnedDaemon {
    /// Pipe connection to the daemon, greeting not yet read
    pub connection: BoxedConnection,
    pub pid: u32,
    /// Resolves once the process has terminated. Dropping it early
    /// terminates the daemon.
    pub exit: BoxFuture<'static, DaemonExit>,
}

/// Launches the daemon and opens additional connections to it.
pub trait Launcher: Send + Sync {
    fn spawn<'a>(
        &'a self,
        program: &'a Path,
        args: &'a [String],
        detached: bool,
    ) -> BoxFuture<'a, std::io::Result<SpawnedDaemon>>;

    /// Connect to the daemon's additional socket. The greeting is not read.
    fn connect<'a>(&'a self, socket: &'a Path) -> BoxFuture<'a, std::io::Result<BoxedConnection>>;
}

/// Launches the daemon as a child process talking over its stdio.
///
/// Rust opens descriptors close-on-exec, so the child inherits only its
/// stdio; stderr is shared unless running detached. The child is killed
/// when its exit future is dropped before the process ended.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn spawn<'a>(
        &'a self,
        program: &'a Path,
        args: &'a [String],
        detached: bool,
    ) -> BoxFuture<'a, std::io::Result<SpawnedDaemon>> {
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args)
                .kill_on_drop(true)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(if detached {
                    Stdio::null()
                } else {
                    Stdio::inherit()
                });
            #[cfg(unix)]
            if let Some(name) = program.file_name() {
                cmd.arg0(name);
            }
            #[cfg(windows)]
            {
                const CREATE_NO_WINDOW: u32 = 0x0800_0000;
                cmd.creation_flags(CREATE_NO_WINDOW);
            }

            let mut child = cmd.spawn()?;
            let pid = child
                .id()
                .ok_or_else(|| std::io::Error::other("daemon exited during startup"))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| std::io::Error::other("daemon stdin not captured"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| std::io::Error::other("daemon stdout not captured"))?;

            let connection = BoxedConnection::boxed(BufReader::new(stdout), stdin).with_pid(pid);
            let exit = Box::pin(async move {
                match child.wait().await {
                    Ok(status) => exit_from_status(status),
                    Err(e) => DaemonExit::WaitFailed(e),
                }
            });
            Ok(SpawnedDaemon {
                connection,
                pid,
                exit,
            })
        })
    }

    fn connect<'a>(&'a self, socket: &'a Path) -> BoxFuture<'a, std::io::Result<BoxedConnection>> {
        Box::pin(async move {
            #[cfg(unix)]
            {
                let stream = tokio::net::UnixStream::connect(socket).await?;
                let (reader, writer) = stream.into_split();
                Ok(BoxedConnection::boxed(BufReader::new(reader), writer))
            }
            #[cfg(not(unix))]
            {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("cannot connect to {}", socket.display()),
                ))
            }
        })
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> DaemonExit {
    if let Some(code) = status.code() {
        return DaemonExit::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return DaemonExit::Signaled(signal);
        }
    }
    DaemonExit::Exited(-1)
}

/// Arguments passed to the daemon program.
pub fn daemon_args(config: &Config) -> Result<Vec<String>> {
    let mut args = vec!["--multi-server".to_string()];
    args.extend(config.homedir_args()?);
    Ok(args)
}

/// `OPTION` line asking the daemon to signal card events with SIGUSR2.
#[cfg(unix)]
fn event_signal_option() -> Option<String> {
    Some(format!(
        "OPTION event-signal={}",
        nix::sys::signal::Signal::SIGUSR2 as i32
    ))
}

#[cfg(not(unix))]
fn event_signal_option() -> Option<String> {
    None
}

/// A daemon that answered its greeting.
pub struct StartedDaemon {
    pub connection: BoxedConnection,
    pub pid: u32,
    /// Address for additional connections, when the daemon offers one
    pub socket_name: Option<PathBuf>,
    pub exit: BoxFuture<'static, DaemonExit>,
}

/// Launch the daemon and bring its primary connection up.
///
/// Every failure is reported as [`ScdError::NoScdaemon`].
pub async fn start(
    config: &Config,
    launcher: &dyn Launcher,
    cache: &dyn PinCache,
) -> Result<StartedDaemon> {
    if config.verbose {
        info!("no running SCdaemon - starting it");
    }

    // A new daemon knows nothing about PINs cached for the old one.
    cache.flush_pins();

    if let Err(e) = std::io::stdout().flush().and_then(|()| std::io::stderr().flush()) {
        error!("error flushing pending output: {e}");
        return Err(ScdError::no_scdaemon(format!("error flushing pending output: {e}")));
    }

    let args = daemon_args(config).map_err(|e| {
        error!("error building daemon arguments: {e}");
        ScdError::no_scdaemon(format!("error building daemon arguments: {e}"))
    })?;
    let program = &config.scdaemon_program;
    let SpawnedDaemon {
        mut connection,
        pid,
        exit,
    } = launcher
        .spawn(program, &args, config.running_detached)
        .await
        .map_err(|e| {
            error!("can't connect to the SCdaemon: {e}");
            ScdError::no_scdaemon(format!("can't start {}: {e}", program.display()))
        })?;

    if let Err(e) = connection.handshake().await {
        error!("can't connect to the SCdaemon: {e}");
        // nobody will watch this process
        drop(exit);
        return Err(ScdError::no_scdaemon(format!(
            "handshake with {} failed: {e}",
            program.display()
        )));
    }
    debug!("first connection to SCdaemon established (pid {pid})");

    let mut data = Vec::new();
    let result = Transaction::new("GETINFO socket_name")
        .on_data(&mut data)
        .run(&mut connection, cache)
        .await;
    let socket_name = match result {
        Ok(()) if !data.is_empty() => {
            let name = PathBuf::from(String::from_utf8_lossy(&data).into_owned());
            debug!("additional connections at '{}'", name.display());
            Some(name)
        }
        Ok(()) => None,
        Err(e) => {
            debug!("GETINFO socket_name failed: {e}");
            None
        }
    };

    if config.event_signal
        && let Some(option) = event_signal_option()
        && let Err(e) = Transaction::new(option).run(&mut connection, cache).await
    {
        debug!("daemon rejected event signal option: {e}");
    }

    Ok(StartedDaemon {
        connection,
        pid,
        socket_name,
        exit,
    })
}

/// Open an additional connection through the daemon's socket.
pub async fn connect_secondary(launcher: &dyn Launcher, socket: &Path) -> Result<BoxedConnection> {
    let mut connection = launcher.connect(socket).await.map_err(|e| {
        error!("can't connect to socket '{}': {e}", socket.display());
        ScdError::no_scdaemon(format!("can't connect to socket '{}': {e}", socket.display()))
    })?;
    connection.handshake().await.map_err(|e| {
        error!("can't connect to socket '{}': {e}", socket.display());
        ScdError::no_scdaemon(format!("handshake on '{}' failed: {e}", socket.display()))
    })?;
    Ok(connection)
}
