// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Scripted stand-in for the card daemon.
//!
//! Each fake daemon runs as a task on one end of an in-memory duplex
//! stream. It greets, then walks its script: `Expect` steps read one line
//! from the client and compare it, `Send` steps write a raw protocol line.
//! Once the script is exhausted every further command is answered with
//! `OK`. Everything the client wrote is kept in a transcript.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cardagent_assuan::BoxedConnection;
use cardagent_assuan::line::read_line;
use futures::future::BoxFuture;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;

use crate::supervisor::{DaemonExit, Launcher, SpawnedDaemon};

#[derive(Debug, Clone)]
pub enum Step {
    Expect(String),
    Send(String),
}

pub fn expect(line: impl Into<String>) -> Step {
    Step::Expect(line.into())
}

pub fn send(line: impl Into<String>) -> Step {
    Step::Send(line.into())
}

pub fn ok() -> Step {
    send("OK")
}

/// Startup exchange of a primary daemon offering `socket` for additional
/// connections.
pub fn startup(socket: Option<&str>) -> Vec<Step> {
    let mut steps = vec![expect("GETINFO socket_name")];
    if let Some(socket) = socket {
        steps.push(send(format!("D {socket}")));
    }
    steps.push(ok());
    steps
}

const GREETING: &str = "OK Pleased to meet you";

/// Lines the client sent to a fake daemon.
#[derive(Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, line: String) {
        self.0.lock().unwrap().push(line);
    }
}

async fn serve(stream: DuplexStream, greeting: String, script: Vec<Step>, transcript: Transcript) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    if writer.write_all(format!("{greeting}\n").as_bytes()).await.is_err() {
        return;
    }
    for step in script {
        match step {
            Step::Expect(expected) => {
                let Ok(Some(raw)) = read_line(&mut reader).await else {
                    panic!("client hung up, expected '{expected}'");
                };
                let line = String::from_utf8_lossy(&raw).into_owned();
                transcript.push(line.clone());
                assert_eq!(line, expected, "unexpected line from client");
            }
            Step::Send(line) => {
                if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    while let Ok(Some(raw)) = read_line(&mut reader).await {
        transcript.push(String::from_utf8_lossy(&raw).into_owned());
        if writer.write_all(b"OK\n").await.is_err() {
            return;
        }
    }
}

/// Start a fake daemon and return the client end of its connection.
pub fn connect(script: Vec<Step>) -> (BoxedConnection, Transcript) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let transcript = Transcript::default();
    tokio::spawn(serve(server, GREETING.to_string(), script, transcript.clone()));
    let (reader, writer) = tokio::io::split(client);
    (BoxedConnection::boxed(BufReader::new(reader), writer), transcript)
}

/// Handle on a daemon queued in a [`FakeLauncher`].
pub struct FakeDaemon {
    pub transcript: Transcript,
    exit: Option<oneshot::Sender<i32>>,
}

impl FakeDaemon {
    /// Let the daemon process exit with `code`.
    pub fn exit(&mut self, code: i32) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(code);
        }
    }
}

struct QueuedDaemon {
    greeting: String,
    script: Vec<Step>,
    transcript: Transcript,
    exit: oneshot::Receiver<i32>,
}

/// Launcher handing out scripted daemons in the order they were queued.
#[derive(Default)]
pub struct FakeLauncher {
    daemons: Mutex<VecDeque<QueuedDaemon>>,
    sockets: Mutex<VecDeque<(Vec<Step>, Transcript)>>,
    spawned: AtomicUsize,
    connected: Mutex<Vec<PathBuf>>,
    next_pid: AtomicUsize,
    killed: Arc<AtomicUsize>,
}

/// Counts the daemon as killed when dropped before the daemon exited,
/// mirroring the process launcher.
struct KillOnDrop {
    killed: Arc<AtomicUsize>,
    exited: bool,
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.exited {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicUsize::new(4000),
            ..Self::default()
        })
    }

    /// Queue a daemon for the next spawn. Its script starts after the
    /// greeting, so it should begin with [`startup`].
    pub fn queue_daemon(&self, script: Vec<Step>) -> FakeDaemon {
        self.queue_greeting(GREETING, script)
    }

    /// Queue a daemon that refuses the connection in its greeting.
    pub fn queue_refusing_daemon(&self) -> FakeDaemon {
        self.queue_greeting("ERR 100663404 Not ready", vec![])
    }

    fn queue_greeting(&self, greeting: &str, script: Vec<Step>) -> FakeDaemon {
        let (tx, rx) = oneshot::channel();
        let transcript = Transcript::default();
        self.daemons.lock().unwrap().push_back(QueuedDaemon {
            greeting: greeting.to_string(),
            script,
            transcript: transcript.clone(),
            exit: rx,
        });
        FakeDaemon {
            transcript,
            exit: Some(tx),
        }
    }

    /// Queue a script for the next connection through the daemon socket.
    pub fn queue_socket(&self, script: Vec<Step>) -> Transcript {
        let transcript = Transcript::default();
        self.sockets
            .lock()
            .unwrap()
            .push_back((script, transcript.clone()));
        transcript
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn connected_sockets(&self) -> Vec<PathBuf> {
        self.connected.lock().unwrap().clone()
    }

    /// Daemons whose exit handle was dropped while they were running.
    pub fn killed_count(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }
}

impl Launcher for Arc<FakeLauncher> {
    fn spawn<'a>(
        &'a self,
        _program: &'a Path,
        _args: &'a [String],
        _detached: bool,
    ) -> BoxFuture<'a, std::io::Result<SpawnedDaemon>> {
        Box::pin(async move {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let queued = self.daemons.lock().unwrap().pop_front();
            let Some(QueuedDaemon {
                greeting,
                script,
                transcript,
                exit,
            }) = queued
            else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no daemon program",
                ));
            };

            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve(server, greeting, script, transcript));
            let (reader, writer) = tokio::io::split(client);
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
            let mut guard = KillOnDrop {
                killed: self.killed.clone(),
                exited: false,
            };
            Ok(SpawnedDaemon {
                connection: BoxedConnection::boxed(BufReader::new(reader), writer).with_pid(pid),
                pid,
                exit: Box::pin(async move {
                    match exit.await {
                        Ok(code) => {
                            guard.exited = true;
                            DaemonExit::Exited(code)
                        }
                        Err(_) => futures::future::pending().await,
                    }
                }),
            })
        })
    }

    fn connect<'a>(&'a self, socket: &'a Path) -> BoxFuture<'a, std::io::Result<BoxedConnection>> {
        Box::pin(async move {
            self.connected.lock().unwrap().push(socket.to_path_buf());
            let queued = self.sockets.lock().unwrap().pop_front();
            let Some((script, transcript)) = queued else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "socket refused connection",
                ));
            };
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve(server, GREETING.to_string(), script, transcript));
            let (reader, writer) = tokio::io::split(client);
            Ok(BoxedConnection::boxed(BufReader::new(reader), writer))
        })
    }
}
