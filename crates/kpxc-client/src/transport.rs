//! `keepassxc-proxy` child process and the encrypted channel running over its
//! stdio.
//!
//! The transport is driven by [`Transport::next_event`]: each call moves bytes
//! between the pipes and the frame buffers until something worth reporting
//! happens. All awaits in there are cancel safe, so the call can sit in a
//! `tokio::select!` next to other work without losing data.
//!
//! Disconnecting is a ladder. Each rung is taken by one call to
//! [`Transport::disconnect`], and the next call is scheduled after the
//! configured timeout in case the process is still around:
//!
//! 1. Connected: close stdin so the proxy exits on EOF.
//! 2. Connecting or after EOF: SIGTERM.
//! 3. Kill.
//! 4. Clean up and report `Disconnected`.
//!
//! The process exiting on its own at any point short-circuits to cleanup.

use std::collections::VecDeque;
use std::future::pending;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::BytesMut;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::{Inbound, SecureChannel};
use crate::codec::FrameDecoder;
use crate::config::ClientConfig;
use crate::crypto::CryptoInit;
use crate::error::ClientError;
use crate::secure_memory::{MemoryState, SecureBuffer};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Locked,
    Unlocked,
    Message { action: String, message: Map<String, Value> },
    Failed { action: String, error: ClientError },
    Error(ClientError),
}

/// Operations the session needs from whatever carries its messages.
pub trait Link {
    fn connect(&mut self, program: &str) -> Result<(), ClientError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn is_connecting(&self) -> bool;
    /// Failures are reported as [`TransportEvent::Failed`], never returned.
    fn send_encrypted(&mut self, action: &str, message: Map<String, Value>, trigger_unlock: bool);
    fn public_key(&self) -> Result<String, ClientError>;
    fn random_bytes(&self, len: usize, state: MemoryState) -> Result<SecureBuffer, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Connecting,
    Connected,
    ClosedInput,
    Terminated,
    Killed,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    CloseInput,
    Terminate,
    Kill,
    Cleanup,
}

impl ConnectPhase {
    /// Next rung of the disconnect ladder, `None` when there is nothing to stop.
    pub fn advance(self) -> Option<(ConnectPhase, ShutdownStep)> {
        match self {
            ConnectPhase::Connected => Some((ConnectPhase::ClosedInput, ShutdownStep::CloseInput)),
            ConnectPhase::Connecting | ConnectPhase::ClosedInput => {
                Some((ConnectPhase::Terminated, ShutdownStep::Terminate))
            }
            ConnectPhase::Terminated => Some((ConnectPhase::Killed, ShutdownStep::Kill)),
            ConnectPhase::Killed => Some((ConnectPhase::Idle, ShutdownStep::Cleanup)),
            ConnectPhase::Idle => None,
        }
    }

    fn is_shutting_down(self) -> bool {
        matches!(
            self,
            ConnectPhase::ClosedInput | ConnectPhase::Terminated | ConnectPhase::Killed
        )
    }
}

struct ProxyProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    exited: Option<ExitStatus>,
}

enum Wake {
    Wrote(io::Result<usize>),
    Read(io::Result<usize>),
    Stderr(io::Result<Option<String>>),
    Exited(io::Result<ExitStatus>),
    Timer,
}

pub struct Transport {
    args: Vec<String>,
    disconnect_timeout: Duration,
    channel: SecureChannel,
    process: Option<ProxyProcess>,
    phase: ConnectPhase,
    decoder: FrameDecoder,
    outbox: VecDeque<Vec<u8>>,
    written: usize,
    deadline: Option<Instant>,
    events: VecDeque<TransportEvent>,
}

impl Transport {
    pub fn new(init: CryptoInit, config: &ClientConfig) -> Self {
        Self {
            args: config.proxy_args.clone(),
            disconnect_timeout: config.disconnect_timeout(),
            channel: SecureChannel::new(init),
            process: None,
            phase: ConnectPhase::Idle,
            decoder: FrameDecoder::new(),
            outbox: VecDeque::new(),
            written: 0,
            deadline: None,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> ConnectPhase {
        self.phase
    }

    /// Waits for the next event. `None` means the transport is idle and will
    /// not produce anything until the next `connect`.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if let Some(frame) = self.decoder.next_frame() {
                let inbound = match frame {
                    Ok(value) => self.channel.open(value),
                    Err(err) => Inbound::Invalid(err.into()),
                };
                self.handle_inbound(inbound);
                continue;
            }
            let wake = self.wait().await?;
            self.handle_wake(wake);
        }
    }

    async fn wait(&mut self) -> Option<Wake> {
        let process = self.process.as_mut()?;
        let ProxyProcess {
            child,
            stdin,
            stdout,
            stderr,
            exited,
        } = process;
        let pending_bytes = self.outbox.front().map(|frame| &frame[self.written..]);
        let deadline = self.deadline;
        let running = exited.is_none();
        let buffer = self.decoder.buffer_mut();

        let wake = tokio::select! {
            biased;
            result = read_stdout(stdout, buffer) => Wake::Read(result),
            result = read_stderr(stderr) => Wake::Stderr(result),
            result = write_stdin(stdin, pending_bytes) => Wake::Wrote(result),
            _ = sleep_until(deadline) => Wake::Timer,
            result = child.wait(), if running => Wake::Exited(result),
        };
        Some(wake)
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Wrote(Ok(0)) => self.fail_write(io::ErrorKind::WriteZero.into()),
            Wake::Wrote(Ok(n)) => {
                self.written += n;
                if self.outbox.front().is_some_and(|frame| self.written >= frame.len()) {
                    self.outbox.pop_front();
                    self.written = 0;
                }
            }
            Wake::Wrote(Err(err)) => self.fail_write(err),
            Wake::Read(Ok(0)) => {
                if let Some(process) = self.process.as_mut() {
                    process.stdout = None;
                }
                self.finish_if_exited();
            }
            Wake::Read(Ok(_)) => {}
            Wake::Read(Err(err)) => {
                if let Some(process) = self.process.as_mut() {
                    process.stdout = None;
                }
                self.fail_io(err);
                self.finish_if_exited();
            }
            Wake::Stderr(Ok(Some(line))) => warn!(target: "kpxc_client::proxy", "{line}"),
            Wake::Stderr(Ok(None)) | Wake::Stderr(Err(_)) => {
                if let Some(process) = self.process.as_mut() {
                    process.stderr = None;
                }
            }
            Wake::Exited(result) => self.handle_exit(result),
            Wake::Timer => {
                self.deadline = None;
                self.disconnect();
            }
        }
    }

    fn handle_exit(&mut self, result: io::Result<ExitStatus>) {
        let status = match result {
            Ok(status) => status,
            Err(err) => {
                error!(error = %err, "waiting for proxy failed");
                self.events.push_back(TransportEvent::Error(ClientError::Io(err.to_string())));
                self.cleanup();
                self.events.push_back(TransportEvent::Disconnected);
                return;
            }
        };
        info!(%status, "proxy exited");
        if !status.success() && !self.phase.is_shutting_down() {
            self.events
                .push_back(TransportEvent::Error(ClientError::ProcessCrashed(status.to_string())));
        }
        let Some(process) = self.process.as_mut() else {
            return;
        };
        process.exited = Some(status);
        process.stdin = None;
        self.finish_if_exited();
        if self.process.is_some() {
            // Something still holds stdout open. Give it one timeout, then clean up.
            self.phase = ConnectPhase::Killed;
            self.arm_timer();
        }
    }

    fn finish_if_exited(&mut self) {
        let done = self
            .process
            .as_ref()
            .is_some_and(|p| p.exited.is_some() && p.stdout.is_none());
        if done {
            self.cleanup();
            self.events.push_back(TransportEvent::Disconnected);
        }
    }

    /// A failed write leaves stdin unusable, so it is closed along with
    /// whatever was still queued.
    fn fail_write(&mut self, err: io::Error) {
        if let Some(process) = self.process.as_mut() {
            process.stdin = None;
        }
        self.outbox.clear();
        self.written = 0;
        self.fail_io(err);
    }

    fn fail_io(&mut self, err: io::Error) {
        if self.phase.is_shutting_down() {
            debug!(error = %err, "proxy pipe closed during shutdown");
            return;
        }
        error!(error = %err, "proxy pipe failed");
        self.events.push_back(TransportEvent::Error(ClientError::Io(err.to_string())));
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let event = match inbound {
            Inbound::KeysExchanged => {
                if self.phase != ConnectPhase::Connecting {
                    warn!(phase = ?self.phase, "ignoring key exchange reply");
                    return;
                }
                self.phase = ConnectPhase::Connected;
                info!("key exchange with KeePassXC complete");
                TransportEvent::Connected
            }
            Inbound::Locked => TransportEvent::Locked,
            Inbound::Unlocked => TransportEvent::Unlocked,
            Inbound::Message { action, message } => TransportEvent::Message { action, message },
            Inbound::Failed { action, error } => TransportEvent::Failed { action, error },
            Inbound::Invalid(error) => TransportEvent::Error(error),
        };
        self.events.push_back(event);
    }

    fn arm_timer(&mut self) {
        self.deadline = Some(Instant::now() + self.disconnect_timeout);
    }

    fn cleanup(&mut self) {
        if let Some(process) = self.process.take() {
            debug!(pid = ?process.child.id(), "releasing proxy process");
        }
        self.deadline = None;
        self.channel.clear();
        self.decoder.clear();
        self.outbox.clear();
        self.written = 0;
        self.phase = ConnectPhase::Idle;
    }

    fn terminate(child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
                    warn!(pid, error = %io::Error::last_os_error(), "SIGTERM failed");
                }
                return;
            }
        }
        if let Err(err) = child.start_kill() {
            warn!(error = %err, "terminating proxy failed");
        }
    }
}

impl Link for Transport {
    fn connect(&mut self, program: &str) -> Result<(), ClientError> {
        if self.process.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        self.cleanup();
        self.channel.reset()?;

        let spawned = Command::new(program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                error!(program, error = %err, "failed to start proxy");
                self.cleanup();
                self.events.push_back(TransportEvent::Error(ClientError::SpawnFailed {
                    program: program.to_owned(),
                    reason: err.to_string(),
                }));
                self.events.push_back(TransportEvent::Disconnected);
                return Ok(());
            }
        };
        info!(program, pid = ?child.id(), "proxy started");

        self.process = Some(ProxyProcess {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take().map(|pipe| BufReader::new(pipe).lines()),
            child,
            exited: None,
        });
        self.phase = ConnectPhase::Connecting;

        match self.channel.key_exchange() {
            Ok(frame) => self.outbox.push_back(frame),
            Err(error) => self.events.push_back(TransportEvent::Error(error)),
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.process.is_none() {
            return;
        }
        let Some((next, step)) = self.phase.advance() else {
            return;
        };
        debug!(?step, "disconnect step");
        self.phase = next;
        self.deadline = None;
        match step {
            ShutdownStep::CloseInput => {
                if let Some(process) = self.process.as_mut() {
                    process.stdin = None;
                }
                self.outbox.clear();
                self.written = 0;
                self.arm_timer();
            }
            ShutdownStep::Terminate => {
                if let Some(process) = self.process.as_mut() {
                    Self::terminate(&mut process.child);
                }
                self.arm_timer();
            }
            ShutdownStep::Kill => {
                if let Some(process) = self.process.as_mut() {
                    if let Err(err) = process.child.start_kill() {
                        debug!(error = %err, "kill failed, process already gone");
                    }
                }
                self.arm_timer();
            }
            ShutdownStep::Cleanup => {
                self.cleanup();
                self.events.push_back(TransportEvent::Disconnected);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.phase == ConnectPhase::Connected
    }

    fn is_connecting(&self) -> bool {
        self.phase == ConnectPhase::Connecting
    }

    fn send_encrypted(&mut self, action: &str, message: Map<String, Value>, trigger_unlock: bool) {
        if self.phase != ConnectPhase::Connected {
            self.events.push_back(TransportEvent::Failed {
                action: action.to_owned(),
                error: ClientError::NotConnected,
            });
            return;
        }
        match self.channel.seal(action, message, trigger_unlock) {
            Ok(frame) => {
                debug!(action, bytes = frame.len(), "queued request");
                self.outbox.push_back(frame);
            }
            Err(error) => self.events.push_back(TransportEvent::Failed {
                action: action.to_owned(),
                error,
            }),
        }
    }

    fn public_key(&self) -> Result<String, ClientError> {
        Ok(self.channel.crypto().public_key_base64()?)
    }

    fn random_bytes(&self, len: usize, state: MemoryState) -> Result<SecureBuffer, ClientError> {
        Ok(self.channel.crypto().random_bytes(len, state)?)
    }
}

async fn read_stdout(stdout: &mut Option<ChildStdout>, buffer: &mut BytesMut) -> io::Result<usize> {
    match stdout.as_mut() {
        Some(pipe) => {
            buffer.reserve(READ_CHUNK);
            pipe.read_buf(buffer).await
        }
        None => pending().await,
    }
}

async fn read_stderr(stderr: &mut Option<Lines<BufReader<ChildStderr>>>) -> io::Result<Option<String>> {
    match stderr.as_mut() {
        Some(lines) => lines.next_line().await,
        None => pending().await,
    }
}

async fn write_stdin(stdin: &mut Option<ChildStdin>, bytes: Option<&[u8]>) -> io::Result<usize> {
    match (stdin.as_mut(), bytes) {
        (Some(pipe), Some(bytes)) => pipe.write(bytes).await,
        _ => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}
