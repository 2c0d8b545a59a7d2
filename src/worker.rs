//! The per-worker process-supervision state machine (spec §4.2).
//!
//! Each [`WorkerHandle`] fronts a single supervisor task (a [`WorkerActor`])
//! that owns the child process, its handshake pipe, and its socket path.
//! State transitions and events are posted across channels rather than
//! invoked as direct callbacks, so listeners always observe the
//! post-transition state (spec §5's "deferred, non-reentrant" rule).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command as ChildCommand};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::aggregate::{AggregateSender, LogChunk, LogKind};
use crate::client::{BoxBody, Client, Exchange, RequestWriter, ResponseBody};
use crate::common::timeout::IdleTimer;
use crate::error::{Error, Result};

const WORKER_PROGRAM: &str = "nack_worker";
const TEMP_PREFIX: &str = "relay-pool";

static WORKER_PROGRAM_PATH: OnceCell<PathBuf> = OnceCell::new();

fn resolve_worker_program() -> Result<PathBuf> {
    WORKER_PROGRAM_PATH
        .get_or_try_init(|| {
            which::which(WORKER_PROGRAM).map_err(|_| Error::new_worker_program_missing())
        })
        .map(|path| path.clone())
}

/// Identifies a worker within its pool. Stable for the worker's lifetime,
/// independent of its process-level identity (which changes across
/// respawns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

/// The worker's process-supervision state (spec §4.2's state table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No child process, no OS resources held.
    Absent,
    /// Child process launched; waiting on the handshake pipe.
    Spawning,
    /// Child is listening on its socket, no exchange in flight.
    Ready,
    /// One exchange is in flight.
    Busy,
    /// A graceful or forceful shutdown signal has been sent.
    Quitting,
}

/// An event emitted by a worker's supervisor task, deferred past the
/// transition that caused it.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The worker began spawning its child process.
    Spawning,
    /// The child process was launched (but is not yet ready).
    Spawn,
    /// The handshake completed; the worker accepts connections.
    Ready,
    /// An exchange was accepted.
    Busy,
    /// The idle timer expired.
    Idle,
    /// A shutdown signal was sent to the child.
    Quitting,
    /// The child exited and the worker returned to `Absent`.
    Exit,
    /// A non-fatal error occurred on this worker.
    Error(Arc<Error>),
}

/// Construction-time options for a single worker (spec §2.3's
/// `WorkerOptions`).
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Path to the worker's configuration file, passed as its last argument.
    pub config_path: PathBuf,
    /// Working directory for the child process; inherited if `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables, layered over the supervisor's own
    /// environment (spec §6's "Environment" rule).
    pub env: HashMap<String, String>,
    /// If set, a worker with no activity for this long after its last
    /// `busy` transition is sent a graceful quit.
    pub idle_timeout: Option<Duration>,
    /// Passed to the child as `--debug` when set.
    pub debug: bool,
    /// Directory under which per-worker socket and pipe paths are created.
    pub socket_dir: PathBuf,
}

impl WorkerOptions {
    /// Validate the config path exists and build options with otherwise
    /// default settings (no idle timeout, inherited cwd/env, temp-dir
    /// sockets), matching spec §7's `config-missing` row.
    pub fn new(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        if !config_path.exists() {
            return Err(Error::new_config_missing());
        }
        Ok(WorkerOptions {
            config_path,
            cwd: None,
            env: HashMap::new(),
            idle_timeout: None,
            debug: false,
            socket_dir: std::env::temp_dir(),
        })
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, duration: Duration) -> Self {
        self.idle_timeout = Some(duration);
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Parameters for one proxied request, passed through to
/// [`crate::env::build_env`] once the worker is ready to accept it.
#[derive(Default)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Raw query string, without a leading `?`.
    pub query: String,
    /// Request headers, in wire order.
    pub headers: Vec<(String, String)>,
    /// Synthesized/override environment entries (spec §4.1 rule 6).
    pub meta: HashMap<String, String>,
    /// The outbound request body, pumped to the worker socket after the
    /// environment frame and before the end-of-stream sentinel (spec
    /// §4.1: "Subsequent frames are the request body chunks, in order").
    /// `None` behaves like a body with no chunks (GET/HEAD).
    pub body: Option<BoxBody>,
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("meta", &self.meta)
            .field("body", &self.body.is_some())
            .finish()
    }
}

/// A single leased exchange against a worker's socket.
///
/// Dropping a `Lease` (after finishing or abandoning the exchange) notifies
/// the worker's supervisor, which transitions the worker back to `ready`
/// (spec §4.2: "exchange socket closes" -> `ready`).
#[derive(Debug)]
pub struct Lease {
    /// The writable half of the exchange.
    pub writer: RequestWriter,
    /// The event-emitting half of the exchange.
    pub body: ResponseBody,
    worker: WorkerId,
    release_tx: mpsc::UnboundedSender<WorkerId>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.release_tx.send(self.worker);
    }
}

enum Command {
    Spawn(oneshot::Sender<Result<()>>),
    CreateConnection(ProxyRequest, oneshot::Sender<Result<Lease>>),
    Quit,
    Terminate,
    Restart(oneshot::Sender<()>),
}

/// A cloneable front for a worker's supervisor task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<WorkerState>,
    event_tx: broadcast::Sender<(WorkerId, WorkerEvent)>,
}

impl WorkerHandle {
    /// This worker's stable identity within its pool.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The worker's current state.
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// Subscribe to this worker's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<(WorkerId, WorkerEvent)> {
        self.event_tx.subscribe()
    }

    /// A `Receiver` that observes state changes directly, for callers that
    /// want to `await` a specific state rather than filter events.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    /// Spawn the child process. No-op (returns `Ok`) if already live.
    pub async fn spawn(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Spawn(tx))
            .map_err(|_| Error::new_channel_closed())?;
        rx.await.map_err(|_| Error::new_canceled())?
    }

    /// Spawn the worker if absent, wait for readiness, and lease one
    /// exchange (spec §4.2's `createConnection`).
    ///
    /// `request.body` is not consumed here: this is the bare `createConnection`
    /// primitive, returning the [`Lease`]'s raw `writer`/`body` halves for the
    /// caller to drive directly, same as [`Client::request`]. Callers that
    /// want the body pumped for them should go through
    /// [`crate::pool::Pool::proxy`], spec §4.1's `proxyRequest` convenience.
    pub async fn create_connection(&self, request: ProxyRequest) -> Result<Lease> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CreateConnection(request, tx))
            .map_err(|_| Error::new_channel_closed())?;
        rx.await.map_err(|_| Error::new_canceled())?
    }

    /// Send a graceful quit (SIGQUIT): the child finishes any in-flight
    /// request before exiting.
    pub fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit);
    }

    /// Send a forceful quit (SIGTERM).
    pub fn terminate(&self) {
        let _ = self.cmd_tx.send(Command::Terminate);
    }

    /// Quit, then spawn again once the child has exited.
    pub async fn restart(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Restart(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start a worker's supervisor task and return a handle to it. The worker
/// begins in `Absent`; call [`WorkerHandle::spawn`] or
/// [`WorkerHandle::create_connection`] to launch its child process.
pub fn spawn_worker(
    id: WorkerId,
    options: WorkerOptions,
    stdout_tx: AggregateSender,
    stderr_tx: AggregateSender,
    pool_tx: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let idle_timeout = options.idle_timeout.unwrap_or(Duration::from_secs(0));
    let (state_tx, state_rx) = watch::channel(WorkerState::Absent);
    let (event_tx, _) = broadcast::channel(64);
    let (release_tx, release_rx) = mpsc::unbounded_channel();

    let handle = WorkerHandle {
        id,
        cmd_tx,
        state_rx,
        event_tx: event_tx.clone(),
    };

    let actor = WorkerActor {
        id,
        options,
        cmd_rx,
        state_tx,
        event_tx,
        pool_tx,
        stdout_tx,
        stderr_tx,
        release_tx,
        release_rx,
        child: None,
        sock_path: None,
        pipe_path: None,
        write_pipe: None,
        idle_timer: IdleTimer::new(idle_timeout),
        pending_leases: VecDeque::new(),
        restart_pending: false,
        stderr_tail: Arc::new(std::sync::Mutex::new(Vec::new())),
        stderr_pump: None,
    };

    tokio::spawn(actor.run());
    handle
}

struct WorkerActor {
    id: WorkerId,
    options: WorkerOptions,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<WorkerState>,
    event_tx: broadcast::Sender<(WorkerId, WorkerEvent)>,
    pool_tx: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
    stdout_tx: AggregateSender,
    stderr_tx: AggregateSender,
    release_tx: mpsc::UnboundedSender<WorkerId>,
    release_rx: mpsc::UnboundedReceiver<WorkerId>,
    child: Option<Child>,
    sock_path: Option<PathBuf>,
    pipe_path: Option<PathBuf>,
    write_pipe: Option<pipe::Sender>,
    idle_timer: IdleTimer,
    pending_leases: VecDeque<(ProxyRequest, oneshot::Sender<Result<Lease>>)>,
    restart_pending: bool,
    stderr_tail: Arc<std::sync::Mutex<Vec<u8>>>,
    stderr_pump: Option<tokio::task::JoinHandle<()>>,
}

/// Bytes kept from a child's stderr, used to build a crash message (spec §8
/// scenario 4). Capped so a chatty worker can't grow this unbounded.
const STDERR_TAIL_CAP: usize = 4096;

fn format_crash_message(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "worker child process exited unexpectedly".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<std::process::ExitStatus> {
    match child {
        Some(c) => c.wait().await,
        None => futures_util::future::pending().await,
    }
}

impl WorkerActor {
    fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, state: WorkerState) {
        tracing::debug!(worker = self.id.0, ?state, "worker state transition");
        let _ = self.state_tx.send(state);
    }

    fn emit(&self, event: WorkerEvent) {
        match &event {
            // Ready/Exit are the lifecycle milestones callers most care
            // about; everything else (including errors, logged with
            // fuller context at their call sites) stays at debug.
            WorkerEvent::Ready | WorkerEvent::Exit => {
                tracing::info!(worker = self.id.0, ?event, "worker event");
            }
            _ => {
                tracing::debug!(worker = self.id.0, ?event, "worker event");
            }
        }
        let _ = self.event_tx.send((self.id, event.clone()));
        let _ = self.pool_tx.send((self.id, event));
    }

    /// The most recent stderr output from the current (or just-exited)
    /// child, trimmed, falling back to a generic message if silent.
    fn crash_message(&self) -> String {
        let buf = self.stderr_tail.lock().unwrap();
        format_crash_message(&buf)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        None if self.state() == WorkerState::Absent => break,
                        None => {
                            self.terminate_signal(Signal::SIGTERM);
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                result = wait_child(&mut self.child), if self.child.is_some() => {
                    self.handle_child_exit(result).await;
                }

                Some(worker) = self.release_rx.recv() => {
                    debug_assert_eq!(worker, self.id);
                    self.handle_release().await;
                }

                () = self.idle_timer.expired(), if self.idle_timer.is_armed() => {
                    self.handle_idle_expiry().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Spawn(reply) => {
                let res = match self.state() {
                    WorkerState::Absent => self.begin_spawn().await,
                    _ => Ok(()),
                };
                let _ = reply.send(res);
            }
            Command::CreateConnection(request, reply) => {
                self.pending_leases.push_back((request, reply));
                if self.state() == WorkerState::Absent {
                    if let Err(err) = self.begin_spawn().await {
                        if let Some((_, r)) = self.pending_leases.pop_back() {
                            let _ = r.send(Err(err));
                        }
                        return;
                    }
                }
                self.try_serve_pending().await;
            }
            Command::Quit => self.begin_quit(Signal::SIGQUIT),
            Command::Terminate => self.begin_quit(Signal::SIGTERM),
            Command::Restart(reply) => {
                match self.state() {
                    WorkerState::Absent => {
                        let _ = self.begin_spawn().await;
                    }
                    _ => {
                        self.restart_pending = true;
                        self.begin_quit(Signal::SIGQUIT);
                    }
                }
                let _ = reply.send(());
            }
        }
    }

    fn terminate_signal(&mut self, signal: Signal) {
        if self.state() != WorkerState::Absent {
            self.begin_quit(signal);
        }
    }

    /// Only meaningful once the worker is `Ready`: pops the next queued
    /// lease request, opens a connection, and transitions to `busy`.
    async fn try_serve_pending(&mut self) {
        if self.state() != WorkerState::Ready {
            // Either still spawning (served once the handshake completes,
            // since begin_spawn's caller calls try_serve_pending again) or
            // already busy/quitting; nothing to do right now.
            return;
        }
        let sock_path = match &self.sock_path {
            Some(p) => p.clone(),
            None => return,
        };
        let Some((request, reply)) = self.pending_leases.pop_front() else {
            return;
        };

        match Client::request(
            &sock_path,
            &request.method,
            &request.path,
            &request.query,
            &request.headers,
            &request.meta,
        )
        .await
        {
            Ok(exchange) => {
                self.set_state(WorkerState::Busy);
                if self.options.idle_timeout.is_some() {
                    self.idle_timer.rearm();
                }
                self.emit(WorkerEvent::Busy);
                let Exchange { writer, body } = exchange;
                let _ = reply.send(Ok(Lease {
                    writer,
                    body,
                    worker: self.id,
                    release_tx: self.release_tx.clone(),
                }));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    async fn handle_release(&mut self) {
        if self.state() == WorkerState::Busy {
            self.set_state(WorkerState::Ready);
            self.emit(WorkerEvent::Ready);
            self.try_serve_pending().await;
        }
    }

    async fn handle_idle_expiry(&mut self) {
        self.emit(WorkerEvent::Idle);
        self.begin_quit(Signal::SIGQUIT);
    }

    fn begin_quit(&mut self, signal: Signal) {
        if matches!(self.state(), WorkerState::Absent | WorkerState::Quitting) {
            return;
        }
        tracing::debug!(worker = self.id.0, ?signal, "teardown: signaling worker child");
        self.idle_timer.disarm();
        if let Some(child) = &self.child {
            if let Some(pid) = child.id() {
                if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
                    tracing::warn!(worker = self.id.0, %err, "failed to signal worker child");
                }
            }
        }
        self.set_state(WorkerState::Quitting);
        self.emit(WorkerEvent::Quitting);
    }

    async fn handle_child_exit(&mut self, result: std::io::Result<std::process::ExitStatus>) {
        let was_quitting = self.state() == WorkerState::Quitting;
        if let Err(err) = &result {
            tracing::warn!(worker = self.id.0, %err, "error awaiting worker child exit");
        }

        self.idle_timer.disarm();
        self.child = None;
        self.write_pipe = None;
        if let Some(pump) = self.stderr_pump.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), pump).await;
        }
        if let Some(path) = self.sock_path.take() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(path) = self.pipe_path.take() {
            let _ = std::fs::remove_file(path);
        }
        tracing::debug!(worker = self.id.0, "teardown complete");
        self.set_state(WorkerState::Absent);

        let crash_message = if was_quitting {
            None
        } else {
            let msg = self.crash_message();
            tracing::warn!(worker = self.id.0, %msg, "worker child exited unexpectedly");
            self.emit(WorkerEvent::Error(Arc::new(Error::new_child_crash_message(
                msg.clone(),
            ))));
            Some(msg)
        };

        while let Some((_, reply)) = self.pending_leases.pop_front() {
            let err = match &crash_message {
                Some(msg) => Error::new_child_crash_message(msg.clone()),
                None => Error::new_child_crash(),
            };
            let _ = reply.send(Err(err));
        }

        self.emit(WorkerEvent::Exit);

        if self.restart_pending {
            self.restart_pending = false;
            let _ = self.begin_spawn().await;
        }
    }

    /// Spec §4.2's spawn sequence, steps 2-6 (step 1, the `absent` guard,
    /// is enforced by callers).
    async fn begin_spawn(&mut self) -> Result<()> {
        self.set_state(WorkerState::Spawning);
        self.emit(WorkerEvent::Spawning);

        let program = resolve_worker_program()?;
        tracing::debug!(worker = self.id.0, program = %program.display(), "spawn attempt");

        let stem = uuid::Uuid::new_v4();
        let sock_path = self.options.socket_dir.join(format!("{}.{}.sock", TEMP_PREFIX, stem));
        let pipe_path = self.options.socket_dir.join(format!("{}.{}.pipe", TEMP_PREFIX, stem));

        if let Err(err) = nix::unistd::mkfifo(&pipe_path, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR) {
            self.set_state(WorkerState::Absent);
            return Err(Error::new_spawn_io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err,
            )));
        }

        let mut receiver = match pipe::OpenOptions::new().open_receiver(&pipe_path) {
            Ok(r) => r,
            Err(err) => {
                let _ = std::fs::remove_file(&pipe_path);
                self.set_state(WorkerState::Absent);
                return Err(Error::new_spawn_io(err));
            }
        };

        let mut command = ChildCommand::new(&program);
        command
            .arg("--file")
            .arg(&sock_path)
            .arg("--pipe")
            .arg(&pipe_path);
        if self.options.debug {
            command.arg("--debug");
        }
        command.arg(&self.options.config_path);
        if let Some(cwd) = &self.options.cwd {
            command.current_dir(cwd);
        }
        command.envs(self.options.env.iter());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(err) => {
                let _ = std::fs::remove_file(&pipe_path);
                self.set_state(WorkerState::Absent);
                return Err(Error::new_spawn_io(err));
            }
        };

        self.stderr_tail.lock().unwrap().clear();

        if let Some(stdout) = child.stdout.take() {
            spawn_log_pump(self.id, stdout, LogKind::Stdout, self.stdout_tx.clone(), None);
        }
        self.stderr_pump = child.stderr.take().map(|stderr| {
            spawn_log_pump(
                self.id,
                stderr,
                LogKind::Stderr,
                self.stderr_tx.clone(),
                Some(self.stderr_tail.clone()),
            )
        });

        self.emit(WorkerEvent::Spawn);

        // Race the handshake EOF against the child exiting early.
        let handshake = async {
            let mut buf = [0u8; 64];
            loop {
                match receiver.read(&mut buf).await {
                    Ok(0) => return Ok(()),
                    Ok(_) => continue,
                    Err(err) => return Err(err),
                }
            }
        };

        tokio::select! {
            res = handshake => {
                if let Err(err) = res {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    let _ = std::fs::remove_file(&sock_path);
                    let _ = std::fs::remove_file(&pipe_path);
                    self.set_state(WorkerState::Absent);
                    return Err(Error::new_spawn_io(err));
                }
            }
            exit = child.wait() => {
                let _ = std::fs::remove_file(&sock_path);
                let _ = std::fs::remove_file(&pipe_path);
                self.set_state(WorkerState::Absent);
                return match exit {
                    Ok(_) => {
                        if let Some(pump) = self.stderr_pump.take() {
                            let _ = tokio::time::timeout(Duration::from_millis(500), pump).await;
                        }
                        let msg = self.crash_message();
                        self.emit(WorkerEvent::Error(Arc::new(Error::new_child_crash_message(
                            msg.clone(),
                        ))));
                        self.emit(WorkerEvent::Exit);
                        Err(Error::new_child_crash_message(msg))
                    }
                    Err(err) => {
                        self.emit(WorkerEvent::Exit);
                        Err(Error::new_spawn_io(err))
                    }
                };
            }
        }

        let write_pipe = match pipe::OpenOptions::new().open_sender(&pipe_path) {
            Ok(p) => p,
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = std::fs::remove_file(&sock_path);
                let _ = std::fs::remove_file(&pipe_path);
                self.set_state(WorkerState::Absent);
                return Err(Error::new_spawn_io(err));
            }
        };

        self.child = Some(child);
        self.sock_path = Some(sock_path);
        self.pipe_path = Some(pipe_path);
        self.write_pipe = Some(write_pipe);
        self.set_state(WorkerState::Ready);
        self.emit(WorkerEvent::Ready);

        Ok(())
    }
}

fn spawn_log_pump<R>(
    id: WorkerId,
    mut reader: R,
    kind: LogKind,
    sender: AggregateSender,
    tail: Option<Arc<std::sync::Mutex<Vec<u8>>>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(tail) = &tail {
                        let mut tail = tail.lock().unwrap();
                        tail.extend_from_slice(&buf[..n]);
                        let len = tail.len();
                        if len > STDERR_TAIL_CAP {
                            tail.drain(0..len - STDERR_TAIL_CAP);
                        }
                    }
                    sender.send(LogChunk {
                        worker: id,
                        kind,
                        bytes: bytes::Bytes::copy_from_slice(&buf[..n]),
                    });
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_stable_keys() {
        let a = WorkerId(0);
        let b = WorkerId(0);
        assert_eq!(a, b);
        assert!(WorkerId(1) > a);
    }

    #[test]
    fn crash_message_falls_back_when_stderr_is_silent() {
        assert_eq!(
            format_crash_message(b""),
            "worker child process exited unexpectedly"
        );
        assert_eq!(format_crash_message(b"  \n"), "worker child process exited unexpectedly");
        assert_eq!(format_crash_message(b"b00m\n"), "b00m");
    }

    #[test]
    fn rejects_missing_config_path() {
        let err = WorkerOptions::new("/nonexistent/path/for/relay-pool-tests").unwrap_err();
        assert!(err.is_config_missing());
    }

    #[tokio::test]
    async fn starts_absent_and_reports_program_missing() {
        let dir = std::env::temp_dir().join(format!("relay-pool-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = dir.join("worker.conf");
        std::fs::write(&config, b"").unwrap();
        let options = WorkerOptions::new(&config).unwrap();

        let (stdout_tx, _stdout_rx) = crate::aggregate::channel();
        let (stderr_tx, _stderr_rx) = crate::aggregate::channel();
        let (pool_tx, _pool_rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(WorkerId(0), options, stdout_tx, stderr_tx, pool_tx);
        assert_eq!(handle.state(), WorkerState::Absent);

        // Whether this errors depends on whether a `nack_worker` binary is
        // present on the host running the tests; either way the call must
        // not hang and the worker must not be left mid-spawn.
        let _ = handle.spawn().await;
    }
}
