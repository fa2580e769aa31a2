//! Connection state machine.
//!
//! ```text
//!            connect()                 setup done
//!   Idle ───────────────► Connecting ─────────────► Streaming
//!    ▲                        │                        │
//!    │ stop()                 │ setup failed           │ disconnect() / stream lost
//!    │ (from any state)       ▼                        ▼
//!    └──────────────────── Disconnected ◄──────────────┘
//!                             │   ▲
//!                 backoff     │   │
//!                 (no stop)   ▼   │
//!                          Connecting
//! ```
//!
//! Every teardown bumps a generation counter and cancels the attempt in
//! flight, then waits (bounded) for that attempt to close what it opened.
//! When `stop()`/`disconnect()` return, no socket from an earlier attempt is
//! still bound and a fresh `connect()` is accepted.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use jhview_core::{ConnectionState, EngineConfig, ErrorKind, TransportError};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{CommandTransport, TransportConnector, UdpConnector};
use crate::command::Command;
use crate::keepalive::{spawn_keepalive, KeepAliveStats};
use crate::reassembler::{spawn_reassembler, AssemblerStats, ReassemblerConfig};
use crate::sink::FrameSink;
use crate::stop::StopSignal;

// ── Public types ──────────────────────────────────────────────────────────────

/// Result of a single [`DeviceEngine::connect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Setup completed; the engine is now `Streaming`.
    Streaming,
    /// Another attempt is already running; nothing was started.
    AlreadyConnecting,
    /// The engine was already streaming; nothing was started.
    AlreadyStreaming,
    /// `stop()` or `disconnect()` interrupted the attempt.
    Aborted,
    /// Sockets could not be opened; a reconnect has been scheduled.
    Failed,
}

// ── Internals ─────────────────────────────────────────────────────────────────

struct Lifecycle {
    state: ConnectionState,
    generation: u64,
    attempt: Option<AttemptHandle>,
}

/// Lets teardown cancel the running attempt and wait until it has let go of
/// its sockets.
struct AttemptHandle {
    cancel: StopSignal,
    done: StopSignal,
}

struct Session {
    transport: Arc<dyn CommandTransport>,
    data_addr: SocketAddr,
    stop: StopSignal,
    reassembler: Option<JoinHandle<AssemblerStats>>,
    keepalive: Option<JoinHandle<KeepAliveStats>>,
}

impl Drop for Session {
    // Only does work when the session was dropped without `release`, i.e.
    // the future that owned it was cancelled.
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        if let Some(handle) = self.reassembler.take() {
            handle.abort();
        }
    }
}

struct PendingReconnect {
    generation: u64,
    handle: JoinHandle<()>,
}

enum AttemptError {
    Superseded,
    Setup(TransportError),
}

struct Inner {
    config: EngineConfig,
    sink: Arc<dyn FrameSink>,
    connector: Arc<dyn TransportConnector>,
    lifecycle: Mutex<Lifecycle>,
    connecting: AtomicBool,
    stopped: AtomicBool,
    session: tokio::sync::Mutex<Option<Session>>,
    data_addr: Mutex<Option<SocketAddr>>,
    reconnect: Mutex<Option<PendingReconnect>>,
    reconnect_attempts: AtomicU64,
}

/// Clears the "connecting" flag however the attempt ends, including when its
/// future is dropped mid-handshake. A dropped attempt that still owns the
/// current generation leaves `Connecting` for `Disconnected`.
struct ConnectingGuard<'a> {
    engine: &'a DeviceEngine,
    generation: Option<u64>,
    done: StopSignal,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation {
            let stranded = {
                let lc = lock(&self.engine.inner.lifecycle);
                lc.generation == generation && lc.state == ConnectionState::Connecting
            };
            if stranded {
                debug!("Connection attempt cancelled by its caller");
                self.engine
                    .transition_for(generation, ConnectionState::Disconnected);
            }
        }
        self.engine.inner.connecting.store(false, Ordering::Release);
        self.done.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── DeviceEngine ──────────────────────────────────────────────────────────────

/// Owns the sockets, worker tasks and lifecycle of one device connection.
///
/// `DeviceEngine` is `Clone`; clones share the same connection.
#[derive(Clone)]
pub struct DeviceEngine {
    inner: Arc<Inner>,
}

impl DeviceEngine {
    pub fn new(config: EngineConfig, sink: Arc<dyn FrameSink>) -> Self {
        Self::with_connector(config, sink, Arc::new(UdpConnector))
    }

    /// Build an engine whose command transport comes from `connector`.
    pub fn with_connector(
        config: EngineConfig,
        sink: Arc<dyn FrameSink>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                connector,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Idle,
                    generation: 0,
                    attempt: None,
                }),
                connecting: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                session: tokio::sync::Mutex::new(None),
                data_addr: Mutex::new(None),
                reconnect: Mutex::new(None),
                reconnect_attempts: AtomicU64::new(0),
            }),
        }
    }

    // ── Observation ──────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.lifecycle).state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Local address of the data socket while a session is up.
    pub fn local_data_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.data_addr)
    }

    /// Number of automatic reconnect attempts made so far.
    pub fn reconnect_attempts(&self) -> u64 {
        self.inner.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Whether an automatic reconnect is waiting or running.
    pub fn reconnect_pending(&self) -> bool {
        lock(&self.inner.reconnect)
            .as_ref()
            .map_or(false, |pending| !pending.handle.is_finished())
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Open sockets, run the handshake and start the workers.
    ///
    /// Returns without doing anything if an attempt is already running or
    /// the engine is already streaming. On setup failure the engine moves to
    /// `Disconnected` and schedules a reconnect after the configured backoff.
    pub async fn connect(&self) -> ConnectOutcome {
        self.inner.stopped.store(false, Ordering::SeqCst);
        let outcome = self.attempt(None).await;
        if outcome == ConnectOutcome::Failed {
            self.schedule_reconnect();
        }
        outcome
    }

    /// Tear the session down and stay `Disconnected` (or `Idle` if nothing
    /// was ever started). Never reconnects on its own.
    pub async fn disconnect(&self) {
        self.cancel_reconnect();
        let target = match self.state() {
            ConnectionState::Idle => ConnectionState::Idle,
            _ => ConnectionState::Disconnected,
        };
        self.teardown(target).await;
    }

    /// Tear everything down, cancel pending reconnects and return to `Idle`.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        self.teardown(ConnectionState::Idle).await;
    }

    /// Liveness hook for an external watchdog: if streaming, tear down to
    /// `Disconnected` and schedule a reconnect. Returns whether it acted.
    pub async fn report_stream_lost(&self, reason: &str) -> bool {
        if self.state() != ConnectionState::Streaming {
            debug!("Stream-lost report ignored in state {}", self.state());
            return false;
        }
        warn!("Stream lost: {}", reason);
        self.inner.sink.on_error(ErrorKind::StreamLost, reason);
        self.teardown(ConnectionState::Disconnected).await;
        self.schedule_reconnect();
        true
    }

    // ── Attempt ──────────────────────────────────────────────────────────────

    /// One connection attempt. When `expected_generation` is set the attempt
    /// only starts if no teardown happened since it was scheduled.
    async fn attempt(&self, expected_generation: Option<u64>) -> ConnectOutcome {
        let inner = &self.inner;
        if inner
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("connect() ignored: handshake already in progress");
            return ConnectOutcome::AlreadyConnecting;
        }
        let done = StopSignal::new();
        let mut guard = ConnectingGuard {
            engine: self,
            generation: None,
            done: done.clone(),
        };
        let cancel = StopSignal::new();

        let generation = {
            let mut lc = lock(&inner.lifecycle);
            if lc.state == ConnectionState::Streaming {
                return ConnectOutcome::AlreadyStreaming;
            }
            if expected_generation.is_some_and(|g| g != lc.generation) {
                return ConnectOutcome::Aborted;
            }
            if inner.stopped.load(Ordering::SeqCst) && expected_generation.is_some() {
                return ConnectOutcome::Aborted;
            }
            lc.attempt = Some(AttemptHandle {
                cancel: cancel.clone(),
                done,
            });
            lc.generation
        };
        if !self.transition_for(generation, ConnectionState::Connecting) {
            return ConnectOutcome::Aborted;
        }
        guard.generation = Some(generation);

        match self.establish(generation, &cancel).await {
            Ok(session) => {
                let mut slot = inner.session.lock().await;
                if self.superseded(generation) {
                    drop(slot);
                    self.release(session).await;
                    return ConnectOutcome::Aborted;
                }
                *lock(&inner.data_addr) = Some(session.data_addr);
                *slot = Some(session);
                if !self.transition_for(generation, ConnectionState::Streaming) {
                    // A teardown is queued behind the session lock; it will
                    // release the session we just installed.
                    return ConnectOutcome::Aborted;
                }
                ConnectOutcome::Streaming
            }
            Err(AttemptError::Superseded) => {
                debug!("Connection attempt abandoned after teardown");
                ConnectOutcome::Aborted
            }
            Err(AttemptError::Setup(e)) => {
                warn!("Connection setup failed: {}", e);
                inner.sink.on_error(ErrorKind::SetupFailed, &e.to_string());
                if self.transition_for(generation, ConnectionState::Disconnected) {
                    ConnectOutcome::Failed
                } else {
                    ConnectOutcome::Aborted
                }
            }
        }
    }

    async fn establish(
        &self,
        generation: u64,
        cancel: &StopSignal,
    ) -> Result<Session, AttemptError> {
        let inner = &self.inner;
        let cfg = &inner.config;

        // ── 1. Sockets ───────────────────────────────────────────────────────
        let transport = inner
            .connector
            .open(cfg)
            .await
            .map_err(AttemptError::Setup)?;

        let bind_addr = cfg.data_bind_addr();
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(s) => s,
            Err(e) => {
                transport.close().await;
                return Err(AttemptError::Setup(TransportError::BindFailed {
                    addr: bind_addr.to_string(),
                    reason: e.to_string(),
                }));
            }
        };
        let data_addr = socket.local_addr().unwrap_or(bind_addr);
        info!(
            "Connecting to {} (data port {})",
            cfg.control_addr(),
            data_addr.port()
        );

        // ── 2. Handshake ─────────────────────────────────────────────────────
        let steps = [
            (Command::HANDSHAKE_1, cfg.redundant_send_count, cfg.handshake_delay()),
            (Command::HANDSHAKE_2, cfg.redundant_send_count, cfg.handshake_delay()),
            (Command::START_STREAM, cfg.start_stream_repeats, Duration::ZERO),
        ];
        for (command, times, pause) in steps {
            if cancel.is_stopped() || self.superseded(generation) {
                transport.close().await;
                return Err(AttemptError::Superseded);
            }
            let step = async {
                if let Err(e) = transport
                    .send_redundant(command, times, cfg.redundant_send_spacing())
                    .await
                {
                    // UDP is best effort; frame traffic is the real confirmation.
                    warn!("{} not delivered: {}", command, e);
                    inner
                        .sink
                        .on_error(ErrorKind::SendFailed, &format!("{command}: {e}"));
                }
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            };
            tokio::select! {
                _ = cancel.stopped() => {}
                _ = step => {}
            }
        }
        if cancel.is_stopped() || self.superseded(generation) {
            transport.close().await;
            return Err(AttemptError::Superseded);
        }

        // ── 3. Workers ───────────────────────────────────────────────────────
        let stop = StopSignal::new();
        let reassembler = spawn_reassembler(
            socket,
            ReassemblerConfig::from(cfg),
            Arc::clone(&inner.sink),
            stop.clone(),
        );
        let keepalive = spawn_keepalive(
            Arc::clone(&transport),
            cfg.keepalive_interval(),
            Arc::clone(&inner.sink),
            stop.clone(),
        );

        Ok(Session {
            transport,
            data_addr,
            stop,
            reassembler: Some(reassembler),
            keepalive: Some(keepalive),
        })
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    async fn teardown(&self, target: ConnectionState) {
        let interrupted = {
            let mut lc = lock(&self.inner.lifecycle);
            lc.generation = lc.generation.wrapping_add(1);
            lc.attempt.take()
        };

        if let Some(attempt) = interrupted {
            attempt.cancel.stop();
            let cfg = &self.inner.config;
            let limit = cfg.join_timeout() * 2 + cfg.command_timeout();
            if tokio::time::timeout(limit, attempt.done.stopped()).await.is_err() {
                warn!("Connection attempt still running after {:?}", limit);
            }
        }

        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            self.release(session).await;
        }
        *lock(&self.inner.data_addr) = None;

        self.transition(target);
    }

    /// Stop the workers, tell the device to stop, and close the channel.
    /// Every step is best effort.
    async fn release(&self, mut session: Session) {
        let limit = self.inner.config.join_timeout();

        session.stop.stop();
        // Keep-alive first so it cannot re-send START_STREAM after STOP_STREAM.
        if let Some(handle) = session.keepalive.take() {
            if let Some(stats) = join_bounded("keep-alive", handle, limit).await {
                debug!("Keep-alive joined: {:?}", stats);
            }
        }
        if let Err(e) = session.transport.send(Command::STOP_STREAM).await {
            debug!("STOP_STREAM not delivered: {}", e);
        }
        if let Some(handle) = session.reassembler.take() {
            if let Some(stats) = join_bounded("frame receiver", handle, limit).await {
                debug!("Frame receiver joined: {:?}", stats);
            }
        }
        session.transport.close().await;
    }

    // ── Reconnect ────────────────────────────────────────────────────────────

    fn schedule_reconnect(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let generation = lock(&self.inner.lifecycle).generation;

        let mut pending = lock(&self.inner.reconnect);
        if let Some(p) = pending.as_ref() {
            if p.generation == generation && !p.handle.is_finished() {
                return;
            }
        }

        let engine = self.clone();
        let backoff = self.inner.config.reconnect_backoff();
        info!("Reconnecting in {:?}", backoff);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(backoff).await;
                if engine.inner.stopped.load(Ordering::SeqCst) || engine.superseded(generation) {
                    break;
                }
                let n = engine.inner.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                info!("Reconnect attempt #{} to {}", n, engine.inner.config.control_addr());
                match engine.attempt(Some(generation)).await {
                    // A concurrent attempt may still fail; check again next round.
                    ConnectOutcome::Failed | ConnectOutcome::AlreadyConnecting => continue,
                    outcome => {
                        debug!("Reconnect loop finished: {:?}", outcome);
                        break;
                    }
                }
            }
        });

        if let Some(previous) = pending.replace(PendingReconnect { generation, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(pending) = lock(&self.inner.reconnect).take() {
            pending.handle.abort();
        }
    }

    // ── State helpers ────────────────────────────────────────────────────────

    fn superseded(&self, generation: u64) -> bool {
        lock(&self.inner.lifecycle).generation != generation
    }

    /// Transition only if no teardown happened since `generation`.
    fn transition_for(&self, generation: u64, to: ConnectionState) -> bool {
        let from = {
            let mut lc = lock(&self.inner.lifecycle);
            if lc.generation != generation {
                return false;
            }
            std::mem::replace(&mut lc.state, to)
        };
        self.notify(from, to);
        true
    }

    fn transition(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut lock(&self.inner.lifecycle).state, to);
        self.notify(from, to);
    }

    fn notify(&self, from: ConnectionState, to: ConnectionState) {
        if from == to {
            return;
        }
        info!("Connection state: {} → {}", from, to);
        self.inner.sink.on_state_changed(to);
    }
}

async fn join_bounded<T>(name: &str, mut handle: JoinHandle<T>, limit: Duration) -> Option<T> {
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("{} task ended abnormally: {}", name, e);
            None
        }
        Err(_) => {
            warn!("{} did not stop within {:?}, aborting", name, limit);
            handle.abort();
            None
        }
    }
}
