//! Connection manager.
//!
//! A background supervisor task owns the session lifecycle: it opens the
//! command and callback sockets, performs the registration handshake,
//! replays callback registrations, then opens the gate that releases
//! blocked façade callers. On any channel failure it closes the gate and
//! reconnects, retrying forever until the proxy is shut down.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::callback::dispatch;
use crate::callback::CallbackRegistry;
use crate::error::{DisServiceError, Result};
use crate::events::ConnectionEvent;
use crate::protocol::{FrameReader, FrameWriter};
use crate::transport::{BoxedConnection, Connector};

/// Gate observed by façade callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateState {
    /// Not connected; callers block until the gate opens.
    Down,
    /// Connected and ready for command exchanges.
    Up,
    /// Shut down; callers fail immediately.
    Disposed,
}

/// Framed command channel plus the session generation it belongs to.
pub(crate) struct CommandChannel {
    pub(crate) reader: FrameReader<ReadHalf<BoxedConnection>>,
    pub(crate) writer: FrameWriter<WriteHalf<BoxedConnection>>,
    pub(crate) generation: u64,
}

struct CallbackChannel {
    reader: FrameReader<ReadHalf<BoxedConnection>>,
    writer: FrameWriter<WriteHalf<BoxedConnection>>,
    generation: u64,
}

/// State shared between the façade, the supervisor and the dispatch loop.
pub(crate) struct Shared {
    /// Single in-flight command exchange at a time.
    pub(crate) command: Mutex<Option<CommandChannel>>,
    pub(crate) registry: CallbackRegistry,
    pub(crate) application_id: AtomicU16,
    pub(crate) response_timeout: StdMutex<Option<Duration>>,
    pub(crate) disposed: AtomicBool,
    gate_tx: watch::Sender<GateState>,
    gate_rx: watch::Receiver<GateState>,
    /// Highest generation for which a loss has been signaled.
    lost_tx: watch::Sender<u64>,
    lost_rx: watch::Receiver<u64>,
}

impl Shared {
    pub(crate) fn new(application_id: u16) -> Self {
        let (gate_tx, gate_rx) = watch::channel(GateState::Down);
        let (lost_tx, lost_rx) = watch::channel(0);
        Self {
            command: Mutex::new(None),
            registry: CallbackRegistry::new(),
            application_id: AtomicU16::new(application_id),
            response_timeout: StdMutex::new(None),
            disposed: AtomicBool::new(false),
            gate_tx,
            gate_rx,
            lost_tx,
            lost_rx,
        }
    }

    /// Reports a dead channel. The loss marker is monotonic, so reports
    /// against already-replaced channels are stale and have no effect.
    pub(crate) fn signal_lost(&self, generation: u64) {
        self.lost_tx.send_if_modified(|last| {
            if generation > *last {
                *last = generation;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once a loss has been signaled for `generation` or newer.
    pub(crate) async fn wait_lost(&self, generation: u64) {
        let mut rx = self.lost_rx.clone();
        let _ = rx.wait_for(|last| *last >= generation).await;
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.gate_rx.borrow() == GateState::Up
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Blocks until the gate is up. Fails once the proxy is disposed.
    pub(crate) async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.gate_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                GateState::Up => return Ok(()),
                GateState::Disposed => return Err(DisServiceError::Disposed),
                GateState::Down => {}
            }
            if rx.changed().await.is_err() {
                return Err(DisServiceError::Disposed);
            }
        }
    }

    /// Resolves once the proxy is disposed. Used to race long blocking
    /// reads against shutdown.
    pub(crate) async fn wait_disposed(&self) {
        let mut rx = self.gate_rx.clone();
        loop {
            if *rx.borrow_and_update() == GateState::Disposed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn response_timeout(&self) -> Option<Duration> {
        *self.response_timeout.lock().unwrap()
    }

    /// Moves the gate between `Down` and `Up`. `Disposed` is terminal: a
    /// supervisor that raced `dispose()` must not reopen the gate, or
    /// waiters would unblock on a dead proxy and `wait_disposed` would
    /// never resolve.
    fn set_gate(&self, state: GateState) {
        self.gate_tx.send_if_modified(|gate| {
            if *gate == GateState::Disposed || *gate == state {
                false
            } else {
                *gate = state;
                true
            }
        });
    }

    /// Marks the proxy disposed and wakes everything blocked on it. Sockets
    /// are dropped by the supervisor (or by `try_lock` here when the
    /// supervisor has already exited).
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.gate_tx.send(GateState::Disposed);
        if let Ok(mut slot) = self.command.try_lock() {
            *slot = None;
        }
    }
}

/// Supervisor task driving the reconnect cycle.
pub(crate) struct Supervisor {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    reconnect_interval: Duration,
}

impl Supervisor {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        connector: Arc<dyn Connector>,
        reconnect_interval: Duration,
    ) -> JoinHandle<()> {
        let supervisor = Self {
            shared,
            connector,
            reconnect_interval,
        };
        tokio::spawn(supervisor.run())
    }

    async fn run(self) {
        let mut generation: u64 = 0;
        loop {
            if self.shared.is_disposed() {
                return;
            }
            generation += 1;
            let Some((mut command, callback)) = self.establish(generation).await else {
                return;
            };
            let dispatch = self.spawn_dispatch(callback);
            if let Err(e) = self.announce(&mut command).await {
                tracing::debug!(error = %e, "failed to replay callback registrations");
                dispatch.abort();
                continue;
            }
            *self.shared.command.lock().await = Some(command);
            self.shared.set_gate(GateState::Up);
            self.shared
                .registry
                .dispatch_server_connect(&ConnectionEvent { connected: true });

            tokio::select! {
                _ = self.shared.wait_lost(generation) => {}
                _ = self.shared.wait_disposed() => {}
            }

            if self.shared.is_disposed() {
                dispatch.abort();
                if let Ok(mut slot) = self.shared.command.try_lock() {
                    *slot = None;
                }
                return;
            }
            self.shared.set_gate(GateState::Down);
            tracing::warn!("lost connection to the proxy server; reconnecting");
            self.shared
                .registry
                .dispatch_server_disconnect(&ConnectionEvent { connected: false });
            dispatch.abort();
            *self.shared.command.lock().await = None;
        }
    }

    /// Connects and handshakes both channels, retrying forever. Returns
    /// `None` once the proxy is disposed.
    async fn establish(&self, generation: u64) -> Option<(CommandChannel, CallbackChannel)> {
        let mut logged_failure = false;
        loop {
            if self.shared.is_disposed() {
                return None;
            }
            let result = tokio::select! {
                res = self.attempt(generation) => res,
                _ = self.shared.wait_disposed() => return None,
            };
            match result {
                Ok(pair) => {
                    if logged_failure {
                        tracing::info!("re-established connection to the proxy server");
                    } else {
                        tracing::debug!("connected to the proxy server");
                    }
                    return Some(pair);
                }
                Err(e) => {
                    // Log the first failure of an outage, then stay quiet
                    // until recovery.
                    if !logged_failure {
                        tracing::warn!(
                            error = %e,
                            interval = ?self.reconnect_interval,
                            "cannot reach the proxy server; retrying"
                        );
                        logged_failure = true;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_interval) => {}
                        _ = self.shared.wait_disposed() => return None,
                    }
                }
            }
        }
    }

    async fn attempt(&self, generation: u64) -> Result<(CommandChannel, CallbackChannel)> {
        let (cr, cw) = tokio::io::split(self.connector.connect().await?);
        let (br, bw) = tokio::io::split(self.connector.connect().await?);
        let mut command = CommandChannel {
            reader: FrameReader::new(cr),
            writer: FrameWriter::new(cw),
            generation,
        };
        let mut callback = CallbackChannel {
            reader: FrameReader::new(br),
            writer: FrameWriter::new(bw),
            generation,
        };

        let app_id = self.shared.application_id.load(Ordering::Relaxed);
        command
            .writer
            .write_line(&format!("registerProxy {app_id}"))
            .await?;
        let reply = command.reader.read_line().await?;
        if let Some(assigned) = parse_handshake_reply(&reply)? {
            // The server may assign a different application id; adopt it
            // before registering the callback channel.
            self.shared
                .application_id
                .store(assigned, Ordering::Relaxed);
        }

        let app_id = self.shared.application_id.load(Ordering::Relaxed);
        callback
            .writer
            .write_line(&format!("registerProxyCallback {app_id}"))
            .await?;
        let reply = callback.reader.read_line().await?;
        parse_handshake_reply(&reply)?;

        Ok((command, callback))
    }

    fn spawn_dispatch(&self, mut chan: CallbackChannel) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let generation = chan.generation;
            tokio::select! {
                res = dispatch::dispatch_loop(&mut chan.reader, &mut chan.writer, &shared.registry) => {
                    if let Err(e) = res {
                        tracing::debug!(error = %e, "callback channel failed");
                        shared.signal_lost(generation);
                    }
                }
                _ = shared.wait_disposed() => {}
            }
        })
    }

    /// Replays one registration verb per event kind that has handlers.
    /// The server sends no reply to these.
    async fn announce(&self, command: &mut CommandChannel) -> Result<()> {
        for kind in self.shared.registry.kinds_to_announce() {
            command.writer.write_line(kind.registration_verb()).await?;
            tracing::debug!(verb = kind.registration_verb(), "replayed callback registration");
        }
        Ok(())
    }
}

/// Parses a handshake status line. `OK` may carry a reassigned application
/// id as its second token. Anything else counts as a connection failure so
/// the supervisor keeps retrying.
fn parse_handshake_reply(line: &str) -> Result<Option<u16>> {
    let Some(rest) = line.strip_prefix("OK") else {
        tracing::debug!(line, "handshake rejected by the proxy server");
        return Err(DisServiceError::ConnectionClosed);
    };
    Ok(rest
        .split_whitespace()
        .next()
        .and_then(|tok| tok.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake_reply() {
        assert_eq!(parse_handshake_reply("OK").unwrap(), None);
        assert_eq!(parse_handshake_reply("OK 17").unwrap(), Some(17));
        assert_eq!(parse_handshake_reply("OK not-a-number").unwrap(), None);
        assert!(parse_handshake_reply("ERROR").is_err());
        assert!(parse_handshake_reply("").is_err());
    }

    #[tokio::test]
    async fn test_loss_signals_are_generation_scoped() {
        let shared = Shared::new(0);
        // A stale loss for an older session never satisfies a newer wait.
        shared.signal_lost(1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), shared.wait_lost(2))
                .await
                .is_err()
        );
        shared.signal_lost(2);
        tokio::time::timeout(Duration::from_millis(50), shared.wait_lost(2))
            .await
            .expect("current generation loss must wake");
        // The marker is monotonic: an out-of-order older report is ignored
        // but already-signaled generations stay satisfied.
        shared.signal_lost(1);
        tokio::time::timeout(Duration::from_millis(50), shared.wait_lost(2))
            .await
            .expect("loss marker must not move backwards");
    }

    #[tokio::test]
    async fn test_wait_connected_fails_after_dispose() {
        let shared = Arc::new(Shared::new(0));
        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.wait_connected().await })
        };
        tokio::task::yield_now().await;
        shared.dispose();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DisServiceError::Disposed)));
    }

    #[tokio::test]
    async fn test_gate_opens_waiters() {
        let shared = Arc::new(Shared::new(0));
        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.wait_connected().await })
        };
        tokio::task::yield_now().await;
        assert!(!shared.is_connected());
        shared.set_gate(GateState::Up);
        waiter.await.unwrap().unwrap();
        assert!(shared.is_connected());
    }

    #[tokio::test]
    async fn test_dispose_is_terminal_for_the_gate() {
        let shared = Arc::new(Shared::new(0));
        shared.dispose();
        // A session whose handshake completed concurrently with dispose()
        // must not reopen the gate.
        shared.set_gate(GateState::Up);
        assert!(!shared.is_connected());
        assert!(matches!(
            shared.wait_connected().await,
            Err(DisServiceError::Disposed)
        ));
        // Supervisor cleanup still observes disposal.
        tokio::time::timeout(Duration::from_millis(50), shared.wait_disposed())
            .await
            .expect("wait_disposed must resolve after dispose");
        shared.set_gate(GateState::Down);
        assert!(matches!(
            shared.wait_connected().await,
            Err(DisServiceError::Disposed)
        ));
    }
}
