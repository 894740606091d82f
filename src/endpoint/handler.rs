//! Endpoint
//!
//! Owns one server's connection lifecycle, its [`CommandQueue`] and the
//! outbound buffer.
//!
//! ## Lifecycle
//!
//! ```text
//!                activate                     close
//!   Disconnected ─────────> Open ──────────────────────┐
//!        ▲   │                │                         ▼
//!        │   │   connection   │                     Closing ──> Closed
//!        │   │   lost         │                         ▲
//!        └───┼────────────────┘                         │
//!            └──────────────────────────────────────────┘
//!                                  close
//! ```
//!
//! ## Locking
//!
//! All state lives behind one mutex per endpoint. Writes, reply dispatch,
//! activation after a reconnect and the drain in `close()` each take it, so
//! none of them can observe another half done. Command completions and
//! router callbacks always run after the lock is released: they may write
//! to other endpoints.

use crate::cluster::Redirect;
use crate::command::{CommandError, SharedCommand};
use crate::connection::{
    connect, ConnectionError, ConnectionEvents, ConnectionHandle, ConnectionStats,
    ConnectionWatchdog,
};
use crate::endpoint::{ChannelWriter, CommandQueue, CommandRouter};
use crate::options::ClientOptions;
use crate::protocol::{ParseError, RespValue};
use bytes::BytesMut;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, info_span, trace, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// A connection is current.
    Open,
    /// No connection is current; writes are queued for the next one.
    Disconnected,
    /// `close()` is draining the queue.
    Closing,
    Closed,
}

impl Lifecycle {
    pub fn is_closed(self) -> bool {
        matches!(self, Lifecycle::Closing | Lifecycle::Closed)
    }
}

/// Everything guarded by the endpoint's exclusive region.
#[derive(Debug)]
pub struct EndpointState {
    lifecycle: Lifecycle,
    connection: Option<ConnectionHandle>,
    queue: CommandQueue,
    auto_flush: bool,
    outbound: BytesMut,
    /// Queue-tail commands whose frames are still in `outbound`.
    unflushed: usize,
    /// Replies still owed for commands abandoned by a reset.
    stale_replies: usize,
}

impl EndpointState {
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn auto_flush(&self) -> bool {
        self.auto_flush
    }

    /// Bytes encoded but not flushed yet.
    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Commands in the queue that have not been handed to the connection.
    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    fn clear_outbound(&mut self) {
        self.outbound.clear();
        self.unflushed = 0;
    }

    fn mark_disconnected(&mut self) {
        if self.lifecycle == Lifecycle::Open {
            self.lifecycle = Lifecycle::Disconnected;
        }
        self.clear_outbound();
        self.stale_replies = 0;
        for command in self.queue.iter() {
            command.mark_unsent();
        }
    }
}

/// One server, as seen by the driver.
///
/// # Example
///
/// ```ignore
/// let endpoint = Endpoint::new("127.0.0.1:6379", Arc::new(ClientOptions::default()));
/// endpoint.establish(Arc::new(ConnectionStats::new())).await?;
///
/// let (command, handle) = Command::new("PING", StatusOutput::new()).prepare();
/// endpoint.write(command)?;
/// assert_eq!(handle.await?, "PONG");
/// ```
#[derive(Debug)]
pub struct Endpoint {
    address: String,
    options: Arc<ClientOptions>,
    router: Option<Weak<dyn CommandRouter>>,
    watchdog: Mutex<Weak<ConnectionWatchdog>>,
    state: Mutex<EndpointState>,
    span: Span,
}

impl Endpoint {
    /// A standalone endpoint. Commands drained on close are failed.
    pub fn new(address: &str, options: Arc<ClientOptions>) -> Arc<Self> {
        Arc::new(Self::build(address, options, None))
    }

    /// An endpoint owned by a router; commands drained from it while
    /// disconnected are resubmitted through `router`.
    pub fn with_router(
        address: &str,
        options: Arc<ClientOptions>,
        router: Weak<dyn CommandRouter>,
    ) -> Arc<Self> {
        Arc::new(Self::build(address, options, Some(router)))
    }

    fn build(
        address: &str,
        options: Arc<ClientOptions>,
        router: Option<Weak<dyn CommandRouter>>,
    ) -> Self {
        let state = EndpointState {
            lifecycle: Lifecycle::Disconnected,
            connection: None,
            queue: CommandQueue::new(),
            auto_flush: options.auto_flush,
            outbound: BytesMut::new(),
            unflushed: 0,
            stale_replies: 0,
        };
        Self {
            address: address.to_string(),
            span: info_span!("endpoint", address = %address),
            options,
            router,
            watchdog: Mutex::new(Weak::new()),
            state: Mutex::new(state),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` inside this endpoint's exclusive region.
    pub fn do_exclusive<R>(&self, f: impl FnOnce(&mut EndpointState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    /// True once `close()` has begun.
    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle.is_closed()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Ids of the queued commands, head first.
    pub fn queued_ids(&self) -> Vec<u64> {
        self.lock().queue.ids()
    }

    /// Registers the watchdog of this endpoint's connection. Only a weak
    /// reference is kept.
    pub fn attach_watchdog(&self, watchdog: &Arc<ConnectionWatchdog>) {
        *self.watchdog.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(watchdog);
    }

    pub fn watchdog(&self) -> Option<Arc<ConnectionWatchdog>> {
        self.watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    fn router(&self) -> Option<Arc<dyn CommandRouter>> {
        self.router.as_ref().and_then(Weak::upgrade)
    }

    /// Connects to this endpoint's address and activates the connection.
    pub async fn establish(
        self: &Arc<Self>,
        stats: Arc<ConnectionStats>,
    ) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::EndpointClosed);
        }
        let events: Arc<dyn ConnectionEvents> = self.clone();
        let connection = connect(
            &self.address,
            Arc::downgrade(&events),
            stats,
            self.options.connect_timeout,
        )
        .await?;
        self.activate(connection)
    }

    /// Makes `connection` current and re-sends every queued command on it.
    ///
    /// Refused once `close()` has begun: the connection is released and
    /// [`ConnectionError::EndpointClosed`] returned.
    pub fn activate(&self, connection: ConnectionHandle) -> Result<(), ConnectionError> {
        let _enter = self.span.enter();
        let mut state = self.lock();

        if state.lifecycle.is_closed() {
            drop(state);
            connection.release();
            return Err(ConnectionError::EndpointClosed);
        }

        let connection_id = connection.id();
        if let Some(previous) = state.connection.replace(connection) {
            previous.release();
        }
        state.lifecycle = Lifecycle::Open;
        state.clear_outbound();
        state.stale_replies = 0;

        let discarded = state.queue.remove_done();
        let pending = state.queue.drain_and_clear();
        let mut failed = Vec::new();
        for command in pending {
            let mut frame = BytesMut::new();
            match command.encode(&mut frame) {
                Ok(()) => {
                    if let Err(e) = state.queue.enqueue(command.clone()) {
                        failed.push((command, e));
                        continue;
                    }
                    state.outbound.extend_from_slice(&frame);
                    state.unflushed += 1;
                }
                Err(e) => failed.push((command, e)),
            }
        }

        let replayed = state.queue.len();
        let lost = self.flush_locked(&mut state);
        drop(state);

        info!(
            connection = connection_id,
            replayed, discarded, "Connection activated"
        );
        for (command, e) in failed {
            warn!(command_id = command.id(), error = %e, "Command failed on replay");
            command.complete_exceptionally(e);
        }
        if lost {
            self.connection_lost();
        }
        Ok(())
    }

    /// Writes several commands back to back. Commands already settled are
    /// skipped; a command that fails to encode is failed alone.
    pub fn write_all(&self, commands: Vec<SharedCommand>) -> Result<(), CommandError> {
        let _enter = self.span.enter();
        let mut state = self.lock();

        match state.lifecycle {
            Lifecycle::Closing | Lifecycle::Closed => return Err(CommandError::Closed),
            Lifecycle::Disconnected if self.options.reject_when_disconnected => {
                return Err(CommandError::Disconnected)
            }
            _ => {}
        }
        if state.queue.len() + commands.len() > self.options.request_queue_size {
            return Err(CommandError::QueueFull(self.options.request_queue_size));
        }

        let mut result = Ok(());
        let mut failed = Vec::new();
        let mut frame = BytesMut::new();
        for command in commands {
            if command.is_done() {
                trace!(command_id = command.id(), "Skipping settled command");
                continue;
            }
            frame.clear();
            if let Err(e) = command.encode(&mut frame) {
                failed.push((command, e));
                continue;
            }
            if let Err(e) = state.queue.enqueue(command.clone()) {
                result = Err(e);
                break;
            }
            if state.connection.is_some() {
                state.outbound.extend_from_slice(&frame);
                state.unflushed += 1;
            }
            trace!(command_id = command.id(), name = command.name(), "Command queued");
        }

        let lost = state.auto_flush && self.flush_locked(&mut state);
        drop(state);

        for (command, e) in failed {
            warn!(command_id = command.id(), error = %e, "Command could not be encoded");
            command.complete_exceptionally(e);
        }
        if lost {
            self.connection_lost();
        }
        result
    }

    pub fn set_auto_flush_commands(&self, auto_flush: bool) {
        let lost = {
            let mut state = self.lock();
            state.auto_flush = auto_flush;
            auto_flush && self.flush_locked(&mut state)
        };
        if lost {
            self.connection_lost();
        }
    }

    pub fn flush_commands(&self) {
        let lost = self.flush_locked(&mut self.lock());
        if lost {
            self.connection_lost();
        }
    }

    /// Hands the outbound buffer to the connection and marks the commands
    /// behind it in flight. Returns `true` when the connection turned out to
    /// be gone; the endpoint is then disconnected and the caller must run
    /// [`Endpoint::connection_lost`] after unlocking.
    fn flush_locked(&self, state: &mut EndpointState) -> bool {
        if state.outbound.is_empty() || state.connection.is_none() {
            return false;
        }
        let bytes = state.outbound.split().freeze();
        let sent = match state.connection.as_ref() {
            Some(connection) => connection.send(bytes),
            None => return false,
        };
        match sent {
            Ok(()) => {
                for command in state.queue.iter().rev().take(state.unflushed) {
                    command.mark_in_flight();
                }
                state.unflushed = 0;
                false
            }
            Err(e) => {
                warn!(error = %e, "Connection gone while flushing, commands stay queued");
                state.connection = None;
                state.mark_disconnected();
                true
            }
        }
    }

    /// Lets the watchdog reconnect, or closes the endpoint when there is no
    /// watchdog.
    fn connection_lost(&self) {
        match self.watchdog() {
            Some(watchdog) => watchdog.connection_lost(),
            None => {
                debug!(address = %self.address, "Connection lost without watchdog, closing endpoint");
                self.close();
            }
        }
    }

    /// Closes the endpoint: `Open|Disconnected → Closing → Closed`.
    ///
    /// Reconnection is suspended before the queue is drained. Drained
    /// commands that never reached the connection go back through the
    /// router: all of them when the connection was not live, the unflushed
    /// tail otherwise. Commands already on the wire, or any command when
    /// there is no router, fail with [`CommandError::Closed`]. Later calls
    /// do nothing.
    pub fn close(&self) {
        let _enter = self.span.enter();
        if let Some(watchdog) = self.watchdog() {
            watchdog.set_reconnect_suspended(true);
        }

        let (connection, mut pending, unflushed) = {
            let mut state = self.lock();
            if state.lifecycle.is_closed() {
                return;
            }
            state.lifecycle = Lifecycle::Closing;
            let unflushed = state.unflushed;
            state.clear_outbound();
            (state.connection.take(), state.queue.drain_and_clear(), unflushed)
        };

        let live = connection.as_ref().is_some_and(ConnectionHandle::is_open);
        let unsent = if live {
            pending.split_off(pending.len().saturating_sub(unflushed))
        } else {
            std::mem::take(&mut pending)
        };
        debug!(
            sent = pending.len(),
            unsent = unsent.len(),
            live,
            "Closing endpoint"
        );

        for command in pending {
            command.complete_exceptionally(CommandError::Closed);
        }
        match self.router() {
            Some(router) => {
                for command in unsent {
                    if command.is_done() {
                        trace!(command_id = command.id(), "Dropping settled command");
                        continue;
                    }
                    trace!(command_id = command.id(), "Requeueing command");
                    if let Err(e) = router.requeue(command.clone()) {
                        warn!(command_id = command.id(), error = %e, "Requeue failed");
                        command.complete_exceptionally(e);
                    }
                }
            }
            None => {
                for command in unsent {
                    command.complete_exceptionally(CommandError::Closed);
                }
            }
        }

        if let Some(connection) = connection {
            connection.release();
        }
        self.lock().lifecycle = Lifecycle::Closed;
        info!("Endpoint closed");
    }

    /// Fails every queued command with [`CommandError::Reset`] without
    /// resubmitting any of them.
    ///
    /// Replies for commands already on the wire can no longer be matched.
    /// With a watchdog the connection is dropped and replaced; without one it
    /// is kept and those replies are skipped as they arrive.
    pub fn reset_commands(&self) {
        let _enter = self.span.enter();
        let watchdog = self.watchdog();
        let (pending, connection) = {
            let mut state = self.lock();
            let pending = state.queue.drain_and_clear();
            let sent = pending.len().saturating_sub(state.unflushed);
            state.clear_outbound();
            let connection = if sent == 0 || state.connection.is_none() {
                None
            } else if watchdog.is_some() {
                let connection = state.connection.take();
                state.mark_disconnected();
                connection
            } else {
                state.stale_replies += sent;
                None
            };
            (pending, connection)
        };

        debug!(reset = pending.len(), "Resetting commands");
        for command in pending {
            command.complete_exceptionally(CommandError::Reset);
        }
        if let Some(connection) = connection {
            connection.release();
            if let Some(watchdog) = watchdog {
                watchdog.connection_lost();
            }
        }
    }

    /// Fails the queued commands of an endpoint that has no connection.
    /// Does nothing while connected: those commands are on the wire.
    pub fn fail_queued(&self, error: CommandError) -> usize {
        let pending = {
            let mut state = self.lock();
            if state.connection.is_some() {
                return 0;
            }
            state.clear_outbound();
            state.queue.drain_and_clear()
        };
        for command in &pending {
            command.complete_exceptionally(error.clone());
        }
        pending.len()
    }

    /// Request/reply correspondence is lost: close for good and fail
    /// everything outstanding.
    fn tear_down(&self, reason: CommandError) {
        if let Some(watchdog) = self.watchdog() {
            watchdog.set_reconnect_suspended(true);
        }
        let (connection, pending) = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
            state.clear_outbound();
            (state.connection.take(), state.queue.drain_and_clear())
        };

        error!(error = %reason, failed = pending.len(), "Tearing down endpoint");
        if let Some(connection) = connection {
            connection.release();
        }
        for command in pending {
            command.complete_exceptionally(reason.clone());
        }
    }

    fn is_current(state: &EndpointState, connection_id: u64) -> bool {
        state
            .connection
            .as_ref()
            .is_some_and(|connection| connection.id() == connection_id)
    }
}

impl ConnectionEvents for Endpoint {
    fn on_reply(&self, connection_id: u64, reply: RespValue) {
        let _enter = self.span.enter();
        let command = {
            let mut state = self.lock();
            if !Self::is_current(&state, connection_id) {
                trace!(connection = connection_id, "Reply from stale connection ignored");
                return;
            }
            if state.stale_replies > 0 {
                state.stale_replies -= 1;
                trace!(connection = connection_id, "Reply for reset command skipped");
                return;
            }
            match state.queue.dequeue_matching_reply() {
                Some(command) => command,
                None => {
                    drop(state);
                    self.tear_down(CommandError::Protocol(
                        "reply received with no command outstanding".to_string(),
                    ));
                    return;
                }
            }
        };

        if command.is_cancelled() {
            trace!(command_id = command.id(), "Reply for cancelled command discarded");
            return;
        }

        if let Some(redirect) = reply.as_error().and_then(Redirect::parse) {
            if let Some(router) = self.router() {
                debug!(command_id = command.id(), redirect = %redirect, "Redirecting command");
                router.redirect(command, redirect);
                return;
            }
        }

        command.complete(reply);
    }

    fn on_connection_lost(&self, connection_id: u64) {
        let _enter = self.span.enter();
        {
            let mut state = self.lock();
            if !Self::is_current(&state, connection_id) {
                return;
            }
            state.connection = None;
            state.mark_disconnected();
            debug!(
                connection = connection_id,
                queued = state.queue.len(),
                "Connection lost"
            );
        }
        self.connection_lost();
    }

    fn on_protocol_error(&self, connection_id: u64, error: ParseError) {
        let current = Self::is_current(&self.lock(), connection_id);
        if current {
            self.tear_down(CommandError::Protocol(error.to_string()));
        }
    }
}

impl ChannelWriter for Endpoint {
    fn write(&self, command: SharedCommand) -> Result<(), CommandError> {
        self.write_all(vec![command])
    }

    fn set_auto_flush_commands(&self, auto_flush: bool) {
        Endpoint::set_auto_flush_commands(self, auto_flush);
    }

    fn flush_commands(&self) {
        Endpoint::flush_commands(self);
    }

    fn reset(&self) {
        self.reset_commands();
    }

    fn close(&self) {
        Endpoint::close(self);
    }
}
