//! Commands and Completion Handles
//!
//! A [`Command`] is one request/response exchange. The caller builds it with
//! an output, calls [`Command::prepare`] and keeps the returned
//! [`CommandHandle`]; the driver keeps the shared command and moves it between
//! queues, endpoints and redirections until exactly one of completion,
//! exceptional completion or cancellation settles it.
//!
//! ## State Machine
//!
//! ```text
//!             enqueue            bytes written
//!   ┌─────┐ ─────────> ┌────────┐ ──────────> ┌──────────┐
//!   │ New │            │ Queued │             │ InFlight │
//!   └─────┘ <───────── └────────┘ <────────── └──────────┘
//!      │     dequeue /      │     connection       │
//!      │     drain          │     lost             │
//!      ▼                    ▼                      ▼
//!   ┌───────────┐   ┌────────┐   ┌───────────┐
//!   │ Completed │   │ Failed │   │ Cancelled │   (terminal, first one wins)
//!   └───────────┘   └────────┘   └───────────┘
//! ```
//!
//! Only a `New` command may be enqueued, so a command can never sit in two
//! queues at once.

pub mod output;

pub use output::{
    decode_reply, CommandOutput, IntegerOutput, ListOutput, ListSubscriber, RespOutput,
    StatusOutput, StreamingOutput, StringListOutput, Subscriber, ValueListOutput, ValueOutput,
};

use crate::protocol::RespValue;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Errors delivered on a command's completion handle, or returned by writers
/// that refuse a command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The command was cancelled by the caller.
    #[error("command cancelled")]
    Cancelled,

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The command could not be encoded for the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// The endpoint or client has been closed.
    #[error("connection closed")]
    Closed,

    /// Pending work was abandoned through a reset.
    #[error("connection reset, command abandoned")]
    Reset,

    /// No connection is current and the endpoint rejects commands meanwhile.
    #[error("not connected, commands are rejected while disconnected")]
    Disconnected,

    /// The endpoint's request queue is at capacity.
    #[error("request queue full (max {0} commands)")]
    QueueFull(usize),

    /// Request/reply correspondence was lost on the connection.
    #[error("protocol desynchronized: {0}")]
    Protocol(String),

    /// The command bounced between nodes more often than allowed.
    #[error("too many redirects ({0})")]
    TooManyRedirects(u32),

    /// No node is known for the slot.
    #[error("no node serves slot {0}")]
    NoRoute(u16),

    /// A keyless command found no node to run on.
    #[error("no node available for keyless command")]
    NoNode,

    /// A caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The driver dropped the command without settling it.
    #[error("command dropped before completion")]
    Dropped,
}

/// Where a command is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    New,
    Queued,
    InFlight,
    Completed,
    Failed,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::Cancelled
        )
    }
}

/// The type-erased view of a command that queues, endpoints and writers work
/// with. Implemented by [`Command`].
pub trait RedisCommand: Send + Sync + fmt::Debug {
    /// Process-unique identity.
    fn id(&self) -> u64;

    /// Command name, e.g. `GET`.
    fn name(&self) -> &str;

    /// The key used for cluster routing, if any.
    fn key(&self) -> Option<&Bytes>;

    /// Appends the RESP frame for this command to `buf`.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CommandError>;

    fn state(&self) -> CommandState;

    /// Decodes `reply` into the output and settles the command. Returns
    /// `false` if the command had already settled; the output is untouched.
    fn complete(&self, reply: RespValue) -> bool;

    /// Settles the command with `error`. Returns `false` if already settled.
    fn complete_exceptionally(&self, error: CommandError) -> bool;

    /// Cancels the command. Returns `false` if already settled.
    fn cancel(&self) -> bool;

    fn is_cancelled(&self) -> bool {
        self.state() == CommandState::Cancelled
    }

    fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// `New -> Queued`. Fails with the current state otherwise.
    fn mark_queued(&self) -> Result<(), CommandState>;

    /// `Queued -> InFlight`, no-op in any other state.
    fn mark_in_flight(&self);

    /// `InFlight -> Queued`, for commands whose connection went away.
    fn mark_unsent(&self);

    /// `Queued | InFlight -> New`, for commands leaving a queue.
    fn mark_detached(&self);

    /// Counts one more redirection and returns the new total.
    fn record_redirect(&self) -> u32;
}

/// A command shared between the caller's handle and the driver.
pub type SharedCommand = Arc<dyn RedisCommand>;

/// State shared by a command and its handle. The completion sender is not
/// part of it: only the driver side owns that.
struct Inner<T> {
    state: CommandState,
    output: Option<Box<dyn CommandOutput<Output = T>>>,
}

type Completion<T> = oneshot::Sender<Result<T, CommandError>>;

fn lock_inner<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request/response command producing a `T`.
///
/// # Example
///
/// ```
/// use flashkv_driver::command::{Command, ValueOutput};
///
/// let (command, handle) = Command::new("GET", ValueOutput::new())
///     .key_arg("user:101")
///     .prepare();
/// assert_eq!(handle.id(), flashkv_driver::command::RedisCommand::id(&*command));
/// ```
pub struct Command<T> {
    id: u64,
    name: String,
    args: Vec<Bytes>,
    key: Option<Bytes>,
    redirects: AtomicU32,
    inner: Arc<Mutex<Inner<T>>>,
    completion: Mutex<Option<Completion<T>>>,
}

impl<T: Send + 'static> Command<T> {
    /// Creates a command whose reply is decoded by `output`.
    pub fn new(name: impl Into<String>, output: impl CommandOutput<Output = T> + 'static) -> Self {
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            args: Vec::new(),
            key: None,
            redirects: AtomicU32::new(0),
            inner: Arc::new(Mutex::new(Inner {
                state: CommandState::New,
                output: Some(Box::new(output)),
            })),
            completion: Mutex::new(None),
        }
    }

    /// Appends an opaque, already-encoded argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an argument that is also the routing key.
    pub fn key_arg(mut self, key: impl Into<Bytes>) -> Self {
        let key = key.into();
        self.args.push(key.clone());
        if self.key.is_none() {
            self.key = Some(key);
        }
        self
    }

    /// Wires up the completion channel and splits the command into the
    /// driver-side shared command and the caller-side handle.
    ///
    /// Only the shared command owns the completion sender: once the driver
    /// lets go of an unsettled command, the handle resolves to
    /// [`CommandError::Dropped`].
    pub fn prepare(mut self) -> (Arc<Self>, CommandHandle<T>) {
        let (tx, rx) = oneshot::channel();
        self.completion = Mutex::new(Some(tx));
        let handle = CommandHandle {
            id: self.id,
            inner: Arc::clone(&self.inner),
            receiver: rx,
        };
        (Arc::new(self), handle)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        lock_inner(&self.inner)
    }

    /// Settles under the command lock held by the caller.
    fn settle(&self, inner: &mut Inner<T>, state: CommandState, result: Result<T, CommandError>) {
        inner.state = state;
        inner.output = None;
        let completion = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(completion) = completion {
            // The caller may have dropped its handle; nothing to deliver then.
            let _ = completion.send(result);
        }
    }
}

impl<T: Send + 'static> RedisCommand for Command<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CommandError> {
        if self.name.is_empty() {
            return Err(CommandError::Encode("empty command name".to_string()));
        }
        RespValue::command(&self.name, &self.args).serialize_into(buf);
        Ok(())
    }

    fn state(&self) -> CommandState {
        self.lock().state
    }

    fn complete(&self, reply: RespValue) -> bool {
        // Decoding happens under the command lock, so a concurrent cancel
        // either wins before the output is touched or is a no-op afterwards.
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }

        let result = match reply {
            RespValue::Error(message) => Err(CommandError::Server(message)),
            reply => match inner.output.take() {
                Some(mut output) => match decode_reply(reply, output.as_mut()) {
                    Ok(()) => Ok(output.finish()),
                    Err(message) => Err(CommandError::Server(message)),
                },
                None => Err(CommandError::Protocol(
                    "command output already consumed".to_string(),
                )),
            },
        };

        let state = if result.is_ok() {
            CommandState::Completed
        } else {
            CommandState::Failed
        };
        self.settle(&mut inner, state, result);
        true
    }

    fn complete_exceptionally(&self, error: CommandError) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        self.settle(&mut inner, CommandState::Failed, Err(error));
        true
    }

    fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        self.settle(&mut inner, CommandState::Cancelled, Err(CommandError::Cancelled));
        true
    }

    fn mark_queued(&self) -> Result<(), CommandState> {
        let mut inner = self.lock();
        match inner.state {
            CommandState::New => {
                inner.state = CommandState::Queued;
                Ok(())
            }
            other => Err(other),
        }
    }

    fn mark_in_flight(&self) {
        let mut inner = self.lock();
        if inner.state == CommandState::Queued {
            inner.state = CommandState::InFlight;
        }
    }

    fn mark_unsent(&self) {
        let mut inner = self.lock();
        if inner.state == CommandState::InFlight {
            inner.state = CommandState::Queued;
        }
    }

    fn mark_detached(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, CommandState::Queued | CommandState::InFlight) {
            inner.state = CommandState::New;
        }
    }

    fn record_redirect(&self) -> u32 {
        self.redirects.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl<T> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Command");
        debug.field("id", &self.id).field("name", &self.name);
        // try_lock: Debug may run while the command lock is held.
        if let Ok(inner) = self.inner.try_lock() {
            debug.field("state", &inner.state);
        }
        debug.finish()
    }
}

/// The caller's side of a command: a future resolving to the command's
/// result, plus cancellation.
///
/// The handle stays the same object across any number of requeues and
/// redirections of the underlying command. It shares the command's state but
/// not its completion sender, so it never keeps a lost command alive.
pub struct CommandHandle<T> {
    id: u64,
    inner: Arc<Mutex<Inner<T>>>,
    receiver: oneshot::Receiver<Result<T, CommandError>>,
}

impl<T> CommandHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> CommandState {
        lock_inner(&self.inner).state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Cancels the command. Its reply, if one still arrives, is discarded and
    /// it will not be resubmitted by requeue or redirection.
    pub fn cancel(&self) -> bool {
        let mut inner = lock_inner(&self.inner);
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = CommandState::Cancelled;
        inner.output = None;
        true
    }
}

impl<T> Future for CommandHandle<T> {
    type Output = Result<T, CommandError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) if self.state() == CommandState::Cancelled => {
                Poll::Ready(Err(CommandError::Cancelled))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(CommandError::Dropped)),
            // Cancelled through this handle: nothing will be sent any more.
            Poll::Pending if self.state() == CommandState::Cancelled => {
                Poll::Ready(Err(CommandError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for CommandHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CommandHandle");
        debug.field("id", &self.id);
        if let Ok(inner) = self.inner.try_lock() {
            debug.field("state", &inner.state);
        }
        debug.finish()
    }
}
