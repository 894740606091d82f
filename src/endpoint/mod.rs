//! Endpoint Module
//!
//! An endpoint is the driver's view of one server: the current connection
//! (if any), the FIFO of commands awaiting replies on it, and the lifecycle
//! that decides what happens to those commands when the connection drops or
//! the endpoint closes.
//!
//! ## Command Flow
//!
//! ```text
//!   write(cmd) ──> encode ──> queue.enqueue ──> outbound buffer ──> flush
//!                                  │
//!   reply ──> queue.dequeue_matching_reply ──┬──> complete(cmd)
//!                                            └──> router.redirect (MOVED/ASK)
//!
//!   close ──> drain queue ──┬──> router.requeue  (connection not live)
//!                           └──> fail(Closed)    (live, or no router)
//! ```
//!
//! Every state change of an endpoint happens inside its exclusive region
//! (see [`Endpoint::do_exclusive`]); completions and router callbacks run
//! after the region is left.

pub mod handler;
pub mod queue;

pub use handler::{Endpoint, EndpointState, Lifecycle};
pub use queue::CommandQueue;

use crate::cluster::Redirect;
use crate::command::{CommandError, SharedCommand};

/// Something commands can be written to: a single endpoint or a whole
/// cluster.
pub trait ChannelWriter: Send + Sync {
    /// Writes one command. On `Err` the command was not accepted and the
    /// caller owns its failure.
    fn write(&self, command: SharedCommand) -> Result<(), CommandError>;

    /// Enables or disables sending on every write. Enabling flushes.
    fn set_auto_flush_commands(&self, auto_flush: bool);

    /// Sends everything buffered since the last flush.
    fn flush_commands(&self);

    /// Fails every outstanding command with [`CommandError::Reset`].
    fn reset(&self);

    /// Closes the writer. Idempotent.
    fn close(&self);
}

/// Re-routes commands an endpoint can no longer serve.
pub trait CommandRouter: Send + Sync {
    /// Resubmits a command drained from a closing endpoint. `Err` means the
    /// command could not be placed anywhere.
    fn requeue(&self, command: SharedCommand) -> Result<(), CommandError>;

    /// Follows a MOVED or ASK reply received for `command`. The router owns
    /// the command's completion from here on.
    fn redirect(&self, command: SharedCommand, redirect: Redirect);
}
