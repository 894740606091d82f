//! Command Queue
//!
//! The FIFO of commands awaiting a reply on one connection. RESP replies
//! arrive in the order commands were written, so the head of the queue is
//! always the command the next reply belongs to.
//!
//! The queue has no lock of its own: it lives inside the endpoint state and
//! every operation runs inside the endpoint's exclusive region.

use crate::command::{CommandError, CommandState, SharedCommand};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: VecDeque<SharedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `command` at the tail and marks it queued.
    ///
    /// A command that already sits in a queue is refused with
    /// [`CommandError::Protocol`]; one that already settled is refused with
    /// the state it settled in, as a [`CommandError::Protocol`] as well.
    pub fn enqueue(&mut self, command: SharedCommand) -> Result<(), CommandError> {
        match command.mark_queued() {
            Ok(()) => {
                self.commands.push_back(command);
                Ok(())
            }
            Err(CommandState::Queued) | Err(CommandState::InFlight) => Err(CommandError::Protocol(
                format!("command {} is already queued", command.id()),
            )),
            Err(state) => Err(CommandError::Protocol(format!(
                "command {} cannot be queued in state {:?}",
                command.id(),
                state
            ))),
        }
    }

    /// Pops the head for the reply that just arrived. `None` means a reply
    /// arrived with nothing outstanding.
    pub fn dequeue_matching_reply(&mut self) -> Option<SharedCommand> {
        let command = self.commands.pop_front()?;
        command.mark_detached();
        Some(command)
    }

    /// Removes every entry and returns them in queue order.
    pub fn drain_and_clear(&mut self) -> Vec<SharedCommand> {
        self.commands
            .drain(..)
            .inspect(|command| command.mark_detached())
            .collect()
    }

    /// Drops entries that settled while waiting (cancelled, failed).
    pub fn remove_done(&mut self) -> usize {
        let before = self.commands.len();
        self.commands.retain(|command| !command.is_done());
        before - self.commands.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SharedCommand> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Ids in queue order.
    pub fn ids(&self) -> Vec<u64> {
        self.commands.iter().map(|command| command.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandHandle, StatusOutput};

    fn command(name: &str) -> (SharedCommand, CommandHandle<String>) {
        let (command, handle) = Command::new(name, StatusOutput::new()).prepare();
        let shared: SharedCommand = command;
        (shared, handle)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = CommandQueue::new();
        let commands: Vec<_> = (0..3).map(|_| command("PING")).collect();
        for (c, _) in &commands {
            queue.enqueue(c.clone()).unwrap();
        }

        for (expected, _) in &commands {
            let head = queue.dequeue_matching_reply().unwrap();
            assert_eq!(head.id(), expected.id());
            assert_eq!(head.state(), CommandState::New);
        }
        assert!(queue.dequeue_matching_reply().is_none());
    }

    #[test]
    fn test_double_enqueue_is_refused() {
        let mut queue = CommandQueue::new();
        let mut other = CommandQueue::new();
        let (c, _h) = command("PING");

        queue.enqueue(c.clone()).unwrap();
        assert!(matches!(
            other.enqueue(c.clone()),
            Err(CommandError::Protocol(_))
        ));
        assert_eq!(queue.len(), 1);
        assert!(other.is_empty());
    }

    #[test]
    fn test_drain_and_clear_returns_snapshot() {
        let mut queue = CommandQueue::new();
        let (a, _ha) = command("A");
        let (b, _hb) = command("B");
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        let drained = queue.drain_and_clear();
        assert!(queue.is_empty());
        assert_eq!(
            drained.iter().map(|c| c.id()).collect::<Vec<_>>(),
            vec![a.id(), b.id()]
        );

        // Drained commands may move to another queue.
        let mut next = CommandQueue::new();
        next.enqueue(a).unwrap();
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn test_settled_command_is_refused() {
        let mut queue = CommandQueue::new();
        let (c, handle) = command("PING");
        handle.cancel();
        assert!(queue.enqueue(c).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_done() {
        let mut queue = CommandQueue::new();
        let (a, ha) = command("A");
        let (b, _hb) = command("B");
        queue.enqueue(a).unwrap();
        queue.enqueue(b.clone()).unwrap();

        ha.cancel();
        assert_eq!(queue.remove_done(), 1);
        assert_eq!(queue.ids(), vec![b.id()]);
    }
}
