//! MOVED / ASK error replies.
//!
//! ```text
//! -MOVED 3999 127.0.0.1:6381    slot 3999 now lives on 127.0.0.1:6381
//! -ASK 3999 127.0.0.1:6381      retry this one command there, after ASKING
//! ```

use crate::cluster::slot::SLOT_COUNT;
use crate::cluster::topology::NodeId;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Permanent: the slot moved, routing should be updated.
    Moved,
    /// One-shot: the slot is migrating, routing stays as is.
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub node: NodeId,
}

impl Redirect {
    /// Parses the message of an error reply. Anything that is not a
    /// well-formed MOVED or ASK yields `None`.
    pub fn parse(message: &str) -> Option<Self> {
        let mut parts = message.split_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let slot: u16 = parts.next()?.parse().ok()?;
        if slot >= SLOT_COUNT {
            return None;
        }
        let node = parts.next()?;
        if parts.next().is_some() || !node.contains(':') {
            return None;
        }
        Some(Self {
            kind,
            slot,
            node: NodeId::from(node),
        })
    }

    pub fn is_moved(&self) -> bool {
        self.kind == RedirectKind::Moved
    }

    pub fn is_ask(&self) -> bool {
        self.kind == RedirectKind::Ask
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RedirectKind::Moved => "MOVED",
            RedirectKind::Ask => "ASK",
        };
        write!(f, "{} {} {}", kind, self.slot, self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moved() {
        let redirect = Redirect::parse("MOVED 3999 127.0.0.1:6381").unwrap();
        assert_eq!(redirect.kind, RedirectKind::Moved);
        assert_eq!(redirect.slot, 3999);
        assert_eq!(redirect.node, NodeId::from("127.0.0.1:6381"));
        assert_eq!(redirect.to_string(), "MOVED 3999 127.0.0.1:6381");
    }

    #[test]
    fn test_parse_ask() {
        let redirect = Redirect::parse("ASK 12182 10.0.0.2:7000").unwrap();
        assert!(redirect.is_ask());
        assert_eq!(redirect.slot, 12182);
    }

    #[test]
    fn test_parse_rejects_other_errors() {
        assert_eq!(Redirect::parse("ERR unknown command"), None);
        assert_eq!(Redirect::parse("MOVED"), None);
        assert_eq!(Redirect::parse("MOVED abc 127.0.0.1:6381"), None);
        assert_eq!(Redirect::parse("MOVED 16384 127.0.0.1:6381"), None);
        assert_eq!(Redirect::parse("MOVED 1 nodewithoutport"), None);
        assert_eq!(Redirect::parse("ASK 1 127.0.0.1:1 extra"), None);
    }
}
