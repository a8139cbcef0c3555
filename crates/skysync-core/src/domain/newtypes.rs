//! Strongly-typed identifiers.
//!
//! Filesystem ids and cloud handles are opaque integers assigned by their
//! respective sides. Absence is modelled with `Option<_>` rather than a
//! sentinel value, so "has this node ever been synced" reads as
//! `synced_handle.is_some()` at every call site.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Filesystem-assigned stable identifier for one entry (inode or platform
/// analogue). May collide across volumes, so it is only compared between
/// entries of the same sync root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fsid(pub u64);

impl Display for Fsid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Server-assigned identifier for a cloud node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(pub u64);

impl Display for NodeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Tag identifying one in-flight cloud mutation. Further mutations of the
/// same cloud node are held back until its acknowledgement arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingChange(pub u64);

/// Ticket for a byte transfer handed to the transfer subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);
