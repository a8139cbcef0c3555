//! Domain entities shared by the engine and its adapters.

pub mod cloud;
pub mod fingerprint;
pub mod fsnode;
pub mod newtypes;
pub mod treestate;

pub use cloud::CloudNode;
pub use fingerprint::FileFingerprint;
pub use fsnode::{FsNode, NodeType};
pub use newtypes::{Fsid, NodeHandle, PendingChange, TransferId};
pub use treestate::TreeState;
