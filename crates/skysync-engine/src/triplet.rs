//! Alignment of the three per-directory views into rows.
//!
//! Given the cloud children, the reconciled children and the filesystem
//! children of one directory, produce one row per logical entry holding
//! whichever of the three views has it.
//!
//! Pairing happens in two passes with two different comparators:
//!
//! 1. Filesystem entries pair with reconciled children by exact
//!    (case-sensitive) name, because the local child map is stored
//!    case-sensitively.
//! 2. Cloud children then attach to those rows under the comparison rules of
//!    the filesystem holding the sync root. A case-insensitive volume must
//!    match `Readme.md` to `README.md`, or a case-only rename would churn
//!    through endless delete/create cycles.
//!
//! Where several entries on one side share a name, the row records them all
//! as clashes and carries no view for that side, except that an entry
//! matching the reconciled child's fsid (or cloud handle) is kept so the
//! already-synced subtree keeps syncing while the clash is reported.

use skysync_core::domain::{CloudNode, FsNode, Fsid, NodeHandle};
use skysync_core::ports::NameCase;

use crate::tree::NodeId;

/// Reconciled-child reference carried through a pass.
#[derive(Debug, Clone)]
pub struct SyncChildRef {
    pub id: NodeId,
    pub name: String,
    pub fsid: Option<Fsid>,
    pub synced_handle: Option<NodeHandle>,
}

/// One aligned row of the three views.
#[derive(Debug, Default)]
pub struct SyncRow {
    pub cloud: Option<CloudNode>,
    pub sync: Option<SyncChildRef>,
    pub fs: Option<FsNode>,
    /// Filesystem entries sharing this row's name.
    pub fs_clashes: Vec<FsNode>,
    /// Cloud children sharing this row's name.
    pub cloud_clashes: Vec<CloudNode>,
    /// Set by destructive transitions while a subtree is mid-deletion.
    pub suppress_recursion: bool,
}

impl SyncRow {
    /// The row's display name, from whichever view is present.
    pub fn name(&self) -> Option<&str> {
        if let Some(sync) = &self.sync {
            return Some(&sync.name);
        }
        if let Some(fs) = &self.fs {
            return Some(&fs.name);
        }
        if let Some(fs) = self.fs_clashes.first() {
            return Some(&fs.name);
        }
        if let Some(cloud) = &self.cloud {
            return Some(&cloud.name);
        }
        self.cloud_clashes.first().map(|c| c.name.as_str())
    }

    pub fn has_clashes(&self) -> bool {
        !self.fs_clashes.is_empty() || !self.cloud_clashes.is_empty()
    }
}

/// Builds the rows for one directory.
pub fn compute_triplets(
    mut fs_nodes: Vec<FsNode>,
    mut sync_children: Vec<SyncChildRef>,
    mut cloud_nodes: Vec<CloudNode>,
    case: NameCase,
) -> Vec<SyncRow> {
    // Pass 1: filesystem entries vs reconciled children, exact names.
    fs_nodes.sort_by(|a, b| a.name.cmp(&b.name));
    sync_children.sort_by(|a, b| a.name.cmp(&b.name));

    let fs_groups = group_by(fs_nodes, |a, b| a.name == b.name);

    let mut rows: Vec<SyncRow> = Vec::new();
    let mut fs_iter = fs_groups.into_iter().peekable();
    let mut sync_iter = sync_children.into_iter().peekable();

    loop {
        let order = match (fs_iter.peek(), sync_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(group), Some(sync)) => group[0].name.cmp(&sync.name),
        };
        match order {
            std::cmp::Ordering::Less => {
                let group = fs_iter.next().expect("peeked");
                rows.push(row_from_fs_group(group, None));
            }
            std::cmp::Ordering::Greater => {
                let sync = sync_iter.next().expect("peeked");
                rows.push(SyncRow {
                    sync: Some(sync),
                    ..Default::default()
                });
            }
            std::cmp::Ordering::Equal => {
                let group = fs_iter.next().expect("peeked");
                let sync = sync_iter.next().expect("peeked");
                rows.push(row_from_fs_group(group, Some(sync)));
            }
        }
    }

    // Pass 2: attach cloud children under filesystem name rules.
    cloud_nodes.sort_by(|a, b| case.cmp_names(&a.name, &b.name));
    rows.sort_by(|a, b| case.cmp_names(a.name().unwrap_or(""), b.name().unwrap_or("")));

    let cloud_groups = group_by(cloud_nodes, |a, b| case.names_equal(&a.name, &b.name));

    let mut out: Vec<SyncRow> = Vec::new();
    let mut row_iter = rows.into_iter().peekable();
    let mut cloud_iter = cloud_groups.into_iter().peekable();

    loop {
        let order = match (row_iter.peek(), cloud_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(row), Some(group)) => {
                case.cmp_names(row.name().unwrap_or(""), &group[0].name)
            }
        };
        match order {
            std::cmp::Ordering::Less => out.push(row_iter.next().expect("peeked")),
            std::cmp::Ordering::Greater => {
                let group = cloud_iter.next().expect("peeked");
                out.push(row_from_cloud_group(group));
            }
            std::cmp::Ordering::Equal => {
                let mut row = row_iter.next().expect("peeked");
                let group = cloud_iter.next().expect("peeked");
                attach_cloud_group(&mut row, group);
                out.push(row);
            }
        }
    }

    out
}

/// Splits a sorted vector into runs of equal elements.
fn group_by<T>(items: Vec<T>, equal: impl Fn(&T, &T) -> bool) -> Vec<Vec<T>> {
    let mut groups: Vec<Vec<T>> = Vec::new();
    for item in items {
        match groups.last_mut() {
            Some(group) if equal(&group[0], &item) => group.push(item),
            _ => groups.push(vec![item]),
        }
    }
    groups
}

fn row_from_fs_group(group: Vec<FsNode>, sync: Option<SyncChildRef>) -> SyncRow {
    if group.len() == 1 {
        let mut group = group;
        return SyncRow {
            sync,
            fs: group.pop(),
            ..Default::default()
        };
    }

    // A name clash: keep no filesystem view unless one of the colliders is
    // the entry already being synced, identified by fsid.
    let chosen = sync.as_ref().and_then(|s| {
        let fsid = s.fsid?;
        group.iter().find(|n| n.fsid == Some(fsid)).cloned()
    });
    SyncRow {
        sync,
        fs: chosen,
        fs_clashes: group,
        ..Default::default()
    }
}

fn row_from_cloud_group(group: Vec<CloudNode>) -> SyncRow {
    if group.len() == 1 {
        let mut group = group;
        return SyncRow {
            cloud: group.pop(),
            ..Default::default()
        };
    }
    SyncRow {
        cloud_clashes: group,
        ..Default::default()
    }
}

fn attach_cloud_group(row: &mut SyncRow, group: Vec<CloudNode>) {
    if group.len() == 1 {
        let mut group = group;
        row.cloud = group.pop();
        return;
    }

    // Same tie-break as the filesystem side, by synced handle.
    row.cloud = row.sync.as_ref().and_then(|s| {
        let handle = s.synced_handle?;
        group.iter().find(|n| n.handle == handle).cloned()
    });
    row.cloud_clashes = group;
}
