use crate::node_store::NodeId;
use nix::dir::OwningIter;
use std::collections::HashMap;
use std::os::fd::OwnedFd;

/// An open resource: a backing fd for files, a consuming directory
/// stream for directories. The node id is informational.
pub enum Handle {
    File { nid: NodeId, fd: OwnedFd },
    Dir { nid: NodeId, stream: OwningIter },
}

/// Open handles keyed by the opaque token returned to the kernel. The
/// token space is its own counter, disjoint from node ids. Owned by the
/// request loop, hence `&mut self` throughout.
pub struct HandleTable {
    next_id: u64,
    entries: HashMap<u64, Handle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn insert_file(&mut self, nid: NodeId, fd: OwnedFd) -> u64 {
        self.insert(Handle::File { nid, fd })
    }

    pub fn insert_dir(&mut self, nid: NodeId, stream: OwningIter) -> u64 {
        self.insert(Handle::Dir { nid, stream })
    }

    pub fn get_file(&self, id: u64) -> Option<&OwnedFd> {
        match self.entries.get(&id) {
            Some(Handle::File { fd, .. }) => Some(fd),
            _ => None,
        }
    }

    pub fn get_dir_mut(&mut self, id: u64) -> Option<&mut OwningIter> {
        match self.entries.get_mut(&id) {
            Some(Handle::Dir { stream, .. }) => Some(stream),
            _ => None,
        }
    }

    /// Dropping the returned handle closes the underlying resource.
    pub fn remove(&mut self, id: u64) -> Option<Handle> {
        self.entries.remove(&id)
    }

    #[allow(dead_code)] // invariant checks in the tests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, handle: Handle) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, handle);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{OFlag, open};
    use nix::sys::stat::Mode;

    fn dev_null() -> OwnedFd {
        open("/dev/null", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()).expect("open")
    }

    #[test]
    fn tokens_are_distinct_and_kind_checked() {
        let mut table = HandleTable::new();
        let first = table.insert_file(5, dev_null());
        let second = table.insert_file(5, dev_null());
        assert_ne!(first, second);

        assert!(table.get_file(first).is_some());
        assert!(table.get_dir_mut(first).is_none());
        assert!(table.get_file(999).is_none());
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut table = HandleTable::new();
        let id = table.insert_file(3, dev_null());
        assert_eq!(table.len(), 1);
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert_eq!(table.len(), 0);
        assert!(table.get_file(id).is_none());
    }
}
