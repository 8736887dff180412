use crate::error::{FsError, FsResult};
use crate::util::normalize_name;
use log::warn;
use std::collections::HashMap;

pub type NodeId = u64;

/// The kernel addresses the export root by the protocol's fixed id.
pub const ROOT_NID: NodeId = crate::proto::FUSE_ROOT_ID;

/// Fixed assembly buffer for backing paths; the last byte is reserved,
/// matching the classic 1023-byte path limit.
pub const PATH_BUFFER_SIZE: usize = 1024;

/// One name the kernel has learned about. `refcount` counts the parent
/// link (+1 while attached), cached children (+1 each), and outstanding
/// kernel lookups (+1 per delivered lookup-style reply).
#[derive(Debug)]
pub struct Node {
    pub nid: NodeId,
    pub generation: u64,
    pub name: Vec<u8>,
    pub parent: Option<NodeId>,
    children: Vec<NodeId>,
    pub refcount: u32,
}

/// Tree of known nodes keyed by node id. Ids come from a monotonically
/// increasing counter; the kernel only requires `(nid, gen)` stability
/// and uniqueness. Single-owner: the request loop is the sole caller,
/// so everything takes `&mut self`.
#[derive(Debug)]
pub struct NodeStore {
    nodes: HashMap<NodeId, Node>,
    next_nid: NodeId,
    next_generation: u64,
    case_fold: bool,
}

impl NodeStore {
    /// Root node carries the absolute backing path as its name and a
    /// refcount seeded at 2 so normal release can never destroy it.
    pub fn new(root_path: &[u8], case_fold: bool) -> Self {
        let root = Node {
            nid: ROOT_NID,
            generation: 0,
            name: root_path.to_vec(),
            parent: None,
            children: Vec::new(),
            refcount: 2,
        };
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NID, root);
        Self {
            nodes,
            next_nid: ROOT_NID + 1,
            next_generation: 0,
            case_fold,
        }
    }

    pub fn get(&self, nid: NodeId) -> Option<&Node> {
        self.nodes.get(&nid)
    }

    pub fn resolve(&self, nid: NodeId) -> FsResult<&Node> {
        self.nodes.get(&nid).ok_or(FsError::NotFound)
    }

    #[allow(dead_code)] // invariant checks in the tests
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Linear scan of a parent's children for an exact name match.
    pub fn child_by_name(&self, parent: NodeId, name: &[u8]) -> Option<NodeId> {
        let parent = self.nodes.get(&parent)?;
        parent
            .children
            .iter()
            .copied()
            .find(|nid| self.nodes.get(nid).is_some_and(|n| n.name == name))
    }

    /// Existing child of that name, or a fresh node attached under the
    /// parent. The caller has already confirmed the backing entry exists.
    pub fn lookup_or_create(&mut self, parent: NodeId, name: &[u8]) -> FsResult<NodeId> {
        if let Some(existing) = self.child_by_name(parent, name) {
            return Ok(existing);
        }
        self.create_child(parent, name)
    }

    fn create_child(&mut self, parent: NodeId, name: &[u8]) -> FsResult<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return Err(FsError::NotFound);
        }
        let mut stored_name = Vec::new();
        stored_name
            .try_reserve_exact(name.len())
            .map_err(|_| FsError::NoMemory)?;
        stored_name.extend_from_slice(name);

        let nid = self.next_nid;
        self.next_nid += 1;
        let generation = self.next_generation;
        self.next_generation += 1;

        let node = Node {
            nid,
            generation,
            name: stored_name,
            parent: Some(parent),
            children: Vec::new(),
            refcount: 1,
        };
        self.nodes.insert(nid, node);
        self.attach_child(parent, nid)?;
        Ok(nid)
    }

    /// One more kernel reference, taken after a lookup-style reply is
    /// successfully delivered.
    pub fn acquire(&mut self, nid: NodeId) {
        if let Some(node) = self.nodes.get_mut(&nid) {
            node.refcount += 1;
        }
    }

    /// Drop one reference. When only the parent link remains the node is
    /// spliced out of the tree, destroyed, and the parent released in
    /// turn. Returns true if the node was destroyed.
    pub fn release(&mut self, nid: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&nid) else {
            warn!("release of unknown node {nid:#x}");
            return false;
        };
        if node.refcount == 0 {
            warn!("refcount underflow on node {nid:#x}");
            return false;
        }
        node.refcount -= 1;
        if nid == ROOT_NID || node.refcount != 1 || !node.children.is_empty() {
            return false;
        }

        let Some(node) = self.nodes.remove(&nid) else {
            return false;
        };
        if let Some(parent_nid) = node.parent {
            if let Some(parent) = self.nodes.get_mut(&parent_nid) {
                parent.children.retain(|&child| child != nid);
            }
            self.release(parent_nid);
        }
        true
    }

    /// Apply a forget's `nlookup` count; excess decrements past the
    /// node's lifetime are logged and ignored.
    pub fn forget(&mut self, nid: NodeId, nlookup: u64) {
        for applied in 0..nlookup {
            if !self.nodes.contains_key(&nid) {
                warn!(
                    "forget of node {nid:#x} exceeds outstanding lookups by {}",
                    nlookup - applied
                );
                return;
            }
            self.release(nid);
        }
    }

    /// Unhook a child from its parent, dropping the parent's refcount by
    /// one. No destruction check: rename re-attaches immediately and the
    /// forget path is the only place nodes die.
    pub fn detach_child(&mut self, parent: NodeId, child: NodeId) -> FsResult<()> {
        {
            let parent_node = self.nodes.get_mut(&parent).ok_or(FsError::NotFound)?;
            let position = parent_node
                .children
                .iter()
                .position(|&nid| nid == child)
                .ok_or(FsError::NotFound)?;
            parent_node.children.remove(position);
            if parent_node.refcount > 0 {
                parent_node.refcount -= 1;
            } else {
                warn!("refcount underflow detaching from node {parent:#x}");
            }
        }
        if let Some(child_node) = self.nodes.get_mut(&child) {
            child_node.parent = None;
        }
        Ok(())
    }

    /// Hook a node under a (new) parent, bumping the parent's refcount.
    pub fn attach_child(&mut self, parent: NodeId, child: NodeId) -> FsResult<()> {
        if !self.nodes.contains_key(&child) {
            return Err(FsError::NotFound);
        }
        {
            let parent_node = self.nodes.get_mut(&parent).ok_or(FsError::NotFound)?;
            parent_node.children.push(child);
            parent_node.refcount += 1;
        }
        if let Some(child_node) = self.nodes.get_mut(&child) {
            child_node.parent = Some(parent);
        }
        Ok(())
    }

    /// Replace a node's name in place, keeping `(nid, gen)` untouched.
    pub fn set_name(&mut self, nid: NodeId, name: &[u8]) -> FsResult<()> {
        let node = self.nodes.get_mut(&nid).ok_or(FsError::NotFound)?;
        let mut stored_name = Vec::new();
        stored_name
            .try_reserve_exact(name.len())
            .map_err(|_| FsError::NoMemory)?;
        stored_name.extend_from_slice(name);
        node.name = stored_name;
        Ok(())
    }

    /// Absolute backing path for a node, with an optional extra trailing
    /// component, assembled right-to-left in a fixed buffer. The root's
    /// name is an absolute path and lands verbatim as the leftmost
    /// segment; every other segment gets a `/` separator. Overflow is
    /// `ENAMETOOLONG`. The assembled path is case-normalized when
    /// folding is enabled.
    pub fn path_for(&self, nid: NodeId, extra: Option<&[u8]>) -> FsResult<Vec<u8>> {
        let mut buf = [0u8; PATH_BUFFER_SIZE];
        let mut start = PATH_BUFFER_SIZE - 1;

        let mut prepend = |buf: &mut [u8; PATH_BUFFER_SIZE], segment: &[u8]| -> FsResult<()> {
            if segment.len() > start {
                return Err(FsError::NameTooLong);
            }
            start -= segment.len();
            buf[start..start + segment.len()].copy_from_slice(segment);
            Ok(())
        };

        if let Some(extra) = extra {
            prepend(&mut buf, extra)?;
            prepend(&mut buf, b"/")?;
        }

        let mut current = nid;
        loop {
            let node = self.resolve(current)?;
            match node.parent {
                Some(parent) => {
                    prepend(&mut buf, &node.name)?;
                    prepend(&mut buf, b"/")?;
                    current = parent;
                }
                None if current == ROOT_NID => {
                    prepend(&mut buf, &node.name)?;
                    break;
                }
                // Detached (a rename evicted it); no path leads here.
                None => return Err(FsError::NotFound),
            }
        }

        let mut path = buf[start..PATH_BUFFER_SIZE - 1].to_vec();
        if self.case_fold {
            normalize_name(&mut path);
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> NodeStore {
        NodeStore::new(b"/data/media", false)
    }

    /// Mimic a delivered lookup-style reply: find-or-create plus the
    /// kernel reference.
    fn lookup(store: &mut NodeStore, parent: NodeId, name: &[u8]) -> NodeId {
        let nid = store.lookup_or_create(parent, name).expect("lookup");
        store.acquire(nid);
        nid
    }

    #[test]
    fn path_reconstruction_walks_to_root() {
        let mut store = store();
        let dir = lookup(&mut store, ROOT_NID, b"dcim");
        let file = lookup(&mut store, dir, b"img_0001.jpg");

        assert_eq!(
            store.path_for(file, None).unwrap(),
            b"/data/media/dcim/img_0001.jpg".to_vec()
        );
        assert_eq!(
            store.path_for(dir, Some(b"extra")).unwrap(),
            b"/data/media/dcim/extra".to_vec()
        );
        assert_eq!(store.path_for(ROOT_NID, None).unwrap(), b"/data/media");
    }

    #[test]
    fn path_buffer_boundary_is_exact() {
        // Root name (11) + '/' + name: an exact fill of the 1023 usable
        // bytes succeeds, one byte more does not.
        let mut store = store();
        let fit = vec![b'a'; PATH_BUFFER_SIZE - 1 - 11 - 1];
        let nid = lookup(&mut store, ROOT_NID, &fit);
        let path = store.path_for(nid, None).unwrap();
        assert_eq!(path.len(), PATH_BUFFER_SIZE - 1);

        let over = vec![b'b'; PATH_BUFFER_SIZE - 1 - 11];
        let nid = store.lookup_or_create(ROOT_NID, &over).unwrap();
        assert_eq!(store.path_for(nid, None), Err(FsError::NameTooLong));
    }

    #[test]
    fn case_folding_applies_to_assembled_paths() {
        let mut store = NodeStore::new(b"/data/media", true);
        let nid = lookup(&mut store, ROOT_NID, b"Foo.TXT");
        assert_eq!(
            store.path_for(nid, None).unwrap(),
            b"/data/media/foo.txt".to_vec()
        );
        // The cached name itself keeps its original case.
        assert_eq!(store.get(nid).unwrap().name, b"Foo.TXT");
    }

    #[test]
    fn repeated_lookups_reuse_the_node() {
        let mut store = store();
        let first = lookup(&mut store, ROOT_NID, b"x");
        let second = lookup(&mut store, ROOT_NID, b"x");
        assert_eq!(first, second);
        assert_eq!(store.get(first).unwrap().refcount, 3);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn forget_balancing_destroys_on_last_reference() {
        let mut store = store();
        let nid = lookup(&mut store, ROOT_NID, b"x");
        lookup(&mut store, ROOT_NID, b"x");
        lookup(&mut store, ROOT_NID, b"x");

        store.forget(nid, 2);
        let node = store.get(nid).expect("still cached");
        // One outstanding lookup plus the parent link.
        assert_eq!(node.refcount, 2);

        store.forget(nid, 1);
        assert!(store.get(nid).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(ROOT_NID).unwrap().refcount, 2);
    }

    #[test]
    fn forget_excess_does_not_underflow() {
        let mut store = store();
        let nid = lookup(&mut store, ROOT_NID, b"x");
        store.forget(nid, 100);
        assert!(store.get(nid).is_none());
        assert_eq!(store.get(ROOT_NID).unwrap().refcount, 2);
    }

    #[test]
    fn destroying_a_leaf_releases_parents_recursively() {
        let mut store = store();
        let dir = lookup(&mut store, ROOT_NID, b"a");
        let file = lookup(&mut store, dir, b"x");

        // Parent holds: attachment + one lookup + one cached child.
        assert_eq!(store.get(dir).unwrap().refcount, 3);

        store.forget(file, 1);
        assert!(store.get(file).is_none());
        assert_eq!(store.get(dir).unwrap().refcount, 2);

        store.forget(dir, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rename_moves_node_keeping_identity() {
        let mut store = store();
        let a = lookup(&mut store, ROOT_NID, b"a");
        let b = lookup(&mut store, ROOT_NID, b"b");
        let x = lookup(&mut store, a, b"x");
        let generation = store.get(x).unwrap().generation;

        store.detach_child(a, x).unwrap();
        store.set_name(x, b"y").unwrap();
        store.attach_child(b, x).unwrap();

        assert!(store.child_by_name(a, b"x").is_none());
        assert_eq!(store.child_by_name(b, b"y"), Some(x));
        assert_eq!(store.get(x).unwrap().generation, generation);
        assert_eq!(store.path_for(x, None).unwrap(), b"/data/media/b/y");

        // Parent refcounts moved with the child.
        assert_eq!(store.get(a).unwrap().refcount, 2);
        assert_eq!(store.get(b).unwrap().refcount, 3);
    }

    #[test]
    fn detached_nodes_have_no_path_and_die_on_forget() {
        let mut store = store();
        let stale = lookup(&mut store, ROOT_NID, b"victim");

        store.detach_child(ROOT_NID, stale).unwrap();
        assert_eq!(store.path_for(stale, None), Err(FsError::NotFound));
        assert_eq!(store.get(ROOT_NID).unwrap().refcount, 2);

        store.forget(stale, 1);
        assert!(store.get(stale).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn detach_of_unknown_child_leaves_store_unchanged() {
        let mut store = store();
        let a = lookup(&mut store, ROOT_NID, b"a");
        let before = store.get(a).unwrap().refcount;
        assert_eq!(store.detach_child(a, 999), Err(FsError::NotFound));
        assert_eq!(store.get(a).unwrap().refcount, before);
    }

    #[test]
    fn sibling_names_stay_unique() {
        let mut store = store();
        let first = store.lookup_or_create(ROOT_NID, b"dup").unwrap();
        let second = store.lookup_or_create(ROOT_NID, b"dup").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn fresh_nodes_get_increasing_ids_and_generations() {
        let mut store = store();
        let a = store.lookup_or_create(ROOT_NID, b"a").unwrap();
        let b = store.lookup_or_create(ROOT_NID, b"b").unwrap();
        assert!(b > a);
        assert!(store.get(b).unwrap().generation > store.get(a).unwrap().generation);
        assert_eq!(store.resolve(777).unwrap_err(), FsError::NotFound);
    }
}
