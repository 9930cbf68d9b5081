// Path: crates/storage/src/hash_tree.rs
//! The persistent 16-ary hash trie over raw message bytes.
//!
//! Directories hold sixteen nybble-indexed slots, each empty, an inline
//! object reference, or a subdirectory carrying a 64-bit condensed hash of
//! its contents. The tree is semi-persistent: forking clones the root
//! handle in constant time, and every mutation path copies exactly the
//! shared directories it touches (`Rc::make_mut` is the fork-if-shared
//! discipline). All forks share one append-only object table.

use std::cell::RefCell;
use std::rc::Rc;
use synod_crypto::hash::{nybble, sha3, truncate_u64, HashAccumulator, MsgHash};
use synod_types::wire::{HtSlot, HASH_SIZE, HTDIR_SIZE};
use synod_types::Instant;

/// A short id naming an object within one hash-tree forest. Short ids are
/// allocated monotonically and never reused.
pub type Sid = u32;

/// One interned message.
struct StoredObject {
    hash: MsgHash,
    instant: Instant,
    data: Vec<u8>,
}

/// An owned view of one stored object.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ObjRef {
    /// The object's short id.
    pub sid: Sid,
    /// The instant stamped on the message when it was interned.
    pub instant: Instant,
    /// The raw message bytes.
    pub data: Vec<u8>,
    /// The full hash of the bytes.
    pub hash: MsgHash,
}

#[derive(Clone)]
enum DirEntry {
    Empty,
    Object(Sid),
    Sub { condensed: u64, dir: Rc<Directory> },
}

#[derive(Clone)]
struct Directory {
    entries: [DirEntry; HTDIR_SIZE],
}

impl Default for Directory {
    fn default() -> Self {
        Self {
            entries: std::array::from_fn(|_| DirEntry::Empty),
        }
    }
}

/// The outcome of [`HashTree::add`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddResult {
    /// The bytes were new and are now interned under this short id.
    Added(Sid),
    /// Byte-identical content was already present under this short id.
    AlreadyPresent(Sid),
}

impl AddResult {
    /// The short id regardless of outcome.
    pub fn sid(self) -> Sid {
        match self {
            AddResult::Added(sid) | AddResult::AlreadyPresent(sid) => sid,
        }
    }
}

/// A handle onto one version of the tree.
#[derive(Clone)]
pub struct HashTree {
    root: Rc<Directory>,
    table: Rc<RefCell<Vec<StoredObject>>>,
}

impl Default for HashTree {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTree {
    /// Creates an empty tree with a fresh object table.
    pub fn new() -> Self {
        Self {
            root: Rc::new(Directory::default()),
            table: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Forks this version in constant time. The fork shares the object
    /// table; mutations to either handle never affect the other's view.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// The number of objects in the shared table.
    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    /// Whether the shared table holds no objects at all.
    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    /// Interns a message, stamping it with the given instant.
    pub fn add(&mut self, data: &[u8], instant: Instant) -> AddResult {
        let hash = sha3(data);
        Self::add_to(&mut self.root, &self.table, &hash, 0, data, instant)
    }

    fn add_to(
        this: &mut Rc<Directory>,
        table: &Rc<RefCell<Vec<StoredObject>>>,
        hash: &MsgHash,
        offset: usize,
        data: &[u8],
        instant: Instant,
    ) -> AddResult {
        let ix = nybble(hash, offset) as usize;

        match &this.entries[ix] {
            DirEntry::Empty => {
                let sid = {
                    let mut table = table.borrow_mut();
                    let sid = table.len() as Sid;
                    table.push(StoredObject {
                        hash: *hash,
                        instant,
                        data: data.to_vec(),
                    });
                    sid
                };
                Rc::make_mut(this).entries[ix] = DirEntry::Object(sid);
                AddResult::Added(sid)
            }

            DirEntry::Object(sid) => {
                let sid = *sid;
                let existing_hash = table.borrow()[sid as usize].hash;
                if existing_hash == *hash {
                    return AddResult::AlreadyPresent(sid);
                }

                // Convert the inline object to a singleton subdirectory,
                // then descend into it as the directory case would.
                let mut sub = Directory::default();
                sub.entries[nybble(&existing_hash, offset + 1) as usize] = DirEntry::Object(sid);
                Rc::make_mut(this).entries[ix] = DirEntry::Sub {
                    condensed: 0,
                    dir: Rc::new(sub),
                };
                let result = Self::descend(this, table, hash, offset, ix, data, instant);
                Self::rehash(this, table, ix);
                result
            }

            DirEntry::Sub { .. } => {
                let result = Self::descend(this, table, hash, offset, ix, data, instant);
                Self::rehash(this, table, ix);
                result
            }
        }
    }

    fn descend(
        this: &mut Rc<Directory>,
        table: &Rc<RefCell<Vec<StoredObject>>>,
        hash: &MsgHash,
        offset: usize,
        ix: usize,
        data: &[u8],
        instant: Instant,
    ) -> AddResult {
        let dir = Rc::make_mut(this);
        match &mut dir.entries[ix] {
            DirEntry::Sub { dir: child, .. } => {
                Self::add_to(child, table, hash, offset + 1, data, instant)
            }
            // descend() is only called on Sub entries.
            _ => AddResult::AlreadyPresent(0),
        }
    }

    /// Recomputes the condensed hash of the subdirectory at `ix` from its
    /// children: object slots absorb the child's full hash, directory
    /// slots absorb the child's condensed hash.
    fn rehash(this: &mut Rc<Directory>, table: &Rc<RefCell<Vec<StoredObject>>>, ix: usize) {
        let condensed = {
            let DirEntry::Sub { dir: child, .. } = &this.entries[ix] else {
                return;
            };
            let table = table.borrow();
            let mut acc = HashAccumulator::new();
            for entry in &child.entries {
                match entry {
                    DirEntry::Empty => {}
                    DirEntry::Object(sid) => acc.absorb(&table[*sid as usize].hash),
                    DirEntry::Sub { condensed, .. } => acc.absorb(&condensed.to_le_bytes()),
                }
            }
            acc.finish_u64()
        };

        if let DirEntry::Sub { condensed: c, .. } = &mut Rc::make_mut(this).entries[ix] {
            *c = condensed;
        }
    }

    /// Looks a message up by full hash.
    pub fn get_by_hash(&self, hash: &MsgHash) -> Option<ObjRef> {
        let mut dir = &self.root;
        for n in 0..HASH_SIZE * 2 {
            let ix = nybble(hash, n) as usize;
            match &dir.entries[ix] {
                DirEntry::Empty => return None,
                DirEntry::Object(sid) => {
                    let found = self.get_by_id(*sid)?;
                    return (found.hash == *hash).then_some(found);
                }
                DirEntry::Sub { dir: child, .. } => dir = child,
            }
        }
        None
    }

    /// Looks a message up by short id.
    pub fn get_by_id(&self, sid: Sid) -> Option<ObjRef> {
        let table = self.table.borrow();
        let object = table.get(sid as usize)?;
        Some(ObjRef {
            sid,
            instant: object.instant,
            data: object.data.clone(),
            hash: object.hash,
        })
    }

    /// Walks objects in hash order starting from `start_hash`, returning
    /// up to `count` objects whose final hash byte, masked, equals
    /// `offset`.
    pub fn get_range(
        &self,
        start_hash: &MsgHash,
        offset: u8,
        mask: u8,
        count: usize,
    ) -> Vec<ObjRef> {
        let mut out = Vec::new();
        self.range_from_dir(&self.root, start_hash, 0, true, offset, mask, count, &mut out);
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn range_from_dir(
        &self,
        dir: &Rc<Directory>,
        hash: &MsgHash,
        hash_nybble: usize,
        restrict_hash: bool,
        offset: u8,
        mask: u8,
        count: usize,
        out: &mut Vec<ObjRef>,
    ) {
        let init = if restrict_hash {
            nybble(hash, hash_nybble) as usize
        } else {
            0
        };

        for ix in init..HTDIR_SIZE {
            if out.len() >= count {
                return;
            }
            match &dir.entries[ix] {
                DirEntry::Empty => {}
                DirEntry::Object(sid) => {
                    let table = self.table.borrow();
                    let object = &table[*sid as usize];
                    if object.hash[HASH_SIZE - 1] & mask == offset {
                        out.push(ObjRef {
                            sid: *sid,
                            instant: object.instant,
                            data: object.data.clone(),
                            hash: object.hash,
                        });
                    }
                }
                DirEntry::Sub { dir: child, .. } => {
                    self.range_from_dir(
                        child,
                        hash,
                        hash_nybble + 1,
                        restrict_hash && init == ix,
                        offset,
                        mask,
                        count,
                        out,
                    );
                }
            }
        }
    }

    /// Returns the wire slots of the directory reached by walking `offset`
    /// nybbles of `hash`, or `None` when that path is not a directory.
    /// Object slots carry the low 64 bits of the object's hash;
    /// subdirectory slots carry the condensed hash.
    pub fn readdir(&self, hash: &MsgHash, offset: usize) -> Option<[HtSlot; HTDIR_SIZE]> {
        let mut dir = &self.root;
        for n in 0..offset {
            let ix = nybble(hash, n) as usize;
            match &dir.entries[ix] {
                DirEntry::Sub { dir: child, .. } => dir = child,
                _ => return None,
            }
        }

        let table = self.table.borrow();
        Some(std::array::from_fn(|ix| match &dir.entries[ix] {
            DirEntry::Empty => HtSlot::Empty,
            DirEntry::Object(sid) => HtSlot::Object(truncate_u64(&table[*sid as usize].hash)),
            DirEntry::Sub { condensed, .. } => HtSlot::Dir(*condensed),
        }))
    }

    /// The number of nybbles of `hash` needed to disambiguate the terminal
    /// entry on its path; bounds the hash prefix a scan message must carry.
    pub fn minimum_hash_length(&self, hash: &MsgHash) -> usize {
        let mut dir = &self.root;
        for n in 0..HASH_SIZE * 2 {
            let ix = nybble(hash, n) as usize;
            match &dir.entries[ix] {
                DirEntry::Sub { dir: child, .. } => dir = child,
                _ => return n + 1,
            }
        }
        HASH_SIZE * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_returns_the_same_bytes() {
        let mut tree = HashTree::new();
        let result = tree.add(b"hello praetorians", 5);
        let AddResult::Added(sid) = result else {
            panic!("first add must intern");
        };

        let by_hash = tree.get_by_hash(&sha3(b"hello praetorians")).unwrap();
        assert_eq!(by_hash.data, b"hello praetorians");
        assert_eq!(by_hash.instant, 5);
        assert_eq!(by_hash.sid, sid);
        assert_eq!(tree.get_by_id(sid).unwrap(), by_hash);
    }

    #[test]
    fn duplicate_bytes_are_deduplicated() {
        let mut tree = HashTree::new();
        let first = tree.add(b"dup", 1);
        let second = tree.add(b"dup", 9);
        assert_eq!(second, AddResult::AlreadyPresent(first.sid()));
        // The original instant wins.
        assert_eq!(tree.get_by_id(first.sid()).unwrap().instant, 1);
    }

    #[test]
    fn forks_are_isolated_from_later_adds() {
        let mut tree = HashTree::new();
        tree.add(b"one", 1);
        let snapshot = tree.fork();

        for i in 0..200u32 {
            tree.add(&i.to_le_bytes(), i);
        }

        assert!(snapshot.get_by_hash(&sha3(b"one")).is_some());
        assert!(snapshot.get_by_hash(&sha3(&7u32.to_le_bytes())).is_none());
        assert!(tree.get_by_hash(&sha3(&7u32.to_le_bytes())).is_some());
    }

    #[test]
    fn range_respects_the_final_byte_filter() {
        let mut tree = HashTree::new();
        for i in 0..64u32 {
            tree.add(&i.to_le_bytes(), i);
        }

        let zero = [0u8; HASH_SIZE];
        let mask = 0x03;
        for offset in 0..4u8 {
            let hits = tree.get_range(&zero, offset, mask, 1000);
            assert!(!hits.is_empty(), "each residue class should be populated");
            assert!(hits
                .iter()
                .all(|o| o.hash[HASH_SIZE - 1] & mask == offset));
        }
        let total: usize = (0..4u8)
            .map(|offset| tree.get_range(&zero, offset, mask, 1000).len())
            .sum();
        assert_eq!(total, 64);
    }

    #[test]
    fn range_honours_the_count_limit_in_hash_order() {
        let mut tree = HashTree::new();
        for i in 0..64u32 {
            tree.add(&i.to_le_bytes(), i);
        }
        let zero = [0u8; HASH_SIZE];
        let limited = tree.get_range(&zero, 0, 0, 10);
        assert_eq!(limited.len(), 10);
        let hashes: Vec<_> = limited.iter().map(|o| o.hash).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted, "range walk must follow hash order");
    }

    #[test]
    fn readdir_reports_condensed_slots() {
        let mut tree = HashTree::new();
        for i in 0..300u32 {
            tree.add(&i.to_le_bytes(), i);
        }

        let root = tree.readdir(&[0u8; HASH_SIZE], 0).unwrap();
        assert!(
            root.iter().any(|s| matches!(s, HtSlot::Dir(_))),
            "300 objects must split at least one root slot"
        );

        // Descend into the first subdirectory and list it too.
        let ix = root
            .iter()
            .position(|s| matches!(s, HtSlot::Dir(_)))
            .unwrap();
        let mut path = [0u8; HASH_SIZE];
        path[0] = (ix as u8) << 4;
        assert!(tree.readdir(&path, 1).is_some());
    }

    #[test]
    fn condensed_hashes_agree_between_equal_trees() {
        let build = |order: &[u32]| {
            let mut tree = HashTree::new();
            for i in order {
                tree.add(&i.to_le_bytes(), *i);
            }
            tree
        };
        let a = build(&(0..300).collect::<Vec<_>>());
        let b = build(&(0..300).rev().collect::<Vec<_>>());
        assert_eq!(
            a.readdir(&[0u8; HASH_SIZE], 0),
            b.readdir(&[0u8; HASH_SIZE], 0),
            "directory condensation must be insertion-order independent"
        );
    }

    #[test]
    fn minimum_hash_length_grows_with_collisions() {
        let mut tree = HashTree::new();
        let hash = sha3(b"probe");
        assert_eq!(tree.minimum_hash_length(&hash), 1);
        tree.add(b"probe", 0);
        for i in 0..500u32 {
            tree.add(&i.to_le_bytes(), i);
        }
        assert!(tree.minimum_hash_length(&hash) >= 1);
        assert!(tree.minimum_hash_length(&hash) <= HASH_SIZE * 2);
    }
}
