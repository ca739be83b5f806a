//! Trie node encodings
//!
//! Nodes are decoded into owned values on every access and encoded back on
//! every write; nothing keeps a reference into the arena between calls.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//!   Value    1 | len u32 | payload
//!   Sparse   2 | stamp u16 | value u32 | prefix_len u16 | count u16 | bytes [u8; count] | ids [u32; count] | prefix
//!   Dense    3 | stamp u16 | value u32 | prefix_len u16 | count u16 | ids [u32; 256] | prefix
//!   Cluster  4 | stamp u16 | prefix_len u16 | count u16 | prefix | (suffix_len u16 | value u32 | suffix) * count
//! ```
//!
//! A value id of 0 means "no value". Slots are zero padded past the encoded
//! length, so decoding never relies on the slice length.

use crate::directory::ObjectId;

/// A sparse table holding more children than this becomes dense
pub const SPARSE_MAX_CHILDREN: usize = 32;
/// A dense table holding this many children or fewer becomes sparse
pub const DENSE_MIN_CHILDREN: usize = 16;
/// Longest suffix a cluster entry may hold
pub const MAX_CLUSTER_SUFFIX: usize = 32;

const TAG_VALUE: u8 = 1;
const TAG_SPARSE: u8 = 2;
const TAG_DENSE: u8 = 3;
const TAG_CLUSTER: u8 = 4;

/// Kind of the node encoded in a byte slice, read from its tag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Value,
    Branch,
    Cluster,
}

impl NodeKind {
    pub fn of(bytes: &[u8]) -> NodeKind {
        NodeKind::try_of(bytes).unwrap_or_else(|| panic!("unknown node tag {:?}", bytes.first()))
    }

    /// Like [`NodeKind::of`], `None` on an unknown tag.
    pub fn try_of(bytes: &[u8]) -> Option<NodeKind> {
        match bytes.first()? {
            &TAG_VALUE => Some(NodeKind::Value),
            &TAG_SPARSE | &TAG_DENSE => Some(NodeKind::Branch),
            &TAG_CLUSTER => Some(NodeKind::Cluster),
            _ => None,
        }
    }
}

/// Child table of a branch node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchTable {
    /// Sorted branch bytes with a parallel id array
    Sparse { bytes: Vec<u8>, children: Vec<ObjectId> },
    /// Direct-indexed by branch byte
    Dense(Box<[Option<ObjectId>; 256]>),
}

impl Default for BranchTable {
    fn default() -> Self {
        BranchTable::Sparse { bytes: Vec::new(), children: Vec::new() }
    }
}

impl BranchTable {
    pub fn len(&self) -> usize {
        match self {
            BranchTable::Sparse { bytes, .. } => bytes.len(),
            BranchTable::Dense(slots) => slots.iter().filter(|s| s.is_some()).count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, BranchTable::Dense(_))
    }

    pub fn get(&self, byte: u8) -> Option<ObjectId> {
        match self {
            BranchTable::Sparse { bytes, children } => {
                bytes.binary_search(&byte).ok().map(|i| children[i])
            }
            BranchTable::Dense(slots) => slots[byte as usize],
        }
    }

    /// Set the child for `byte`, returning the one it replaces.
    pub fn insert(&mut self, byte: u8, child: ObjectId) -> Option<ObjectId> {
        let old = match self {
            BranchTable::Sparse { bytes, children } => match bytes.binary_search(&byte) {
                Ok(i) => Some(std::mem::replace(&mut children[i], child)),
                Err(i) => {
                    bytes.insert(i, byte);
                    children.insert(i, child);
                    None
                }
            },
            BranchTable::Dense(slots) => slots[byte as usize].replace(child),
        };
        self.refactor();
        old
    }

    pub fn remove(&mut self, byte: u8) -> Option<ObjectId> {
        let old = match self {
            BranchTable::Sparse { bytes, children } => match bytes.binary_search(&byte) {
                Ok(i) => {
                    bytes.remove(i);
                    Some(children.remove(i))
                }
                Err(_) => None,
            },
            BranchTable::Dense(slots) => slots[byte as usize].take(),
        };
        self.refactor();
        old
    }

    /// Switch encodings when the child count crosses a threshold.
    pub fn refactor(&mut self) {
        let len = self.len();
        match self {
            BranchTable::Sparse { bytes, children } if len > SPARSE_MAX_CHILDREN => {
                let mut slots = Box::new([None; 256]);
                for (b, c) in bytes.iter().zip(children.iter()) {
                    slots[*b as usize] = Some(*c);
                }
                *self = BranchTable::Dense(slots);
            }
            BranchTable::Dense(_) if len <= DENSE_MIN_CHILDREN => {
                let (bytes, children) = self.iter().unzip();
                *self = BranchTable::Sparse { bytes, children };
            }
            _ => {}
        }
    }

    /// Children in ascending byte order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (u8, ObjectId)> + '_> {
        match self {
            BranchTable::Sparse { bytes, children } => {
                Box::new(bytes.iter().copied().zip(children.iter().copied()))
            }
            BranchTable::Dense(slots) => Box::new(
                slots
                    .iter()
                    .enumerate()
                    .filter_map(|(b, c)| c.map(|c| (b as u8, c))),
            ),
        }
    }

    /// First child whose byte is `>= byte`.
    pub fn ceiling(&self, byte: u8) -> Option<(u8, ObjectId)> {
        match self {
            BranchTable::Sparse { bytes, children } => {
                let i = bytes.partition_point(|b| *b < byte);
                bytes.get(i).map(|b| (*b, children[i]))
            }
            BranchTable::Dense(slots) => (byte as usize..256)
                .find_map(|b| slots[b].map(|c| (b as u8, c))),
        }
    }

    /// First child whose byte is `> byte`.
    pub fn after(&self, byte: u8) -> Option<(u8, ObjectId)> {
        byte.checked_add(1).and_then(|b| self.ceiling(b))
    }

    /// Last child whose byte is `< byte`.
    pub fn before(&self, byte: u8) -> Option<(u8, ObjectId)> {
        match self {
            BranchTable::Sparse { bytes, children } => {
                let i = bytes.partition_point(|b| *b < byte);
                i.checked_sub(1).map(|i| (bytes[i], children[i]))
            }
            BranchTable::Dense(slots) => (0..byte as usize)
                .rev()
                .find_map(|b| slots[b].map(|c| (b as u8, c))),
        }
    }

    pub fn first(&self) -> Option<(u8, ObjectId)> {
        self.ceiling(0)
    }

    pub fn last(&self) -> Option<(u8, ObjectId)> {
        match self {
            BranchTable::Sparse { bytes, children } => {
                bytes.last().map(|b| (*b, children[children.len() - 1]))
            }
            BranchTable::Dense(slots) => (0..256usize)
                .rev()
                .find_map(|b| slots[b].map(|c| (b as u8, c))),
        }
    }
}

/// Interior node: shared prefix, optional value, child table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BranchNode {
    /// Revision that last wrote this node in place
    pub stamp: u16,
    pub prefix: Vec<u8>,
    /// Value of the key ending exactly at `prefix`
    pub value: Option<ObjectId>,
    pub table: BranchTable,
}

/// One key of a value cluster, relative to the cluster's prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEntry {
    pub suffix: Vec<u8>,
    pub value: ObjectId,
}

/// Leaf-heavy subtree flattened into a sorted suffix list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub stamp: u16,
    pub prefix: Vec<u8>,
    /// Sorted by suffix, never empty
    pub entries: Vec<ClusterEntry>,
}

impl ClusterNode {
    /// Index of `suffix`, or where it would be inserted.
    pub fn search(&self, suffix: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.suffix.as_slice().cmp(suffix))
    }
}

/// A decoded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Value(Vec<u8>),
    Branch(BranchNode),
    Cluster(ClusterNode),
}

/// Sequential little-endian reader over an encoded node.
struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let out = &self.bytes[self.at..self.at + n];
        self.at += n;
        out
    }

    fn u16(&mut self) -> u16 {
        let b = self.take(2);
        u16::from_le_bytes([b[0], b[1]])
    }

    fn u32(&mut self) -> u32 {
        let b = self.take(4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn id(&mut self) -> Option<ObjectId> {
        ObjectId::new(self.u32())
    }

    fn child(&mut self) -> ObjectId {
        let raw = self.u32();
        ObjectId::new(raw).unwrap_or_else(|| panic!("null child id at byte {}", self.at - 4))
    }
}

impl Node {
    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Value(payload) => 5 + payload.len(),
            Node::Branch(b) => {
                let table = match &b.table {
                    BranchTable::Sparse { bytes, .. } => bytes.len() * 5,
                    BranchTable::Dense(_) => 256 * 4,
                };
                11 + table + b.prefix.len()
            }
            Node::Cluster(c) => {
                7 + c.prefix.len() + c.entries.iter().map(|e| 6 + e.suffix.len()).sum::<usize>()
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        match self {
            Node::Value(payload) => return encode_value(payload),
            Node::Branch(b) => {
                buf.push(if b.table.is_dense() { TAG_DENSE } else { TAG_SPARSE });
                buf.extend_from_slice(&b.stamp.to_le_bytes());
                buf.extend_from_slice(&ObjectId::to_raw(b.value).to_le_bytes());
                buf.extend_from_slice(&(b.prefix.len() as u16).to_le_bytes());
                buf.extend_from_slice(&(b.table.len() as u16).to_le_bytes());
                match &b.table {
                    BranchTable::Sparse { bytes, children } => {
                        buf.extend_from_slice(bytes);
                        for c in children {
                            buf.extend_from_slice(&c.get().to_le_bytes());
                        }
                    }
                    BranchTable::Dense(slots) => {
                        for s in slots.iter() {
                            buf.extend_from_slice(&ObjectId::to_raw(*s).to_le_bytes());
                        }
                    }
                }
                buf.extend_from_slice(&b.prefix);
            }
            Node::Cluster(c) => {
                buf.push(TAG_CLUSTER);
                buf.extend_from_slice(&c.stamp.to_le_bytes());
                buf.extend_from_slice(&(c.prefix.len() as u16).to_le_bytes());
                buf.extend_from_slice(&(c.entries.len() as u16).to_le_bytes());
                buf.extend_from_slice(&c.prefix);
                for e in &c.entries {
                    buf.extend_from_slice(&(e.suffix.len() as u16).to_le_bytes());
                    buf.extend_from_slice(&e.value.get().to_le_bytes());
                    buf.extend_from_slice(&e.suffix);
                }
            }
        }
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf
    }

    /// Decode a node. Panics on an unknown tag: arena contents are trusted.
    pub fn decode(bytes: &[u8]) -> Node {
        let mut r = Reader { bytes, at: 1 };
        match NodeKind::of(bytes) {
            NodeKind::Value => {
                let len = r.u32() as usize;
                Node::Value(r.take(len).to_vec())
            }
            NodeKind::Branch => {
                let stamp = r.u16();
                let value = r.id();
                let prefix_len = r.u16() as usize;
                let count = r.u16() as usize;
                let table = if bytes[0] == TAG_DENSE {
                    let mut slots = Box::new([None; 256]);
                    for slot in slots.iter_mut() {
                        *slot = r.id();
                    }
                    BranchTable::Dense(slots)
                } else {
                    let branch_bytes = r.take(count).to_vec();
                    let children = (0..count).map(|_| r.child()).collect();
                    BranchTable::Sparse { bytes: branch_bytes, children }
                };
                let prefix = r.take(prefix_len).to_vec();
                Node::Branch(BranchNode { stamp, prefix, value, table })
            }
            NodeKind::Cluster => {
                let stamp = r.u16();
                let prefix_len = r.u16() as usize;
                let count = r.u16() as usize;
                let prefix = r.take(prefix_len).to_vec();
                let entries = (0..count)
                    .map(|_| {
                        let suffix_len = r.u16() as usize;
                        let value = r.child();
                        ClusterEntry { suffix: r.take(suffix_len).to_vec(), value }
                    })
                    .collect();
                Node::Cluster(ClusterNode { stamp, prefix, entries })
            }
        }
    }

    /// Payload of an encoded value node without decoding anything else.
    pub fn value_payload(bytes: &[u8]) -> &[u8] {
        assert_eq!(NodeKind::of(bytes), NodeKind::Value, "not a value node");
        let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        &bytes[5..5 + len]
    }

    /// Every object id this node holds a reference to.
    pub fn refs(&self) -> Vec<ObjectId> {
        match self {
            Node::Value(_) => Vec::new(),
            Node::Branch(b) => b.value.into_iter().chain(b.table.iter().map(|(_, c)| c)).collect(),
            Node::Cluster(c) => c.entries.iter().map(|e| e.value).collect(),
        }
    }

    pub fn stamp(&self) -> Option<u16> {
        match self {
            Node::Value(_) => None,
            Node::Branch(b) => Some(b.stamp),
            Node::Cluster(c) => Some(c.stamp),
        }
    }

    pub fn set_stamp(&mut self, stamp: u16) {
        match self {
            Node::Value(_) => {}
            Node::Branch(b) => b.stamp = stamp,
            Node::Cluster(c) => c.stamp = stamp,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        match self {
            Node::Value(_) => &[],
            Node::Branch(b) => &b.prefix,
            Node::Cluster(c) => &c.prefix,
        }
    }
}

/// Encode a value node straight from its payload.
pub fn encode_value(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(TAG_VALUE);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Length of the common prefix of `a` and `b`.
#[inline]
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
