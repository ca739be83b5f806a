//! Ordered traversal over one revision's trie
//!
//! A [`Cursor`] keeps the path from the root to its current entry as a stack
//! of decoded nodes, each with the position chosen in it. Nodes are copied out
//! of the arena when pushed, so the cursor never holds arena memory between
//! calls and objects are free to move underneath it.

use parking_lot::Mutex;

use crate::arena::ObjectArena;
use crate::directory::ObjectId;
use crate::error::TrieResult;
use crate::node::{common_prefix_len, BranchNode, ClusterNode, Node, NodeKind};
use crate::trie::{lookup, read_value};

/// Position inside a branch meaning "the branch's own value"
const OWN_VALUE: i32 = -1;

#[derive(Debug, Clone)]
enum Frame {
    /// `pos` is [`OWN_VALUE`] or the branch byte of the chosen child
    Branch { node: BranchNode, pos: i32 },
    Cluster { node: ClusterNode, pos: usize },
}

fn load(arena: &mut ObjectArena, id: ObjectId) -> TrieResult<Node> {
    Ok(Node::decode(arena.get(id)?))
}

fn is_value(arena: &mut ObjectArena, id: ObjectId) -> TrieResult<bool> {
    Ok(NodeKind::of(arena.get(id)?) == NodeKind::Value)
}

/// Smallest key above every key that starts with `prefix`; `None` when the
/// prefix is empty or all `0xff`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let end = prefix.iter().rposition(|&b| b != 0xff)?;
    let mut bound = prefix[..=end].to_vec();
    bound[end] += 1;
    Some(bound)
}

/// Push frames down to the smallest entry below `node`.
fn push_first(stack: &mut Vec<Frame>, arena: &mut ObjectArena, mut node: Node) -> TrieResult<()> {
    loop {
        match node {
            Node::Branch(branch) => {
                if branch.value.is_some() {
                    stack.push(Frame::Branch { node: branch, pos: OWN_VALUE });
                    return Ok(());
                }
                let Some((byte, child)) = branch.table.first() else {
                    panic!("branch without value or children");
                };
                stack.push(Frame::Branch { node: branch, pos: byte as i32 });
                if is_value(arena, child)? {
                    return Ok(());
                }
                node = load(arena, child)?;
            }
            Node::Cluster(cluster) => {
                stack.push(Frame::Cluster { node: cluster, pos: 0 });
                return Ok(());
            }
            Node::Value(_) => panic!("cursor descended into a value node"),
        }
    }
}

/// Push frames down to the largest entry below `node`.
fn push_last(stack: &mut Vec<Frame>, arena: &mut ObjectArena, mut node: Node) -> TrieResult<()> {
    loop {
        match node {
            Node::Branch(branch) => {
                let Some((byte, child)) = branch.table.last() else {
                    stack.push(Frame::Branch { node: branch, pos: OWN_VALUE });
                    return Ok(());
                };
                stack.push(Frame::Branch { node: branch, pos: byte as i32 });
                if is_value(arena, child)? {
                    return Ok(());
                }
                node = load(arena, child)?;
            }
            Node::Cluster(cluster) => {
                let pos = cluster.entries.len() - 1;
                stack.push(Frame::Cluster { node: cluster, pos });
                return Ok(());
            }
            Node::Value(_) => panic!("cursor descended into a value node"),
        }
    }
}

/// Position on the first entry of the subtree `id` that is `>= key`, where
/// `key` is relative to the subtree. Returns false, leaving the stack as it
/// was, when every entry of the subtree sorts before `key`.
fn push_lower_bound(stack: &mut Vec<Frame>, arena: &mut ObjectArena, id: ObjectId, key: &[u8]) -> TrieResult<bool> {
    let node = load(arena, id)?;
    let prefix = node.prefix();
    let common = common_prefix_len(prefix, key);
    if common < prefix.len() {
        // the subtree diverges from the key: all of it sorts on one side
        if common == key.len() || prefix[common] > key[common] {
            push_first(stack, arena, node)?;
            return Ok(true);
        }
        return Ok(false);
    }
    let rest = &key[prefix.len()..];

    match node {
        Node::Cluster(cluster) => {
            let pos = cluster.entries.partition_point(|e| e.suffix.as_slice() < rest);
            if pos == cluster.entries.len() {
                return Ok(false);
            }
            stack.push(Frame::Cluster { node: cluster, pos });
            Ok(true)
        }
        Node::Branch(branch) => {
            let Some((&byte, tail)) = rest.split_first() else {
                push_first(stack, arena, Node::Branch(branch))?;
                return Ok(true);
            };
            if let Some(child) = branch.table.get(byte) {
                stack.push(Frame::Branch { node: branch.clone(), pos: byte as i32 });
                if is_value(arena, child)? {
                    if tail.is_empty() {
                        return Ok(true);
                    }
                } else if push_lower_bound(stack, arena, child, tail)? {
                    return Ok(true);
                }
                stack.pop();
            }
            let Some((next, child)) = branch.table.after(byte) else {
                return Ok(false);
            };
            stack.push(Frame::Branch { node: branch, pos: next as i32 });
            if !is_value(arena, child)? {
                let node = load(arena, child)?;
                push_first(stack, arena, node)?;
            }
            Ok(true)
        }
        Node::Value(_) => panic!("cursor descended into a value node"),
    }
}

/// A position in one revision's key order.
///
/// An invalid cursor (past either end, or never positioned) has no key.
pub struct Cursor<'a> {
    arena: &'a Mutex<ObjectArena>,
    root: Option<ObjectId>,
    stack: Vec<Frame>,
}

impl<'a> Cursor<'a> {
    /// An unpositioned cursor over the trie at `root`.
    pub fn new(arena: &'a Mutex<ObjectArena>, root: Option<ObjectId>) -> Self {
        Self { arena, root, stack: Vec::new() }
    }

    pub fn is_valid(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Key of the current entry.
    pub fn key(&self) -> Option<Vec<u8>> {
        if self.stack.is_empty() {
            return None;
        }
        let mut key = Vec::new();
        for frame in &self.stack {
            match frame {
                Frame::Branch { node, pos } => {
                    key.extend_from_slice(&node.prefix);
                    if *pos != OWN_VALUE {
                        key.push(*pos as u8);
                    }
                }
                Frame::Cluster { node, pos } => {
                    key.extend_from_slice(&node.prefix);
                    key.extend_from_slice(&node.entries[*pos].suffix);
                }
            }
        }
        Some(key)
    }

    fn value_id(&self) -> Option<ObjectId> {
        match self.stack.last()? {
            Frame::Branch { node, pos } if *pos == OWN_VALUE => node.value,
            Frame::Branch { node, pos } => node.table.get(*pos as u8),
            Frame::Cluster { node, pos } => Some(node.entries[*pos].value),
        }
    }

    /// Value of the current entry.
    pub fn value(&self) -> TrieResult<Option<Vec<u8>>> {
        let Some(id) = self.value_id() else {
            return Ok(None);
        };
        read_value(&mut self.arena.lock(), id).map(Some)
    }

    pub fn seek_first(&mut self) -> TrieResult<bool> {
        self.stack.clear();
        if let Some(root) = self.root {
            let mut arena = self.arena.lock();
            let node = load(&mut arena, root)?;
            push_first(&mut self.stack, &mut arena, node)?;
        }
        Ok(self.is_valid())
    }

    pub fn seek_last(&mut self) -> TrieResult<bool> {
        self.stack.clear();
        if let Some(root) = self.root {
            let mut arena = self.arena.lock();
            let node = load(&mut arena, root)?;
            push_last(&mut self.stack, &mut arena, node)?;
        }
        Ok(self.is_valid())
    }

    /// Position on the first entry whose key is `>= key`.
    pub fn seek_lower_bound(&mut self, key: &[u8]) -> TrieResult<bool> {
        self.stack.clear();
        if let Some(root) = self.root {
            let mut arena = self.arena.lock();
            if !push_lower_bound(&mut self.stack, &mut arena, root, key)? {
                self.stack.clear();
            }
        }
        Ok(self.is_valid())
    }

    /// Position on `key` exactly, or become invalid.
    pub fn seek_exact(&mut self, key: &[u8]) -> TrieResult<bool> {
        if self.seek_lower_bound(key)? && self.key().as_deref() != Some(key) {
            self.stack.clear();
        }
        Ok(self.is_valid())
    }

    /// Position on the largest key starting with `prefix`, or become invalid.
    pub fn seek_last_with_prefix(&mut self, prefix: &[u8]) -> TrieResult<bool> {
        let bounded = match prefix_successor(prefix) {
            Some(bound) => self.seek_lower_bound(&bound)?,
            None => false,
        };
        if bounded {
            self.move_prev()?;
        } else {
            self.seek_last()?;
        }
        if !self.key().is_some_and(|key| key.starts_with(prefix)) {
            self.stack.clear();
        }
        Ok(self.is_valid())
    }

    /// Advance to the next key; the cursor becomes invalid past the last one.
    pub fn move_next(&mut self) -> TrieResult<bool> {
        let mut arena = self.arena.lock();
        while let Some(top) = self.stack.last_mut() {
            let next = match top {
                Frame::Cluster { node, pos } => {
                    if *pos + 1 < node.entries.len() {
                        *pos += 1;
                        return Ok(true);
                    }
                    None
                }
                Frame::Branch { node, pos } => {
                    let next = if *pos == OWN_VALUE { node.table.first() } else { node.table.after(*pos as u8) };
                    if let Some((byte, _)) = next {
                        *pos = byte as i32;
                    }
                    next
                }
            };
            let Some((_, child)) = next else {
                self.stack.pop();
                continue;
            };
            if !is_value(&mut arena, child)? {
                let node = load(&mut arena, child)?;
                push_first(&mut self.stack, &mut arena, node)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Step back to the previous key; the cursor becomes invalid before the first one.
    pub fn move_prev(&mut self) -> TrieResult<bool> {
        let mut arena = self.arena.lock();
        while let Some(top) = self.stack.last_mut() {
            let prev = match top {
                Frame::Cluster { pos, .. } => {
                    if *pos > 0 {
                        *pos -= 1;
                        return Ok(true);
                    }
                    None
                }
                Frame::Branch { pos, .. } if *pos == OWN_VALUE => None,
                Frame::Branch { node, pos } => match node.table.before(*pos as u8) {
                    Some((byte, child)) => {
                        *pos = byte as i32;
                        Some(child)
                    }
                    None if node.value.is_some() => {
                        *pos = OWN_VALUE;
                        return Ok(true);
                    }
                    None => None,
                },
            };
            let Some(child) = prev else {
                self.stack.pop();
                continue;
            };
            if !is_value(&mut arena, child)? {
                let node = load(&mut arena, child)?;
                push_last(&mut self.stack, &mut arena, node)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Iterate forward from the current position.
    pub fn entries(self) -> Entries<'a> {
        Entries { cursor: self, prefix: None }
    }
}

/// Forward iterator over `(key, value)` pairs, optionally bounded to keys
/// starting with a prefix.
pub struct Entries<'a> {
    cursor: Cursor<'a>,
    prefix: Option<Vec<u8>>,
}

impl<'a> Entries<'a> {
    fn step(&mut self) -> TrieResult<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(key) = self.cursor.key() else {
            return Ok(None);
        };
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix) {
                self.cursor.stack.clear();
                return Ok(None);
            }
        }
        let value = self.cursor.value()?.unwrap_or_default();
        self.cursor.move_next()?;
        Ok(Some((key, value)))
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = TrieResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                // an arena failure ends the iteration
                self.cursor.stack.clear();
                Some(Err(err))
            }
        }
    }
}

/// Read access to one revision, shared by read and write sessions.
pub trait TrieReader {
    fn arena(&self) -> &Mutex<ObjectArena>;

    /// Root node of the revision, `None` when it holds no keys.
    fn root(&self) -> Option<ObjectId>;

    fn get(&self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        lookup(&mut self.arena().lock(), self.root(), key)
    }

    fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self.arena(), self.root())
    }

    /// Cursor on the smallest key.
    fn first(&self) -> TrieResult<Cursor<'_>> {
        let mut cursor = self.cursor();
        cursor.seek_first()?;
        Ok(cursor)
    }

    /// Cursor on the largest key.
    fn last(&self) -> TrieResult<Cursor<'_>> {
        let mut cursor = self.cursor();
        cursor.seek_last()?;
        Ok(cursor)
    }

    /// Cursor on the first key `>= key`.
    fn lower_bound(&self, key: &[u8]) -> TrieResult<Cursor<'_>> {
        let mut cursor = self.cursor();
        cursor.seek_lower_bound(key)?;
        Ok(cursor)
    }

    /// Cursor on `key`, invalid when the key is absent.
    fn find(&self, key: &[u8]) -> TrieResult<Cursor<'_>> {
        let mut cursor = self.cursor();
        cursor.seek_exact(key)?;
        Ok(cursor)
    }

    /// Cursor on the largest key starting with `prefix`, invalid when none does.
    fn last_with_prefix(&self, prefix: &[u8]) -> TrieResult<Cursor<'_>> {
        let mut cursor = self.cursor();
        cursor.seek_last_with_prefix(prefix)?;
        Ok(cursor)
    }

    /// Every entry in key order.
    fn iter(&self) -> TrieResult<Entries<'_>> {
        Ok(self.first()?.entries())
    }

    /// Entries with keys `>= key`, in order.
    fn range_from(&self, key: &[u8]) -> TrieResult<Entries<'_>> {
        Ok(self.lower_bound(key)?.entries())
    }

    /// Entries whose keys start with `prefix`, in order.
    fn prefix_iter(&self, prefix: &[u8]) -> TrieResult<Entries<'_>> {
        let mut entries = self.lower_bound(prefix)?.entries();
        entries.prefix = Some(prefix.to_vec());
        Ok(entries)
    }
}
