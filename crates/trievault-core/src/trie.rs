//! Copy-on-write radix trie over the object arena
//!
//! A key is matched against a chain of nodes: each branch or cluster consumes
//! its prefix, each branch then consumes one byte to pick a child. A branch
//! child is either a value node (the key ends right after the branch byte) or
//! another branch or cluster. The root is never a value node.
//!
//! Mutation is bottom-up. A node is rewritten in place only when every node
//! above it was, its stamp is the writer's revision and nothing else
//! references it; otherwise a modified copy is allocated and the parent
//! repoints to it. When a call returns a new id for a node, the old id is
//! left untouched and the caller releases it once the new id is linked in, so
//! an allocation failure anywhere leaves the trie as it was.

use crate::arena::ObjectArena;
use crate::directory::ObjectId;
use crate::error::TrieResult;
use crate::node::{
    common_prefix_len, encode_value, BranchNode, BranchTable, ClusterEntry, ClusterNode, Node,
    NodeKind, MAX_CLUSTER_SUFFIX,
};

/// Drop one reference to `id`, reclaiming every node that becomes unreachable.
pub fn release_tree(arena: &mut ObjectArena, id: ObjectId) {
    let mut pending = vec![id];
    while let Some(id) = pending.pop() {
        let refs = arena.release_with(id, |bytes| match NodeKind::of(bytes) {
            NodeKind::Value => Vec::new(),
            _ => Node::decode(bytes).refs(),
        });
        if let Some(refs) = refs {
            pending.extend(refs);
        }
    }
}

/// Value stored under `key`, if any.
pub fn lookup(arena: &mut ObjectArena, root: Option<ObjectId>, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
    let Some(mut id) = root else {
        return Ok(None);
    };
    let mut key = key;
    loop {
        match Node::decode(arena.get(id)?) {
            Node::Branch(branch) => {
                let Some(rest) = key.strip_prefix(branch.prefix.as_slice()) else {
                    return Ok(None);
                };
                let Some((&byte, rest)) = rest.split_first() else {
                    return branch.value.map(|v| read_value(arena, v)).transpose();
                };
                let Some(child) = branch.table.get(byte) else {
                    return Ok(None);
                };
                let bytes = arena.get(child)?;
                if NodeKind::of(bytes) == NodeKind::Value {
                    return Ok(rest.is_empty().then(|| Node::value_payload(bytes).to_vec()));
                }
                id = child;
                key = rest;
            }
            Node::Cluster(cluster) => {
                let Some(suffix) = key.strip_prefix(cluster.prefix.as_slice()) else {
                    return Ok(None);
                };
                return match cluster.search(suffix) {
                    Ok(i) => read_value(arena, cluster.entries[i].value).map(Some),
                    Err(_) => Ok(None),
                };
            }
            Node::Value(_) => panic!("descended into value node {}", id),
        }
    }
}

/// Payload of the value node `id`.
pub fn read_value(arena: &mut ObjectArena, id: ObjectId) -> TrieResult<Vec<u8>> {
    Ok(Node::value_payload(arena.get(id)?).to_vec())
}

/// Node returned by an upsert below some parent slot.
struct Upserted {
    id: ObjectId,
    inserted: bool,
}

/// Outcome of a removal below some parent slot.
#[derive(Debug, PartialEq, Eq)]
enum Removal {
    NotFound,
    /// Removed; the node was rewritten in place
    InPlace,
    /// Removed; the parent must point at this node instead, or drop the slot
    Replaced(Option<ObjectId>),
}

fn settled(old: ObjectId, new: ObjectId) -> Removal {
    if old == new {
        Removal::InPlace
    } else {
        Removal::Replaced(Some(new))
    }
}

/// Mutating access to one revision's trie.
pub struct TrieWriter<'a> {
    arena: &'a mut ObjectArena,
    revision: u16,
    max_cluster_entries: usize,
}

impl<'a> TrieWriter<'a> {
    pub fn new(arena: &'a mut ObjectArena, revision: u16, max_cluster_entries: usize) -> Self {
        Self { arena, revision, max_cluster_entries }
    }

    fn load(&mut self, id: ObjectId) -> TrieResult<Node> {
        Ok(Node::decode(self.arena.get(id)?))
    }

    fn kind(&mut self, id: ObjectId) -> TrieResult<NodeKind> {
        Ok(NodeKind::of(self.arena.get(id)?))
    }

    /// Whether `node` may be rewritten in place by this writer.
    fn owns(&self, id: ObjectId, node: &Node, parent_owned: bool) -> bool {
        parent_owned && node.stamp() == Some(self.revision) && self.arena.ref_count(id) == 1
    }

    fn alloc_value(&mut self, value: &[u8]) -> TrieResult<ObjectId> {
        self.arena.alloc(&encode_value(value))
    }

    fn release_all(&mut self, ids: &[ObjectId]) {
        for id in ids {
            release_tree(self.arena, *id);
        }
    }

    fn fits_cluster(&self, entries: usize, longest_suffix: usize) -> bool {
        self.max_cluster_entries > 0
            && entries <= self.max_cluster_entries
            && longest_suffix <= MAX_CLUSTER_SUFFIX
    }

    /// Allocate `node`. Ids in `fresh` already hold a reference for it; every
    /// other id it points at is retained. On failure `fresh` is released.
    fn create(&mut self, node: Node, fresh: &[ObjectId]) -> TrieResult<ObjectId> {
        match self.arena.alloc(&node.encode()) {
            Ok(id) => {
                for r in node.refs() {
                    if !fresh.contains(&r) {
                        self.arena.retain(r);
                    }
                }
                Ok(id)
            }
            Err(err) => {
                self.release_all(fresh);
                Err(err)
            }
        }
    }

    /// Store `node` as the new version of `id`: in place when owned, as a
    /// copy otherwise. `dropped` are ids the old version referenced and the
    /// new one does not.
    fn commit(
        &mut self,
        id: ObjectId,
        owned: bool,
        mut node: Node,
        fresh: &[ObjectId],
        dropped: &[ObjectId],
    ) -> TrieResult<ObjectId> {
        node.set_stamp(self.revision);
        if !owned {
            return self.create(node, fresh);
        }
        if let Err(err) = self.arena.rewrite(id, &node.encode()) {
            self.release_all(fresh);
            return Err(err);
        }
        self.release_all(dropped);
        Ok(id)
    }

    /// Build a subtree holding `entries`, suffixes relative to the subtree
    /// root, sorted and distinct. Value ids are retained, not consumed.
    fn build(&mut self, entries: &[(Vec<u8>, ObjectId)]) -> TrieResult<ObjectId> {
        let first = &entries[0].0;
        let common = entries[1..]
            .iter()
            .fold(first.len(), |n, (suffix, _)| common_prefix_len(&first[..n], suffix));
        let longest = entries.iter().map(|(s, _)| s.len() - common).max().unwrap_or(0);

        if self.fits_cluster(entries.len(), longest) {
            let node = ClusterNode {
                stamp: self.revision,
                prefix: first[..common].to_vec(),
                entries: entries
                    .iter()
                    .map(|(suffix, value)| ClusterEntry { suffix: suffix[common..].to_vec(), value: *value })
                    .collect(),
            };
            return self.create(Node::Cluster(node), &[]);
        }

        let mut branch = BranchNode { stamp: self.revision, prefix: first[..common].to_vec(), ..Default::default() };
        let mut rest = entries;
        if rest[0].0.len() == common {
            branch.value = Some(rest[0].1);
            rest = &rest[1..];
        }

        let mut fresh = Vec::new();
        while let Some((suffix, value)) = rest.first() {
            let byte = suffix[common];
            let run = rest.iter().take_while(|(s, _)| s[common] == byte).count();
            let (group, tail) = rest.split_at(run);
            let child = if run == 1 && suffix.len() == common + 1 {
                *value
            } else {
                let stripped: Vec<(Vec<u8>, ObjectId)> =
                    group.iter().map(|(s, v)| (s[common + 1..].to_vec(), *v)).collect();
                match self.build(&stripped) {
                    Ok(child) => {
                        fresh.push(child);
                        child
                    }
                    Err(err) => {
                        self.release_all(&fresh);
                        return Err(err);
                    }
                }
            };
            branch.table.insert(byte, child);
            rest = tail;
        }
        self.create(Node::Branch(branch), &fresh)
    }

    /// Fresh subtree for one key `rest` below a branch byte.
    fn new_subtree(&mut self, rest: &[u8], value: &[u8]) -> TrieResult<ObjectId> {
        let value = self.alloc_value(value)?;
        if rest.is_empty() {
            return Ok(value);
        }
        let built = self.build(&[(rest.to_vec(), value)]);
        self.arena.release(value);
        built
    }

    /// Overwrite the value node `value` in place if this writer owns it.
    fn overwrite_owned(&mut self, owned: bool, value: ObjectId, payload: &[u8]) -> TrieResult<bool> {
        if owned && self.arena.ref_count(value) == 1 {
            self.arena.rewrite(value, &encode_value(payload))?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Insert or overwrite `key`. Returns the new root and whether the key is new.
    pub fn upsert(
        &mut self,
        root: Option<ObjectId>,
        key: &[u8],
        value: &[u8],
    ) -> TrieResult<(Option<ObjectId>, bool)> {
        let Some(root) = root else {
            let value = self.alloc_value(value)?;
            let built = self.build(&[(key.to_vec(), value)]);
            self.arena.release(value);
            return Ok((Some(built?), true));
        };
        let up = self.upsert_node(root, key, value, true)?;
        if up.id != root {
            release_tree(self.arena, root);
        }
        Ok((Some(up.id), up.inserted))
    }

    fn upsert_node(&mut self, id: ObjectId, key: &[u8], value: &[u8], parent_owned: bool) -> TrieResult<Upserted> {
        let node = self.load(id)?;
        let owned = self.owns(id, &node, parent_owned);
        match node {
            Node::Branch(branch) => self.upsert_branch(id, owned, branch, key, value),
            Node::Cluster(cluster) => self.upsert_cluster(id, owned, cluster, key, value),
            Node::Value(_) => panic!("descended into value node {}", id),
        }
    }

    fn upsert_branch(
        &mut self,
        id: ObjectId,
        owned: bool,
        mut branch: BranchNode,
        key: &[u8],
        value: &[u8],
    ) -> TrieResult<Upserted> {
        let common = common_prefix_len(&branch.prefix, key);
        if common < branch.prefix.len() {
            return self.split(branch, common, key, value);
        }

        if common == key.len() {
            let old = branch.value;
            if let Some(old) = old {
                if self.overwrite_owned(owned, old, value)? {
                    return Ok(Upserted { id, inserted: false });
                }
            }
            let fresh = self.alloc_value(value)?;
            branch.value = Some(fresh);
            let dropped: Vec<ObjectId> = old.into_iter().collect();
            let id = self.commit(id, owned, Node::Branch(branch), &[fresh], &dropped)?;
            return Ok(Upserted { id, inserted: old.is_none() });
        }

        let byte = key[common];
        let rest = &key[common + 1..];
        let Some(child) = branch.table.get(byte) else {
            let fresh = self.new_subtree(rest, value)?;
            branch.table.insert(byte, fresh);
            let id = self.commit(id, owned, Node::Branch(branch), &[fresh], &[])?;
            return Ok(Upserted { id, inserted: true });
        };

        let (fresh, inserted) = match self.kind(child)? {
            NodeKind::Value if rest.is_empty() => {
                if self.overwrite_owned(owned, child, value)? {
                    return Ok(Upserted { id, inserted: false });
                }
                (self.alloc_value(value)?, false)
            }
            NodeKind::Value => {
                // the existing key becomes a strict prefix of the new one
                let added = self.alloc_value(value)?;
                let built = self.build(&[(Vec::new(), child), (rest.to_vec(), added)]);
                self.arena.release(added);
                (built?, true)
            }
            NodeKind::Branch | NodeKind::Cluster => {
                let up = self.upsert_node(child, rest, value, owned)?;
                if up.id == child {
                    return Ok(Upserted { id, inserted: up.inserted });
                }
                (up.id, up.inserted)
            }
        };
        branch.table.insert(byte, fresh);
        let id = self.commit(id, owned, Node::Branch(branch), &[fresh], &[child])?;
        Ok(Upserted { id, inserted })
    }

    /// Split `branch` at `common`, where the key leaves its prefix.
    ///
    /// The old node moves below a new branch holding the shared part, as a
    /// copy with its prefix trimmed.
    fn split(&mut self, branch: BranchNode, common: usize, key: &[u8], value: &[u8]) -> TrieResult<Upserted> {
        let old_byte = branch.prefix[common];
        // a bare value right below the split point hangs off the new branch directly
        let bare = branch
            .value
            .filter(|_| branch.table.is_empty() && common + 1 == branch.prefix.len());
        let lower = match bare {
            Some(value) => {
                self.arena.retain(value);
                value
            }
            None => {
                let trimmed = BranchNode {
                    stamp: self.revision,
                    prefix: branch.prefix[common + 1..].to_vec(),
                    ..branch
                };
                self.create(Node::Branch(trimmed), &[])?
            }
        };

        let mut top = BranchNode { stamp: self.revision, prefix: key[..common].to_vec(), ..Default::default() };
        top.table.insert(old_byte, lower);
        let added = if common == key.len() {
            self.alloc_value(value).map(|v| {
                top.value = Some(v);
                v
            })
        } else {
            self.new_subtree(&key[common + 1..], value).map(|c| {
                top.table.insert(key[common], c);
                c
            })
        };
        let added = match added {
            Ok(added) => added,
            Err(err) => {
                release_tree(self.arena, lower);
                return Err(err);
            }
        };
        let id = self.create(Node::Branch(top), &[lower, added])?;
        Ok(Upserted { id, inserted: true })
    }

    fn upsert_cluster(
        &mut self,
        id: ObjectId,
        owned: bool,
        mut cluster: ClusterNode,
        key: &[u8],
        value: &[u8],
    ) -> TrieResult<Upserted> {
        if let Some(suffix) = key.strip_prefix(cluster.prefix.as_slice()) {
            match cluster.search(suffix) {
                Ok(i) => {
                    let old = cluster.entries[i].value;
                    if self.overwrite_owned(owned, old, value)? {
                        return Ok(Upserted { id, inserted: false });
                    }
                    let fresh = self.alloc_value(value)?;
                    cluster.entries[i].value = fresh;
                    let id = self.commit(id, owned, Node::Cluster(cluster), &[fresh], &[old])?;
                    return Ok(Upserted { id, inserted: false });
                }
                Err(i) if self.fits_cluster(cluster.entries.len() + 1, suffix.len()) => {
                    let fresh = self.alloc_value(value)?;
                    cluster.entries.insert(i, ClusterEntry { suffix: suffix.to_vec(), value: fresh });
                    let id = self.commit(id, owned, Node::Cluster(cluster), &[fresh], &[])?;
                    return Ok(Upserted { id, inserted: true });
                }
                Err(_) => {}
            }
        }

        // prefix mismatch or the cluster outgrew its limits: rebuild the subtree
        let added = self.alloc_value(value)?;
        let mut entries: Vec<(Vec<u8>, ObjectId)> = cluster
            .entries
            .iter()
            .map(|e| ([cluster.prefix.as_slice(), e.suffix.as_slice()].concat(), e.value))
            .collect();
        let at = entries
            .binary_search_by(|(suffix, _)| suffix.as_slice().cmp(key))
            .unwrap_or_else(|at| at);
        entries.insert(at, (key.to_vec(), added));
        let built = self.build(&entries);
        self.arena.release(added);
        Ok(Upserted { id: built?, inserted: true })
    }

    /// Remove `key`. Returns the new root and whether the key existed.
    pub fn remove(&mut self, root: Option<ObjectId>, key: &[u8]) -> TrieResult<(Option<ObjectId>, bool)> {
        let Some(root) = root else {
            return Ok((None, false));
        };
        match self.remove_node(root, key, true)? {
            Removal::NotFound => Ok((Some(root), false)),
            Removal::InPlace => Ok((Some(root), true)),
            Removal::Replaced(new) => {
                release_tree(self.arena, root);
                Ok((new, true))
            }
        }
    }

    fn remove_node(&mut self, id: ObjectId, key: &[u8], parent_owned: bool) -> TrieResult<Removal> {
        let node = self.load(id)?;
        let owned = self.owns(id, &node, parent_owned);
        match node {
            Node::Branch(branch) => self.remove_branch(id, owned, branch, key),
            Node::Cluster(cluster) => self.remove_cluster(id, owned, cluster, key),
            Node::Value(_) => panic!("descended into value node {}", id),
        }
    }

    fn remove_branch(&mut self, id: ObjectId, owned: bool, mut branch: BranchNode, key: &[u8]) -> TrieResult<Removal> {
        let Some(rest) = key.strip_prefix(branch.prefix.as_slice()) else {
            return Ok(Removal::NotFound);
        };
        let Some((&byte, rest)) = rest.split_first() else {
            return match branch.value.take() {
                Some(old) => self.collapse(id, owned, branch, old),
                None => Ok(Removal::NotFound),
            };
        };
        let Some(child) = branch.table.get(byte) else {
            return Ok(Removal::NotFound);
        };

        if self.kind(child)? == NodeKind::Value {
            if !rest.is_empty() {
                return Ok(Removal::NotFound);
            }
            branch.table.remove(byte);
            return self.collapse(id, owned, branch, child);
        }

        match self.remove_node(child, rest, owned)? {
            Removal::Replaced(Some(new)) => {
                branch.table.insert(byte, new);
                let new_id = self.commit(id, owned, Node::Branch(branch), &[new], &[child])?;
                Ok(settled(id, new_id))
            }
            Removal::Replaced(None) => {
                branch.table.remove(byte);
                self.collapse(id, owned, branch, child)
            }
            other => Ok(other),
        }
    }

    /// Store `branch` after it lost the reference to `dropped`, applying the
    /// collapse rules: no value and no children deletes the node, no value and
    /// one child merges the node into that child.
    fn collapse(&mut self, id: ObjectId, owned: bool, branch: BranchNode, dropped: ObjectId) -> TrieResult<Removal> {
        if branch.value.is_none() {
            match branch.table.first() {
                None => return Ok(Removal::Replaced(None)),
                Some((byte, child)) if branch.table.len() == 1 => {
                    let merged = self.merge(branch.prefix, byte, child)?;
                    return Ok(Removal::Replaced(Some(merged)));
                }
                Some(_) => {}
            }
        }
        let new_id = self.commit(id, owned, Node::Branch(branch), &[], &[dropped])?;
        Ok(settled(id, new_id))
    }

    /// New node standing for `prefix + byte + child`.
    fn merge(&mut self, mut prefix: Vec<u8>, byte: u8, child: ObjectId) -> TrieResult<ObjectId> {
        prefix.push(byte);
        let node = match self.kind(child)? {
            NodeKind::Value => Node::Branch(BranchNode {
                stamp: self.revision,
                prefix,
                value: Some(child),
                table: BranchTable::default(),
            }),
            _ => {
                let mut node = self.load(child)?;
                prefix.extend_from_slice(node.prefix());
                match &mut node {
                    Node::Branch(b) => b.prefix = prefix,
                    Node::Cluster(c) => c.prefix = prefix,
                    Node::Value(_) => unreachable!("kind checked above"),
                }
                node.set_stamp(self.revision);
                node
            }
        };
        self.create(node, &[])
    }

    fn remove_cluster(&mut self, id: ObjectId, owned: bool, mut cluster: ClusterNode, key: &[u8]) -> TrieResult<Removal> {
        let Some(suffix) = key.strip_prefix(cluster.prefix.as_slice()) else {
            return Ok(Removal::NotFound);
        };
        let Ok(i) = cluster.search(suffix) else {
            return Ok(Removal::NotFound);
        };
        let old = cluster.entries.remove(i).value;
        if cluster.entries.is_empty() {
            return Ok(Removal::Replaced(None));
        }

        // grow the prefix over whatever the remaining suffixes share
        let first = cluster.entries[0].suffix.clone();
        let shared = cluster.entries[1..]
            .iter()
            .fold(first.len(), |n, e| common_prefix_len(&first[..n], &e.suffix));
        if shared > 0 {
            cluster.prefix.extend_from_slice(&first[..shared]);
            for entry in &mut cluster.entries {
                entry.suffix.drain(..shared);
            }
        }
        let new_id = self.commit(id, owned, Node::Cluster(cluster), &[], &[old])?;
        Ok(settled(id, new_id))
    }
}
