//! Offline integrity check
//!
//! Walks every live revision, recomputing the refcount each reachable object
//! should have, and checks node shape along the way. Nothing is repaired.

use hashbrown::HashMap;
use tracing::{info, warn};

use crate::arena::ObjectArena;
use crate::database::Database;
use crate::directory::ObjectId;
use crate::node::{BranchNode, ClusterNode, Node, NodeKind, DENSE_MIN_CHILDREN, MAX_CLUSTER_SUFFIX, SPARSE_MAX_CHILDREN};
use crate::revision::RevisionId;

/// Outcome of [`Database::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Revisions with a root
    pub revisions: usize,
    /// Branch and cluster nodes reached
    pub nodes: usize,
    /// Value nodes reached
    pub values: usize,
    pub problems: Vec<String>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

struct Walk<'a> {
    arena: &'a ObjectArena,
    live: HashMap<ObjectId, u16>,
    /// References found so far per object
    seen: HashMap<ObjectId, u32>,
    pending: Vec<ObjectId>,
    report: CheckReport,
}

impl<'a> Walk<'a> {
    /// Count one reference to `id`; returns its kind the first time it is reached.
    fn reference(&mut self, id: ObjectId, from: &str) -> Option<NodeKind> {
        if !self.live.contains_key(&id) {
            self.report.problems.push(format!("{} references released object {}", from, id));
            return None;
        }
        let count = self.seen.entry(id).or_insert(0);
        *count += 1;
        if *count > 1 {
            return None;
        }
        let kind = NodeKind::try_of(self.arena.peek(id));
        match kind {
            Some(NodeKind::Value) => self.report.values += 1,
            Some(_) => self.pending.push(id),
            None => self.report.problems.push(format!("{} has an unknown node tag", id)),
        }
        kind
    }

    fn value(&mut self, id: ObjectId, from: ObjectId) {
        let kind = self.reference(id, &from.to_string());
        if matches!(kind, Some(NodeKind::Branch | NodeKind::Cluster)) {
            self.report.problems.push(format!("{} value slot points at non-value node {}", from, id));
        }
    }

    fn branch(&mut self, id: ObjectId, branch: &BranchNode) {
        let children = branch.table.len();
        if branch.table.is_dense() && children <= DENSE_MIN_CHILDREN {
            self.report.problems.push(format!("{} is dense with only {} children", id, children));
        }
        if !branch.table.is_dense() && children > SPARSE_MAX_CHILDREN {
            self.report.problems.push(format!("{} is sparse with {} children", id, children));
        }
        if branch.value.is_none() && children < 2 {
            self.report.problems.push(format!("{} has no value and {} children", id, children));
        }
        if let Some(value) = branch.value {
            self.value(value, id);
        }
        for (_, child) in branch.table.iter() {
            self.reference(child, &id.to_string());
        }
    }

    fn cluster(&mut self, id: ObjectId, cluster: &ClusterNode) {
        if cluster.entries.is_empty() {
            self.report.problems.push(format!("{} is an empty cluster", id));
        }
        if cluster.entries.windows(2).any(|w| w[0].suffix >= w[1].suffix) {
            self.report.problems.push(format!("{} cluster entries are not strictly sorted", id));
        }
        if let Some(entry) = cluster.entries.iter().find(|e| e.suffix.len() > MAX_CLUSTER_SUFFIX) {
            self.report
                .problems
                .push(format!("{} cluster suffix of {} bytes", id, entry.suffix.len()));
        }
        for entry in &cluster.entries {
            self.value(entry.value, id);
        }
    }

    fn run(&mut self) {
        while let Some(id) = self.pending.pop() {
            self.report.nodes += 1;
            match Node::decode(self.arena.peek(id)) {
                Node::Branch(branch) => self.branch(id, &branch),
                Node::Cluster(cluster) => self.cluster(id, &cluster),
                Node::Value(_) => unreachable!("values are never queued"),
            }
        }
    }
}

/// Check every trie reachable from `roots` against the arena's refcounts.
pub(crate) fn check_tries(arena: &ObjectArena, roots: &[(RevisionId, ObjectId)]) -> CheckReport {
    let mut walk = Walk {
        arena,
        live: arena.live_objects().map(|(id, _, refs)| (id, refs)).collect(),
        seen: HashMap::new(),
        pending: Vec::new(),
        report: CheckReport { revisions: roots.len(), ..Default::default() },
    };
    for (rev, root) in roots {
        if walk.reference(*root, &rev.to_string()) == Some(NodeKind::Value) {
            walk.report.problems.push(format!("root of {} is a value node", rev));
        }
        walk.run();
    }

    let mut problems = std::mem::take(&mut walk.report.problems);
    for (id, refs) in &walk.live {
        match walk.seen.get(id) {
            None => problems.push(format!("{} is live with {} refs but unreachable", id, refs)),
            Some(seen) if *seen != *refs as u32 => {
                problems.push(format!("{} has refcount {} but {} references", id, refs, seen))
            }
            Some(_) => {}
        }
    }
    problems.extend(arena.validate());
    CheckReport { problems, ..walk.report }
}

impl Database {
    /// Verify refcounts, node shapes and page free lists.
    ///
    /// Holds every revision slot for reading while it runs, so it waits for
    /// writers to finish and blocks new ones.
    pub fn check(&self) -> CheckReport {
        let guards: Vec<_> = self.revisions.iter().map(|slot| slot.read()).collect();
        let roots: Vec<(RevisionId, ObjectId)> = guards
            .iter()
            .enumerate()
            .filter_map(|(i, root)| root.map(|root| (RevisionId(i as u16), root)))
            .collect();
        let arena = self.arena.lock();
        let report = check_tries(&arena, &roots);
        if report.is_ok() {
            info!(revisions = report.revisions, nodes = report.nodes, values = report.values, "check passed");
        } else {
            warn!(problems = report.problems.len(), "check found problems");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::cursor::TrieReader;

    #[test]
    fn test_clean_database_passes() {
        let db = Database::in_memory(Config::testing()).unwrap();
        {
            let mut w = db.start_write_revision(0, 0).unwrap();
            for i in 0..200u32 {
                w.upsert(format!("user:{:04}", i).as_bytes(), &i.to_le_bytes()).unwrap();
            }
        }
        {
            let mut w = db.start_write_revision(1, 0).unwrap();
            for i in (0..200u32).step_by(3) {
                w.remove(format!("user:{:04}", i).as_bytes()).unwrap();
            }
            w.upsert(b"extra", b"x").unwrap();
        }
        let report = db.check();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.revisions, 2);
        assert!(report.nodes > 0);
        assert_eq!(report.values, 200 + 1);
    }

    #[test]
    fn test_refcount_mismatch_reported() {
        let db = Database::in_memory(Config::testing()).unwrap();
        let root = {
            let mut w = db.start_write_revision(0, 0).unwrap();
            w.upsert(b"k", b"v").unwrap();
            w.root().unwrap()
        };
        db.arena.lock().retain(root);
        let report = db.check();
        assert!(!report.is_ok());
        assert!(report.problems.iter().any(|p| p.contains("refcount 2 but 1 references")), "{:?}", report.problems);
        db.arena.lock().release(root);
        assert!(db.check().is_ok());
    }

    #[test]
    fn test_leak_reported() {
        let db = Database::in_memory(Config::testing()).unwrap();
        let stray = db.arena.lock().alloc(b"orphan").unwrap();
        let report = db.check();
        assert!(report.problems.iter().any(|p| p.contains("unreachable")));
        db.arena.lock().release(stray);
        assert!(db.check().is_ok());
    }
}
