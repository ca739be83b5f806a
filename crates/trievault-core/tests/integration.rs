//! Integration tests: revisions, tries and the arena through the public API.

use std::collections::BTreeMap;

use proptest::prelude::*;
use tempfile::TempDir;

use trievault_core::page::PAGE_SIZE;
use trievault_core::{Config, Database, TrieError, TrieReader};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn configs() -> [Config; 2] {
    [Config::testing(), Config::testing().without_clusters()]
}

fn keys_of<R: TrieReader>(reader: &R) -> Vec<Vec<u8>> {
    reader.iter().unwrap().map(|entry| entry.unwrap().0).collect()
}

fn keys_backward<R: TrieReader>(reader: &R) -> Vec<Vec<u8>> {
    let mut cursor = reader.last().unwrap();
    let mut keys = Vec::new();
    while let Some(key) = cursor.key() {
        keys.push(key);
        cursor.move_prev().unwrap();
    }
    keys
}

// ---------------------------------------------------------------------------
// Basic Operations
// ---------------------------------------------------------------------------

#[test]
fn test_hello_hell_help() {
    for config in configs() {
        let db = Database::in_memory(config).unwrap();
        let mut w = db.start_write_revision(0, 0).unwrap();
        assert!(w.upsert(b"hello", b"world").unwrap());
        assert!(w.upsert(b"hell", b"!").unwrap());
        assert!(w.upsert(b"help", b"?").unwrap());

        assert_eq!(w.get(b"hell").unwrap(), Some(b"!".to_vec()));
        assert_eq!(w.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(w.get(b"help").unwrap(), Some(b"?".to_vec()));
        assert_eq!(w.first().unwrap().key(), Some(b"hell".to_vec()));
        assert_eq!(keys_of(&w), vec![b"hell".to_vec(), b"hello".to_vec(), b"help".to_vec()]);

        assert!(w.remove(b"hell").unwrap());
        assert_eq!(w.get(b"hell").unwrap(), None);
        assert_eq!(w.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(w.get(b"help").unwrap(), Some(b"?".to_vec()));
        drop(w);
        assert!(db.check().is_ok());
    }
}

#[test]
fn test_prefix_coexistence() {
    for config in configs() {
        let db = Database::in_memory(config).unwrap();
        let mut w = db.start_write_revision(0, 0).unwrap();
        w.upsert(b"a", b"x").unwrap();
        w.upsert(b"ab", b"y").unwrap();
        assert_eq!(w.get(b"a").unwrap(), Some(b"x".to_vec()));
        assert_eq!(w.get(b"ab").unwrap(), Some(b"y".to_vec()));

        // and in the other insertion order
        w.upsert(b"zz", b"long").unwrap();
        w.upsert(b"z", b"short").unwrap();
        assert_eq!(w.get(b"z").unwrap(), Some(b"short".to_vec()));
        assert_eq!(w.get(b"zz").unwrap(), Some(b"long".to_vec()));
    }
}

#[test]
fn test_find_and_lower_bound() {
    let db = Database::in_memory(Config::testing()).unwrap();
    let mut w = db.start_write_revision(0, 0).unwrap();
    for key in ["apple", "apricot", "banana", "blueberry", "cherry"] {
        w.upsert(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
    }
    let cursor = w.find(b"banana").unwrap();
    assert_eq!(cursor.value().unwrap(), Some(b"BANANA".to_vec()));
    assert!(!w.find(b"ban").unwrap().is_valid());
    assert_eq!(w.lower_bound(b"ban").unwrap().key(), Some(b"banana".to_vec()));
    assert_eq!(w.lower_bound(b"c").unwrap().key(), Some(b"cherry".to_vec()));
    assert!(!w.lower_bound(b"d").unwrap().is_valid());

    let fruit: Vec<Vec<u8>> = w.prefix_iter(b"ap").unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(fruit, vec![b"apple".to_vec(), b"apricot".to_vec()]);
    assert_eq!(w.range_from(b"blue").unwrap().count(), 2);
}

#[test]
fn test_big_values() {
    let db = Database::in_memory(Config::testing()).unwrap();
    let mut w = db.start_write_revision(0, 0).unwrap();
    let big: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    w.upsert(b"blob", &big).unwrap();
    w.upsert(b"blob2", b"small").unwrap();
    assert_eq!(w.get(b"blob").unwrap(), Some(big));
    assert!(db.stats().big_bytes_in_use > 0);
    w.remove(b"blob").unwrap();
    drop(w);
    assert_eq!(db.stats().big_bytes_in_use, 0);
}

#[test]
fn test_oversized_and_empty_keys() {
    let db = Database::in_memory(Config::testing()).unwrap();
    let mut w = db.start_write_revision(0, 0).unwrap();
    assert!(matches!(w.upsert(b"", b"v"), Err(TrieError::EmptyKey)));
    let key = vec![1u8; Config::testing().max_key_size + 1];
    assert!(matches!(w.upsert(&key, b"v"), Err(TrieError::OversizedEntry { .. })));
    assert!(w.is_empty());
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

#[test]
fn test_isolation_under_copy_on_write() {
    for config in configs() {
        let db = Database::in_memory(config).unwrap();
        {
            let mut a = db.start_write_revision(1, 1).unwrap();
            a.upsert(b"a", b"1").unwrap();
            a.upsert(b"ab", b"2").unwrap();
        }
        {
            let mut b = db.start_write_revision(2, 1).unwrap();
            assert!(b.remove(b"ab").unwrap());
            b.upsert(b"b", b"3").unwrap();
        }
        let a = db.read_revision(1).unwrap();
        let b = db.read_revision(2).unwrap();
        assert_eq!(a.get(b"ab").unwrap(), Some(b"2".to_vec()));
        assert_eq!(a.get(b"b").unwrap(), None);
        assert_eq!(b.get(b"ab").unwrap(), None);
        assert_eq!(b.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(b.get(b"b").unwrap(), Some(b"3".to_vec()));
        drop((a, b));
        assert!(db.check().is_ok());
    }
}

#[test]
fn test_revision_chain() {
    let db = Database::in_memory(Config::testing()).unwrap();
    for rev in 0..10u16 {
        let mut w = db.start_write_revision(rev, rev.saturating_sub(1)).unwrap();
        w.upsert(format!("block{:02}", rev).as_bytes(), &rev.to_le_bytes()).unwrap();
        w.upsert(b"head", &rev.to_le_bytes()).unwrap();
    }
    for rev in 0..10u16 {
        let r = db.read_revision(rev).unwrap();
        assert_eq!(r.get(b"head").unwrap(), Some(rev.to_le_bytes().to_vec()));
        assert_eq!(keys_of(&r).len(), rev as usize + 2);
    }
    let report = db.check();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.revisions, 10);

    for rev in 0..10u16 {
        db.free_revision(rev).unwrap();
    }
    assert_eq!(db.stats().live_objects, 0);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let db = Database::in_memory(Config::testing()).unwrap();
    {
        let mut w = db.start_write_revision(0, 0).unwrap();
        for i in 0..100u32 {
            w.upsert(format!("k{:03}", i).as_bytes(), format!("v{}", i).as_bytes()).unwrap();
        }
    }

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..20 {
                    let r = db.read_revision(0).unwrap();
                    for i in (0..100u32).step_by(7) {
                        let value = r.get(format!("k{:03}", i).as_bytes()).unwrap();
                        assert_eq!(value, Some(format!("v{}", i).into_bytes()));
                    }
                    assert_eq!(r.iter().unwrap().count(), 100);
                }
            });
        }
        s.spawn(|| {
            let mut w = db.start_write_revision(1, 0).unwrap();
            for i in 0..100u32 {
                w.upsert(format!("k{:03}", i).as_bytes(), b"rewritten").unwrap();
                if i % 2 == 0 {
                    w.remove(format!("k{:03}", i).as_bytes()).unwrap();
                }
            }
        });
    });

    let r = db.read_revision(1).unwrap();
    assert_eq!(r.iter().unwrap().count(), 50);
    drop(r);
    assert!(db.check().is_ok());
}

// ---------------------------------------------------------------------------
// Arena behaviour
// ---------------------------------------------------------------------------

#[test]
fn test_eviction_is_transparent() {
    let db = Database::in_memory(Config::testing()).unwrap();
    let value = |i: u32| -> Vec<u8> { format!("{:0>100}", i).into_bytes() };
    {
        let mut w = db.start_write_revision(0, 0).unwrap();
        for i in 0..3000u32 {
            w.upsert(format!("key:{:05}", i).as_bytes(), &value(i)).unwrap();
        }
    }
    let stats = db.stats();
    assert!(stats.swaps > 0, "hot tier should have overflowed: {:?}", stats);

    let r = db.read_revision(0).unwrap();
    for i in 0..3000u32 {
        assert_eq!(r.get(format!("key:{:05}", i).as_bytes()).unwrap(), Some(value(i)));
    }
    assert!(db.stats().promotions > 0);
    drop(r);
    assert!(db.check().is_ok());
}

#[test]
fn test_capacity_recovers_after_free() {
    let db = Database::in_memory(Config::testing()).unwrap();
    let fill = |db: &Database| {
        let mut w = db.start_write_revision(0, 0).unwrap();
        for i in 0..1500u32 {
            w.upsert(format!("item{}", i).as_bytes(), &vec![i as u8; 10 + (i % 90) as usize]).unwrap();
        }
    };
    for _ in 0..3 {
        fill(&db);
        db.free_revision(0).unwrap();
        let stats = db.stats();
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.hot_pages_in_use, 0);
        assert_eq!(stats.cold_pages_in_use, 0);
    }
}

#[test]
fn test_exhausted_arena_leaves_revision_intact() {
    for mut config in configs() {
        config.hot_bytes = 16 * PAGE_SIZE as u64;
        config.cold_bytes = 48 * PAGE_SIZE as u64;
        let db = Database::in_memory(config).unwrap();
        {
            // ballast, freed later to make room for reads
            let mut w = db.start_write_revision(1, 1).unwrap();
            for i in 0..200u32 {
                w.upsert(format!("ballast/{:03}", i).as_bytes(), &[7u8; 300]).unwrap();
            }
        }

        let mut model = BTreeMap::new();
        let mut w = db.start_write_revision(0, 0).unwrap();
        let mut failed = None;
        for i in 0..100_000u32 {
            let key = format!("fill/{:05}", i).into_bytes();
            let value = vec![i as u8; 200];
            match w.upsert(&key, &value) {
                Ok(inserted) => {
                    assert!(inserted);
                    model.insert(key, value);
                }
                Err(err) => {
                    assert!(matches!(err, TrieError::NoFreePages { .. }), "{}", err);
                    failed = Some(key);
                    break;
                }
            }
        }
        let failed = failed.expect("tiers should fill up");
        assert!(!model.is_empty());

        let mut removal_failures = 0;
        let keys: Vec<Vec<u8>> = model.keys().step_by(7).cloned().collect();
        for key in keys {
            match w.remove(&key) {
                Ok(existed) => {
                    assert!(existed);
                    model.remove(&key);
                }
                Err(err) => {
                    assert!(matches!(err, TrieError::NoFreePages { .. }), "{}", err);
                    removal_failures += 1;
                }
            }
        }
        drop(w);
        let report = db.check();
        assert!(report.is_ok(), "removal failures {}: {:?}", removal_failures, report.problems);

        db.free_revision(1).unwrap();
        let r = db.read_revision(0).unwrap();
        assert_eq!(r.get(&failed).unwrap(), None);
        for (key, value) in &model {
            assert_eq!(r.get(key).unwrap().as_ref(), Some(value));
        }
        assert_eq!(keys_of(&r), model.keys().cloned().collect::<Vec<_>>());
        drop(r);
        assert!(db.check().is_ok());
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_reopen_keeps_every_revision() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(dir.path(), Config::testing()).unwrap();
        let mut w = db.start_write_revision(0, 0).unwrap();
        for i in 0..500u32 {
            w.upsert(format!("acct/{:04}", i).as_bytes(), &i.to_be_bytes()).unwrap();
        }
        drop(w);
        let mut w = db.start_write_revision(5, 0).unwrap();
        w.remove(b"acct/0000").unwrap();
        w.upsert(b"big", &vec![9u8; 10_000]).unwrap();
        drop(w);
        db.sync().unwrap();
    }
    {
        let db = Database::open(dir.path(), Config::testing()).unwrap();
        assert!(db.check().is_ok());
        let r0 = db.read_revision(0).unwrap();
        let r5 = db.read_revision(5).unwrap();
        assert_eq!(keys_of(&r0).len(), 500);
        assert_eq!(r0.get(b"acct/0000").unwrap(), Some(0u32.to_be_bytes().to_vec()));
        assert_eq!(r5.get(b"acct/0000").unwrap(), None);
        assert_eq!(r5.get(b"big").unwrap(), Some(vec![9u8; 10_000]));
        assert_eq!(r5.first().unwrap().key(), Some(b"acct/0001".to_vec()));
    }
}

#[test]
fn test_reopen_then_write() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(dir.path(), Config::testing()).unwrap();
        let mut w = db.start_write_revision(0, 0).unwrap();
        w.upsert(b"first", b"1").unwrap();
    }
    let db = Database::open(dir.path(), Config::testing()).unwrap();
    let mut w = db.start_write_revision(0, 0).unwrap();
    w.upsert(b"second", b"2").unwrap();
    assert_eq!(keys_of(&w), vec![b"first".to_vec(), b"second".to_vec()]);
    drop(w);
    assert!(db.check().is_ok());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Upsert(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c', 0u8, 0xff]), 1..6)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (key_strategy(), prop::collection::vec(any::<u8>(), 0..24)).prop_map(|(k, v)| Op::Upsert(k, v)),
        1 => key_strategy().prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_matches_btreemap(
        ops in prop::collection::vec(op_strategy(), 1..120),
        seek in key_strategy(),
        clusters in prop::bool::ANY,
    ) {
        let config = if clusters { Config::testing() } else { Config::testing().without_clusters() };
        let db = Database::in_memory(config).unwrap();
        let mut model = BTreeMap::new();
        let mut w = db.start_write_revision(0, 0).unwrap();
        for op in &ops {
            match op {
                Op::Upsert(k, v) => {
                    let inserted = w.upsert(k, v).unwrap();
                    prop_assert_eq!(inserted, model.insert(k.clone(), v.clone()).is_none());
                }
                Op::Remove(k) => {
                    let existed = w.remove(k).unwrap();
                    prop_assert_eq!(existed, model.remove(k).is_some());
                }
            }
        }
        for (k, v) in &model {
            prop_assert_eq!(w.get(k).unwrap(), Some(v.clone()));
        }
        let forward: Vec<(Vec<u8>, Vec<u8>)> = w.iter().unwrap().map(|e| e.unwrap()).collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.clone().into_iter().collect();
        prop_assert_eq!(forward, expected);
        let mut backward = keys_backward(&w);
        backward.reverse();
        prop_assert_eq!(backward, model.keys().cloned().collect::<Vec<_>>());

        {
            let mut cursor = w.lower_bound(&seek).unwrap();
            prop_assert_eq!(cursor.key(), model.range(seek.clone()..).next().map(|(k, _)| k.clone()));
            if cursor.is_valid() {
                cursor.move_prev().unwrap();
                prop_assert_eq!(cursor.key(), model.range(..seek.clone()).next_back().map(|(k, _)| k.clone()));
            }
        }
        let prefixed: Vec<Vec<u8>> = model.keys().filter(|k| k.starts_with(&seek)).cloned().collect();
        let found: Vec<Vec<u8>> = w.prefix_iter(&seek).unwrap().map(|e| e.unwrap().0).collect();
        prop_assert_eq!(&found, &prefixed);
        prop_assert_eq!(w.last_with_prefix(&seek).unwrap().key(), prefixed.last().cloned());
        drop(w);
        let report = db.check();
        prop_assert!(report.is_ok(), "{:?}", report.problems);
    }

    #[test]
    fn prop_snapshot_is_unaffected(
        base in prop::collection::vec(op_strategy(), 1..60),
        edits in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let db = Database::in_memory(Config::testing()).unwrap();
        {
            let mut w = db.start_write_revision(0, 0).unwrap();
            for op in &base {
                match op {
                    Op::Upsert(k, v) => { w.upsert(k, v).unwrap(); }
                    Op::Remove(k) => { w.remove(k).unwrap(); }
                }
            }
        }
        let before: Vec<(Vec<u8>, Vec<u8>)> = {
            let r = db.read_revision(0).unwrap();
            let entries = r.iter().unwrap().map(|e| e.unwrap()).collect();
            entries
        };
        {
            let mut w = db.start_write_revision(1, 0).unwrap();
            for op in &edits {
                match op {
                    Op::Upsert(k, v) => { w.upsert(k, v).unwrap(); }
                    Op::Remove(k) => { w.remove(k).unwrap(); }
                }
            }
        }
        let r = db.read_revision(0).unwrap();
        let after: Vec<(Vec<u8>, Vec<u8>)> = r.iter().unwrap().map(|e| e.unwrap()).collect();
        prop_assert_eq!(before, after);
        drop(r);
        db.free_revision(1).unwrap();
        db.free_revision(0).unwrap();
        prop_assert_eq!(db.stats().live_objects, 0);
    }
}
