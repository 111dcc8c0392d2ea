//! End-to-end scenarios: tree behavior against an oracle map, durability
//! across checkpoint/reopen, and the observable resource invariants.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use betula_common::BetulaError;
use betula_swap::{FileStore, FileStoreConfig, LruCacheManager, MemStore, SwapSpace};
use betula_tree::{Betree, TreeConfig};

fn concat(a: &String, b: &String) -> String {
    format!("{a}{b}")
}

fn mem_space(cache: u64) -> SwapSpace {
    SwapSpace::new(
        Box::new(MemStore::new()),
        Box::new(LruCacheManager::new(cache)),
    )
    .unwrap()
}

fn file_space(dir: &std::path::Path, cache: u64) -> SwapSpace {
    let store = FileStore::open(FileStoreConfig {
        dir: dir.to_path_buf(),
        fsync_enabled: false,
    })
    .unwrap();
    SwapSpace::new(Box::new(store), Box::new(LruCacheManager::new(cache))).unwrap()
}

fn small_tree(space: &SwapSpace) -> Betree<u64, String> {
    Betree::create(space, TreeConfig::new(16, 4), String::new(), concat).unwrap()
}

fn assert_matches_oracle(tree: &Betree<u64, String>, oracle: &BTreeMap<u64, String>) {
    let entries: Vec<(u64, String)> = tree.iter().unwrap().map(|e| e.unwrap()).collect();
    let expected: Vec<(u64, String)> = oracle.iter().map(|(k, v)| (*k, v.clone())).collect();
    assert_eq!(entries, expected);
}

#[test]
fn insert_query_erase_roundtrip() {
    // S1
    let space = mem_space(4);
    let tree = small_tree(&space);

    tree.insert(5, "a".to_string()).unwrap();
    assert_eq!(tree.query(&5).unwrap(), "a");

    tree.erase(5).unwrap();
    assert!(matches!(tree.query(&5), Err(BetulaError::NotFound)));
}

#[test]
fn updates_concatenate_from_default() {
    // S2
    let space = mem_space(4);
    let tree = small_tree(&space);

    tree.update(7, "x".to_string()).unwrap();
    tree.update(7, "y".to_string()).unwrap();
    assert_eq!(tree.query(&7).unwrap(), "xy");
}

#[test]
fn update_after_insert_appends() {
    // S3
    let space = mem_space(4);
    let tree = small_tree(&space);

    tree.insert(7, "A".to_string()).unwrap();
    tree.update(7, "B".to_string()).unwrap();
    assert_eq!(tree.query(&7).unwrap(), "AB");
}

#[test]
fn update_chain_folds_left_to_right() {
    // Property 8: a run of updates against a missing key folds as
    // (((default ⊕ v1) ⊕ v2) ... ⊕ vk).
    let space = mem_space(4);
    let tree = small_tree(&space);

    let mut expected = String::new();
    for i in 0..10 {
        let piece = format!("{i},");
        tree.update(42, piece.clone()).unwrap();
        expected.push_str(&piece);
    }
    assert_eq!(tree.query(&42).unwrap(), expected);
}

#[test]
fn thousand_inserts_query_and_scan() {
    // S4: max_node_size=16, min_flush_size=4, cache_size=4.
    let space = mem_space(4);
    let tree = small_tree(&space);

    for k in 0..1000u64 {
        tree.insert(k, format!("{k}:")).unwrap();
    }
    tree.check_invariants().unwrap();
    space.verify_referents().unwrap();

    for k in 0..1000u64 {
        assert_eq!(tree.query(&k).unwrap(), format!("{k}:"));
    }

    let entries: Vec<(u64, String)> = tree.iter().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 1000);
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(*k, i as u64);
        assert_eq!(*v, format!("{i}:"));
    }
}

#[test]
fn checkpoint_after_every_insert_survives_reopen() {
    // S5: like S4 but checkpointing after every insert, then reopening
    // the swap space from the backing-store root.
    let dir = tempdir().unwrap();
    let count = 1000u64;

    {
        let space = file_space(dir.path(), 4);
        let tree = small_tree(&space);
        for k in 0..count {
            tree.insert(k, format!("{k}:")).unwrap();
            space.checkpoint().unwrap();
        }
        space.verify_referents().unwrap();
    }

    let space = file_space(dir.path(), 4);
    space.verify_referents().unwrap();
    let tree: Betree<u64, String> = Betree::open(&space, concat).unwrap();

    for k in 0..count {
        assert_eq!(tree.query(&k).unwrap(), format!("{k}:"));
    }
    let entries: Vec<(u64, String)> = tree.iter().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), count as usize);
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(*k, i as u64);
        assert_eq!(*v, format!("{i}:"));
    }
}

#[test]
fn random_operations_match_oracle() {
    // S6: 4096 random operations over 1024 distinct keys, mirrored into
    // a shadow BTreeMap.
    let space = mem_space(4);
    let tree = small_tree(&space);
    let mut oracle: BTreeMap<u64, String> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x42);

    for step in 0..4096u32 {
        let key = rng.gen_range(0..1024u64);
        let payload = format!("{key}:");
        match rng.gen_range(0..7u32) {
            0 | 1 => {
                tree.insert(key, payload.clone()).unwrap();
                oracle.insert(key, payload);
            }
            2 => {
                tree.update(key, payload.clone()).unwrap();
                oracle
                    .entry(key)
                    .and_modify(|v| v.push_str(&payload))
                    .or_insert(payload);
            }
            3 => {
                tree.erase(key).unwrap();
                oracle.remove(&key);
            }
            4 => match tree.query(&key) {
                Ok(value) => assert_eq!(Some(&value), oracle.get(&key)),
                Err(BetulaError::NotFound) => assert!(!oracle.contains_key(&key)),
                Err(e) => panic!("query failed: {e}"),
            },
            5 => {
                let got: Vec<(u64, String)> =
                    tree.lower_bound(&key).unwrap().map(|e| e.unwrap()).collect();
                let want: Vec<(u64, String)> = oracle
                    .range(key..)
                    .map(|(k, v)| (*k, v.clone()))
                    .collect();
                assert_eq!(got, want);
            }
            _ => {
                let got: Vec<(u64, String)> =
                    tree.upper_bound(&key).unwrap().map(|e| e.unwrap()).collect();
                let want: Vec<(u64, String)> = oracle
                    .range(key + 1..)
                    .map(|(k, v)| (*k, v.clone()))
                    .collect();
                assert_eq!(got, want);
            }
        }

        // Shape invariants at rest (properties 3 and 4), checked
        // periodically to keep the test quick.
        if step % 256 == 0 {
            tree.check_invariants().unwrap();
            space.verify_referents().unwrap();
        }
    }

    tree.check_invariants().unwrap();
    space.verify_referents().unwrap();
    assert_matches_oracle(&tree, &oracle);
}

#[test]
fn size_bound_holds_after_every_mutation() {
    // Property 4, checked after every returning mutation on a small,
    // split-happy configuration.
    let space = mem_space(8);
    let tree: Betree<u64, String> =
        Betree::create(&space, TreeConfig::new(8, 2), String::new(), concat).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..400 {
        let key = rng.gen_range(0..64u64);
        match rng.gen_range(0..3u32) {
            0 => tree.insert(key, "v".to_string()).unwrap(),
            1 => tree.update(key, "+".to_string()).unwrap(),
            _ => tree.erase(key).unwrap(),
        }
        tree.check_invariants().unwrap();
    }
}

#[test]
fn resident_set_stays_bounded() {
    // Property 7: with cache_size = n, at most n targets stay resident,
    // allowing the handful of pins a single operation holds on its
    // root-to-leaf path.
    let cache = 4u64;
    let space = mem_space(cache);
    let tree = small_tree(&space);

    for k in 0..500u64 {
        tree.insert(k, format!("{k}:")).unwrap();
        assert!(
            space.resident_count() as u64 <= cache + 8,
            "resident {} after insert {k}",
            space.resident_count()
        );
    }
    for k in (0..500u64).step_by(7) {
        tree.query(&k).unwrap();
        assert!(space.resident_count() as u64 <= cache + 8);
    }
}

#[test]
fn mixed_workload_survives_checkpoint_and_reopen() {
    // Checkpoint durability (property 6) for a workload with deletes and
    // updates, not just inserts.
    let dir = tempdir().unwrap();
    let mut oracle: BTreeMap<u64, String> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(99);

    {
        let space = file_space(dir.path(), 4);
        let tree = small_tree(&space);
        for _ in 0..600 {
            let key = rng.gen_range(0..128u64);
            let payload = format!("{key};");
            match rng.gen_range(0..4u32) {
                0 | 1 => {
                    tree.insert(key, payload.clone()).unwrap();
                    oracle.insert(key, payload);
                }
                2 => {
                    tree.update(key, payload.clone()).unwrap();
                    oracle
                        .entry(key)
                        .and_modify(|v| v.push_str(&payload))
                        .or_insert(payload);
                }
                _ => {
                    tree.erase(key).unwrap();
                    oracle.remove(&key);
                }
            }
        }
        space.checkpoint().unwrap();
    }

    let space = file_space(dir.path(), 4);
    let tree: Betree<u64, String> = Betree::open(&space, concat).unwrap();
    assert_matches_oracle(&tree, &oracle);
    for (k, v) in &oracle {
        assert_eq!(&tree.query(k).unwrap(), v);
    }
}

#[test]
fn reopened_tree_accepts_further_mutations() {
    let dir = tempdir().unwrap();

    {
        let space = file_space(dir.path(), 4);
        let tree = small_tree(&space);
        for k in 0..100u64 {
            tree.insert(k, "first".to_string()).unwrap();
        }
        space.checkpoint().unwrap();
    }

    {
        let space = file_space(dir.path(), 4);
        let tree: Betree<u64, String> = Betree::open(&space, concat).unwrap();
        for k in 100..200u64 {
            tree.insert(k, "second".to_string()).unwrap();
        }
        tree.erase(0).unwrap();
        space.checkpoint().unwrap();
    }

    let space = file_space(dir.path(), 4);
    let tree: Betree<u64, String> = Betree::open(&space, concat).unwrap();
    assert!(tree.query(&0).is_err());
    assert_eq!(tree.query(&50).unwrap(), "first");
    assert_eq!(tree.query(&150).unwrap(), "second");
    assert_eq!(tree.iter().unwrap().count(), 199);
}
