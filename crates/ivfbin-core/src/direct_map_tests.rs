//! Tests for `direct_map` module

use super::config::DeviceConfig;
use super::direct_map::*;
use super::error::Error;
use super::invlists::DeviceInvertedLists;
use super::resources::DeviceResources;
use std::sync::Arc;

fn lists_with(entries: &[(usize, i64)]) -> DeviceInvertedLists {
    let res = Arc::new(DeviceResources::new(&DeviceConfig::default()));
    let lists = DeviceInvertedLists::new(3, 1, res);
    for &(list, id) in entries {
        lists.append(list, id, &[0]).expect("append");
    }
    lists
}

#[test]
fn test_default_is_hashtable() {
    assert_eq!(DirectMap::default().kind(), DirectMapType::Hashtable);
}

#[test]
fn test_hashtable_insert_and_lookup() {
    let map = DirectMap::new(DirectMapType::Hashtable);

    map.insert_batch(&[42, -3], 2, 5).expect("insert");

    assert_eq!(map.lookup(42).expect("id"), Location { list: 2, offset: 5 });
    assert_eq!(map.lookup(-3).expect("id"), Location { list: 2, offset: 6 });
    assert!(matches!(map.lookup(7), Err(Error::NotFound(7))));
    assert_eq!(map.len(), 2);
}

#[test]
fn test_hashtable_claims_reject_duplicates() {
    // Arrange
    let map = DirectMap::new(DirectMapType::Hashtable);
    map.insert_batch(&[1], 0, 0).expect("insert");

    // Act
    let stored = map.claim_ids(&[2, 1], 1);
    let repeated = map.claim_ids(&[4, 4], 1);

    // Assert
    assert!(matches!(stored, Err(Error::InvalidArgument(_))));
    assert!(matches!(repeated, Err(Error::InvalidArgument(_))));
    // Failed claims leave nothing behind
    map.claim_ids(&[2, 4], 1).expect("free ids");
    assert!(matches!(map.claim_ids(&[4], 3), Err(Error::InvalidArgument(_))));
    assert!(matches!(map.lookup(4), Err(Error::NotFound(4))));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_release_returns_only_pending_ids() {
    let map = DirectMap::new(DirectMapType::Hashtable);
    map.claim_ids(&[5, 6], 0).expect("claim");
    map.insert_batch(&[5], 1, 0).expect("commit");

    map.release(&[5, 6]);

    assert_eq!(map.lookup(5).expect("committed"), Location { list: 1, offset: 0 });
    map.claim_ids(&[6], 1).expect("released id is free again");
}

#[test]
fn test_array_requires_sequential_ids() {
    let map = DirectMap::new(DirectMapType::Array);

    assert!(map.claim_ids(&[3, 5], 3).is_err());
    assert!(map.claim_ids(&[0], 3).is_err());
    assert!(map.claim_ids(&[-1], 0).is_err());
    assert!(map.claim_ids(&[3, 4, 5], 3).is_ok());
}

#[test]
fn test_array_claims_are_exclusive() {
    let map = DirectMap::new(DirectMapType::Array);
    map.claim_ids(&[0, 1], 0).expect("claim");

    assert!(matches!(map.claim_ids(&[0], 0), Err(Error::InvalidArgument(_))));
    assert!(matches!(map.lookup(0), Err(Error::NotFound(0))));
    assert!(map.is_empty());

    map.release(&[0, 1]);
    map.claim_ids(&[0], 0).expect("released");
    map.insert_batch(&[0], 2, 3).expect("commit");
    assert_eq!(map.lookup(0).expect("id"), Location { list: 2, offset: 3 });
    assert_eq!(map.len(), 1);
}

#[test]
fn test_array_out_of_order_inserts() {
    let map = DirectMap::new(DirectMapType::Array);

    map.insert_batch(&[2], 1, 0).expect("insert");
    map.insert_batch(&[0, 1], 0, 0).expect("insert");

    assert_eq!(map.len(), 3);
    assert_eq!(map.lookup(1).expect("id"), Location { list: 0, offset: 1 });
    assert!(matches!(map.lookup(3), Err(Error::NotFound(3))));
}

#[test]
fn test_no_map_disables_lookup() {
    let map = DirectMap::new(DirectMapType::NoMap);
    map.insert_batch(&[1], 0, 0).expect("noop");

    assert!(map.is_empty());
    assert!(map.claim_ids(&[9, 9], 0).is_ok());
    assert!(matches!(map.lookup(1), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_clear_keeps_type() {
    let map = DirectMap::new(DirectMapType::Array);
    map.insert_batch(&[0], 0, 0).expect("insert");

    map.clear();

    assert!(map.is_empty());
    assert_eq!(map.kind(), DirectMapType::Array);
}

#[test]
fn test_set_type_rebuilds_from_lists() {
    // Arrange
    let lists = lists_with(&[(0, 1), (2, 0), (0, 2)]);
    let map = DirectMap::new(DirectMapType::NoMap);

    // Act
    map.set_type(DirectMapType::Array, &lists).expect("dense ids");

    // Assert
    assert_eq!(map.lookup(0).expect("id"), Location { list: 2, offset: 0 });
    assert_eq!(map.lookup(2).expect("id"), Location { list: 0, offset: 1 });
    assert!(map.verify(&lists).is_empty());
}

#[test]
fn test_set_type_array_rejects_sparse_ids() {
    let lists = lists_with(&[(0, 0), (1, 5)]);
    let map = DirectMap::new(DirectMapType::Hashtable);
    map.rebuild(&lists).expect("hashtable accepts any ids");

    let err = map.set_type(DirectMapType::Array, &lists).unwrap_err();

    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(map.kind(), DirectMapType::Hashtable);
    assert_eq!(map.lookup(5).expect("kept").list, 1);
}

#[test]
fn test_verify_reports_and_rebuild_repairs() {
    let lists = lists_with(&[(0, 10), (1, 11)]);
    let map = DirectMap::new(DirectMapType::Hashtable);
    map.insert_batch(&[10], 0, 0).expect("insert");
    map.insert_batch(&[11], 2, 0).expect("wrong list");
    map.insert_batch(&[99], 1, 4).expect("stale entry");

    let mut bad = map.verify(&lists);
    bad.sort_unstable();
    assert_eq!(bad, vec![11, 99]);

    map.rebuild(&lists).expect("rebuild");
    assert!(map.verify(&lists).is_empty());
    assert_eq!(map.len(), 2);
}
