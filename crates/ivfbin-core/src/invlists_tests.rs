//! Tests for `invlists` module

use super::config::DeviceConfig;
use super::error::Error;
use super::invlists::*;
use super::resources::{DeviceResources, MemorySpace};
use std::sync::Arc;

fn device(memory_bytes: usize) -> Arc<DeviceResources> {
    Arc::new(DeviceResources::new(&DeviceConfig {
        memory_bytes,
        ..DeviceConfig::default()
    }))
}

fn lists(nlist: usize, code_size: usize) -> DeviceInvertedLists {
    DeviceInvertedLists::new(nlist, code_size, device(1 << 20))
}

#[test]
fn test_append_returns_consecutive_offsets() {
    // Arrange
    let lists = lists(3, 2);

    // Act
    let a = lists.append(1, 10, &[0xAA, 0x01]).expect("append");
    let b = lists.append(1, 11, &[0xBB, 0x02]).expect("append");
    let c = lists.append(2, 12, &[0xCC, 0x03]).expect("append");

    // Assert
    assert_eq!((a, b, c), (0, 1, 0));
    assert_eq!(lists.list_sizes(), vec![0, 2, 1]);
    assert_eq!(lists.total_len(), 3);
    assert_eq!(lists.get(1, 1), Some((11, vec![0xBB, 0x02])));
}

#[test]
fn test_append_batch_wrong_code_length() {
    let lists = lists(1, 4);
    let mut guard = lists.write_list(0).expect("lock");

    let err = guard.append_batch(&[1, 2], &[0u8; 7]).unwrap_err();

    assert!(matches!(
        err,
        Error::DimensionMismatch {
            expected: 64,
            actual: 56
        }
    ));
    assert!(guard.is_empty());
}

#[test]
fn test_out_of_range_list_is_rejected() {
    let lists = lists(2, 1);

    assert!(matches!(lists.append(2, 0, &[0]), Err(Error::InvalidArgument(_))));
    assert!(lists.read_list(5).is_err());
    assert_eq!(lists.list_len(9), 0);
    assert_eq!(lists.get(9, 0), None);
}

#[test]
fn test_reservation_grows_geometrically() {
    let res = device(1 << 20);
    let lists = DeviceInvertedLists::new(1, 8, Arc::clone(&res));
    let entry = lists.entry_bytes();
    assert_eq!(entry, 16);

    lists.append(0, 0, &[0; 8]).expect("append");
    assert_eq!(lists.reserved_bytes(), MIN_LIST_CAPACITY * entry);

    let ids: Vec<i64> = (1..=MIN_LIST_CAPACITY as i64).collect();
    let codes = vec![0u8; ids.len() * 8];
    lists
        .write_list(0)
        .expect("lock")
        .append_batch(&ids, &codes)
        .expect("append");

    assert_eq!(lists.reserved_bytes(), 2 * MIN_LIST_CAPACITY * entry);
    assert_eq!(res.used_memory(MemorySpace::Device), lists.reserved_bytes());
}

#[test]
fn test_out_of_memory_leaves_list_unchanged() {
    // Arrange: room for exactly one minimum reservation
    let lists = DeviceInvertedLists::new(2, 8, device(MIN_LIST_CAPACITY * 16));
    lists.append(0, 1, &[1; 8]).expect("first list fits");

    // Act
    let err = lists.append(1, 2, &[2; 8]).unwrap_err();

    // Assert
    assert!(err.is_retryable());
    assert_eq!(lists.list_len(1), 0);
    assert_eq!(lists.total_len(), 1);
    assert_eq!(lists.get(0, 0), Some((1, vec![1; 8])));
}

#[test]
fn test_failed_growth_keeps_existing_entries() {
    let lists = DeviceInvertedLists::new(1, 8, device(MIN_LIST_CAPACITY * 16));
    let ids: Vec<i64> = (0..MIN_LIST_CAPACITY as i64).collect();
    let codes = vec![7u8; ids.len() * 8];
    lists
        .write_list(0)
        .expect("lock")
        .append_batch(&ids, &codes)
        .expect("fits");

    assert!(lists.append(0, 99, &[0; 8]).is_err());

    let guard = lists.read_list(0).expect("lock");
    assert_eq!(guard.len(), MIN_LIST_CAPACITY);
    assert_eq!(guard.ids(), &ids[..]);
}

#[test]
fn test_reset_empties_lists_and_releases_memory() {
    let res = device(1 << 20);
    let lists = DeviceInvertedLists::new(4, 1, Arc::clone(&res));
    for i in 0..20 {
        lists.append(i % 4, i as i64, &[i as u8]).expect("append");
    }
    assert_eq!(lists.generation(), 0);

    lists.reset();

    assert_eq!(lists.generation(), 1);
    assert_eq!(lists.total_len(), 0);
    assert_eq!(lists.list_sizes(), vec![0; 4]);
    assert_eq!(res.used_memory(MemorySpace::Device), 0);
    assert_eq!(lists.append(3, 5, &[5]).expect("append after reset"), 0);
}

#[test]
fn test_read_guard_views() {
    let lists = lists(1, 2);
    for i in 0..4u8 {
        lists.append(0, i64::from(i) + 100, &[i, i]).expect("append");
    }

    let guard = lists.read_list(0).expect("lock");
    let (ids, codes) = guard.prefix(2);
    let streamed: Vec<i64> = guard.iter().map(|(id, _)| id).collect();

    assert_eq!(ids, &[100, 101]);
    assert_eq!(codes, &[0, 0, 1, 1]);
    assert_eq!(guard.prefix(10).0.len(), 4);
    assert_eq!(guard.code(3), Some(&[3u8, 3][..]));
    assert_eq!(guard.code(4), None);
    assert_eq!(streamed, vec![100, 101, 102, 103]);
}

#[test]
fn test_imbalance_factor() {
    let lists = lists(2, 1);
    assert!(lists.imbalance_factor().abs() < f64::EPSILON);

    lists.append(0, 0, &[0]).expect("append");
    lists.append(1, 1, &[0]).expect("append");
    assert!((lists.imbalance_factor() - 1.0).abs() < 1e-9);

    lists.append(0, 2, &[0]).expect("append");
    lists.append(0, 3, &[0]).expect("append");
    // sizes [3, 1]: (9 + 1) * 2 / 16
    assert!((lists.imbalance_factor() - 1.25).abs() < 1e-9);
}

#[test]
fn test_handle_ownership() {
    let shared = Arc::new(lists(1, 1));
    let owned = InvListsHandle::Owned(Box::new(lists(1, 1)));
    let borrowed = InvListsHandle::Shared(Arc::clone(&shared));

    borrowed.append(0, 7, &[1]).expect("append through handle");

    assert!(owned.is_owned());
    assert!(!borrowed.is_owned());
    assert_eq!(shared.total_len(), 1);
}

#[test]
fn test_append_one_list_while_scanning_another() {
    let lists = Arc::new(lists(2, 1));
    lists.append(0, 0, &[0]).expect("append");

    let reader = lists.read_list(0).expect("lock");
    let writer = {
        let lists = Arc::clone(&lists);
        std::thread::spawn(move || {
            for i in 0..100 {
                lists.append(1, i, &[1]).expect("append");
            }
        })
    };
    writer.join().expect("writer thread");

    assert_eq!(reader.len(), 1);
    drop(reader);
    assert_eq!(lists.list_len(1), 100);
    assert_eq!(lists.total_len(), 101);
}
