//! End-to-end tests for the binary IVF index through the public API.
//!
//! Covers the exhaustive-probe equivalence with brute force, paging
//! invariance, concurrent add/search, and configuration-driven construction.

use std::io::Write;
use std::sync::Arc;
use std::thread;

use ivfbin_core::{
    hamming_distance, init_tracing, BinaryIvfIndex, DeviceConfig, DeviceInvertedLists,
    DeviceResources, FlatBinaryQuantizer, IvfConfig, LoggingConfig, MemorySpace, QuantizerHandle,
    ResourcesProvider, SearchParams, StandardResources, SENTINEL_ID,
};
use proptest::prelude::*;

/// Deterministic pseudo-random codes (LCG).
fn generate_codes(n: usize, code_size: usize, seed: u64) -> Vec<u8> {
    let mut x = seed;
    (0..n * code_size)
        .map(|_| {
            x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (x >> 56) as u8
        })
        .collect()
}

/// Index with `nlist` centroids taken from the first codes of `codes`.
fn seeded_index(
    provider: &dyn ResourcesProvider,
    dims: usize,
    nlist: usize,
    codes: &[u8],
    config: &IvfConfig,
) -> BinaryIvfIndex {
    let code_size = dims / 8;
    let mut quantizer = FlatBinaryQuantizer::new(code_size);
    quantizer
        .add_centroids(&codes[..nlist * code_size])
        .expect("centroids");
    BinaryIvfIndex::new(
        provider,
        QuantizerHandle::Owned(Box::new(quantizer)),
        dims,
        nlist,
        config,
    )
    .expect("index")
}

/// Sorted `(distance, id)` of every stored code, cut at `k`.
fn brute_force(codes: &[u8], query: &[u8], k: usize) -> Vec<(i32, i64)> {
    let mut all: Vec<(i32, i64)> = codes
        .chunks_exact(query.len())
        .enumerate()
        .map(|(id, code)| (hamming_distance(query, code) as i32, id as i64))
        .collect();
    all.sort_unstable();
    all.truncate(k);
    all
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// With a single list every stored code is scanned.
    #[test]
    fn prop_single_list_matches_brute_force(
        seed in any::<u64>(),
        n in 1usize..200,
        nq in 1usize..8,
        k in 1usize..12,
        use_heap in any::<bool>(),
    ) {
        let res = StandardResources::new();
        let codes = generate_codes(n, 4, seed);
        let queries = generate_codes(nq, 4, seed ^ 0xABCD);
        let index = seeded_index(&res, 32, 1, &codes, &IvfConfig::default());
        index.add(&codes).expect("add");
        index.set_use_heap(use_heap);

        let results = index.search(&queries, k).expect("search");

        for (q, query) in queries.chunks_exact(4).enumerate() {
            let expected = brute_force(&codes, query, k);
            let (distances, labels) = results.row(q);
            for (i, &(d, id)) in expected.iter().enumerate() {
                prop_assert_eq!(distances[i], d);
                prop_assert_eq!(labels[i], id);
            }
            prop_assert!(labels[expected.len()..].iter().all(|&l| l == SENTINEL_ID));
        }
    }

    /// Paged results do not depend on the chunk size.
    #[test]
    fn prop_paging_is_invisible(
        seed in any::<u64>(),
        nq in 1usize..40,
        chunk_rows in 1usize..16,
        max_codes in 0usize..50,
        per_invlist_search in any::<bool>(),
    ) {
        let res = StandardResources::new();
        let codes = generate_codes(300, 2, seed);
        let queries = generate_codes(nq, 2, seed.wrapping_add(7));
        let index = seeded_index(&res, 16, 8, &codes, &IvfConfig::default());
        index.add(&codes).expect("add");
        index.set_nprobe(3).expect("nprobe");
        index.set_max_codes(max_codes);
        index.set_per_invlist_search(per_invlist_search);

        let direct = index.search(&queries, 5).expect("search");
        let paged = index
            .search_paged_with_chunk_rows(&queries, 5, chunk_rows)
            .expect("paged search");

        prop_assert_eq!(direct, paged);
    }
}

#[test]
fn test_full_probe_equals_brute_force() {
    // Arrange
    let res = StandardResources::new();
    let codes = generate_codes(500, 8, 42);
    let queries = generate_codes(10, 8, 43);
    let index = seeded_index(&res, 64, 16, &codes, &IvfConfig::default());
    index.add(&codes).expect("add");
    let params = SearchParams {
        nprobe: 16,
        ..SearchParams::default()
    };

    // Act
    let results = index.search_with_params(&queries, 10, &params).expect("search");

    // Assert
    for (q, query) in queries.chunks_exact(8).enumerate() {
        let expected = brute_force(&codes, query, 10);
        let got: Vec<(i32, i64)> = results
            .row(q)
            .0
            .iter()
            .copied()
            .zip(results.row(q).1.iter().copied())
            .collect();
        assert_eq!(got, expected, "query {q}");
    }
}

#[test]
fn test_large_batch_is_paged_transparently() {
    let res = StandardResources::new();
    let codes = generate_codes(200, 4, 3);
    let queries = generate_codes(64, 4, 4);
    let mut config = IvfConfig::default();
    config.paging.min_paged_bytes = 16;
    config.paging.page_bytes = 24;
    config.paging.pinned_staging_bytes = 0;
    let paged_index = seeded_index(&res, 32, 4, &codes, &config);
    let plain_index = seeded_index(&res, 32, 4, &codes, &IvfConfig::default());
    paged_index.add(&codes).expect("add");
    plain_index.add(&codes).expect("add");

    let paged = paged_index.search(&queries, 4).expect("paged");
    let plain = plain_index.search(&queries, 4).expect("plain");

    assert_eq!(paged, plain);
    assert_eq!(paged_index.stats().nq, 64);
}

#[test]
fn test_out_of_memory_search_falls_back_to_paging() {
    // Arrange: one list of 16 entries (144 bytes); the whole batch needs
    // 32 + 768 bytes, a half batch 384
    let codes = generate_codes(16, 1, 9);
    let queries = generate_codes(32, 1, 10);
    let res = Arc::new(DeviceResources::new(&DeviceConfig {
        memory_bytes: 144 + 400,
        ..DeviceConfig::default()
    }));
    let index = seeded_index(&res, 8, 1, &codes, &IvfConfig::default());
    index.add(&codes).expect("add");
    let reference = seeded_index(&StandardResources::new(), 8, 1, &codes, &IvfConfig::default());
    reference.add(&codes).expect("add");

    // Act
    let results = index.search(&queries, 2).expect("fallback search");

    // Assert
    assert_eq!(results, reference.search(&queries, 2).expect("search"));
    assert_eq!(res.used_memory(MemorySpace::Device), 144);
}

/// 4 writers and 4 readers; every search returns well-formed rows and every
/// added code is retrievable afterwards.
#[test]
fn test_concurrent_add_and_search() {
    let res = StandardResources::new();
    let seed_codes = generate_codes(32, 4, 1);
    let index = Arc::new(seeded_index(&res, 32, 32, &seed_codes, &IvfConfig::default()));
    index.set_nprobe(4).expect("nprobe");

    let mut handles = Vec::new();
    for w in 0..4u64 {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            for batch in 0..20u64 {
                let codes = generate_codes(25, 4, w * 1000 + batch);
                index.add(&codes).expect("add");
            }
        }));
    }
    for r in 0..4u64 {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            for i in 0..30u64 {
                let queries = generate_codes(3, 4, 77 + r * 100 + i);
                let results = index.search(&queries, 5).expect("search");
                for q in 0..3 {
                    let (distances, labels) = results.row(q);
                    assert!(distances.windows(2).all(|w| w[0] <= w[1]));
                    assert!(labels.iter().all(|&l| l >= SENTINEL_ID));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    assert_eq!(index.ntotal(), 4 * 20 * 25);
    assert!(index.verify_direct_map().is_empty());
    let all = index.reconstruct_n(0, index.ntotal()).expect("all ids mapped");
    assert_eq!(all.len(), index.ntotal() * 4);
}

#[test]
fn test_reset_during_searches_is_atomic() {
    let res = StandardResources::new();
    let codes = generate_codes(400, 2, 5);
    let index = Arc::new(seeded_index(&res, 16, 4, &codes, &IvfConfig::default()));
    index.add(&codes).expect("add");
    index.set_nprobe(4).expect("nprobe");

    let reader = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for i in 0..50u64 {
                let results = index.search(&generate_codes(1, 2, i), 3).expect("search");
                let (_, labels) = results.row(0);
                // Either the full index or the empty one
                let filled = labels.iter().filter(|&&l| l != SENTINEL_ID).count();
                assert!(filled == 0 || filled == 3);
            }
        })
    };
    index.reset();
    reader.join().expect("reader panicked");

    assert_eq!(index.ntotal(), 0);
}

#[test]
fn test_sharing_index_resets_while_per_list_searches_run() {
    // Arrange: two indexes over the same lists, one refilling, one searching
    let res = StandardResources::new();
    let codes = generate_codes(300, 2, 17);
    let lists = Arc::new(DeviceInvertedLists::new(4, 2, res.resources()));
    let sharing = |codes: &[u8]| {
        let mut quantizer = FlatBinaryQuantizer::new(2);
        quantizer.add_centroids(&codes[..8]).expect("centroids");
        BinaryIvfIndex::with_shared_invlists(
            &res,
            QuantizerHandle::Owned(Box::new(quantizer)),
            Arc::clone(&lists),
            16,
            &IvfConfig::default(),
        )
        .expect("index")
    };
    let writer = sharing(&codes);
    let reader = sharing(&codes);
    reader.set_per_invlist_search(true);
    reader.set_nprobe(4).expect("nprobe");
    writer.add(&codes).expect("add");

    // Act
    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..20 {
                writer.reset();
                writer.add(&codes[..100]).expect("refill");
            }
        });
        s.spawn(|| {
            for i in 0..50u64 {
                let queries = generate_codes(8, 2, i);
                let results = reader.search(&queries, 5).expect("search");

                // Assert
                assert!(results
                    .labels
                    .iter()
                    .all(|&l| l == SENTINEL_ID || (0..300).contains(&l)));
            }
        });
    });

    assert_eq!(lists.total_len(), 50);
}

#[test]
fn test_config_file_drives_index() {
    // Arrange
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
[search]
nprobe = 2
max_codes = 64
use_heap = false

[device]
memory_bytes = 1048576
streams = 1

[logging]
level = "debug"
"#
    )
    .expect("write config");

    // Act
    let config = IvfConfig::load_from_path(file.path()).expect("load");
    let res = StandardResources::from_config(&config.device);
    let codes = generate_codes(50, 2, 11);
    let index = seeded_index(&res, 16, 4, &codes, &config);

    // Assert
    assert_eq!(
        index.search_params(),
        SearchParams {
            nprobe: 2,
            max_codes: 64,
            use_heap: false,
            per_invlist_search: false,
        }
    );
    assert_eq!(index.resources().capacity(MemorySpace::Device), 1_048_576);
    assert_eq!(index.resources().stream_count(), 1);
    let _ = init_tracing(&config.logging);
}

#[test]
fn test_init_tracing_only_once() {
    let config = LoggingConfig::default();

    let _ = init_tracing(&config);

    assert!(!init_tracing(&config));
}

/// Large index, many probes (ignored for CI)
#[test]
#[ignore = "Heavy test, run manually"]
fn test_large_index_full_probe() {
    let res = StandardResources::new();
    let codes = generate_codes(200_000, 32, 99);
    let queries = generate_codes(100, 32, 100);
    let index = seeded_index(&res, 256, 256, &codes, &IvfConfig::default());
    index.add(&codes).expect("add");
    index.set_nprobe(256).expect("nprobe");

    let results = index.search(&queries, 10).expect("search");

    for (q, query) in queries.chunks_exact(32).enumerate() {
        let expected: Vec<i64> = brute_force(&codes, query, 10).iter().map(|e| e.1).collect();
        assert_eq!(results.row(q).1, &expected[..]);
    }
}
