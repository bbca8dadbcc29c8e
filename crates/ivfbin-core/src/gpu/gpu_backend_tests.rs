//! Tests for `gpu_backend` module

use super::gpu_backend::*;
use crate::hamming::hamming_distance;

#[test]
fn test_gpu_available_check() {
    // Should not panic
    let _ = GpuHammingAccelerator::is_available();
}

#[test]
fn test_pack_words_pads_partial_word() {
    let (packed, words) = pack_words(&[0xFF, 0x01, 0x00, 0x00, 0xAA, 0xFF, 0x01, 0x00, 0x00, 0xBB], 5);

    assert_eq!(words, 2);
    assert_eq!(packed, vec![0x0000_01FF, 0x0000_00AA, 0x0000_01FF, 0x0000_00BB]);
}

#[test]
fn test_batch_hamming_empty_input() {
    if let Some(gpu) = GpuHammingAccelerator::new() {
        let results = gpu.batch_hamming(&[0; 4], &[], 4).expect("dispatch");
        assert!(results.is_empty());
    }
}

#[test]
fn test_batch_hamming_matches_cpu() {
    if let Some(gpu) = GpuHammingAccelerator::new() {
        let code_size = 6;
        let query: Vec<u8> = (0..code_size as u8).collect();
        let codes: Vec<u8> = (0..64 * code_size).map(|i| (i * 37 % 251) as u8).collect();

        let results = gpu.batch_hamming(&query, &codes, code_size).expect("dispatch");

        let expected: Vec<u32> = codes
            .chunks_exact(code_size)
            .map(|c| hamming_distance(&query, c))
            .collect();
        assert_eq!(results, expected);
    } else {
        println!("No GPU available, skipping GPU tests");
    }
}
