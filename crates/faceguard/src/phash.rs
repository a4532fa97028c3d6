//! 64-bit perceptual hash for visual deduplication.
//!
//! DCT hash: downscale to 32x32 grayscale, 2D DCT-II, take the top-left 8x8
//! low-frequency block, threshold each coefficient against the block median.
//! Stored in the database as `bit(64)`; duplicate lookup uses Hamming
//! distance (`bit_count(a # b)`) within a short discovery window.

use std::sync::LazyLock;

use image::{imageops::FilterType, DynamicImage};

const HASH_SIZE: usize = 8;
const DCT_SIZE: usize = 32;

/// Maximum Hamming distance treated as a visual duplicate.
pub const DUPLICATE_MAX_DISTANCE: u32 = 5;

/// Days back to search for visual duplicates.
pub const DUPLICATE_WINDOW_DAYS: i64 = 14;

static COS_TABLE: LazyLock<Vec<f64>> = LazyLock::new(|| {
    let mut table = vec![0.0; DCT_SIZE * DCT_SIZE];
    for (k, row) in table.chunks_mut(DCT_SIZE).enumerate() {
        for (n, value) in row.iter_mut().enumerate() {
            *value = (std::f64::consts::PI / DCT_SIZE as f64 * (n as f64 + 0.5) * k as f64).cos();
        }
    }
    table
});

/// Compute the 64-bit perceptual hash of an image.
#[must_use]
pub fn phash(image: &DynamicImage) -> u64 {
    let gray = image
        .resize_exact(DCT_SIZE as u32, DCT_SIZE as u32, FilterType::Lanczos3)
        .to_luma8();

    let mut pixels = [0.0f64; DCT_SIZE * DCT_SIZE];
    for (i, p) in gray.pixels().enumerate() {
        pixels[i] = f64::from(p.0[0]);
    }

    // Row DCT then column DCT
    let mut rows = [0.0f64; DCT_SIZE * DCT_SIZE];
    for y in 0..DCT_SIZE {
        for k in 0..HASH_SIZE {
            let mut sum = 0.0;
            for n in 0..DCT_SIZE {
                sum += pixels[y * DCT_SIZE + n] * COS_TABLE[k * DCT_SIZE + n];
            }
            rows[y * DCT_SIZE + k] = sum;
        }
    }

    let mut coeffs = [0.0f64; HASH_SIZE * HASH_SIZE];
    for x in 0..HASH_SIZE {
        for k in 0..HASH_SIZE {
            let mut sum = 0.0;
            for n in 0..DCT_SIZE {
                sum += rows[n * DCT_SIZE + x] * COS_TABLE[k * DCT_SIZE + n];
            }
            coeffs[k * HASH_SIZE + x] = sum;
        }
    }

    // Median threshold over the low-frequency block
    let mut sorted = coeffs;
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = (sorted[31] + sorted[32]) / 2.0;

    let mut hash: u64 = 0;
    for (i, c) in coeffs.iter().enumerate() {
        if *c > median {
            hash |= 1 << (63 - i);
        }
    }
    hash
}

/// Number of differing bits between two hashes.
#[must_use]
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Render a hash as the 64-character `0`/`1` string used for the database's
/// `bit(64)` literal.
#[must_use]
pub fn to_bit_string(hash: u64) -> String {
    format!("{hash:064b}")
}

/// Parse a 64-character bit string back into a hash.
#[must_use]
pub fn from_bit_string(bits: &str) -> Option<u64> {
    if bits.len() != 64 || !bits.bytes().all(|b| b == b'0' || b == b'1') {
        return None;
    }
    u64::from_str_radix(bits, 2).ok()
}
