//! A small thread-safe Bloom filter for the negative-lookup short circuit
//! in front of the user cache: a request for a user id that was never
//! seen (typo, revoked, brute-forced) skips both cache tiers and the
//! repository entirely.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `capacity` expected items at `fp_rate` false
    /// positive probability, using the standard optimal-m/k formulas.
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        let fp_rate = fp_rate.clamp(1e-6, 0.5);
        let m = (-(capacity * fp_rate.ln()) / (std::f64::consts::LN_2.powi(2))).ceil() as u64;
        let num_bits = m.max(64);
        let k = ((num_bits as f64 / capacity) * std::f64::consts::LN_2).round().max(1.0) as u32;
        let words = (num_bits as usize).div_ceil(64);
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes: k,
        }
    }

    pub fn insert(&self, item: &str) {
        for idx in self.bit_indices(item) {
            let word = (idx / 64) as usize;
            let bit = idx % 64;
            self.bits[word].fetch_or(1 << bit, Ordering::SeqCst);
        }
    }

    pub fn might_contain(&self, item: &str) -> bool {
        self.bit_indices(item).all(|idx| {
            let word = (idx / 64) as usize;
            let bit = idx % 64;
            self.bits[word].load(Ordering::SeqCst) & (1 << bit) != 0
        })
    }

    /// Kirsch-Mitzenmacher double hashing: derive `k` indices from two
    /// independent hashes instead of computing `k` full hash functions.
    fn bit_indices<'a>(&'a self, item: &'a str) -> impl Iterator<Item = u64> + 'a {
        let h1 = hash_with_seed(item, 0);
        let h2 = hash_with_seed(item, 1);
        (0..self.num_hashes).map(move |i| (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits)
    }
}

fn hash_with_seed(item: &str, seed: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    seed.hash(&mut hasher);
    item.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_item_is_always_reported_present() {
        let filter = BloomFilter::new(1000, 0.01);
        filter.insert("user-42");
        assert!(filter.might_contain("user-42"));
    }

    #[test]
    fn unrelated_item_is_usually_absent() {
        let filter = BloomFilter::new(1000, 0.01);
        for i in 0..500 {
            filter.insert(&format!("user-{i}"));
        }
        let false_positives = (500..1500).filter(|i| filter.might_contain(&format!("user-{i}"))).count();
        assert!(false_positives < 100, "false positive rate too high: {false_positives}/1000");
    }
}
