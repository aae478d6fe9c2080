//! Shared offset and read/write decisions for a replica group.
//!
//! Generated exactly once per logical I/O, using the primary sibling's
//! namespace policy, then applied to every sibling.

use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::Distribution;

use crate::ns::NsEntry;

/// Pick the next shared offset for a logical I/O.
///
/// Zipf when configured, else uniform random, else sequential. The
/// sequential cursor wraps at `min_size_in_ios`, the smallest capacity
/// across all namespaces, so every sibling's offset stays in range.
pub fn next_offset(
    entry: &NsEntry,
    rng: &mut SmallRng,
    seq_cursor: &mut u64,
    min_size_in_ios: u64,
    is_random: bool,
) -> u64 {
    if let Some(zipf) = &entry.zipf {
        let sample = zipf.sample(rng) as u64;
        (sample.saturating_sub(1)).min(entry.size_in_ios.saturating_sub(1))
    } else if is_random {
        rng.random_range(0..entry.size_in_ios.max(1))
    } else {
        let offset = *seq_cursor;
        *seq_cursor += 1;
        if *seq_cursor == min_size_in_ios {
            *seq_cursor = 0;
        }
        offset
    }
}

/// Decide read vs write from the configured read percentage.
pub fn decide_read(rw_percentage: i32, rng: &mut SmallRng) -> bool {
    rw_percentage == 100
        || (rw_percentage != 0 && (rng.random_range(0..100i32)) < rw_percentage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::driver::mem::{MemDevice, MemDeviceOpts, MemHandle};
    use crate::driver::NvmeDevice;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn entry(blocks: u64, zipf_theta: f64) -> NsEntry {
        let dev = MemDevice::new(MemDeviceOpts {
            num_blocks: blocks,
            sector_size: 512,
            ..Default::default()
        });
        let handle: Arc<dyn NvmeDevice> = Arc::new(MemHandle { dev });
        let cfg = RunConfig {
            queue_depth: 1,
            io_size_bytes: 4096,
            time_in_sec: 1,
            is_random: zipf_theta > 0.0,
            zipf_theta,
            ..Default::default()
        };
        NsEntry::from_nvme(handle, &cfg, 7).unwrap()
    }

    #[test]
    fn test_sequential_wraps_at_min_size() {
        let e = entry(8192, 0.0);
        let mut rng = SmallRng::seed_from_u64(1);
        let mut cursor = 0;
        let min = 3;
        let offsets: Vec<u64> = (0..7)
            .map(|_| next_offset(&e, &mut rng, &mut cursor, min, false))
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_random_stays_in_range() {
        let e = entry(8192, 0.0);
        let mut rng = SmallRng::seed_from_u64(2);
        let mut cursor = 0;
        for _ in 0..10_000 {
            let off = next_offset(&e, &mut rng, &mut cursor, e.size_in_ios, true);
            assert!(off < e.size_in_ios);
        }
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_zipf_is_heavily_skewed() {
        // With theta 0.99 over >= 100k slots, the hottest 1% of offsets
        // must absorb more than 30% of accesses.
        let e = entry(1 << 20, 0.99); // 1 MiB blocks * 512 B -> 128k I/O slots
        assert!(e.size_in_ios >= 100_000);
        let mut rng = SmallRng::seed_from_u64(3);
        let mut cursor = 0;
        let samples = 200_000usize;
        let mut counts = vec![0u64; e.size_in_ios as usize];
        for _ in 0..samples {
            let off = next_offset(&e, &mut rng, &mut cursor, e.size_in_ios, true);
            counts[off as usize] += 1;
        }
        counts.sort_unstable_by(|a, b| b.cmp(a));
        let hot = counts.len() / 100;
        let hot_total: u64 = counts[..hot].iter().sum();
        assert!(
            hot_total as f64 / samples as f64 > 0.30,
            "hot 1% got {} of {}",
            hot_total,
            samples
        );
    }

    #[test]
    fn test_decide_read_extremes() {
        let mut rng = SmallRng::seed_from_u64(4);
        assert!((0..100).all(|_| decide_read(100, &mut rng)));
        assert!((0..100).all(|_| !decide_read(0, &mut rng)));
        let reads = (0..10_000).filter(|_| decide_read(30, &mut rng)).count();
        assert!((2_500..3_500).contains(&reads), "reads={}", reads);
    }
}
