use rand::Rng;
use sha2::{Digest, Sha256};

pub const DEFAULT_SHARD_POOL_SIZE: usize = 1000;
pub const SHARD_SUFFIX_HEX_LEN: usize = 8;

/// Suffix for shard `index`: the first [`SHARD_SUFFIX_HEX_LEN`] hex digits of
/// the SHA-256 of the index as a little-endian u32.
///
/// Deployments that named shards with SHA-1 of the same bytes get different
/// suffixes here, so shards they already wrote are not reused. Aggregation
/// still counts them, since it finds shards by target, not by name.
pub fn shard_suffix(index: u32) -> String {
    let digest = Sha256::digest(index.to_le_bytes());
    let mut suffix = hex::encode(digest);
    suffix.truncate(SHARD_SUFFIX_HEX_LEN);
    suffix
}

pub fn generate_shard_suffixes(count: usize) -> Vec<String> {
    (0..count as u32).map(shard_suffix).collect()
}

/// The fixed pool of shard suffixes. Regenerated identically in every
/// process, so no shard naming state is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardKeyUniverse {
    suffixes: Vec<String>,
}

impl ShardKeyUniverse {
    pub fn new(size: usize) -> Self {
        Self {
            suffixes: generate_shard_suffixes(size),
        }
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.suffixes.get(index).map(String::as_str)
    }

    /// Picks a suffix uniformly among the first `distribution_count`, clamped
    /// to `1..=len`.
    pub fn pick<R: Rng + ?Sized>(&self, distribution_count: usize, rng: &mut R) -> &str {
        let bound = distribution_count.clamp(1, self.suffixes.len().max(1));
        let index = rng.random_range(0..bound);
        self.suffixes.get(index).map_or("", String::as_str)
    }
}

impl Default for ShardKeyUniverse {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::{SHARD_SUFFIX_HEX_LEN, ShardKeyUniverse, generate_shard_suffixes, shard_suffix};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[test]
    fn pool_has_exactly_n_distinct_hex_suffixes() {
        let suffixes = generate_shard_suffixes(1000);
        assert_eq!(suffixes.len(), 1000);
        assert_eq!(suffixes.iter().collect::<HashSet<_>>().len(), 1000);
        for suffix in &suffixes {
            assert_eq!(suffix.len(), SHARD_SUFFIX_HEX_LEN);
            assert!(suffix.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
        }
    }

    #[test]
    fn generation_is_reproducible() {
        assert_eq!(generate_shard_suffixes(1000), generate_shard_suffixes(1000));
        assert_eq!(shard_suffix(0), "df3f6198");
        assert_eq!(ShardKeyUniverse::default().get(0), Some("df3f6198"));
    }

    #[test]
    fn pick_stays_within_distribution_count() {
        let universe = ShardKeyUniverse::new(1000);
        let allowed = universe.suffixes()[..3].to_vec();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let picked = universe.pick(3, &mut rng);
            assert!(allowed.iter().any(|s| s == picked));
        }
    }

    #[test]
    fn pick_clamps_out_of_range_counts() {
        let universe = ShardKeyUniverse::new(4);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(universe.pick(0, &mut rng), universe.suffixes()[0]);
        for _ in 0..50 {
            let picked = universe.pick(10_000, &mut rng);
            assert!(universe.suffixes().iter().any(|s| s == picked));
        }
    }
}
