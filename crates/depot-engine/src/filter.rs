//! Probabilistic task-existence filter.
//!
//! First tier of the idempotency guard: consumers probe the filter
//! before touching the task store. A negative answer is authoritative
//! (the task was never created here); a positive answer only means
//! "might exist" and falls through to the real lookup. The filter is
//! additive only; task deletion never removes bits.

use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use depot_core::{DepotError, DepotResult};

/// Existence filter seam. Implementations may be remote; both
/// operations are fallible so callers can degrade to "might exist"
/// when the filter is unreachable.
#[async_trait]
pub trait ExistenceFilter: Send + Sync {
    async fn register(&self, task_id: Uuid) -> DepotResult<()>;

    /// False means definitely absent; true means possibly present.
    async fn might_contain(&self, task_id: Uuid) -> DepotResult<bool>;
}

/// In-process Bloom filter over task ids.
pub struct BloomExistenceFilter {
    bits: RwLock<Vec<u8>>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomExistenceFilter {
    /// Size the filter for `expected_insertions` ids at the given false
    /// positive rate. `fpp` must be in (0, 1).
    pub fn new(expected_insertions: usize, fpp: f64) -> DepotResult<Self> {
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(DepotError::Validation(format!(
                "False positive rate must be in (0, 1), got {}",
                fpp
            )));
        }
        let n = expected_insertions.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * fpp.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;

        Ok(BloomExistenceFilter {
            bits: RwLock::new(vec![0u8; num_bits.div_ceil(8) as usize]),
            num_bits,
            num_hashes,
        })
    }

    fn bit_positions(&self, task_id: Uuid) -> impl Iterator<Item = u64> + '_ {
        let key = *task_id.as_bytes();
        (0..self.num_hashes as u64)
            .map(move |seed| xxh3_64_with_seed(&key, seed) % self.num_bits)
    }
}

#[async_trait]
impl ExistenceFilter for BloomExistenceFilter {
    async fn register(&self, task_id: Uuid) -> DepotResult<()> {
        let positions: Vec<u64> = self.bit_positions(task_id).collect();
        let mut bits = self
            .bits
            .write()
            .map_err(|_| DepotError::Internal(anyhow::anyhow!("Filter lock poisoned")))?;
        for pos in positions {
            bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
        Ok(())
    }

    async fn might_contain(&self, task_id: Uuid) -> DepotResult<bool> {
        let bits = self
            .bits
            .read()
            .map_err(|_| DepotError::Internal(anyhow::anyhow!("Filter lock poisoned")))?;
        Ok(self
            .bit_positions(task_id)
            .all(|pos| bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_ids_always_positive() {
        let filter = BloomExistenceFilter::new(1000, 0.01).unwrap();
        let ids: Vec<Uuid> = (0..200).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            filter.register(*id).await.unwrap();
        }
        for id in &ids {
            assert!(filter.might_contain(*id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_unregistered_ids_mostly_negative() {
        let filter = BloomExistenceFilter::new(1000, 0.01).unwrap();
        for _ in 0..500 {
            filter.register(Uuid::new_v4()).await.unwrap();
        }
        let false_positives = {
            let mut count = 0;
            for _ in 0..1000 {
                if filter.might_contain(Uuid::new_v4()).await.unwrap() {
                    count += 1;
                }
            }
            count
        };
        // Sized for 1% at full load; at half load a 5% ceiling is generous.
        assert!(false_positives < 50, "false positives: {}", false_positives);
    }

    #[test]
    fn test_rejects_bad_false_positive_rate() {
        assert!(BloomExistenceFilter::new(1000, 0.0).is_err());
        assert!(BloomExistenceFilter::new(1000, 1.0).is_err());
    }

    #[test]
    fn test_sizing_grows_with_precision() {
        let loose = BloomExistenceFilter::new(1000, 0.1).unwrap();
        let tight = BloomExistenceFilter::new(1000, 0.001).unwrap();
        assert!(tight.num_bits > loose.num_bits);
        assert!(tight.num_hashes > loose.num_hashes);
    }
}
