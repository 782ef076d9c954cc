use crate::{Fingerprint, OutputDigest};
use kiln_base::hashing::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

// Bookkeeping cost charged against the budget on top of the output bytes themselves
const OUTPUT_OVERHEAD: u64 =
    (std::mem::size_of::<OutputDigest>() + std::mem::size_of::<CachedOutput>()) as u64;
const MAPPING_OVERHEAD: u64 =
    (std::mem::size_of::<Fingerprint>() + std::mem::size_of::<OutputDigest>()) as u64;

struct CachedOutput {
    data: Arc<Vec<u8>>,
    hit_count: u64,
    // Number of fingerprints mapped to this output
    reference_count: u32,
}

#[derive(Default)]
struct JobCacheInner {
    input_hash_to_output: HashMap<Fingerprint, OutputDigest>,
    outputs: HashMap<OutputDigest, CachedOutput>,
    // Invalidated on insert and evict
    allocated_memory: Option<u64>,
    total_queries: u64,
    hits: u64,
    evicted_outputs: u64,
}

impl JobCacheInner {
    fn allocated_memory(&mut self) -> u64 {
        if let Some(allocated_memory) = self.allocated_memory {
            return allocated_memory;
        }

        let outputs: u64 = self
            .outputs
            .values()
            .map(|output| output.data.len() as u64 + OUTPUT_OVERHEAD)
            .sum();
        let allocated_memory = outputs + self.input_hash_to_output.len() as u64 * MAPPING_OVERHEAD;
        self.allocated_memory = Some(allocated_memory);
        allocated_memory
    }

    // Evicts whole hit-count tiers, lowest first, until `needed` more bytes fit under the budget.
    // Returns false if that's impossible without evicting `protected`.
    fn make_room(
        &mut self,
        needed: u64,
        budget: u64,
        protected: Option<OutputDigest>,
    ) -> bool {
        while self.allocated_memory() + needed >= budget {
            let min_hit_count = self
                .outputs
                .iter()
                .filter(|(digest, _)| Some(**digest) != protected)
                .map(|(_, output)| output.hit_count)
                .min();

            let Some(min_hit_count) = min_hit_count else {
                return false;
            };

            let evicted: HashSet<OutputDigest> = self
                .outputs
                .iter()
                .filter(|(digest, output)| {
                    Some(**digest) != protected && output.hit_count == min_hit_count
                })
                .map(|(digest, _)| *digest)
                .collect();

            log::trace!(
                "Evicting {} cached outputs with hit count {}",
                evicted.len(),
                min_hit_count
            );

            self.outputs.retain(|digest, _| !evicted.contains(digest));
            self.input_hash_to_output
                .retain(|_, digest| !evicted.contains(digest));
            self.evicted_outputs += evicted.len() as u64;
            self.allocated_memory = None;
        }

        true
    }

    fn assert_no_dangling_mappings(&self) {
        if cfg!(debug_assertions) {
            for (fingerprint, digest) in &self.input_hash_to_output {
                assert!(
                    self.outputs.contains_key(digest),
                    "{:?} maps to {:?} which is not in the cache",
                    fingerprint,
                    digest
                );
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobCacheStats {
    pub total_queries: u64,
    pub hits: u64,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub evicted_outputs: u64,
    pub allocated_memory: u64,
    pub memory_budget: u64,
}

impl JobCacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_queries as f64
        }
    }
}

impl std::fmt::Display for JobCacheStats {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let budget = if self.memory_budget == u64::MAX {
            "unlimited".to_string()
        } else {
            format!("{:.2} MB", self.memory_budget as f64 / (1024.0 * 1024.0))
        };

        write!(
            f,
            "{} queries, {} hits ({:.1}%), {} inputs -> {} unique outputs, {:.2} MB of {} used, {} outputs evicted",
            self.total_queries,
            self.hits,
            self.hit_rate() * 100.0,
            self.num_inputs,
            self.num_outputs,
            self.allocated_memory as f64 / (1024.0 * 1024.0),
            budget,
            self.evicted_outputs
        )
    }
}

/// Content-addressed store of serialized job outputs keyed by input fingerprint. Distinct inputs
/// that produce identical bytes share one stored output.
pub struct JobCache {
    enabled: bool,
    // u64::MAX = unlimited
    memory_budget: u64,
    inner: Mutex<JobCacheInner>,
}

impl JobCache {
    pub fn new(
        enabled: bool,
        memory_budget: u64,
    ) -> Self {
        JobCache {
            enabled,
            memory_budget,
            inner: Mutex::new(JobCacheInner::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    pub fn find(
        &self,
        fingerprint: Fingerprint,
    ) -> Option<Arc<Vec<u8>>> {
        if !self.enabled {
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.total_queries += 1;
        let digest = *inner.input_hash_to_output.get(&fingerprint)?;
        let output = inner
            .outputs
            .get_mut(&digest)
            .unwrap_or_else(|| panic!("{:?} maps to {:?} which is not in the cache", fingerprint, digest));
        output.hit_count += 1;
        let data = output.data.clone();
        inner.hits += 1;
        Some(data)
    }

    /// `initial_hit_count` is how many requests this output already satisfied (wait-listed
    /// duplicates), so it isn't first in line for eviction.
    #[profiling::function]
    pub fn add(
        &self,
        fingerprint: Fingerprint,
        data: Arc<Vec<u8>>,
        initial_hit_count: u64,
    ) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        // A racing clone may discover the same input twice
        if inner.input_hash_to_output.contains_key(&fingerprint) {
            return;
        }

        let digest = OutputDigest::of_bytes(&data);
        if inner.outputs.contains_key(&digest) {
            if !inner.make_room(MAPPING_OVERHEAD, self.memory_budget, Some(digest)) {
                return;
            }

            if let Some(output) = inner.outputs.get_mut(&digest) {
                output.reference_count += 1;
                output.hit_count += initial_hit_count;
            }
            inner.input_hash_to_output.insert(fingerprint, digest);
            inner.allocated_memory = None;
            inner.assert_no_dangling_mappings();
            return;
        }

        let needed = data.len() as u64 + OUTPUT_OVERHEAD + MAPPING_OVERHEAD;
        if needed >= self.memory_budget {
            log::debug!(
                "Not caching {} byte output for {:?}, it is larger than the whole cache budget",
                data.len(),
                fingerprint
            );
            return;
        }

        if !inner.make_room(needed, self.memory_budget, None) {
            return;
        }

        inner.outputs.insert(
            digest,
            CachedOutput {
                data,
                hit_count: initial_hit_count,
                reference_count: 1,
            },
        );
        inner.input_hash_to_output.insert(fingerprint, digest);
        inner.allocated_memory = None;
        inner.assert_no_dangling_mappings();
    }

    pub fn allocated_memory(&self) -> u64 {
        self.inner.lock().unwrap().allocated_memory()
    }

    pub fn stats(&self) -> JobCacheStats {
        let mut inner = self.inner.lock().unwrap();
        JobCacheStats {
            total_queries: inner.total_queries,
            hits: inner.hits,
            num_inputs: inner.input_hash_to_output.len(),
            num_outputs: inner.outputs.len(),
            evicted_outputs: inner.evicted_outputs,
            allocated_memory: inner.allocated_memory(),
            memory_budget: self.memory_budget,
        }
    }

    #[cfg(test)]
    fn reference_count(
        &self,
        fingerprint: Fingerprint,
    ) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        let digest = inner.input_hash_to_output.get(&fingerprint)?;
        inner.outputs.get(digest).map(|output| output.reference_count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bytes(
        fill: u8,
        len: usize,
    ) -> Arc<Vec<u8>> {
        Arc::new(vec![fill; len])
    }

    #[test]
    fn find_returns_added_bytes_and_counts_hits() {
        let cache = JobCache::new(true, u64::MAX);
        assert!(cache.find(Fingerprint(1)).is_none());

        cache.add(Fingerprint(1), bytes(7, 100), 0);
        assert_eq!(*cache.find(Fingerprint(1)).unwrap(), vec![7; 100]);
        cache.find(Fingerprint(1));

        let stats = cache.stats();
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.num_inputs, 1);
        assert_eq!(stats.num_outputs, 1);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = JobCache::new(false, u64::MAX);
        cache.add(Fingerprint(1), bytes(1, 10), 0);
        assert!(cache.find(Fingerprint(1)).is_none());
        assert_eq!(cache.stats().num_outputs, 0);
    }

    #[test]
    fn identical_outputs_are_stored_once() {
        let cache = JobCache::new(true, u64::MAX);
        cache.add(Fingerprint(1), bytes(3, 64), 0);
        let after_first = cache.allocated_memory();
        cache.add(Fingerprint(2), bytes(3, 64), 0);

        let stats = cache.stats();
        assert_eq!(stats.num_inputs, 2);
        assert_eq!(stats.num_outputs, 1);
        assert_eq!(cache.reference_count(Fingerprint(2)), Some(2));
        assert_eq!(cache.allocated_memory(), after_first + MAPPING_OVERHEAD);
    }

    #[test]
    fn adding_a_mapped_fingerprint_is_a_no_op() {
        let cache = JobCache::new(true, u64::MAX);
        cache.add(Fingerprint(1), bytes(1, 16), 0);
        cache.add(Fingerprint(1), bytes(2, 16), 0);
        assert_eq!(*cache.find(Fingerprint(1)).unwrap(), vec![1; 16]);
        assert_eq!(cache.stats().num_outputs, 1);
    }

    #[test]
    fn eviction_removes_the_lowest_hit_count_tier() {
        let entry_size = 1000 + OUTPUT_OVERHEAD + MAPPING_OVERHEAD;
        // Room for three entries, not four
        let cache = JobCache::new(true, entry_size * 3 + 1);

        cache.add(Fingerprint(1), bytes(1, 1000), 0);
        cache.add(Fingerprint(2), bytes(2, 1000), 0);
        cache.add(Fingerprint(3), bytes(3, 1000), 5);
        cache.find(Fingerprint(2));

        // Hit counts are now 1 -> 0, 2 -> 1, 3 -> 5, so only fingerprint 1 goes
        cache.add(Fingerprint(4), bytes(4, 1000), 0);
        assert!(cache.find(Fingerprint(1)).is_none());
        assert!(cache.find(Fingerprint(2)).is_some());
        assert!(cache.find(Fingerprint(3)).is_some());
        assert!(cache.find(Fingerprint(4)).is_some());
        assert_eq!(cache.stats().evicted_outputs, 1);
    }

    #[test]
    fn allocated_memory_never_exceeds_budget() {
        let budget = 10_000;
        let cache = JobCache::new(true, budget);
        for i in 0..200u128 {
            let len = 100 + (i as usize * 37) % 900;
            cache.add(Fingerprint(i), bytes((i % 251) as u8, len), 0);
            if i % 3 == 0 {
                cache.find(Fingerprint(i));
            }
            assert!(cache.allocated_memory() <= budget);
        }

        // Too large to ever fit
        cache.add(Fingerprint(1000), bytes(9, budget as usize), 0);
        assert!(cache.find(Fingerprint(1000)).is_none());
        assert!(cache.allocated_memory() <= budget);
    }

    #[test]
    fn hit_rate_report() {
        let stats = JobCacheStats {
            total_queries: 4,
            hits: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.25);
        assert!(format!("{}", stats).contains("25.0%"));
        assert_eq!(JobCacheStats::default().hit_rate(), 0.0);
    }
}
