use crate::{CompilerBackendRegistry, JobCache, JobCollection, SchedulerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State shared by the manager and every channel. Created once, before any channel, and dropped
/// after the last channel shuts down.
pub struct SchedulerContext {
    config: SchedulerConfig,
    collection: JobCollection,
    backends: CompilerBackendRegistry,
    compiling_during_game: AtomicBool,
}

impl SchedulerContext {
    pub fn new(
        config: SchedulerConfig,
        backends: CompilerBackendRegistry,
    ) -> Arc<Self> {
        let cache = JobCache::new(config.job_cache_enabled, config.cache_memory_budget());
        if cache.is_enabled() {
            log::info!(
                "Job cache enabled with a budget of {}",
                if cache.memory_budget() == u64::MAX {
                    "unlimited".to_string()
                } else {
                    format!("{} MB", cache.memory_budget() / (1024 * 1024))
                }
            );
        }

        Arc::new(SchedulerContext {
            config,
            collection: JobCollection::new(cache),
            backends,
            compiling_during_game: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn collection(&self) -> &JobCollection {
        &self.collection
    }

    pub fn backends(&self) -> &CompilerBackendRegistry {
        &self.backends
    }

    /// While set, local channels only feed `worker_slots_during_game` slots so the interactive
    /// process keeps some cores
    pub fn set_compiling_during_game(
        &self,
        compiling_during_game: bool,
    ) {
        self.compiling_during_game
            .store(compiling_during_game, Ordering::Relaxed);
    }

    pub fn is_compiling_during_game(&self) -> bool {
        self.compiling_during_game.load(Ordering::Relaxed)
    }

    /// Number of slots a local channel with `worker_slots` slots may feed right now
    pub fn usable_worker_slots(
        &self,
        worker_slots: usize,
    ) -> usize {
        if self.is_compiling_during_game() {
            self.config.worker_slots_during_game.clamp(1, worker_slots.max(1))
        } else {
            worker_slots
        }
    }
}
