use crate::channel::{create_channels, ChannelRunner, ChannelStatsSnapshot, WorkerChannel};
use crate::process_launcher::{CommandLauncher, ProcessLauncher};
use crate::{
    ChannelKind, CompiledUnit, JobCacheStats, JobHandle, JobInput, JobInputs, JobKey, Priority,
    RetryOnError, SchedulerContext, SchedulerError, SchedulerResult, UnitId,
};
use kiln_base::hashing::HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_SLEEP: Duration = Duration::from_millis(10);
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// Receives every unit the manager finishes, in unit id order
pub trait UnitFinalizer: Send {
    fn finalize(
        &mut self,
        unit: CompiledUnit,
    );
}

impl<F: FnMut(CompiledUnit) + Send> UnitFinalizer for F {
    fn finalize(
        &mut self,
        unit: CompiledUnit,
    ) {
        (self)(unit)
    }
}

/// Asked before failed units are recompiled when `retry_on_error` is `Prompt`
pub trait RetryPrompt: Send {
    fn should_retry(
        &mut self,
        failed_units: &[&CompiledUnit],
    ) -> bool;
}

impl<F: FnMut(&[&CompiledUnit]) -> bool + Send> RetryPrompt for F {
    fn should_retry(
        &mut self,
        failed_units: &[&CompiledUnit],
    ) -> bool {
        (self)(failed_units)
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub key: JobKey,
    pub priority: Priority,
    pub inputs: Arc<JobInputs>,
}

impl NewJob {
    pub fn new(
        key: JobKey,
        priority: Priority,
        input: JobInput,
    ) -> Self {
        NewJob {
            key,
            priority,
            inputs: JobInputs::new(input),
        }
    }
}

/// Caller-facing front of the scheduler. Submits units of work, drives cooperative channels,
/// watches for hangs, retries failed units, and hands finished units to the finalizer.
pub struct CompilingManager {
    context: Arc<SchedulerContext>,
    channels: Vec<ChannelRunner>,
    finalizer: Box<dyn UnitFinalizer>,
    retry_prompt: Option<Box<dyn RetryPrompt>>,
    next_unit_id: AtomicU32,
    // Drained units waiting to be finalized by process_async
    finalize_buffer: BTreeMap<UnitId, CompiledUnit>,
    last_progress_log: Option<Instant>,
}

impl CompilingManager {
    /// A manager with no channels. Add them with `add_channel`.
    pub fn new(
        context: Arc<SchedulerContext>,
        finalizer: impl UnitFinalizer + 'static,
    ) -> Self {
        CompilingManager {
            context,
            channels: Vec::default(),
            finalizer: Box::new(finalizer),
            retry_prompt: None,
            // UnitId::GLOBAL is reserved for always-needed jobs
            next_unit_id: AtomicU32::new(1),
            finalize_buffer: BTreeMap::default(),
            last_progress_log: None,
        }
    }

    /// Creates the channels listed in the context's configuration. Local channels start worker
    /// processes through `launcher`, or through the configured worker executable if no launcher
    /// is given. Without either they compile on threads in this process.
    pub fn from_config(
        context: Arc<SchedulerContext>,
        launcher: Option<Arc<dyn ProcessLauncher>>,
        finalizer: impl UnitFinalizer + 'static,
    ) -> SchedulerResult<Self> {
        let launcher = launcher.or_else(|| {
            context
                .config()
                .worker_executable
                .clone()
                .map(|executable| Arc::new(CommandLauncher::new(executable)) as Arc<dyn ProcessLauncher>)
        });

        let mut manager = CompilingManager::new(context.clone(), finalizer);
        for channel in create_channels(&context, launcher)? {
            manager.add_channel(channel)?;
        }

        Ok(manager)
    }

    /// Channels get a thread of their own unless asynchronous compiling is disabled or the
    /// channel asks to be ticked from the polling loop
    pub fn add_channel(
        &mut self,
        channel: Box<dyn WorkerChannel>,
    ) -> SchedulerResult<()> {
        let runner = ChannelRunner::new(
            channel,
            self.context.config().allow_asynchronous_compiling,
        )?;
        log::debug!(
            "Channel '{}' runs {}",
            runner.name(),
            if runner.is_threaded() {
                "on its own thread"
            } else {
                "from the polling loop"
            }
        );
        self.channels.push(runner);
        Ok(())
    }

    pub fn set_retry_prompt(
        &mut self,
        retry_prompt: impl RetryPrompt + 'static,
    ) {
        self.retry_prompt = Some(Box::new(retry_prompt));
    }

    pub fn set_compiling_during_game(
        &self,
        compiling_during_game: bool,
    ) {
        self.context
            .set_compiling_during_game(compiling_during_game);
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.context
    }

    pub fn allocate_unit_id(&self) -> UnitId {
        UnitId(self.next_unit_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues jobs for a unit and returns immediately. Jobs whose key is already live for the
    /// unit are skipped and have no handle in the result.
    pub fn submit(
        &self,
        jobs: Vec<NewJob>,
        unit_id: UnitId,
    ) -> Vec<JobHandle> {
        profiling::scope!("CompilingManager::submit");
        let collection = self.context.collection();
        collection.find_or_add_unit(unit_id);

        let handles: Vec<JobHandle> = jobs
            .into_iter()
            .filter_map(|job| collection.prepare_job(unit_id, job.key, job.priority, job.inputs))
            .collect();
        collection.submit_jobs(&handles);

        log::debug!("Submitted {} jobs for {:?}", handles.len(), unit_id);
        handles
    }

    pub fn set_priority(
        &self,
        handle: JobHandle,
        priority: Priority,
    ) -> bool {
        self.context.collection().set_priority(handle, priority)
    }

    /// Checks channel health, ticks cooperative channels, and looks for hung units
    fn poll_channels(&mut self) -> SchedulerResult<()> {
        for channel in &mut self.channels {
            channel.check_health()?;
            channel.tick()?;
        }

        self.check_for_hung_units()
    }

    fn check_for_hung_units(&self) -> SchedulerResult<()> {
        let Some(hang_timeout) = self.context.config().hang_timeout else {
            return Ok(());
        };

        for unit in self.context.collection().pending_units() {
            if let Some(elapsed) = unit.check_if_hung(hang_timeout) {
                log::error!(
                    "{:?} has been compiling for {:.0}s with {} jobs outstanding",
                    unit.unit_id(),
                    elapsed.as_secs_f32(),
                    unit.outstanding_jobs()
                );

                if self.context.config().hang_is_fatal {
                    return Err(SchedulerError::UnitHung {
                        unit_id: unit.unit_id(),
                        elapsed,
                    });
                }
            }
        }

        Ok(())
    }

    fn log_progress(&mut self) {
        let now = Instant::now();
        let should_print = self
            .last_progress_log
            .map_or(true, |last_print| now - last_print >= PROGRESS_LOG_INTERVAL);
        if should_print {
            let collection = self.context.collection();
            log::info!(
                "Jobs: {} outstanding, {} queued",
                collection.outstanding_count(),
                collection.pending_count()
            );
            self.last_progress_log = Some(now);
        }
    }

    /// Takes completed units out of the collection. Cancelled units were already retired by
    /// `cancel` and never show up here.
    fn take_completed(
        &self,
        unit_ids: Option<&[UnitId]>,
    ) -> Vec<CompiledUnit> {
        self.context
            .collection()
            .take_completed_units(unit_ids)
            .into_iter()
            .map(|unit| unit.take_compiled_unit())
            .collect()
    }

    fn buffer_unit(
        buffer: &mut BTreeMap<UnitId, CompiledUnit>,
        unit: CompiledUnit,
    ) {
        match buffer.get_mut(&unit.unit_id) {
            Some(buffered) => buffered.merge(unit),
            None => {
                buffer.insert(unit.unit_id, unit);
            }
        }
    }

    fn should_retry(
        &mut self,
        failed_units: &[&CompiledUnit],
    ) -> bool {
        for unit in failed_units {
            log::warn!(
                "{:?} failed to compile:\n{}",
                unit.unit_id,
                unit.errors.join("\n")
            );
        }

        match self.context.config().retry_on_error {
            RetryOnError::Disabled => false,
            RetryOnError::Always => true,
            RetryOnError::Prompt => self
                .retry_prompt
                .as_mut()
                .map_or(false, |retry_prompt| retry_prompt.should_retry(failed_units)),
        }
    }

    /// Submits every job of the unit again under fresh job ids
    fn resubmit(
        &self,
        unit: CompiledUnit,
    ) {
        let jobs: Vec<NewJob> = unit
            .jobs
            .iter()
            .map(|job| NewJob {
                key: job.key,
                priority: job.priority,
                inputs: job.inputs.clone(),
            })
            .collect();
        log::info!("Recompiling {} jobs of {:?}", jobs.len(), unit.unit_id);
        self.submit(jobs, unit.unit_id);
    }

    /// Waits for the given units and returns them. Units that are unknown, cancelled, or already
    /// handed to the finalizer are not waited on. Failed units are recompiled according to
    /// `retry_on_error`, up to `max_retries` times each.
    pub fn block_until_done(
        &mut self,
        unit_ids: &[UnitId],
    ) -> SchedulerResult<BTreeMap<UnitId, CompiledUnit>> {
        profiling::scope!("CompilingManager::block_until_done");
        let wanted: BTreeSet<UnitId> = unit_ids.iter().copied().collect();
        let mut done = BTreeMap::default();
        for unit_id in &wanted {
            if let Some(unit) = self.finalize_buffer.remove(unit_id) {
                done.insert(*unit_id, unit);
            }
        }

        let mut retry_counts: HashMap<UnitId, u32> = HashMap::default();
        loop {
            let collection = self.context.collection();
            let remaining: Vec<UnitId> = wanted
                .iter()
                .copied()
                .filter(|unit_id| collection.has_unit(*unit_id))
                .collect();

            if remaining.is_empty() {
                let max_retries = self.context.config().max_retries;
                let retryable: Vec<UnitId> = done
                    .values()
                    .filter(|unit: &&CompiledUnit| !unit.all_succeeded)
                    .filter(|unit| retry_counts.get(&unit.unit_id).copied().unwrap_or(0) < max_retries)
                    .map(|unit| unit.unit_id)
                    .collect();
                if retryable.is_empty() {
                    break;
                }

                let failed_units: Vec<&CompiledUnit> =
                    retryable.iter().filter_map(|unit_id| done.get(unit_id)).collect();
                if !self.should_retry(&failed_units) {
                    break;
                }

                for unit_id in retryable {
                    *retry_counts.entry(unit_id).or_default() += 1;
                    if let Some(unit) = done.remove(&unit_id) {
                        self.resubmit(unit);
                    }
                }
                continue;
            }

            self.poll_channels()?;
            for unit in self.take_completed(Some(&remaining)) {
                Self::buffer_unit(&mut done, unit);
            }

            if remaining.iter().any(|unit_id| self.context.collection().has_unit(*unit_id)) {
                self.log_progress();
                std::thread::sleep(POLL_SLEEP);
            }
        }

        Ok(done)
    }

    /// Waits for every unit currently known to the manager
    pub fn block_until_all_done(&mut self) -> SchedulerResult<BTreeMap<UnitId, CompiledUnit>> {
        let mut unit_ids: Vec<UnitId> = self
            .context
            .collection()
            .pending_units()
            .iter()
            .map(|unit| unit.unit_id())
            .collect();
        unit_ids.extend(self.finalize_buffer.keys().copied());
        self.block_until_done(&unit_ids)
    }

    /// Blocks until the units are compiled and hands them to the finalizer
    pub fn finish_compilation(
        &mut self,
        unit_ids: &[UnitId],
    ) -> SchedulerResult<()> {
        for unit in self.block_until_done(unit_ids)?.into_values() {
            self.finalizer.finalize(unit);
        }
        Ok(())
    }

    pub fn finish_all(&mut self) -> SchedulerResult<()> {
        for unit in self.block_until_all_done()?.into_values() {
            self.finalizer.finalize(unit);
        }
        Ok(())
    }

    /// Non-blocking drain for a steady-state loop. Finished units are finalized until
    /// `time_budget` (or the configured budget if None) is spent, the rest wait for the next
    /// call. With `block_on_highest_priority` the reserved global unit is completed first.
    /// Returns the number of units finalized.
    pub fn process_async(
        &mut self,
        time_budget: Option<Duration>,
        block_on_highest_priority: bool,
    ) -> SchedulerResult<usize> {
        profiling::scope!("CompilingManager::process_async");
        let started_at = Instant::now();
        self.poll_channels()?;

        let mut finalized = 0;
        if block_on_highest_priority && self.context.collection().has_unit(UnitId::GLOBAL) {
            for unit in self.block_until_done(&[UnitId::GLOBAL])?.into_values() {
                self.finalizer.finalize(unit);
                finalized += 1;
            }
        }

        for unit in self.take_completed(None) {
            Self::buffer_unit(&mut self.finalize_buffer, unit);
        }

        let time_budget = time_budget.or(self.context.config().process_async_time_budget);
        while let Some((_, unit)) = self.finalize_buffer.pop_first() {
            if !unit.all_succeeded {
                log::warn!(
                    "{:?} failed to compile:\n{}",
                    unit.unit_id,
                    unit.errors.join("\n")
                );
            }

            self.finalizer.finalize(unit);
            finalized += 1;

            if time_budget.map_or(false, |time_budget| started_at.elapsed() >= time_budget) {
                break;
            }
        }

        Ok(finalized)
    }

    /// Cancels units. Queued jobs are removed now, jobs already with a channel are discarded when
    /// they come back and the finalizer never sees them. The unit id can be submitted to again.
    /// Returns the number of jobs removed.
    pub fn cancel(
        &mut self,
        unit_ids: &[UnitId],
    ) -> usize {
        let collection = self.context.collection();
        let mut removed = 0;
        for unit_id in unit_ids {
            removed += collection.cancel_unit(*unit_id);

            let has_no_finished_jobs = self
                .finalize_buffer
                .get(unit_id)
                .map_or(false, |unit| unit.jobs.is_empty());
            if has_no_finished_jobs {
                self.finalize_buffer.remove(unit_id);
            }
        }

        log::debug!("Cancelled {:?}, removed {} queued jobs", unit_ids, removed);
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.context.collection().pending_count()
    }

    pub fn outstanding_count(&self) -> usize {
        self.context.collection().outstanding_count()
    }

    pub fn cache_stats(&self) -> JobCacheStats {
        self.context.collection().cache().stats()
    }

    pub fn channel_stats(&self) -> Vec<(String, ChannelKind, ChannelStatsSnapshot)> {
        self.channels
            .iter()
            .map(|channel| {
                (
                    channel.name().to_string(),
                    channel.kind(),
                    channel.stats().snapshot(),
                )
            })
            .collect()
    }

    pub fn log_stats(&self) {
        log::info!("Job cache: {}", self.cache_stats());
        for (name, kind, stats) in self.channel_stats() {
            log::info!("Channel '{}' ({:?}): {}", name, kind, stats);
        }
    }

    /// Stops every channel. Jobs still queued or in flight are abandoned.
    pub fn shutdown(&mut self) {
        if self.channels.is_empty() {
            return;
        }

        let outstanding = self.outstanding_count();
        if outstanding > 0 {
            log::warn!(
                "Shutting down the compiling manager with {} jobs outstanding",
                outstanding
            );
        }

        for channel in &mut self.channels {
            channel.shutdown();
        }
        self.channels.clear();
    }
}

impl Drop for CompilingManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
