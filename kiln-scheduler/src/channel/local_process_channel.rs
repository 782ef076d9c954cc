use super::{log_batch_completion, pull_batch, BatchPolicy, ChannelStats, InProcessCompiler, WorkerChannel};
use crate::process_launcher::{ProcessLauncher, WorkerProcess};
use crate::transport::wire::{self, WorkerErrorCode};
use crate::transport::{Transport, TransportHandle};
use crate::{
    ChannelConfig, ChannelKind, DispatchedJob, JobHandle, JobInput, JobOutput, SchedulerContext,
    SchedulerResult,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Checking process liveness is a syscall per slot, don't do it on every loop
const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct WorkerSlot {
    process: Option<Box<dyn WorkerProcess>>,
    queued_jobs: Vec<DispatchedJob>,
    transport_handle: Option<TransportHandle>,
    // Input for queued_jobs has been handed to the transport
    issued_tasks: bool,
    // A process was started for the current batch
    launched_worker: bool,
    started_at: Option<Instant>,
}

impl WorkerSlot {
    fn is_busy(&self) -> bool {
        !self.queued_jobs.is_empty()
    }

    fn take_batch(&mut self) -> (Vec<DispatchedJob>, Option<Instant>) {
        self.transport_handle = None;
        self.issued_tasks = false;
        self.launched_worker = false;
        (
            std::mem::take(&mut self.queued_jobs),
            self.started_at.take(),
        )
    }
}

/// Runs batches in worker processes on this machine, one batch per slot at a time. If a worker
/// crashes or sends back something unusable, the batch is compiled in-process and the channel
/// keeps compiling in-process for a while before trusting workers again.
pub struct LocalProcessChannel {
    name: String,
    policy: BatchPolicy,
    context: Arc<SchedulerContext>,
    slots: Vec<WorkerSlot>,
    transport: Box<dyn Transport>,
    launcher: Arc<dyn ProcessLauncher>,
    fallback: InProcessCompiler,
    consecutive_crashes: u32,
    fallback_batches_remaining: u32,
    last_process_check: Option<Instant>,
    stats: Arc<ChannelStats>,
}

impl LocalProcessChannel {
    pub fn new(
        context: Arc<SchedulerContext>,
        config: &ChannelConfig,
        transport: Box<dyn Transport>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let slots = (0..config.worker_slots.max(1))
            .map(|_| WorkerSlot::default())
            .collect();

        LocalProcessChannel {
            name: config.name.clone(),
            policy: BatchPolicy::from(config),
            fallback: InProcessCompiler::new(context.backends().clone()),
            context,
            slots,
            transport,
            launcher,
            consecutive_crashes: 0,
            fallback_batches_remaining: 0,
            last_process_check: None,
            stats: Default::default(),
        }
    }

    pub fn is_compiling_in_process(&self) -> bool {
        self.fallback_batches_remaining > 0
    }

    fn busy_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_busy()).count()
    }

    fn pull_tasks_from_queue(&mut self) {
        let usable_slots = self
            .context
            .usable_worker_slots(self.slots.len())
            .min(self.slots.len());
        for slot in &mut self.slots[..usable_slots] {
            if slot.is_busy() {
                continue;
            }

            let jobs = pull_batch(self.context.collection(), ChannelKind::Local, &self.policy);
            if jobs.is_empty() {
                break;
            }

            slot.queued_jobs = jobs;
            slot.issued_tasks = false;
            slot.launched_worker = false;
            slot.started_at = Some(Instant::now());
        }
    }

    fn write_new_tasks(&mut self) -> SchedulerResult<()> {
        for (slot_index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_busy() || slot.issued_tasks {
                continue;
            }

            let batch = wire::encode_input(&slot.queued_jobs)?;
            slot.transport_handle = Some(self.transport.write(slot_index, &batch)?);
            slot.issued_tasks = true;
        }

        Ok(())
    }

    /// Starts workers for slots that need one. Returns true if a worker was lost and the channel
    /// has to fail over.
    fn launch_workers_if_needed(&mut self) -> bool {
        let now = Instant::now();
        let check_processes = self
            .last_process_check
            .map_or(true, |last_check| now - last_check >= PROCESS_CHECK_INTERVAL);
        if check_processes {
            self.last_process_check = Some(now);
        }

        for (slot_index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_busy() {
                // Reap keep-alive workers that timed out on their own
                if check_processes {
                    if let Some(process) = &mut slot.process {
                        if !process.is_running() {
                            slot.process = None;
                        }
                    }
                }
                continue;
            }

            let exited = match &mut slot.process {
                Some(process) => check_processes && !process.is_running(),
                None => true,
            };
            if !exited {
                continue;
            }

            let had_process = slot.process.take().is_some();
            if let Some(handle) = &slot.transport_handle {
                if self.transport.has_output(handle) {
                    // Finished and exited, the output is collected below
                    continue;
                }

                // A worker that went away after taking the batch lost it
                if had_process
                    && (slot.launched_worker || !self.transport.has_pending_input(handle))
                {
                    log::error!(
                        "Worker for slot {} of channel '{}' exited without writing output for {} jobs",
                        slot_index,
                        self.name,
                        slot.queued_jobs.len()
                    );
                    self.stats.record_crash();
                    return true;
                }
            }

            match self
                .launcher
                .launch(&self.transport.worker_files(slot_index), slot_index)
            {
                Ok(process) => {
                    slot.process = Some(process);
                    slot.launched_worker = true;
                }
                Err(e) => {
                    log::error!("Channel '{}' could not start a worker: {}", self.name, e);
                    return true;
                }
            }
        }

        false
    }

    /// Collects finished batches. Returns true if a worker reported a failure that requires
    /// failing over.
    fn read_available_results(&mut self) -> SchedulerResult<bool> {
        for slot_index in 0..self.slots.len() {
            let Some(handle) = self.slots[slot_index].transport_handle else {
                continue;
            };

            let Some(bytes) = self.transport.try_read(&handle)? else {
                continue;
            };
            self.transport.release(&handle)?;

            let (jobs, started_at) = self.slots[slot_index].take_batch();
            let elapsed = started_at.map_or(Duration::ZERO, |started_at| started_at.elapsed());
            if self.process_worker_output(&jobs, &bytes, elapsed)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn process_worker_output(
        &mut self,
        jobs: &[DispatchedJob],
        bytes: &[u8],
        elapsed: Duration,
    ) -> SchedulerResult<bool> {
        profiling::scope!("LocalProcessChannel::process_worker_output");
        let expected_singles = jobs
            .iter()
            .filter(|job| matches!(job.input(), JobInput::Single(_)))
            .count();
        let expected_pipelines = jobs.len() - expected_singles;

        let output = match wire::decode_output(bytes, expected_singles, expected_pipelines) {
            Ok(output) => output,
            Err(e) => {
                log::error!(
                    "Channel '{}' received unusable output for {} jobs: {}",
                    self.name,
                    jobs.len(),
                    e
                );
                self.stats.record_crash();
                self.compile_directly(jobs.iter())?;
                return Ok(true);
            }
        };

        let (completed, missing) = wire::match_outputs(jobs, output.outputs);
        let results: Vec<(JobHandle, JobOutput)> = completed
            .into_iter()
            .map(|(job, output)| (job.handle, output))
            .collect();
        self.stats.record_batch(results.len(), elapsed);
        log_batch_completion(self.context.config(), &self.name, jobs, elapsed);
        self.context.collection().process_finished_jobs(results);

        match output.header.error_code {
            WorkerErrorCode::Success => {
                self.consecutive_crashes = 0;
                Ok(false)
            }
            error_code => {
                log::error!(
                    "Worker for channel '{}' reported {:?}: {}",
                    self.name,
                    error_code,
                    output.header.message
                );
                if let WorkerErrorCode::CrashedAfterJobs { .. } = error_code {
                    self.stats.record_crash();
                }
                self.compile_directly(missing)?;
                Ok(true)
            }
        }
    }

    fn compile_directly<'a>(
        &self,
        jobs: impl IntoIterator<Item = &'a DispatchedJob>,
    ) -> SchedulerResult<()> {
        let results = self.fallback.compile_batch(jobs)?;
        if !results.is_empty() {
            self.stats.record_fallback(results.len());
            self.context.collection().process_finished_jobs(results);
        }
        Ok(())
    }

    /// Kills every worker, compiles whatever they were holding in-process, and starts (or
    /// lengthens) the in-process window
    fn abandon_workers(&mut self) -> SchedulerResult<()> {
        self.consecutive_crashes += 1;
        self.fallback_batches_remaining = self
            .context
            .config()
            .fallback_batches_after_crashes(self.consecutive_crashes);
        log::warn!(
            "Channel '{}' lost its workers ({} in a row), compiling the next {} batches in-process",
            self.name,
            self.consecutive_crashes,
            self.fallback_batches_remaining
        );

        let mut abandoned_jobs = Vec::default();
        for slot in &mut self.slots {
            if let Some(mut process) = slot.process.take() {
                process.terminate();
            }

            if let Some(handle) = slot.transport_handle {
                if let Err(e) = self.transport.release(&handle) {
                    log::warn!("Could not clean up batch files for slot {}: {}", handle.slot_index, e);
                }
            }

            let (jobs, _) = slot.take_batch();
            abandoned_jobs.extend(jobs);
        }

        self.compile_directly(&abandoned_jobs)
    }

    fn compile_queued_in_process(&mut self) -> SchedulerResult<()> {
        profiling::scope!("LocalProcessChannel::compile_queued_in_process");
        for slot_index in 0..self.slots.len() {
            if !self.slots[slot_index].is_busy() || self.fallback_batches_remaining == 0 {
                continue;
            }

            let (jobs, started_at) = self.slots[slot_index].take_batch();
            self.compile_directly(&jobs)?;
            if let Some(started_at) = started_at {
                log_batch_completion(
                    self.context.config(),
                    &self.name,
                    &jobs,
                    started_at.elapsed(),
                );
            }

            self.fallback_batches_remaining -= 1;
            if self.fallback_batches_remaining == 0 {
                log::info!(
                    "Channel '{}' is switching back to worker processes",
                    self.name
                );
            }
        }

        Ok(())
    }
}

impl WorkerChannel for LocalProcessChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Local
    }

    fn compiling_loop(&mut self) -> SchedulerResult<usize> {
        profiling::scope!("LocalProcessChannel::compiling_loop");
        self.pull_tasks_from_queue();

        if self.fallback_batches_remaining > 0 {
            self.compile_queued_in_process()?;
            return Ok(self.busy_slots());
        }

        self.write_new_tasks()?;
        if self.launch_workers_if_needed() {
            self.abandon_workers()?;
            return Ok(self.busy_slots());
        }

        if self.read_available_results()? {
            self.abandon_workers()?;
        }

        Ok(self.busy_slots())
    }

    fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }

    fn shutdown(&mut self) {
        let mut abandoned = 0;
        for slot in &mut self.slots {
            if let Some(mut process) = slot.process.take() {
                process.terminate();
            }

            if let Some(handle) = slot.transport_handle {
                if let Err(e) = self.transport.release(&handle) {
                    log::debug!("Could not clean up batch files for slot {}: {}", handle.slot_index, e);
                }
            }

            abandoned += slot.take_batch().0.len();
        }

        if abandoned > 0 {
            log::warn!(
                "Channel '{}' shut down with {} jobs in flight",
                self.name,
                abandoned
            );
        }
    }
}

impl Drop for LocalProcessChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
