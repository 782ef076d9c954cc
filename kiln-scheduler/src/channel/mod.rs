mod in_process_channel;
pub use in_process_channel::*;

mod local_process_channel;
pub use local_process_channel::*;

mod thread_pool_channel;
pub use thread_pool_channel::*;

mod runner;
pub(crate) use runner::*;

use crate::process_launcher::ProcessLauncher;
use crate::transport::FileTransport;
use crate::{
    ChannelConfig, ChannelKind, DispatchedJob, JobCollection, PriorityRange, SchedulerConfig,
    SchedulerContext, SchedulerResult,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A pathway that takes jobs out of the collection, gets them compiled somewhere, and hands the
/// outputs back
pub trait WorkerChannel: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// One pull, dispatch, and collect pass. Returns the number of batches still in flight, zero
    /// when the channel is idle.
    fn compiling_loop(&mut self) -> SchedulerResult<usize>;

    /// Channels that must be pumped from the caller's polling loop instead of their own thread
    fn requires_cooperative_ticking(&self) -> bool {
        false
    }

    fn stats(&self) -> Arc<ChannelStats>;

    /// Stops workers. Jobs still dispatched to the channel are abandoned.
    fn shutdown(&mut self) {}
}

#[derive(Default)]
pub struct ChannelStats {
    batches_completed: AtomicU64,
    jobs_compiled: AtomicU64,
    busy_nanos: AtomicU64,
    fallback_jobs: AtomicU64,
    worker_crashes: AtomicU64,
}

impl ChannelStats {
    pub fn record_batch(
        &self,
        job_count: usize,
        elapsed: Duration,
    ) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        self.jobs_compiled
            .fetch_add(job_count as u64, Ordering::Relaxed);
        self.busy_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_fallback(
        &self,
        job_count: usize,
    ) {
        self.fallback_jobs
            .fetch_add(job_count as u64, Ordering::Relaxed);
    }

    pub fn record_crash(&self) {
        self.worker_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            jobs_compiled: self.jobs_compiled.load(Ordering::Relaxed),
            busy_time: Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed)),
            fallback_jobs: self.fallback_jobs.load(Ordering::Relaxed),
            worker_crashes: self.worker_crashes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStatsSnapshot {
    pub batches_completed: u64,
    pub jobs_compiled: u64,
    pub busy_time: Duration,
    // Jobs compiled in-process because workers were unavailable
    pub fallback_jobs: u64,
    pub worker_crashes: u64,
}

impl std::fmt::Display for ChannelStatsSnapshot {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{} jobs in {} batches, {:.2}s busy, {} jobs compiled in-process, {} worker crashes",
            self.jobs_compiled,
            self.batches_completed,
            self.busy_time.as_secs_f32(),
            self.fallback_jobs,
            self.worker_crashes
        )
    }
}

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub priority_range: PriorityRange,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub batch_hold_time: Duration,
}

impl From<&ChannelConfig> for BatchPolicy {
    fn from(config: &ChannelConfig) -> Self {
        BatchPolicy {
            priority_range: config.priority_range,
            min_batch_size: config.min_batch_size,
            max_batch_size: config.max_batch_size,
            batch_hold_time: config.batch_hold_time,
        }
    }
}

/// Takes the next batch for a channel, trying its highest priority first. A partial batch is
/// accepted once the oldest queued job has waited longer than the hold time.
pub fn pull_batch(
    collection: &JobCollection,
    kind: ChannelKind,
    policy: &BatchPolicy,
) -> Vec<DispatchedJob> {
    for priority in policy.priority_range.iter_descending() {
        let mut min_batch_size = policy.min_batch_size;
        if min_batch_size > 1 {
            let held_long_enough = collection
                .oldest_pending(priority)
                .map_or(false, |queued_at| queued_at.elapsed() >= policy.batch_hold_time);
            if held_long_enough {
                min_batch_size = 1;
            }
        }

        let batch =
            collection.get_pending_jobs(kind, priority, min_batch_size, policy.max_batch_size);
        if !batch.is_empty() {
            return batch;
        }
    }

    Vec::default()
}

pub(crate) fn log_batch_completion(
    config: &SchedulerConfig,
    channel_name: &str,
    jobs: &[DispatchedJob],
    elapsed: Duration,
) {
    let slow = elapsed > config.slow_batch_warning;
    if !slow && !config.log_job_completion_times {
        return;
    }

    let names: Vec<&str> = jobs.iter().map(|job| job.debug_name()).collect();
    if slow {
        log::warn!(
            "Channel '{}' took {:.2}s to compile a batch of {} jobs: {}",
            channel_name,
            elapsed.as_secs_f32(),
            jobs.len(),
            names.join(", ")
        );
    } else {
        log::info!(
            "Channel '{}' compiled {} jobs in {:.3}s: {}",
            channel_name,
            jobs.len(),
            elapsed.as_secs_f32(),
            names.join(", ")
        );
    }
}

/// Builds the channels listed in the configuration. Local channels run worker processes when a
/// launcher is given and compile on a thread pool otherwise.
pub fn create_channels(
    context: &Arc<SchedulerContext>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
) -> SchedulerResult<Vec<Box<dyn WorkerChannel>>> {
    let mut channels: Vec<Box<dyn WorkerChannel>> = Vec::default();
    for config in &context.config().channels {
        let channel: Box<dyn WorkerChannel> = match (config.kind, &launcher) {
            (ChannelKind::Local, Some(launcher)) => {
                let working_directory = context.config().working_directory.join(&config.name);
                let transport = FileTransport::new(&working_directory)?;
                Box::new(LocalProcessChannel::new(
                    context.clone(),
                    config,
                    Box::new(transport),
                    launcher.clone(),
                ))
            }
            (ChannelKind::Local, None) | (ChannelKind::Distributed, _) => {
                Box::new(ThreadPoolChannel::new(context.clone(), config)?)
            }
            (ChannelKind::InProcess, _) => Box::new(InProcessChannel::new(context.clone(), config)),
        };

        log::info!(
            "Created {:?} channel '{}' serving {:?}..={:?} with {} slots",
            config.kind,
            config.name,
            config.priority_range.min,
            config.priority_range.max,
            config.worker_slots
        );
        channels.push(channel);
    }

    Ok(channels)
}
