use super::{log_batch_completion, pull_batch, BatchPolicy, ChannelStats, WorkerChannel};
use crate::{
    compile_job, ChannelConfig, ChannelKind, CompilerBackendRegistry, DispatchedJob, JobHandle,
    JobOutput, SchedulerContext, SchedulerResult,
};
use std::sync::Arc;
use std::time::Instant;

/// Compiles jobs on the calling thread. Used as the fallback when worker processes can't be
/// trusted and as a channel of its own.
#[derive(Clone)]
pub struct InProcessCompiler {
    backends: CompilerBackendRegistry,
}

impl InProcessCompiler {
    pub fn new(backends: CompilerBackendRegistry) -> Self {
        InProcessCompiler { backends }
    }

    pub fn compile_directly(
        &self,
        job: &DispatchedJob,
    ) -> SchedulerResult<JobOutput> {
        compile_job(&self.backends, job.input())
    }

    pub fn compile_batch<'a>(
        &self,
        jobs: impl IntoIterator<Item = &'a DispatchedJob>,
    ) -> SchedulerResult<Vec<(JobHandle, JobOutput)>> {
        profiling::scope!("InProcessCompiler::compile_batch");
        jobs.into_iter()
            .map(|job| Ok((job.handle, self.compile_directly(job)?)))
            .collect()
    }
}

pub struct InProcessChannel {
    name: String,
    kind: ChannelKind,
    policy: BatchPolicy,
    context: Arc<SchedulerContext>,
    compiler: InProcessCompiler,
    stats: Arc<ChannelStats>,
}

impl InProcessChannel {
    pub fn new(
        context: Arc<SchedulerContext>,
        config: &ChannelConfig,
    ) -> Self {
        InProcessChannel {
            name: config.name.clone(),
            kind: config.kind,
            policy: BatchPolicy::from(config),
            compiler: InProcessCompiler::new(context.backends().clone()),
            context,
            stats: Default::default(),
        }
    }
}

impl WorkerChannel for InProcessChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn compiling_loop(&mut self) -> SchedulerResult<usize> {
        profiling::scope!("InProcessChannel::compiling_loop");
        let batch = pull_batch(self.context.collection(), self.kind, &self.policy);
        if batch.is_empty() {
            return Ok(0);
        }

        let started_at = Instant::now();
        let results = self.compiler.compile_batch(&batch)?;
        let elapsed = started_at.elapsed();

        self.stats.record_batch(results.len(), elapsed);
        log_batch_completion(self.context.config(), &self.name, &batch, elapsed);
        self.context.collection().process_finished_jobs(results);

        // Keep the caller looping while there may be more work queued
        Ok(1)
    }

    fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }
}
