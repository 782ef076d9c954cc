use super::{
    log_batch_completion, panic_message, pull_batch, BatchPolicy, ChannelStats, InProcessCompiler,
    WorkerChannel,
};
use crate::{
    ChannelConfig, ChannelKind, DispatchedJob, JobHandle, JobOutput, SchedulerContext,
    SchedulerError, SchedulerResult,
};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// Ask a thread to compile a batch
pub struct CompileThreadPoolRequestRunBatch {
    pub jobs: Vec<DispatchedJob>,
    pub started_at: Instant,
}

pub enum CompileThreadPoolRequest {
    RunBatch(CompileThreadPoolRequestRunBatch),
}

pub struct CompileThreadPoolOutcomeRunBatchComplete {
    pub request: CompileThreadPoolRequestRunBatch,
    pub results: SchedulerResult<Vec<(JobHandle, JobOutput)>>,
    pub elapsed: Duration,
}

pub enum CompileThreadPoolOutcome {
    RunBatchComplete(CompileThreadPoolOutcomeRunBatchComplete),
}

// Thread that takes batches out of the request channel and ends when the finish channel is signalled
struct CompileWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

fn do_compile(
    compiler: &InProcessCompiler,
    request: CompileThreadPoolRequestRunBatch,
) -> CompileThreadPoolOutcome {
    profiling::scope!(&format!("Compile batch of {} jobs", request.jobs.len()));
    let compile_started = Instant::now();
    let results = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        compiler.compile_batch(&request.jobs)
    }))
    .unwrap_or_else(|panic| {
        Err(SchedulerError::StringError(format!(
            "Compiler backend panicked: {}",
            panic_message(&panic)
        )))
    });

    CompileThreadPoolOutcome::RunBatchComplete(CompileThreadPoolOutcomeRunBatchComplete {
        elapsed: compile_started.elapsed(),
        request,
        results,
    })
}

impl CompileWorkerThread {
    fn new(
        compiler: InProcessCompiler,
        request_rx: Receiver<CompileThreadPoolRequest>,
        outcome_tx: Sender<CompileThreadPoolOutcome>,
        active_request_count: Arc<AtomicUsize>,
        channel_name: &str,
        thread_index: usize,
    ) -> SchedulerResult<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let thread_name = format!("{} compile thread {}", channel_name, thread_index);
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                profiling::register_thread!(&thread_name);
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            // The pool dropped its sender
                            let Ok(msg) = msg else {
                                return;
                            };

                            match msg {
                                CompileThreadPoolRequest::RunBatch(msg) => {
                                    profiling::scope!("CompileThreadPoolRequest::RunBatch");
                                    let result = do_compile(&compiler, msg);

                                    // The channel may already be gone during shutdown
                                    let _ = outcome_tx.send(result);
                                    active_request_count.fetch_sub(1, Ordering::Release);
                                }
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })?;

        Ok(CompileWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

// Spawns N threads, proxies batches to/from them, and stops the threads on finish()
pub struct CompileThreadPool {
    worker_threads: Vec<CompileWorkerThread>,
    request_tx: Sender<CompileThreadPoolRequest>,
    active_request_count: Arc<AtomicUsize>,
}

impl CompileThreadPool {
    pub fn new(
        compiler: InProcessCompiler,
        max_requests_in_flight: usize,
        result_tx: Sender<CompileThreadPoolOutcome>,
        channel_name: &str,
    ) -> SchedulerResult<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<CompileThreadPoolRequest>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let mut worker_threads = Vec::with_capacity(max_requests_in_flight);
        for thread_index in 0..max_requests_in_flight {
            let worker = CompileWorkerThread::new(
                compiler.clone(),
                request_rx.clone(),
                result_tx.clone(),
                active_request_count.clone(),
                channel_name,
                thread_index,
            )?;
            worker_threads.push(worker);
        }

        Ok(CompileThreadPool {
            worker_threads,
            request_tx,
            active_request_count,
        })
    }

    pub fn is_idle(&self) -> bool {
        self.active_request_count() == 0
    }

    pub fn active_request_count(&self) -> usize {
        self.active_request_count.load(Ordering::Relaxed)
    }

    pub fn add_request(
        &self,
        request: CompileThreadPoolRequest,
    ) -> SchedulerResult<()> {
        self.active_request_count.fetch_add(1, Ordering::Release);
        self.request_tx.send(request).map_err(|_| {
            self.active_request_count.fetch_sub(1, Ordering::Release);
            SchedulerError::StringError("All compile threads have exited".to_string())
        })
    }

    pub fn finish(self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads {
            if worker_thread.join_handle.join().is_err() {
                log::error!("A compile thread panicked while shutting down");
            }
        }
    }
}

/// Compiles batches on a pool of threads in this process. Serves local channels when no worker
/// executable is configured, and stands in for distributed channels.
pub struct ThreadPoolChannel {
    name: String,
    kind: ChannelKind,
    policy: BatchPolicy,
    worker_slots: usize,
    context: Arc<SchedulerContext>,
    thread_pool: Option<CompileThreadPool>,
    result_rx: Receiver<CompileThreadPoolOutcome>,
    stats: Arc<ChannelStats>,
}

impl ThreadPoolChannel {
    pub fn new(
        context: Arc<SchedulerContext>,
        config: &ChannelConfig,
    ) -> SchedulerResult<Self> {
        let worker_slots = config.worker_slots.max(1);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let thread_pool = CompileThreadPool::new(
            InProcessCompiler::new(context.backends().clone()),
            worker_slots,
            result_tx,
            &config.name,
        )?;

        Ok(ThreadPoolChannel {
            name: config.name.clone(),
            kind: config.kind,
            policy: BatchPolicy::from(config),
            worker_slots,
            context,
            thread_pool: Some(thread_pool),
            result_rx,
            stats: Default::default(),
        })
    }

    fn usable_slots(&self) -> usize {
        match self.kind {
            ChannelKind::Local => self.context.usable_worker_slots(self.worker_slots),
            _ => self.worker_slots,
        }
    }

    fn handle_outcomes(&self) -> SchedulerResult<()> {
        let mut first_error = None;
        for outcome in self.result_rx.try_iter() {
            match outcome {
                CompileThreadPoolOutcome::RunBatchComplete(outcome) => match outcome.results {
                    Ok(results) => {
                        self.stats.record_batch(results.len(), outcome.elapsed);
                        log_batch_completion(
                            self.context.config(),
                            &self.name,
                            &outcome.request.jobs,
                            outcome.request.started_at.elapsed(),
                        );
                        self.context.collection().process_finished_jobs(results);
                    }
                    Err(e) => {
                        log::error!(
                            "Channel '{}' failed to compile a batch of {} jobs: {}",
                            self.name,
                            outcome.request.jobs.len(),
                            e
                        );
                        first_error.get_or_insert(e);
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl WorkerChannel for ThreadPoolChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn compiling_loop(&mut self) -> SchedulerResult<usize> {
        profiling::scope!("ThreadPoolChannel::compiling_loop");
        let thread_pool = self
            .thread_pool
            .as_ref()
            .ok_or_else(|| format!("Channel '{}' was used after shutdown", self.name))?;

        let usable_slots = self.usable_slots();
        while thread_pool.active_request_count() < usable_slots {
            let jobs = pull_batch(self.context.collection(), self.kind, &self.policy);
            if jobs.is_empty() {
                break;
            }

            thread_pool.add_request(CompileThreadPoolRequest::RunBatch(
                CompileThreadPoolRequestRunBatch {
                    jobs,
                    started_at: Instant::now(),
                },
            ))?;
        }

        self.handle_outcomes()?;
        Ok(thread_pool.active_request_count())
    }

    fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }

    fn shutdown(&mut self) {
        if let Some(thread_pool) = self.thread_pool.take() {
            if !thread_pool.is_idle() {
                log::warn!(
                    "Channel '{}' is shutting down with {} batches in flight",
                    self.name,
                    thread_pool.active_request_count()
                );
            }
            thread_pool.finish();
        }
    }
}

impl Drop for ThreadPoolChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
