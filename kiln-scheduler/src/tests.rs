use crate::channel::{pull_batch, BatchPolicy, InProcessChannel};
use crate::{
    compile_job, ChannelConfig, ChannelKind, CompileInput, CompileOutput, CompileTarget,
    CompiledUnit, CompilerBackend, CompilerBackendRegistry, CompilerBackendRegistryBuilder,
    CompilingManager, DispatchedJob, JobHandle, JobId, JobInput, JobInputs, JobKey, JobOutput,
    NewJob, Priority, PriorityRange, RetryOnError, SchedulerConfig, SchedulerContext,
    SchedulerError, UnitId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn compile_input(
    target: u32,
    source: &str,
) -> CompileInput {
    CompileInput {
        target: CompileTarget(target),
        entry_point: "main".to_string(),
        source: source.to_string(),
        environment: Vec::default(),
        debug_name: source.to_string(),
    }
}

pub(crate) fn single(source: &str) -> Arc<JobInputs> {
    JobInputs::new(JobInput::Single(compile_input(1, source)))
}

/// What `TestBackend` produces for `source` on target 1
pub(crate) fn ok_output(source: &str) -> JobOutput {
    JobOutput::Single(CompileOutput {
        succeeded: true,
        code: format!("1:main:{}", source).into_bytes(),
        diagnostics: Vec::default(),
    })
}

pub(crate) fn dispatched(
    index: u32,
    input: JobInput,
) -> DispatchedJob {
    DispatchedJob {
        handle: JobHandle {
            job_type: input.job_type(),
            index,
            generation: 0,
        },
        job_id: JobId(index as u64),
        unit_id: UnitId(1),
        priority: Priority::Normal,
        inputs: JobInputs::new(input),
    }
}

/// Fails sources containing `#error`, panics on `#panic`, and fails the first
/// `flaky_failures` compiles of sources containing `#flaky`
pub(crate) struct TestBackend {
    targets: Vec<CompileTarget>,
    flaky_failures: usize,
    compile_count: Arc<AtomicUsize>,
}

impl TestBackend {
    pub(crate) fn new(targets: Vec<CompileTarget>) -> Self {
        TestBackend {
            targets,
            flaky_failures: 0,
            compile_count: Arc::default(),
        }
    }

    pub(crate) fn with_flaky_failures(
        mut self,
        flaky_failures: usize,
    ) -> Self {
        self.flaky_failures = flaky_failures;
        self
    }

    pub(crate) fn compile_count(&self) -> Arc<AtomicUsize> {
        self.compile_count.clone()
    }
}

impl CompilerBackend for TestBackend {
    fn name(&self) -> &str {
        "test"
    }

    fn targets(&self) -> Vec<CompileTarget> {
        self.targets.clone()
    }

    fn compile(
        &self,
        input: &CompileInput,
    ) -> CompileOutput {
        let compiles_before = self.compile_count.fetch_add(1, Ordering::SeqCst);
        if input.source.contains("#panic") {
            panic!("test backend asked to panic on {}", input.debug_name);
        }

        if input.source.contains("#error")
            || (input.source.contains("#flaky") && compiles_before < self.flaky_failures)
        {
            return CompileOutput::failed(format!("{} does not compile", input.source));
        }

        CompileOutput {
            succeeded: true,
            code: format!("{}:{}:{}", input.target.0, input.entry_point, input.source).into_bytes(),
            diagnostics: Vec::default(),
        }
    }
}

pub(crate) fn test_backends() -> CompilerBackendRegistry {
    let mut builder = CompilerBackendRegistryBuilder::default();
    builder.register_backend(TestBackend::new(vec![CompileTarget(1), CompileTarget(2)]));
    builder.build()
}

fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.job_cache_enabled = false;
    config.allow_asynchronous_compiling = false;
    config.hang_timeout = None;
    config.channels = vec![ChannelConfig::in_process()];
    config
}

type Finalized = Arc<Mutex<Vec<CompiledUnit>>>;

fn manager_without_channels(
    config: SchedulerConfig,
    backends: CompilerBackendRegistry,
) -> (CompilingManager, Finalized) {
    let finalized = Finalized::default();
    let sink = finalized.clone();
    let context = SchedulerContext::new(config, backends);
    let manager = CompilingManager::new(context, move |unit: CompiledUnit| {
        sink.lock().unwrap().push(unit);
    });
    (manager, finalized)
}

fn manager_with_in_process_channel(
    config: SchedulerConfig,
    backends: CompilerBackendRegistry,
) -> (CompilingManager, Finalized) {
    let (mut manager, finalized) = manager_without_channels(config, backends);
    let channel = InProcessChannel::new(manager.context().clone(), &ChannelConfig::in_process());
    manager.add_channel(Box::new(channel)).unwrap();
    (manager, finalized)
}

fn job(
    source: &str,
    priority: Priority,
) -> NewJob {
    NewJob::new(
        JobKey::new_random(),
        priority,
        JobInput::Single(compile_input(1, source)),
    )
}

#[test]
fn three_priorities_drain_highest_first_and_complete() {
    let (mut manager, _) = manager_without_channels(test_config(), test_backends());
    let unit_id = manager.allocate_unit_id();
    manager.submit(
        vec![
            job("low", Priority::Low),
            job("normal", Priority::Normal),
            job("high", Priority::High),
        ],
        unit_id,
    );
    assert_eq!(manager.pending_count(), 3);
    assert_eq!(manager.outstanding_count(), 3);

    let context = manager.context().clone();
    let policy = BatchPolicy {
        priority_range: PriorityRange::all(),
        min_batch_size: 1,
        max_batch_size: 2,
        batch_hold_time: Duration::ZERO,
    };
    let first_batch = pull_batch(context.collection(), ChannelKind::Local, &policy);
    assert_eq!(first_batch.len(), 1);
    assert_eq!(first_batch[0].debug_name(), "high");
    assert_eq!(first_batch[0].priority, Priority::High);

    let output = compile_job(context.backends(), first_batch[0].input()).unwrap();
    context
        .collection()
        .process_finished_job(first_batch[0].handle, output);

    let channel = InProcessChannel::new(context.clone(), &ChannelConfig::in_process());
    manager.add_channel(Box::new(channel)).unwrap();
    let units = manager.block_until_done(&[unit_id]).unwrap();
    let unit = &units[&unit_id];
    assert!(unit.all_succeeded);
    assert_eq!(unit.jobs.len(), 3);
    assert_eq!(manager.outstanding_count(), 0);
    assert_eq!(manager.pending_count(), 0);
}

#[test]
fn one_at_a_time_drain_follows_priority_then_submission_order() {
    let (manager, _) = manager_without_channels(test_config(), test_backends());
    let unit_id = manager.allocate_unit_id();
    manager.submit(
        vec![
            job("a", Priority::Low),
            job("b", Priority::High),
            job("c", Priority::Low),
        ],
        unit_id,
    );

    let policy = BatchPolicy {
        priority_range: PriorityRange::all(),
        min_batch_size: 1,
        max_batch_size: 1,
        batch_hold_time: Duration::ZERO,
    };
    let collection = manager.context().collection();
    let order: Vec<String> = (0..3)
        .map(|_| {
            let batch = pull_batch(collection, ChannelKind::Local, &policy);
            assert_eq!(batch.len(), 1);
            batch[0].debug_name().to_string()
        })
        .collect();
    assert_eq!(order, vec!["b", "a", "c"]);
}

#[test]
fn cancelled_unit_is_never_finalized() {
    let (mut manager, finalized) = manager_without_channels(test_config(), test_backends());
    let unit_id = manager.allocate_unit_id();
    manager.submit(
        vec![
            job("a", Priority::Normal),
            job("b", Priority::Normal),
            job("c", Priority::High),
        ],
        unit_id,
    );

    assert_eq!(manager.cancel(&[unit_id]), 3);
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.outstanding_count(), 0);

    manager.process_async(None, false).unwrap();
    assert!(finalized.lock().unwrap().is_empty());
    assert!(manager.block_until_done(&[unit_id]).unwrap().is_empty());
}

#[test]
fn late_results_of_a_cancelled_unit_are_discarded() {
    let (mut manager, finalized) = manager_without_channels(test_config(), test_backends());
    let unit_id = manager.allocate_unit_id();
    manager.submit(vec![job("a", Priority::Normal), job("b", Priority::Normal)], unit_id);

    let context = manager.context().clone();
    let in_flight = context
        .collection()
        .get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 1);
    assert_eq!(manager.cancel(&[unit_id]), 1);
    assert_eq!(manager.outstanding_count(), 1);

    context
        .collection()
        .process_finished_job(in_flight[0].handle, ok_output("a"));
    assert_eq!(manager.outstanding_count(), 0);
    assert_eq!(manager.process_async(None, false).unwrap(), 0);
    assert!(finalized.lock().unwrap().is_empty());
}

#[test]
fn cancelled_unit_id_can_be_submitted_again() {
    let (mut manager, finalized) = manager_without_channels(test_config(), test_backends());
    let unit_id = manager.allocate_unit_id();
    let key = JobKey::new_random();
    let compile = |source: &str| {
        NewJob::new(
            key,
            Priority::Normal,
            JobInput::Single(compile_input(1, source)),
        )
    };
    manager.submit(vec![compile("old")], unit_id);

    let context = manager.context().clone();
    let in_flight = context
        .collection()
        .get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 1);
    assert_eq!(manager.cancel(&[unit_id]), 0);

    // Same key as the job still in flight
    assert_eq!(manager.submit(vec![compile("new")], unit_id).len(), 1);
    context
        .collection()
        .process_finished_job(in_flight[0].handle, ok_output("old"));

    let channel = InProcessChannel::new(context.clone(), &ChannelConfig::in_process());
    manager.add_channel(Box::new(channel)).unwrap();
    manager.finish_compilation(&[unit_id]).unwrap();

    let finalized = finalized.lock().unwrap();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].unit_id, unit_id);
    let names: Vec<&str> = finalized[0].jobs.iter().map(|job| job.debug_name()).collect();
    assert_eq!(names, vec!["new"]);
    assert_eq!(manager.outstanding_count(), 0);
}

#[test]
fn resubmitting_after_cancelling_queued_jobs_completes_the_unit() {
    let (mut manager, _) = manager_with_in_process_channel(test_config(), test_backends());
    let unit_id = manager.allocate_unit_id();
    manager.submit(vec![job("a", Priority::Normal), job("b", Priority::Normal)], unit_id);
    assert_eq!(manager.cancel(&[unit_id]), 2);

    manager.submit(vec![job("c", Priority::Normal)], unit_id);
    let done = manager.block_until_done(&[unit_id]).unwrap();
    assert_eq!(done.len(), 1);
    let names: Vec<&str> = done[&unit_id].jobs.iter().map(|job| job.debug_name()).collect();
    assert_eq!(names, vec!["c"]);
}

#[test]
fn buffered_unit_merges_with_jobs_submitted_later() {
    let (mut manager, finalized) = manager_with_in_process_channel(test_config(), test_backends());
    let first = manager.allocate_unit_id();
    let second = manager.allocate_unit_id();
    manager.submit(vec![job("a", Priority::Normal)], first);
    manager.submit(vec![job("b1", Priority::Normal)], second);

    // Both compile, only the first is finalized and the second stays buffered
    assert_eq!(manager.process_async(Some(Duration::ZERO), false).unwrap(), 1);
    assert_eq!(finalized.lock().unwrap()[0].unit_id, first);

    manager.submit(vec![job("b2", Priority::Normal)], second);
    let done = manager.block_until_done(&[second]).unwrap();
    let mut names: Vec<&str> = done[&second].jobs.iter().map(|job| job.debug_name()).collect();
    names.sort();
    assert_eq!(names, vec!["b1", "b2"]);
    assert!(done[&second].all_succeeded);
}

#[test]
fn failed_units_are_retried_when_configured() {
    let backend = TestBackend::new(vec![CompileTarget(1)]).with_flaky_failures(1);
    let compile_count = backend.compile_count();
    let mut builder = CompilerBackendRegistryBuilder::default();
    builder.register_backend(backend);

    let mut config = test_config();
    config.retry_on_error = RetryOnError::Always;
    let (mut manager, _) = manager_with_in_process_channel(config, builder.build());

    let unit_id = manager.allocate_unit_id();
    manager.submit(vec![job("#flaky", Priority::Normal)], unit_id);
    let units = manager.block_until_done(&[unit_id]).unwrap();

    assert!(units[&unit_id].all_succeeded);
    assert_eq!(compile_count.load(Ordering::SeqCst), 2);
}

#[test]
fn retries_stop_at_the_limit() {
    let mut config = test_config();
    config.retry_on_error = RetryOnError::Always;
    config.max_retries = 2;
    let backend = TestBackend::new(vec![CompileTarget(1)]);
    let compile_count = backend.compile_count();
    let mut builder = CompilerBackendRegistryBuilder::default();
    builder.register_backend(backend);
    let (mut manager, _) = manager_with_in_process_channel(config, builder.build());

    let unit_id = manager.allocate_unit_id();
    manager.submit(vec![job("#error", Priority::Normal)], unit_id);
    let units = manager.block_until_done(&[unit_id]).unwrap();

    let unit = &units[&unit_id];
    assert!(!unit.all_succeeded);
    assert_eq!(unit.errors, vec!["#error: #error does not compile".to_string()]);
    assert_eq!(compile_count.load(Ordering::SeqCst), 3);
}

#[test]
fn declined_prompt_returns_the_failure() {
    let mut config = test_config();
    config.retry_on_error = RetryOnError::Prompt;
    let (mut manager, _) = manager_with_in_process_channel(config, test_backends());

    let prompts = Arc::new(AtomicUsize::new(0));
    let prompt_count = prompts.clone();
    manager.set_retry_prompt(move |failed_units: &[&CompiledUnit]| {
        assert_eq!(failed_units.len(), 1);
        prompt_count.fetch_add(1, Ordering::SeqCst);
        false
    });

    let unit_id = manager.allocate_unit_id();
    manager.submit(
        vec![job("#error", Priority::Normal), job("fine", Priority::Normal)],
        unit_id,
    );
    let units = manager.block_until_done(&[unit_id]).unwrap();
    assert!(!units[&unit_id].all_succeeded);
    assert_eq!(units[&unit_id].jobs.len(), 2);
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}

#[test]
fn identical_jobs_compile_once_and_later_ones_hit_the_cache() {
    let backend = TestBackend::new(vec![CompileTarget(1)]);
    let compile_count = backend.compile_count();
    let mut builder = CompilerBackendRegistryBuilder::default();
    builder.register_backend(backend);

    let mut config = test_config();
    config.job_cache_enabled = true;
    let (mut manager, _) = manager_with_in_process_channel(config, builder.build());

    let first = manager.allocate_unit_id();
    let second = manager.allocate_unit_id();
    manager.submit(vec![job("shared", Priority::Normal)], first);
    manager.submit(vec![job("shared", Priority::Normal)], second);
    let units = manager.block_until_done(&[first, second]).unwrap();
    assert_eq!(compile_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        units[&first].jobs[0].output,
        units[&second].jobs[0].output
    );

    let third = manager.allocate_unit_id();
    manager.submit(vec![job("shared", Priority::Normal)], third);
    let units = manager.block_until_done(&[third]).unwrap();
    assert!(units[&third].jobs[0].was_cache_hit);
    assert_eq!(compile_count.load(Ordering::SeqCst), 1);
    assert_eq!(manager.cache_stats().hits, 1);
}

#[test]
fn process_async_respects_the_time_budget() {
    let (mut manager, finalized) = manager_with_in_process_channel(test_config(), test_backends());
    let unit_ids: Vec<UnitId> = (0..3).map(|_| manager.allocate_unit_id()).collect();
    for (index, unit_id) in unit_ids.iter().enumerate() {
        manager.submit(vec![job(&format!("job {}", index), Priority::Normal)], *unit_id);
    }

    // One pass of the in-process channel compiles all three, a zero budget finalizes one per call
    assert_eq!(manager.process_async(Some(Duration::ZERO), false).unwrap(), 1);
    assert_eq!(manager.process_async(Some(Duration::ZERO), false).unwrap(), 1);
    assert_eq!(manager.process_async(Some(Duration::ZERO), false).unwrap(), 1);
    assert_eq!(manager.process_async(Some(Duration::ZERO), false).unwrap(), 0);

    let finalized: Vec<UnitId> = finalized
        .lock()
        .unwrap()
        .iter()
        .map(|unit| unit.unit_id)
        .collect();
    assert_eq!(finalized, unit_ids);
}

#[test]
fn process_async_can_block_on_the_global_unit() {
    let (mut manager, finalized) = manager_with_in_process_channel(test_config(), test_backends());
    manager.submit(vec![job("always needed", Priority::ForceLocal)], UnitId::GLOBAL);

    manager.process_async(None, true).unwrap();
    let finalized = finalized.lock().unwrap();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].unit_id, UnitId::GLOBAL);
}

#[test]
fn hung_unit_is_fatal_when_configured() {
    let mut config = test_config();
    config.hang_timeout = Some(Duration::from_millis(1));
    config.hang_is_fatal = true;
    let (mut manager, _) = manager_without_channels(config, test_backends());

    let unit_id = manager.allocate_unit_id();
    manager.submit(vec![job("stuck", Priority::Normal)], unit_id);
    let result = manager.block_until_done(&[unit_id]);
    assert!(matches!(
        result,
        Err(SchedulerError::UnitHung { unit_id: hung, .. }) if hung == unit_id
    ));
}

#[test]
fn hung_unit_is_reported_and_still_completes() {
    let mut config = test_config();
    config.hang_timeout = Some(Duration::from_millis(20));
    config.hang_is_fatal = false;
    let (mut manager, _) = manager_without_channels(config, test_backends());

    let unit_id = manager.allocate_unit_id();
    manager.submit(vec![job("slow", Priority::Normal)], unit_id);
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(manager.process_async(None, false).unwrap(), 0);

    let unit = manager.context().collection().unit(unit_id).unwrap();
    assert!(unit.is_hung());

    let channel = InProcessChannel::new(manager.context().clone(), &ChannelConfig::in_process());
    manager.add_channel(Box::new(channel)).unwrap();
    let done = manager.block_until_done(&[unit_id]).unwrap();
    assert_eq!(done[&unit_id].jobs.len(), 1);
    assert!(done[&unit_id].all_succeeded);
}

#[test]
fn channel_failure_surfaces_on_the_caller() {
    let (mut manager, _) = manager_with_in_process_channel(test_config(), test_backends());
    let unit_id = manager.allocate_unit_id();
    manager.submit(
        vec![NewJob::new(
            JobKey::new_random(),
            Priority::Normal,
            JobInput::Single(compile_input(42, "no backend")),
        )],
        unit_id,
    );

    let result = manager.block_until_done(&[unit_id]);
    assert!(matches!(
        result,
        Err(SchedulerError::ChannelTerminated { .. })
    ));
}

#[test]
fn threaded_channels_finish_everything() {
    let mut config = test_config();
    config.allow_asynchronous_compiling = true;
    config.channels = vec![ChannelConfig::local(2)];
    let context = SchedulerContext::new(config, test_backends());

    let finalized = Finalized::default();
    let sink = finalized.clone();
    let mut manager = CompilingManager::from_config(context, None, move |unit: CompiledUnit| {
        sink.lock().unwrap().push(unit);
    })
    .unwrap();

    let unit_id = manager.allocate_unit_id();
    let jobs = (0..10)
        .map(|index| job(&format!("job {}", index), Priority::Normal))
        .collect();
    assert_eq!(manager.submit(jobs, unit_id).len(), 10);

    manager.finish_all().unwrap();
    {
        let finalized = finalized.lock().unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].jobs.len(), 10);
        assert!(finalized[0].all_succeeded);
    }

    let stats = manager.channel_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].1, ChannelKind::Local);
    assert_eq!(stats[0].2.jobs_compiled, 10);
    manager.shutdown();
}
