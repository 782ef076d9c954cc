use kiln_scheduler::transport::wire::{
    self, WorkerErrorCode, WorkerInput, WorkerOutputHeader, WorkerOutputs,
};
use kiln_scheduler::transport::write_file_atomically;
use kiln_scheduler::{
    compile_job, CompileInput, CompileOutput, CompilerBackendRegistry, JobInput, JobOutput,
    SchedulerError, SchedulerResult,
};
use std::any::Any;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use structopt::StructOpt;

const POLL_SLEEP: Duration = Duration::from_millis(10);

#[derive(StructOpt, Debug)]
pub struct WorkerArgs {
    #[structopt(name = "working-directory", long, parse(from_os_str))]
    pub working_directory: PathBuf,
    #[structopt(name = "input-file", long)]
    pub input_file: String,
    #[structopt(name = "output-file", long)]
    pub output_file: String,
    /// Exit when this process goes away
    #[structopt(name = "parent-pid", long)]
    pub parent_pid: Option<u32>,
    /// Keep serving batches until idle for idle-timeout-secs
    #[structopt(name = "keep-alive", long)]
    pub keep_alive: bool,
    #[structopt(name = "idle-timeout-secs", long, default_value = "30")]
    pub idle_timeout_secs: u64,
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn header(
    error_code: WorkerErrorCode,
    message: String,
) -> WorkerOutputHeader {
    WorkerOutputHeader {
        error_code,
        message,
    }
}

// A backend panic is reported as Err with the panic message
fn compile_guarded(
    registry: &CompilerBackendRegistry,
    input: JobInput,
) -> Result<JobOutput, String> {
    let debug_name = input.debug_name().to_string();
    match std::panic::catch_unwind(AssertUnwindSafe(|| compile_job(registry, &input))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("{}: {}", debug_name, e)),
        Err(panic) => Err(format!("{} panicked: {}", debug_name, panic_message(&panic))),
    }
}

fn compile_batch(
    input: WorkerInput,
    registry: &CompilerBackendRegistry,
) -> (WorkerOutputHeader, WorkerOutputs) {
    profiling::scope!("compile_batch");
    let mut outputs = WorkerOutputs::default();

    let targets = input
        .singles
        .iter()
        .map(|input: &CompileInput| input.target)
        .chain(input.pipelines.iter().map(|stages| stages.target()));
    for target in targets {
        if !registry.contains_target(target) {
            return (
                header(
                    WorkerErrorCode::CantFindBackend { target },
                    format!("No compiler backend registered for {}", target),
                ),
                outputs,
            );
        }
    }

    let crashed = |message: String, outputs: &WorkerOutputs| {
        log::error!("{}", message);
        header(
            WorkerErrorCode::CrashedAfterJobs {
                jobs_processed: outputs.job_count() as u32,
            },
            message,
        )
    };

    for single in input.singles {
        match compile_guarded(registry, JobInput::Single(single)) {
            Ok(JobOutput::Single(output)) => outputs.singles.push(output),
            Ok(JobOutput::Pipeline(_)) => {
                let header = crashed("Single job produced pipeline output".to_string(), &outputs);
                return (header, outputs);
            }
            Err(message) => {
                let header = crashed(message, &outputs);
                return (header, outputs);
            }
        }
    }

    for stages in input.pipelines {
        match compile_guarded(registry, JobInput::Pipeline(stages)) {
            Ok(JobOutput::Pipeline(stage_outputs)) => outputs.pipelines.push(stage_outputs),
            Ok(JobOutput::Single(_)) => {
                let header = crashed("Pipeline job produced single output".to_string(), &outputs);
                return (header, outputs);
            }
            Err(message) => {
                let header = crashed(message, &outputs);
                return (header, outputs);
            }
        }
    }

    (header(WorkerErrorCode::Success, String::default()), outputs)
}

/// Compiles one input batch and returns the encoded output. Problems with the batch itself are
/// reported through the output's error code, only a failure to encode is an error.
pub fn process_input_bytes(
    bytes: &[u8],
    registry: &CompilerBackendRegistry,
) -> SchedulerResult<Vec<u8>> {
    let (header, outputs) = match wire::decode_input(bytes) {
        Ok(input) => {
            log::debug!("Compiling a batch of {} jobs", input.job_count());
            compile_batch(input, registry)
        }
        Err(SchedulerError::TransportVersionMismatch { expected, found }) => (
            header(
                WorkerErrorCode::BadInputVersion { found },
                format!("Expected input version {}, found {}", expected, found),
            ),
            WorkerOutputs::default(),
        ),
        Err(e) => (
            header(WorkerErrorCode::CorruptInput, e.to_string()),
            WorkerOutputs::default(),
        ),
    };

    wire::encode_output(&header, &outputs)
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    std::path::Path::new("/proc")
        .join(pid.to_string())
        .exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    true
}

/// Serves batches from `args.input_file` until done. Without keep-alive the worker exits after
/// one batch. Either way it exits once idle for the timeout or when the parent process is gone.
pub fn run_worker(
    args: &WorkerArgs,
    registry: &CompilerBackendRegistry,
) -> SchedulerResult<()> {
    let input_path = args.working_directory.join(&args.input_file);
    let output_path = args.working_directory.join(&args.output_file);
    let idle_timeout = Duration::from_secs(args.idle_timeout_secs);
    let mut last_activity = Instant::now();
    let mut batches_processed = 0;

    loop {
        if let Some(parent_pid) = args.parent_pid {
            if !process_is_alive(parent_pid) {
                log::info!("Parent process {} is gone, exiting", parent_pid);
                return Ok(());
            }
        }

        let bytes = match std::fs::read(&input_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if last_activity.elapsed() >= idle_timeout {
                    log::info!(
                        "No work for {}s after {} batches, exiting",
                        idle_timeout.as_secs(),
                        batches_processed
                    );
                    return Ok(());
                }

                std::thread::sleep(POLL_SLEEP);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        // Taking the input tells the scheduler this worker owns the batch
        std::fs::remove_file(&input_path)?;
        let output = process_input_bytes(&bytes, registry)?;
        write_file_atomically(&output_path, &output)?;

        batches_processed += 1;
        last_activity = Instant::now();
        if !args.keep_alive {
            return Ok(());
        }
    }
}

/// Entry point for worker executables. Parses the command line and serves batches with the given
/// backends.
pub fn worker_main(registry: CompilerBackendRegistry) {
    let args = WorkerArgs::from_args();
    log::debug!("Worker started with {:?}", args);
    if let Err(e) = run_worker(&args, &registry) {
        log::error!("Worker failed: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kiln_scheduler::{
        CompileTarget, CompilerBackend, CompilerBackendRegistryBuilder, PipelineStages,
    };

    struct EchoBackend;

    impl CompilerBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        fn targets(&self) -> Vec<CompileTarget> {
            vec![CompileTarget(1)]
        }

        fn compile(
            &self,
            input: &CompileInput,
        ) -> CompileOutput {
            if input.source.contains("#panic") {
                panic!("asked to panic");
            }

            CompileOutput {
                succeeded: true,
                code: input.source.as_bytes().to_vec(),
                diagnostics: Vec::default(),
            }
        }
    }

    fn registry() -> CompilerBackendRegistry {
        let mut builder = CompilerBackendRegistryBuilder::default();
        builder.register_backend(EchoBackend);
        builder.build()
    }

    fn input(
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

    fn run(batch: WorkerInput) -> (WorkerOutputHeader, WorkerOutputs) {
        let bytes = wire::encode_worker_input(&batch).unwrap();
        let output = process_input_bytes(&bytes, &registry()).unwrap();
        let decoded =
            wire::decode_output(&output, batch.singles.len(), batch.pipelines.len()).unwrap();
        (decoded.header, decoded.outputs)
    }

    #[test]
    fn compiles_singles_then_pipelines() {
        let (header, outputs) = run(WorkerInput {
            singles: vec![input(1, "a"), input(1, "b")],
            pipelines: vec![PipelineStages::new(vec![input(1, "vs"), input(1, "ps")]).unwrap()],
        });

        assert_eq!(header.error_code, WorkerErrorCode::Success);
        assert_eq!(outputs.singles[1].code, b"b".to_vec());
        assert_eq!(outputs.pipelines[0].len(), 2);
    }

    #[test]
    fn backend_panic_reports_jobs_processed() {
        let (header, outputs) = run(WorkerInput {
            singles: vec![input(1, "a"), input(1, "#panic"), input(1, "c")],
            pipelines: Vec::default(),
        });

        assert_eq!(
            header.error_code,
            WorkerErrorCode::CrashedAfterJobs { jobs_processed: 1 }
        );
        assert_eq!(outputs.singles.len(), 1);
    }

    #[test]
    fn missing_backend_is_reported_before_compiling() {
        let (header, outputs) = run(WorkerInput {
            singles: vec![input(1, "a"), input(5, "b")],
            pipelines: Vec::default(),
        });

        assert_eq!(
            header.error_code,
            WorkerErrorCode::CantFindBackend {
                target: CompileTarget(5)
            }
        );
        assert_eq!(outputs.job_count(), 0);
    }

    #[test]
    fn bad_input_is_reported_in_the_header() {
        let mut bytes = wire::encode_worker_input(&WorkerInput {
            singles: vec![input(1, "a")],
            pipelines: Vec::default(),
        })
        .unwrap();
        // Version field of the block container header
        bytes[8..12].copy_from_slice(&1u32.to_le_bytes());
        let output = process_input_bytes(&bytes, &registry()).unwrap();
        let decoded = wire::decode_output(&output, 1, 0).unwrap();
        assert_eq!(
            decoded.header.error_code,
            WorkerErrorCode::BadInputVersion { found: 1 }
        );

        let output = process_input_bytes(b"garbage", &registry()).unwrap();
        let decoded = wire::decode_output(&output, 1, 0).unwrap();
        assert_eq!(decoded.header.error_code, WorkerErrorCode::CorruptInput);
    }

    #[test]
    fn single_batch_worker_consumes_input_and_publishes_output() {
        let dir = tempfile::tempdir().unwrap();
        let args = WorkerArgs {
            working_directory: dir.path().to_path_buf(),
            input_file: "in.kjb".to_string(),
            output_file: "out.kjb".to_string(),
            parent_pid: Some(std::process::id()),
            keep_alive: false,
            idle_timeout_secs: 5,
        };

        let batch = wire::encode_worker_input(&WorkerInput {
            singles: vec![input(1, "a")],
            pipelines: Vec::default(),
        })
        .unwrap();
        std::fs::write(dir.path().join("in.kjb"), &batch).unwrap();

        run_worker(&args, &registry()).unwrap();

        assert!(!dir.path().join("in.kjb").exists());
        let output = std::fs::read(dir.path().join("out.kjb")).unwrap();
        let decoded = wire::decode_output(&output, 1, 0).unwrap();
        assert_eq!(decoded.header.error_code, WorkerErrorCode::Success);
    }

    #[test]
    fn idle_worker_exits_after_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let args = WorkerArgs {
            working_directory: dir.path().to_path_buf(),
            input_file: "in.kjb".to_string(),
            output_file: "out.kjb".to_string(),
            parent_pid: None,
            keep_alive: true,
            idle_timeout_secs: 0,
        };

        run_worker(&args, &registry()).unwrap();
        assert!(!dir.path().join("out.kjb").exists());
    }
}
