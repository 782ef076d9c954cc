//! Byte format of batches exchanged with worker processes, built on the B3F block container.
//!
//! Input file: block 0 holds the single job inputs, block 1 the pipeline inputs (each pipeline
//! carries its own stage count).
//!
//! Output file: block 0 is a header with an error code, block 1 the single outputs, block 2 the
//! pipeline outputs. Outputs are positional, in the order the inputs were written.

use crate::{
    CompileInput, CompileOutput, CompileTarget, DispatchedJob, JobInput, JobOutput, PipelineStages,
    SchedulerError, SchedulerResult,
};
use kiln_base::{B3FReader, B3FWriter};
use serde::{Deserialize, Serialize};

pub const WORKER_INPUT_VERSION: u32 = 2;
pub const WORKER_OUTPUT_VERSION: u32 = 1;

const INPUT_FILE_TAG: [u8; 4] = *b"KJIN";
const OUTPUT_FILE_TAG: [u8; 4] = *b"KJOU";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerErrorCode {
    Success,
    /// The worker wrote the outputs of the first `jobs_processed` jobs and then failed
    CrashedAfterJobs { jobs_processed: u32 },
    BadInputVersion { found: u32 },
    CorruptInput,
    CantFindBackend { target: CompileTarget },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutputHeader {
    pub error_code: WorkerErrorCode,
    pub message: String,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerInput {
    pub singles: Vec<CompileInput>,
    pub pipelines: Vec<PipelineStages>,
}

impl WorkerInput {
    pub fn job_count(&self) -> usize {
        self.singles.len() + self.pipelines.len()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerOutputs {
    pub singles: Vec<CompileOutput>,
    pub pipelines: Vec<Vec<CompileOutput>>,
}

impl WorkerOutputs {
    pub fn job_count(&self) -> usize {
        self.singles.len() + self.pipelines.len()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub header: WorkerOutputHeader,
    pub outputs: WorkerOutputs,
}

/// Splits a batch into the order it is written on the wire: singles first, then pipelines
pub fn wire_order(jobs: &[DispatchedJob]) -> Vec<&DispatchedJob> {
    let singles = jobs
        .iter()
        .filter(|job| matches!(job.input(), JobInput::Single(_)));
    let pipelines = jobs
        .iter()
        .filter(|job| matches!(job.input(), JobInput::Pipeline(_)));
    singles.chain(pipelines).collect()
}

pub fn encode_input(jobs: &[DispatchedJob]) -> SchedulerResult<Vec<u8>> {
    profiling::scope!("wire::encode_input");
    let mut input = WorkerInput::default();
    for job in jobs {
        match job.input() {
            JobInput::Single(single) => input.singles.push(single.clone()),
            JobInput::Pipeline(stages) => input.pipelines.push(stages.clone()),
        }
    }

    encode_worker_input(&input)
}

pub fn encode_worker_input(input: &WorkerInput) -> SchedulerResult<Vec<u8>> {
    let singles = bincode::serialize(&input.singles)?;
    let pipelines = bincode::serialize(&input.pipelines)?;

    let mut writer = B3FWriter::new_from_u8_tag(INPUT_FILE_TAG, WORKER_INPUT_VERSION);
    writer.add_block(&singles);
    writer.add_block(&pipelines);
    Ok(writer.to_bytes())
}

pub fn decode_input(bytes: &[u8]) -> SchedulerResult<WorkerInput> {
    let reader = open(bytes, INPUT_FILE_TAG, WORKER_INPUT_VERSION, 2)?;
    Ok(WorkerInput {
        singles: bincode::deserialize(reader.get_block(0))?,
        pipelines: bincode::deserialize(reader.get_block(1))?,
    })
}

pub fn encode_output(
    header: &WorkerOutputHeader,
    outputs: &WorkerOutputs,
) -> SchedulerResult<Vec<u8>> {
    let header = bincode::serialize(header)?;
    let singles = bincode::serialize(&outputs.singles)?;
    let pipelines = bincode::serialize(&outputs.pipelines)?;

    let mut writer = B3FWriter::new_from_u8_tag(OUTPUT_FILE_TAG, WORKER_OUTPUT_VERSION);
    writer.add_block(&header);
    writer.add_block(&singles);
    writer.add_block(&pipelines);
    Ok(writer.to_bytes())
}

/// Parses a worker's output. A clean result must have exactly one output per dispatched job, a
/// mismatch means the worker binary doesn't match this scheduler.
pub fn decode_output(
    bytes: &[u8],
    expected_singles: usize,
    expected_pipelines: usize,
) -> SchedulerResult<WorkerOutput> {
    let reader = open(bytes, OUTPUT_FILE_TAG, WORKER_OUTPUT_VERSION, 3)?;
    let header: WorkerOutputHeader = bincode::deserialize(reader.get_block(0))?;
    let outputs = WorkerOutputs {
        singles: bincode::deserialize(reader.get_block(1))?,
        pipelines: bincode::deserialize(reader.get_block(2))?,
    };

    let expected = expected_singles + expected_pipelines;
    match header.error_code {
        WorkerErrorCode::Success => {
            if outputs.singles.len() != expected_singles
                || outputs.pipelines.len() != expected_pipelines
            {
                return Err(SchedulerError::JobCountMismatch {
                    expected,
                    found: outputs.job_count(),
                });
            }
        }
        _ => {
            if outputs.singles.len() > expected_singles
                || outputs.pipelines.len() > expected_pipelines
            {
                return Err(SchedulerError::JobCountMismatch {
                    expected,
                    found: outputs.job_count(),
                });
            }
        }
    }

    Ok(WorkerOutput { header, outputs })
}

fn open<'a>(
    bytes: &'a [u8],
    file_tag: [u8; 4],
    version: u32,
    block_count: usize,
) -> SchedulerResult<B3FReader<'a>> {
    let reader = B3FReader::new(bytes).ok_or_else(|| {
        SchedulerError::TransportCorrupt(format!("{} bytes is not a complete batch file", bytes.len()))
    })?;

    if reader.file_tag_as_u8() != file_tag {
        return Err(SchedulerError::TransportCorrupt(format!(
            "Unexpected file tag {:?}",
            reader.file_tag_as_u8()
        )));
    }

    if reader.version() != version {
        return Err(SchedulerError::TransportVersionMismatch {
            expected: version,
            found: reader.version(),
        });
    }

    if reader.block_count() != block_count {
        return Err(SchedulerError::TransportCorrupt(format!(
            "Expected {} blocks, found {}",
            block_count,
            reader.block_count()
        )));
    }

    Ok(reader)
}

/// Pairs positional worker outputs back up with the jobs they belong to. Jobs without an output
/// (the worker crashed before reaching them) are returned separately.
pub fn match_outputs<'a>(
    jobs: &'a [DispatchedJob],
    outputs: WorkerOutputs,
) -> (Vec<(&'a DispatchedJob, JobOutput)>, Vec<&'a DispatchedJob>) {
    let mut singles = outputs.singles.into_iter();
    let mut pipelines = outputs.pipelines.into_iter();

    let mut completed = Vec::with_capacity(jobs.len());
    let mut missing = Vec::default();
    for job in wire_order(jobs) {
        let output = match job.input() {
            JobInput::Single(_) => singles.next().map(JobOutput::Single),
            JobInput::Pipeline(_) => pipelines.next().map(JobOutput::Pipeline),
        };

        match output {
            Some(output) => completed.push((job, output)),
            None => missing.push(job),
        }
    }

    (completed, missing)
}
