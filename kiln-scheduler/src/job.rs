use crate::{SchedulerError, SchedulerResult};
use kiln_base::create_id_newtype;
use kiln_base::hashing::{hash_bytes_u128, hash_u128};
use serde::{Deserialize, Serialize};
use std::fmt::Formatter;
use std::sync::{Arc, OnceLock};

pub const NUM_PRIORITIES: usize = 4;

/// Ordered lowest to highest. `ForceLocal` jobs are never handed to slow (distributed) channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    ForceLocal,
}

impl Priority {
    pub const ALL: [Priority; NUM_PRIORITIES] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::ForceLocal,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn highest() -> Priority {
        Priority::ForceLocal
    }
}

/// Inclusive range of priorities a channel is willing to serve
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PriorityRange {
    pub min: Priority,
    pub max: Priority,
}

impl PriorityRange {
    pub fn all() -> Self {
        PriorityRange {
            min: Priority::Low,
            max: Priority::ForceLocal,
        }
    }

    pub fn contains(
        &self,
        priority: Priority,
    ) -> bool {
        priority >= self.min && priority <= self.max
    }

    /// Highest priority first, which is the order channels pull work in
    pub fn iter_descending(&self) -> impl Iterator<Item = Priority> + '_ {
        Priority::ALL
            .iter()
            .rev()
            .copied()
            .filter(move |priority| self.contains(*priority))
    }
}

impl Default for PriorityRange {
    fn default() -> Self {
        Self::all()
    }
}

/// A logical group of jobs whose collective completion the caller waits on
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u32);

impl UnitId {
    /// The always-needed unit that `process_async` can block on before draining anything else
    pub const GLOBAL: UnitId = UnitId(0);
}

/// Per-submission id. A retried job gets a fresh one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

create_id_newtype!(JobKey, "JobKey");

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompileTarget(pub u32);

impl std::fmt::Display for CompileTarget {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "target {}", self.0)
    }
}

/// Content hash of a fully resolved job input. Used as the dedup and cache key.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u128);

impl std::fmt::Debug for Fingerprint {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Fingerprint({:032x})", self.0)
    }
}

/// Content hash of serialized job output bytes
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputDigest(pub u128);

impl OutputDigest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        OutputDigest(hash_bytes_u128(bytes))
    }
}

impl std::fmt::Debug for OutputDigest {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "OutputDigest({:032x})", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileInput {
    pub target: CompileTarget,
    pub entry_point: String,
    pub source: String,
    pub environment: Vec<(String, String)>,
    // Not part of the fingerprint
    pub debug_name: String,
}

impl CompileInput {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(hash_u128(&(
            self.target,
            &self.entry_point,
            &self.source,
            &self.environment,
        )))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum JobType {
    Single,
    Pipeline,
}

/// Ordered stages of a pipeline job. Never empty, and every stage compiles for the same target.
/// Deserializing goes through the same check, so a worker can't be handed a mixed pipeline either.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CompileInput>", into = "Vec<CompileInput>")]
pub struct PipelineStages(Vec<CompileInput>);

impl PipelineStages {
    pub fn new(stages: Vec<CompileInput>) -> SchedulerResult<Self> {
        let first = stages
            .first()
            .ok_or_else(|| SchedulerError::from("A pipeline job needs at least one stage"))?;
        if let Some(mismatch) = stages.iter().find(|stage| stage.target != first.target) {
            return Err(SchedulerError::StringError(format!(
                "Pipeline stage '{}' compiles for {} but the pipeline compiles for {}",
                mismatch.debug_name, mismatch.target, first.target
            )));
        }

        Ok(PipelineStages(stages))
    }

    pub fn stages(&self) -> &[CompileInput] {
        &self.0
    }

    pub fn target(&self) -> CompileTarget {
        self.0[0].target
    }

    fn first(&self) -> &CompileInput {
        &self.0[0]
    }
}

impl TryFrom<Vec<CompileInput>> for PipelineStages {
    type Error = SchedulerError;

    fn try_from(stages: Vec<CompileInput>) -> SchedulerResult<Self> {
        PipelineStages::new(stages)
    }
}

impl From<PipelineStages> for Vec<CompileInput> {
    fn from(stages: PipelineStages) -> Self {
        stages.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobInput {
    Single(CompileInput),
    Pipeline(PipelineStages),
}

impl JobInput {
    pub fn pipeline(stages: Vec<CompileInput>) -> SchedulerResult<JobInput> {
        Ok(JobInput::Pipeline(PipelineStages::new(stages)?))
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobInput::Single(_) => JobType::Single,
            JobInput::Pipeline(_) => JobType::Pipeline,
        }
    }

    pub fn target(&self) -> CompileTarget {
        match self {
            JobInput::Single(input) => input.target,
            JobInput::Pipeline(stages) => stages.target(),
        }
    }

    pub fn debug_name(&self) -> &str {
        match self {
            JobInput::Single(input) => &input.debug_name,
            JobInput::Pipeline(stages) => &stages.first().debug_name,
        }
    }

    fn compute_fingerprint(&self) -> Fingerprint {
        match self {
            JobInput::Single(input) => input.fingerprint(),
            JobInput::Pipeline(stages) => {
                let stage_fingerprints: Vec<u128> = stages
                    .stages()
                    .iter()
                    .map(|stage| stage.fingerprint().0)
                    .collect();
                Fingerprint(hash_u128(&stage_fingerprints))
            }
        }
    }
}

/// A job input shared between the collection, channels, and finished results. The fingerprint is
/// computed at most once.
#[derive(Debug)]
pub struct JobInputs {
    input: JobInput,
    fingerprint: OnceLock<Fingerprint>,
}

impl JobInputs {
    pub fn new(input: JobInput) -> Arc<Self> {
        Arc::new(JobInputs {
            input,
            fingerprint: OnceLock::new(),
        })
    }

    pub fn input(&self) -> &JobInput {
        &self.input
    }

    pub fn fingerprint(&self) -> Fingerprint {
        *self
            .fingerprint
            .get_or_init(|| self.input.compute_fingerprint())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileDiagnostic {
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for CompileDiagnostic {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        if self.file.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}({}): {}", self.file, self.line, self.message)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOutput {
    pub succeeded: bool,
    pub code: Vec<u8>,
    pub diagnostics: Vec<CompileDiagnostic>,
}

impl CompileOutput {
    pub fn failed(message: impl Into<String>) -> Self {
        CompileOutput {
            succeeded: false,
            code: Vec::default(),
            diagnostics: vec![CompileDiagnostic {
                file: String::default(),
                line: 0,
                message: message.into(),
            }],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutput {
    Single(CompileOutput),
    Pipeline(Vec<CompileOutput>),
}

impl JobOutput {
    pub fn succeeded(&self) -> bool {
        match self {
            JobOutput::Single(output) => output.succeeded,
            JobOutput::Pipeline(stages) => stages.iter().all(|stage| stage.succeeded),
        }
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &CompileDiagnostic> {
        let stages: &[CompileOutput] = match self {
            JobOutput::Single(output) => std::slice::from_ref(output),
            JobOutput::Pipeline(stages) => stages,
        };
        stages.iter().flat_map(|stage| stage.diagnostics.iter())
    }

    /// A failed output standing in for a job that could not be compiled at all
    pub fn failed_for(
        input: &JobInput,
        message: &str,
    ) -> JobOutput {
        match input {
            JobInput::Single(_) => JobOutput::Single(CompileOutput::failed(message)),
            JobInput::Pipeline(stages) => JobOutput::Pipeline(
                stages
                    .stages().iter()
                    .map(|_| CompileOutput::failed(message))
                    .collect(),
            ),
        }
    }
}

/// Kind of pathway a job is dispatched through. `Distributed` is the slow kind that clone-on-promote
/// races against.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Local,
    Distributed,
    InProcess,
}

/// Stable reference to a job slot in the collection's arena. A stale handle (slot reused) has a
/// different generation and resolves to nothing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub job_type: JobType,
    pub index: u32,
    pub generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Allocated, not yet submitted
    Prepared,
    /// Queued in the priority tier. The ticket identifies the live queue entry.
    Pending { priority: Priority, ticket: u64 },
    /// Waiting on an identical in-flight job
    WaitListed { fingerprint: Fingerprint },
    Dispatched { channel: ChannelKind },
    /// Lost a clone-on-promote race. Its output only feeds the cache.
    Superseded { channel: ChannelKind },
}

/// What a channel holds while a job is in flight
#[derive(Clone, Debug)]
pub struct DispatchedJob {
    pub handle: JobHandle,
    pub job_id: JobId,
    pub unit_id: UnitId,
    pub priority: Priority,
    pub inputs: Arc<JobInputs>,
}

impl DispatchedJob {
    pub fn input(&self) -> &JobInput {
        self.inputs.input()
    }

    pub fn debug_name(&self) -> &str {
        self.inputs.input().debug_name()
    }
}

/// A completed job, shared with the unit it belongs to until the caller drops it
#[derive(Debug)]
pub struct FinishedJob {
    pub job_id: JobId,
    pub unit_id: UnitId,
    pub key: JobKey,
    pub priority: Priority,
    pub inputs: Arc<JobInputs>,
    pub output: JobOutput,
    pub output_digest: OutputDigest,
    pub was_cache_hit: bool,
}

impl FinishedJob {
    pub fn succeeded(&self) -> bool {
        self.output.succeeded()
    }

    pub fn debug_name(&self) -> &str {
        self.inputs.input().debug_name()
    }
}
