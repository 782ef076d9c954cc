use crate::{CompileInput, CompileOutput, CompileTarget, JobInput, JobOutput, SchedulerError, SchedulerResult};
use kiln_base::hashing::HashMap;
use std::panic::RefUnwindSafe;
use std::sync::Arc;

/// A compiler for one or more targets. Must behave as a pure function of its input, since the same
/// input may be compiled by a worker process, in-process, or not at all (cache hit).
pub trait CompilerBackend: Send + Sync + RefUnwindSafe {
    fn name(&self) -> &str;

    fn targets(&self) -> Vec<CompileTarget>;

    fn compile(
        &self,
        input: &CompileInput,
    ) -> CompileOutput;
}

#[derive(Default)]
pub struct CompilerBackendRegistryBuilder {
    backends: HashMap<CompileTarget, Arc<dyn CompilerBackend>>,
}

impl CompilerBackendRegistryBuilder {
    pub fn register_backend<T: CompilerBackend + 'static>(
        &mut self,
        backend: T,
    ) {
        let backend: Arc<dyn CompilerBackend> = Arc::new(backend);
        for target in backend.targets() {
            let old = self.backends.insert(target, backend.clone());
            if old.is_some() {
                panic!("Multiple compiler backends registered for {}", target);
            }
        }
    }

    pub fn build(self) -> CompilerBackendRegistry {
        let inner = CompilerBackendRegistryInner {
            backends: self.backends,
        };

        CompilerBackendRegistry {
            inner: Arc::new(inner),
        }
    }
}

pub struct CompilerBackendRegistryInner {
    backends: HashMap<CompileTarget, Arc<dyn CompilerBackend>>,
}

#[derive(Clone)]
pub struct CompilerBackendRegistry {
    inner: Arc<CompilerBackendRegistryInner>,
}

impl CompilerBackendRegistry {
    pub fn backend_for_target(
        &self,
        target: CompileTarget,
    ) -> Option<&dyn CompilerBackend> {
        self.inner.backends.get(&target).map(|x| &**x)
    }

    pub fn contains_target(
        &self,
        target: CompileTarget,
    ) -> bool {
        self.inner.backends.contains_key(&target)
    }
}

/// Compiles one job with whichever backend handles its target. Pipeline stages run in order and
/// stop at the first failure, the stages after it are reported as skipped.
pub fn compile_job(
    registry: &CompilerBackendRegistry,
    input: &JobInput,
) -> SchedulerResult<JobOutput> {
    let target = input.target();
    let backend = registry
        .backend_for_target(target)
        .ok_or(SchedulerError::BackendNotFound(target))?;

    profiling::scope!(&format!("compile {}", input.debug_name()));
    match input {
        JobInput::Single(input) => Ok(JobOutput::Single(backend.compile(input))),
        JobInput::Pipeline(stages) => {
            let mut outputs = Vec::with_capacity(stages.stages().len());
            let mut failed_stage = None;
            for stage in stages.stages() {
                if let Some(failed_stage) = &failed_stage {
                    outputs.push(CompileOutput::failed(format!(
                        "Skipped because pipeline stage '{}' failed",
                        failed_stage
                    )));
                    continue;
                }

                let output = backend.compile(stage);
                if !output.succeeded {
                    failed_stage = Some(stage.debug_name.clone());
                }
                outputs.push(output);
            }

            Ok(JobOutput::Pipeline(outputs))
        }
    }
}
