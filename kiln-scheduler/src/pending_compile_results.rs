use crate::{FinishedJob, UnitId};
use kiln_base::hashing::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct FinishedJobs {
    jobs: Vec<Arc<FinishedJob>>,
    all_succeeded: bool,
}

/// Bookkeeping for one unit of work while its jobs are in flight. Shared between the collection
/// (which finishes jobs into it) and the manager (which drains it).
pub struct PendingCompileResults {
    unit_id: UnitId,
    created_at: Instant,
    // Submitted jobs that have not finished yet
    outstanding_jobs: AtomicUsize,
    // Prepared jobs that have not been submitted yet. The unit can't complete while these exist.
    prepared_jobs: AtomicUsize,
    skip_processing: AtomicBool,
    hung: AtomicBool,
    finished: Mutex<FinishedJobs>,
}

impl PendingCompileResults {
    pub fn new(unit_id: UnitId) -> Self {
        PendingCompileResults {
            unit_id,
            created_at: Instant::now(),
            outstanding_jobs: AtomicUsize::new(0),
            prepared_jobs: AtomicUsize::new(0),
            skip_processing: AtomicBool::new(false),
            hung: AtomicBool::new(false),
            finished: Mutex::new(FinishedJobs {
                jobs: Vec::default(),
                all_succeeded: true,
            }),
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn outstanding_jobs(&self) -> usize {
        self.outstanding_jobs.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding_jobs() == 0 && self.prepared_jobs.load(Ordering::Acquire) == 0
    }

    pub fn finished_job_count(&self) -> usize {
        self.finished.lock().unwrap().jobs.len()
    }

    pub(crate) fn add_prepared(&self) {
        self.prepared_jobs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_prepared(&self) {
        let previous = self.prepared_jobs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Unit {:?} has no prepared jobs", self.unit_id);
    }

    pub(crate) fn add_outstanding(
        &self,
        count: usize,
    ) {
        self.outstanding_jobs.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn close_outstanding(
        &self,
        count: usize,
    ) {
        let previous = self.outstanding_jobs.fetch_sub(count, Ordering::AcqRel);
        assert!(
            previous >= count,
            "Unit {:?} finished more jobs than were submitted",
            self.unit_id
        );
    }

    // Must happen before close_outstanding so a completed unit never misses its last job
    pub(crate) fn record_finished(
        &self,
        job: Arc<FinishedJob>,
    ) {
        if self.should_skip_processing() {
            log::trace!("Discarding {:?} of cancelled {:?}", job.job_id, self.unit_id);
            return;
        }

        let mut finished = self.finished.lock().unwrap();
        finished.all_succeeded &= job.succeeded();
        finished.jobs.push(job);
    }

    /// Jobs of a cancelled unit that are already with a channel are discarded when they arrive
    pub fn mark_skip_processing(&self) {
        self.skip_processing.store(true, Ordering::Release);
    }

    pub fn should_skip_processing(&self) -> bool {
        self.skip_processing.load(Ordering::Acquire)
    }

    pub fn is_hung(&self) -> bool {
        self.hung.load(Ordering::Acquire)
    }

    /// Returns the elapsed time the first time the unit is found to be over the timeout
    pub fn check_if_hung(
        &self,
        hang_timeout: Duration,
    ) -> Option<Duration> {
        let elapsed = self.created_at.elapsed();
        if self.is_complete() || elapsed <= hang_timeout {
            return None;
        }

        if self.hung.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(elapsed)
        }
    }

    pub(crate) fn take_compiled_unit(&self) -> CompiledUnit {
        let mut finished = self.finished.lock().unwrap();
        let jobs = std::mem::take(&mut finished.jobs);
        let all_succeeded = finished.all_succeeded;
        finished.all_succeeded = true;
        CompiledUnit::new(self.unit_id, jobs, all_succeeded)
    }
}

/// A fully drained unit of work handed to the caller
#[derive(Debug)]
pub struct CompiledUnit {
    pub unit_id: UnitId,
    pub jobs: Vec<Arc<FinishedJob>>,
    pub all_succeeded: bool,
    // Unique diagnostics across every failed job, in the order first seen
    pub errors: Vec<String>,
}

impl CompiledUnit {
    pub fn new(
        unit_id: UnitId,
        jobs: Vec<Arc<FinishedJob>>,
        all_succeeded: bool,
    ) -> Self {
        let mut seen = HashSet::default();
        let mut errors = Vec::default();
        for job in jobs.iter().filter(|job| !job.succeeded()) {
            for diagnostic in job.output.diagnostics() {
                let error = format!("{}: {}", job.debug_name(), diagnostic);
                if seen.insert(error.clone()) {
                    errors.push(error);
                }
            }
        }

        CompiledUnit {
            unit_id,
            jobs,
            all_succeeded,
            errors,
        }
    }

    /// Merges jobs that arrived for the same unit after an earlier drain
    pub fn merge(
        &mut self,
        other: CompiledUnit,
    ) {
        assert_eq!(self.unit_id, other.unit_id);
        let mut jobs = std::mem::take(&mut self.jobs);
        jobs.extend(other.jobs);
        *self = CompiledUnit::new(self.unit_id, jobs, self.all_succeeded && other.all_succeeded);
    }
}
