use crate::{
    ChannelKind, DispatchedJob, FinishedJob, Fingerprint, JobCache, JobHandle, JobId, JobInputs,
    JobKey, JobOutput, JobState, JobType, OutputDigest, PendingCompileResults, Priority, UnitId,
    NUM_PRIORITIES,
};
use kiln_base::hashing::HashMap;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

// Queues with fewer entries than this are never compacted
const MIN_QUEUE_COMPACTION_LEN: usize = 32;

struct Job {
    job_id: JobId,
    unit: Arc<PendingCompileResults>,
    key: JobKey,
    priority: Priority,
    inputs: Arc<JobInputs>,
    state: JobState,
    // Set once the job is registered in the in-flight index or a wait list
    fingerprint: Option<Fingerprint>,
    // Handle of the original job when this job races a clone of itself
    attempt_group: Option<JobHandle>,
    queued_at: Instant,
}

struct JobSlot {
    generation: u32,
    job: Option<Job>,
}

// Free-list backed storage. Handles carry the slot generation so a handle to a removed job never
// resolves to whatever reused the slot.
struct JobArena {
    job_type: JobType,
    slots: Vec<JobSlot>,
    free_list: Vec<u32>,
    live_count: usize,
}

impl JobArena {
    fn new(job_type: JobType) -> Self {
        JobArena {
            job_type,
            slots: Vec::default(),
            free_list: Vec::default(),
            live_count: 0,
        }
    }

    fn allocate(
        &mut self,
        job: Job,
    ) -> JobHandle {
        self.live_count += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.job = Some(job);
            JobHandle {
                job_type: self.job_type,
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(JobSlot {
                generation: 0,
                job: Some(job),
            });
            JobHandle {
                job_type: self.job_type,
                index,
                generation: 0,
            }
        }
    }

    fn get(
        &self,
        handle: JobHandle,
    ) -> Option<&Job> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.job.as_ref()
    }

    fn get_mut(
        &mut self,
        handle: JobHandle,
    ) -> Option<&mut Job> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.job.as_mut()
    }

    fn remove(
        &mut self,
        handle: JobHandle,
    ) -> Option<Job> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let job = slot.job.take()?;
        self.free_list.push(handle.index);
        self.live_count -= 1;
        Some(job)
    }

    fn iter(&self) -> impl Iterator<Item = (JobHandle, &Job)> {
        let job_type = self.job_type;
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            slot.job.as_ref().map(|job| {
                (
                    JobHandle {
                        job_type,
                        index: index as u32,
                        generation: slot.generation,
                    },
                    job,
                )
            })
        })
    }
}

struct JobCollectionInner {
    singles: JobArena,
    pipelines: JobArena,
    // Entries are (handle, ticket). An entry is live only while the job is Pending with the same
    // priority and ticket, so relinking or removing a job never has to search a queue.
    queues: [VecDeque<(JobHandle, u64)>; NUM_PRIORITIES],
    pending_counts: [usize; NUM_PRIORITIES],
    next_ticket: u64,
    in_flight: HashMap<Fingerprint, JobHandle>,
    wait_lists: HashMap<Fingerprint, Vec<JobHandle>>,
    // Original handle -> every attempt racing to produce its output (original included)
    speculative: HashMap<JobHandle, Vec<JobHandle>>,
    pending_keys: HashMap<(UnitId, JobKey), JobHandle>,
    units: HashMap<UnitId, Arc<PendingCompileResults>>,
}

impl JobCollectionInner {
    fn new() -> Self {
        JobCollectionInner {
            singles: JobArena::new(JobType::Single),
            pipelines: JobArena::new(JobType::Pipeline),
            queues: Default::default(),
            pending_counts: [0; NUM_PRIORITIES],
            next_ticket: 0,
            in_flight: HashMap::default(),
            wait_lists: HashMap::default(),
            speculative: HashMap::default(),
            pending_keys: HashMap::default(),
            units: HashMap::default(),
        }
    }

    fn arena_mut(
        &mut self,
        job_type: JobType,
    ) -> &mut JobArena {
        match job_type {
            JobType::Single => &mut self.singles,
            JobType::Pipeline => &mut self.pipelines,
        }
    }

    fn job(
        &self,
        handle: JobHandle,
    ) -> Option<&Job> {
        match handle.job_type {
            JobType::Single => self.singles.get(handle),
            JobType::Pipeline => self.pipelines.get(handle),
        }
    }

    fn job_mut(
        &mut self,
        handle: JobHandle,
    ) -> Option<&mut Job> {
        self.arena_mut(handle.job_type).get_mut(handle)
    }

    fn jobs(&self) -> impl Iterator<Item = (JobHandle, &Job)> {
        self.singles.iter().chain(self.pipelines.iter())
    }

    fn find_or_add_unit(
        &mut self,
        unit_id: UnitId,
    ) -> Arc<PendingCompileResults> {
        self.units
            .entry(unit_id)
            .or_insert_with(|| Arc::new(PendingCompileResults::new(unit_id)))
            .clone()
    }

    fn enqueue(
        &mut self,
        handle: JobHandle,
        priority: Priority,
    ) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let job = self
            .job_mut(handle)
            .unwrap_or_else(|| panic!("Queueing job {:?} which is not owned by the job collection", handle));
        job.priority = priority;
        job.state = JobState::Pending { priority, ticket };
        job.queued_at = Instant::now();

        self.queues[priority.index()].push_back((handle, ticket));
        self.pending_counts[priority.index()] += 1;
    }

    // A relinked or removed job leaves its old queue entry behind. Drop the stale entries once they
    // outnumber the live ones, so a tier that is never served doesn't grow without bound.
    fn compact_queue_if_stale(
        &mut self,
        priority: Priority,
    ) {
        let index = priority.index();
        let queue_len = self.queues[index].len();
        if queue_len < MIN_QUEUE_COMPACTION_LEN || queue_len <= 2 * self.pending_counts[index] {
            return;
        }

        let queue = std::mem::take(&mut self.queues[index]);
        let live: VecDeque<(JobHandle, u64)> = queue
            .into_iter()
            .filter(|(handle, ticket)| self.is_live_queue_entry(*handle, priority, *ticket))
            .collect();
        log::trace!(
            "Compacted {:?} queue from {} to {} entries",
            priority,
            queue_len,
            live.len()
        );
        self.queues[index] = live;
    }

    fn is_live_queue_entry(
        &self,
        handle: JobHandle,
        priority: Priority,
        ticket: u64,
    ) -> bool {
        match self.job(handle).map(|job| job.state) {
            Some(JobState::Pending {
                priority: job_priority,
                ticket: job_ticket,
            }) => job_priority == priority && job_ticket == ticket,
            _ => false,
        }
    }

    // Removal that keeps the queue counts and key index consistent. Panics if the handle is stale,
    // which means some caller's bookkeeping is already broken.
    fn take_job(
        &mut self,
        handle: JobHandle,
    ) -> Job {
        let job = self
            .arena_mut(handle.job_type)
            .remove(handle)
            .unwrap_or_else(|| panic!("Removing job {:?} which is not owned by the job collection", handle));

        if let JobState::Pending { priority, .. } = job.state {
            self.pending_counts[priority.index()] -= 1;
            self.compact_queue_if_stale(priority);
        }

        self.forget_key(handle, job.unit.unit_id(), job.key);
        job
    }

    fn forget_key(
        &mut self,
        handle: JobHandle,
        unit_id: UnitId,
        key: JobKey,
    ) {
        if self.pending_keys.get(&(unit_id, key)) == Some(&handle) {
            self.pending_keys.remove(&(unit_id, key));
        }
    }

    fn leave_attempt_group(
        &mut self,
        handle: JobHandle,
        attempt_group: Option<JobHandle>,
    ) {
        let Some(group) = attempt_group else {
            return;
        };

        let Some(attempts) = self.speculative.get_mut(&group) else {
            return;
        };

        attempts.retain(|attempt| *attempt != handle);
        if attempts.len() <= 1 {
            let remaining = self.speculative.remove(&group).unwrap_or_default();
            for attempt in remaining {
                if let Some(job) = self.job_mut(attempt) {
                    job.attempt_group = None;
                }
            }
        }
    }

    // The in-flight job for `fingerprint` was cancelled. Hand its role to a duplicate that belongs
    // to a different unit so that unit isn't stranded on the wait list.
    fn promote_waiter(
        &mut self,
        fingerprint: Fingerprint,
        cancelled_unit: UnitId,
    ) {
        let Some(mut waiters) = self.wait_lists.remove(&fingerprint) else {
            return;
        };

        let position = waiters.iter().position(|waiter| {
            self.job(*waiter)
                .map_or(false, |job| job.unit.unit_id() != cancelled_unit)
        });

        let Some(position) = position else {
            self.wait_lists.insert(fingerprint, waiters);
            return;
        };

        let promoted = waiters.remove(position);
        if !waiters.is_empty() {
            self.wait_lists.insert(fingerprint, waiters);
        }

        self.in_flight.insert(fingerprint, promoted);
        let priority = self.job(promoted).map_or(Priority::Normal, |job| job.priority);
        self.enqueue(promoted, priority);
        log::debug!(
            "Promoted wait-listed job {:?} after the in-flight duplicate was cancelled",
            promoted
        );
    }
}

/// The registry of every job that has been prepared but not finished. One reader/writer lock
/// guards the queues and indices. Counters that are polled often are atomics.
pub struct JobCollection {
    inner: RwLock<JobCollectionInner>,
    cache: JobCache,
    num_outstanding_jobs: AtomicUsize,
    next_job_id: AtomicU64,
}

impl JobCollection {
    pub fn new(cache: JobCache) -> Self {
        JobCollection {
            inner: RwLock::new(JobCollectionInner::new()),
            cache,
            num_outstanding_jobs: AtomicUsize::new(0),
            next_job_id: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &JobCache {
        &self.cache
    }

    fn allocate_job_id(&self) -> JobId {
        JobId(self.next_job_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the unit record, creating it if this is the first time the unit is referenced
    pub fn find_or_add_unit(
        &self,
        unit_id: UnitId,
    ) -> Arc<PendingCompileResults> {
        self.inner.write().unwrap().find_or_add_unit(unit_id)
    }

    pub fn unit(
        &self,
        unit_id: UnitId,
    ) -> Option<Arc<PendingCompileResults>> {
        self.inner.read().unwrap().units.get(&unit_id).cloned()
    }

    pub fn has_unit(
        &self,
        unit_id: UnitId,
    ) -> bool {
        self.inner.read().unwrap().units.contains_key(&unit_id)
    }

    pub fn pending_units(&self) -> Vec<Arc<PendingCompileResults>> {
        self.inner.read().unwrap().units.values().cloned().collect()
    }

    /// Allocates a job. Returns None if a job with the same key is already live for this unit, in
    /// which case the caller should not submit a second one.
    pub fn prepare_job(
        &self,
        unit_id: UnitId,
        key: JobKey,
        priority: Priority,
        inputs: Arc<JobInputs>,
    ) -> Option<JobHandle> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.pending_keys.get(&(unit_id, key)) {
            log::debug!(
                "Job {:?} for unit {:?} is already live as {:?}",
                key,
                unit_id,
                existing
            );
            return None;
        }

        let unit = inner.find_or_add_unit(unit_id);
        unit.add_prepared();

        let job_type = inputs.input().job_type();
        let handle = inner.arena_mut(job_type).allocate(Job {
            job_id: self.allocate_job_id(),
            unit,
            key,
            priority,
            inputs,
            state: JobState::Prepared,
            fingerprint: None,
            attempt_group: None,
            queued_at: Instant::now(),
        });
        inner.pending_keys.insert((unit_id, key), handle);
        Some(handle)
    }

    /// Moves prepared jobs into the system. Each job is finished straight from the cache, parked
    /// behind an identical in-flight job, or queued at its priority.
    pub fn submit_jobs(
        &self,
        handles: &[JobHandle],
    ) {
        profiling::scope!("JobCollection::submit_jobs");
        if handles.is_empty() {
            return;
        }

        let caching_enabled = self.cache.is_enabled();
        if caching_enabled {
            // Hashing is the expensive part of submission, keep it out of the write lock
            let inputs: Vec<Arc<JobInputs>> = {
                let inner = self.inner.read().unwrap();
                handles
                    .iter()
                    .filter_map(|handle| inner.job(*handle).map(|job| job.inputs.clone()))
                    .collect()
            };

            profiling::scope!("compute fingerprints");
            inputs.par_iter().for_each(|inputs| {
                inputs.fingerprint();
            });
        }

        let mut inner = self.inner.write().unwrap();
        for &handle in handles {
            let (unit, priority, inputs) = {
                let job = inner
                    .job(handle)
                    .unwrap_or_else(|| panic!("Submitting job {:?} which is not owned by the job collection", handle));
                assert!(
                    job.state == JobState::Prepared,
                    "Job {:?} was submitted twice",
                    handle
                );
                (job.unit.clone(), job.priority, job.inputs.clone())
            };

            unit.remove_prepared();
            unit.add_outstanding(1);
            self.num_outstanding_jobs.fetch_add(1, Ordering::AcqRel);

            if !caching_enabled {
                inner.enqueue(handle, priority);
                continue;
            }

            let fingerprint = inputs.fingerprint();
            if let Some(cached) = self.cache.find(fingerprint) {
                match bincode::deserialize::<JobOutput>(&cached) {
                    Ok(output) => {
                        let job = inner.take_job(handle);
                        log::trace!("Cache hit for {}", job.inputs.input().debug_name());
                        self.finalize(job, output, OutputDigest::of_bytes(&cached), true, 1);
                        continue;
                    }
                    Err(e) => {
                        log::warn!(
                            "Cached output for {:?} could not be read, compiling it again: {}",
                            fingerprint,
                            e
                        );
                    }
                }
            }

            if let Some(job) = inner.job_mut(handle) {
                job.fingerprint = Some(fingerprint);
            }

            if inner.in_flight.contains_key(&fingerprint) {
                if let Some(job) = inner.job_mut(handle) {
                    job.state = JobState::WaitListed { fingerprint };
                }
                inner
                    .wait_lists
                    .entry(fingerprint)
                    .or_default()
                    .push(handle);
                continue;
            }

            inner.in_flight.insert(fingerprint, handle);
            inner.enqueue(handle, priority);
        }
    }

    /// Moves a queued job to another priority tier. A job already dispatched to a distributed
    /// channel that is promoted to the highest priority is cloned so a faster channel can race it.
    /// Returns true if anything changed.
    pub fn set_priority(
        &self,
        handle: JobHandle,
        priority: Priority,
    ) -> bool {
        let mut inner = self.inner.write().unwrap();
        self.set_priority_locked(&mut inner, handle, priority)
    }

    fn set_priority_locked(
        &self,
        inner: &mut JobCollectionInner,
        handle: JobHandle,
        new_priority: Priority,
    ) -> bool {
        let Some(job) = inner.job_mut(handle) else {
            // Already finished
            return false;
        };

        match job.state {
            JobState::Prepared => {
                let changed = job.priority != new_priority;
                job.priority = new_priority;
                changed
            }
            JobState::Pending { priority, .. } => {
                if priority == new_priority {
                    return false;
                }

                // The old queue entry goes stale and is skipped when it reaches the front
                inner.pending_counts[priority.index()] -= 1;
                inner.enqueue(handle, new_priority);
                inner.compact_queue_if_stale(priority);
                true
            }
            JobState::WaitListed { fingerprint } => {
                job.priority = new_priority;
                match inner.in_flight.get(&fingerprint).copied() {
                    Some(owner) => self.set_priority_locked(inner, owner, new_priority),
                    None => false,
                }
            }
            JobState::Dispatched { channel } => {
                if new_priority != Priority::highest()
                    || channel != ChannelKind::Distributed
                    || job.attempt_group.is_some()
                {
                    return false;
                }

                job.attempt_group = Some(handle);
                let clone = Job {
                    job_id: self.allocate_job_id(),
                    unit: job.unit.clone(),
                    key: job.key,
                    priority: new_priority,
                    inputs: job.inputs.clone(),
                    state: JobState::Prepared,
                    fingerprint: job.fingerprint,
                    attempt_group: Some(handle),
                    queued_at: Instant::now(),
                };

                log::debug!(
                    "Racing {} already dispatched to a distributed channel with a clone at {:?}",
                    clone.inputs.input().debug_name(),
                    new_priority
                );

                clone.unit.add_outstanding(1);
                self.num_outstanding_jobs.fetch_add(1, Ordering::AcqRel);
                let clone_handle = inner.arena_mut(handle.job_type).allocate(clone);
                inner.enqueue(clone_handle, new_priority);
                inner
                    .speculative
                    .insert(handle, vec![handle, clone_handle]);
                true
            }
            JobState::Superseded { .. } => false,
        }
    }

    /// Dequeues up to `max_batch` jobs of exactly `priority` for a channel. Returns nothing if
    /// fewer than `min_batch` are waiting.
    pub fn get_pending_jobs(
        &self,
        channel: ChannelKind,
        priority: Priority,
        min_batch: usize,
        max_batch: usize,
    ) -> Vec<DispatchedJob> {
        let min_batch = min_batch.max(1);
        if self.pending_count_for(priority) < min_batch {
            return Vec::default();
        }

        profiling::scope!("JobCollection::get_pending_jobs");
        let mut inner = self.inner.write().unwrap();
        if inner.pending_counts[priority.index()] < min_batch {
            return Vec::default();
        }

        let mut batch = Vec::with_capacity(max_batch.min(inner.pending_counts[priority.index()]));
        while batch.len() < max_batch {
            let Some((handle, ticket)) = inner.queues[priority.index()].pop_front() else {
                break;
            };

            if !inner.is_live_queue_entry(handle, priority, ticket) {
                continue;
            }

            inner.pending_counts[priority.index()] -= 1;
            if let Some(job) = inner.job_mut(handle) {
                job.state = JobState::Dispatched { channel };
                batch.push(DispatchedJob {
                    handle,
                    job_id: job.job_id,
                    unit_id: job.unit.unit_id(),
                    priority,
                    inputs: job.inputs.clone(),
                });
            }
        }

        batch
    }

    /// When the oldest job still queued at `priority` was queued
    pub fn oldest_pending(
        &self,
        priority: Priority,
    ) -> Option<Instant> {
        let inner = self.inner.read().unwrap();
        inner.queues[priority.index()]
            .iter()
            .find(|(handle, ticket)| inner.is_live_queue_entry(*handle, priority, *ticket))
            .and_then(|(handle, _)| inner.job(*handle).map(|job| job.queued_at))
    }

    pub fn process_finished_job(
        &self,
        handle: JobHandle,
        output: JobOutput,
    ) {
        self.process_finished_jobs(vec![(handle, output)]);
    }

    /// Hands channel results back. Outputs are cached and copied to any wait-listed duplicates.
    pub fn process_finished_jobs(
        &self,
        results: Vec<(JobHandle, JobOutput)>,
    ) {
        profiling::scope!("JobCollection::process_finished_jobs");
        let results: Vec<_> = results
            .into_iter()
            .map(|(handle, output)| {
                let bytes = match bincode::serialize(&output) {
                    Ok(bytes) => Some(Arc::new(bytes)),
                    Err(e) => {
                        log::error!("Failed to serialize output of job {:?}: {}", handle, e);
                        None
                    }
                };
                (handle, output, bytes)
            })
            .collect();

        let mut inner = self.inner.write().unwrap();
        for (handle, output, bytes) in results {
            self.finish_job_locked(&mut inner, handle, output, bytes);
        }
    }

    fn finish_job_locked(
        &self,
        inner: &mut JobCollectionInner,
        handle: JobHandle,
        output: JobOutput,
        bytes: Option<Arc<Vec<u8>>>,
    ) {
        let state = inner
            .job(handle)
            .map(|job| job.state)
            .unwrap_or_else(|| panic!("Finished job {:?} is not owned by the job collection", handle));
        let digest = bytes
            .as_ref()
            .map(|bytes| OutputDigest::of_bytes(bytes))
            .unwrap_or(OutputDigest(0));

        match state {
            JobState::Dispatched { .. } => {}
            JobState::Superseded { .. } => {
                // Lost the race. The unit was already satisfied but the output still warms the cache.
                let job = inner.take_job(handle);
                if let (true, Some(bytes)) = (output.succeeded(), bytes) {
                    self.cache.add(job.inputs.fingerprint(), bytes, 0);
                }
                log::trace!(
                    "Discarding superseded result for {}",
                    job.inputs.input().debug_name()
                );
                return;
            }
            state => panic!("Job {:?} finished while {:?}", handle, state),
        }

        let job = inner.take_job(handle);
        let mut closed_attempts = 1;

        if let Some(group) = job.attempt_group {
            let attempts = inner.speculative.remove(&group).unwrap_or_default();
            for attempt in attempts.into_iter().filter(|attempt| *attempt != handle) {
                let Some(attempt_job) = inner.job_mut(attempt) else {
                    continue;
                };

                closed_attempts += 1;
                attempt_job.attempt_group = None;
                match attempt_job.state {
                    JobState::Dispatched { channel } => {
                        attempt_job.state = JobState::Superseded { channel };
                        let (unit_id, key) = (attempt_job.unit.unit_id(), attempt_job.key);
                        inner.forget_key(attempt, unit_id, key);
                    }
                    _ => {
                        inner.take_job(attempt);
                    }
                }
            }
        }

        let mut waiters = Vec::default();
        if let Some(fingerprint) = job.fingerprint {
            let owner = inner.in_flight.get(&fingerprint).copied();
            if owner == Some(handle) || (owner.is_some() && owner == job.attempt_group) {
                inner.in_flight.remove(&fingerprint);
                waiters = inner.wait_lists.remove(&fingerprint).unwrap_or_default();

                if let (true, Some(bytes)) = (output.succeeded(), bytes) {
                    self.cache.add(fingerprint, bytes, waiters.len() as u64);
                }
            }
        }

        for waiter in waiters {
            let waiter = inner.take_job(waiter);
            self.finalize(waiter, output.clone(), digest, false, 1);
        }

        self.finalize(job, output, digest, false, closed_attempts);
    }

    fn finalize(
        &self,
        job: Job,
        output: JobOutput,
        output_digest: OutputDigest,
        was_cache_hit: bool,
        closed_attempts: usize,
    ) {
        let unit = job.unit;
        unit.record_finished(Arc::new(FinishedJob {
            job_id: job.job_id,
            unit_id: unit.unit_id(),
            key: job.key,
            priority: job.priority,
            inputs: job.inputs,
            output,
            output_digest,
            was_cache_hit,
        }));
        unit.close_outstanding(closed_attempts);
        self.num_outstanding_jobs
            .fetch_sub(closed_attempts, Ordering::AcqRel);
    }

    /// Cancels every job of the unit that no channel has picked up yet. Jobs already dispatched
    /// are left alone. Returns the number of submitted jobs removed.
    pub fn remove_all_pending_with_unit(
        &self,
        unit_id: UnitId,
    ) -> usize {
        let mut inner = self.inner.write().unwrap();
        self.remove_all_pending_with_unit_locked(&mut inner, unit_id)
    }

    /// Cancels the unit and retires its record. Queued jobs are removed. Jobs already dispatched
    /// still finish into the retired record, which discards them and is never taken as completed.
    /// A later submit under the same id starts a fresh record. Returns the number of queued jobs
    /// removed.
    pub fn cancel_unit(
        &self,
        unit_id: UnitId,
    ) -> usize {
        let mut inner = self.inner.write().unwrap();
        let Some(unit) = inner.units.remove(&unit_id) else {
            return 0;
        };

        unit.mark_skip_processing();
        let removed = self.remove_all_pending_with_unit_locked(&mut inner, unit_id);
        // Dispatched jobs still hold their keys, which would suppress a resubmit
        inner
            .pending_keys
            .retain(|(key_unit_id, _), _| *key_unit_id != unit_id);
        removed
    }

    fn remove_all_pending_with_unit_locked(
        &self,
        inner: &mut JobCollectionInner,
        unit_id: UnitId,
    ) -> usize {
        let removable: Vec<(JobHandle, JobState)> = inner
            .jobs()
            .filter(|(_, job)| {
                job.unit.unit_id() == unit_id
                    && matches!(
                        job.state,
                        JobState::Prepared | JobState::Pending { .. } | JobState::WaitListed { .. }
                    )
            })
            .map(|(handle, job)| (handle, job.state))
            .collect();

        let mut removed = 0;
        for (handle, state) in removable {
            let job = inner.take_job(handle);
            match state {
                JobState::Prepared => {
                    job.unit.remove_prepared();
                    continue;
                }
                JobState::Pending { .. } => {
                    if let Some(fingerprint) = job.fingerprint {
                        if inner.in_flight.get(&fingerprint) == Some(&handle) {
                            inner.in_flight.remove(&fingerprint);
                            inner.promote_waiter(fingerprint, unit_id);
                        }
                    }
                    inner.leave_attempt_group(handle, job.attempt_group);
                }
                JobState::WaitListed { fingerprint } => {
                    if let Some(waiters) = inner.wait_lists.get_mut(&fingerprint) {
                        waiters.retain(|waiter| *waiter != handle);
                        if waiters.is_empty() {
                            inner.wait_lists.remove(&fingerprint);
                        }
                    }
                }
                JobState::Dispatched { .. } | JobState::Superseded { .. } => unreachable!(),
            }

            job.unit.close_outstanding(1);
            self.num_outstanding_jobs.fetch_sub(1, Ordering::AcqRel);
            removed += 1;
        }

        removed
    }

    /// Removes and returns units with nothing left in flight, optionally limited to `unit_ids`.
    /// Sorted by unit id.
    pub fn take_completed_units(
        &self,
        unit_ids: Option<&[UnitId]>,
    ) -> Vec<Arc<PendingCompileResults>> {
        let mut inner = self.inner.write().unwrap();
        let mut completed: Vec<UnitId> = inner
            .units
            .iter()
            .filter(|(unit_id, unit)| {
                unit_ids.map_or(true, |unit_ids| unit_ids.contains(*unit_id)) && unit.is_complete()
            })
            .map(|(unit_id, _)| *unit_id)
            .collect();
        completed.sort();

        completed
            .into_iter()
            .filter_map(|unit_id| inner.units.remove(&unit_id))
            .collect()
    }

    /// Jobs queued and waiting for a channel
    pub fn pending_count(&self) -> usize {
        self.inner.read().unwrap().pending_counts.iter().sum()
    }

    pub fn pending_count_for(
        &self,
        priority: Priority,
    ) -> usize {
        self.inner.read().unwrap().pending_counts[priority.index()]
    }

    /// Jobs submitted and not yet finished, across all units
    pub fn outstanding_count(&self) -> usize {
        self.num_outstanding_jobs.load(Ordering::Acquire)
    }

    pub fn wait_listed_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .wait_lists
            .values()
            .map(|waiters| waiters.len())
            .sum()
    }

    /// Every job still held by the collection, in any state
    pub fn live_job_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.singles.live_count + inner.pipelines.live_count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::{compile_input, ok_output, single};
    use crate::CompileTarget;

    fn collection(caching: bool) -> JobCollection {
        JobCollection::new(JobCache::new(caching, u64::MAX))
    }

    fn submit(
        collection: &JobCollection,
        unit: u32,
        priority: Priority,
        source: &str,
    ) -> JobHandle {
        let handle = collection
            .prepare_job(UnitId(unit), JobKey::new_random(), priority, single(source))
            .unwrap();
        collection.submit_jobs(&[handle]);
        handle
    }

    fn names(batch: &[DispatchedJob]) -> Vec<String> {
        batch.iter().map(|job| job.debug_name().to_string()).collect()
    }

    #[test]
    fn dequeues_by_priority_then_submission_order() {
        let collection = collection(false);
        submit(&collection, 1, Priority::Low, "a");
        submit(&collection, 1, Priority::High, "b");
        submit(&collection, 1, Priority::Low, "c");
        assert_eq!(collection.pending_count(), 3);

        let high = collection.get_pending_jobs(ChannelKind::Local, Priority::High, 1, 10);
        let low = collection.get_pending_jobs(ChannelKind::Local, Priority::Low, 1, 10);
        assert_eq!(names(&high), vec!["b"]);
        assert_eq!(names(&low), vec!["a", "c"]);
        assert_eq!(collection.pending_count(), 0);
        assert_eq!(collection.outstanding_count(), 3);
    }

    #[test]
    fn min_batch_holds_back_small_batches() {
        let collection = collection(false);
        submit(&collection, 1, Priority::Normal, "a");
        submit(&collection, 1, Priority::Normal, "b");

        assert!(collection
            .get_pending_jobs(ChannelKind::Distributed, Priority::Normal, 3, 8)
            .is_empty());
        assert_eq!(collection.pending_count(), 2);

        submit(&collection, 1, Priority::Normal, "c");
        let batch = collection.get_pending_jobs(ChannelKind::Distributed, Priority::Normal, 3, 2);
        assert_eq!(names(&batch), vec!["a", "b"]);
        assert_eq!(collection.pending_count(), 1);
    }

    #[test]
    fn duplicate_key_in_unit_is_suppressed() {
        let collection = collection(true);
        let key = JobKey::new_random();
        assert!(collection
            .prepare_job(UnitId(1), key, Priority::Normal, single("a"))
            .is_some());
        assert!(collection
            .prepare_job(UnitId(1), key, Priority::Normal, single("a"))
            .is_none());
        assert!(collection
            .prepare_job(UnitId(2), key, Priority::Normal, single("a"))
            .is_some());
    }

    #[test]
    fn identical_inputs_wait_for_one_compile() {
        let collection = collection(true);
        let first = submit(&collection, 1, Priority::Normal, "same");
        submit(&collection, 2, Priority::Normal, "same");
        submit(&collection, 3, Priority::Normal, "same");

        assert_eq!(collection.pending_count(), 1);
        assert_eq!(collection.wait_listed_count(), 2);
        assert_eq!(collection.outstanding_count(), 3);

        let batch = collection.get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].handle, first);
        collection.process_finished_job(first, ok_output("same"));

        assert_eq!(collection.outstanding_count(), 0);
        assert_eq!(collection.wait_listed_count(), 0);
        assert_eq!(collection.live_job_count(), 0);
        for unit in collection.take_completed_units(None) {
            let unit = unit.take_compiled_unit();
            assert_eq!(unit.jobs.len(), 1);
            assert!(unit.all_succeeded);
            assert_eq!(unit.jobs[0].output, ok_output("same"));
        }

        // The cache now answers without queueing anything
        submit(&collection, 4, Priority::Normal, "same");
        assert_eq!(collection.pending_count(), 0);
        assert_eq!(collection.outstanding_count(), 0);
        let unit = collection.take_completed_units(Some(&[UnitId(4)]));
        let unit = unit[0].take_compiled_unit();
        assert!(unit.jobs[0].was_cache_hit);
        assert_eq!(unit.jobs[0].output, ok_output("same"));
    }

    #[test]
    fn failed_outputs_are_not_cached() {
        let collection = collection(true);
        let handle = submit(&collection, 1, Priority::Normal, "bad");
        collection.get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 1);
        collection.process_finished_job(
            handle,
            JobOutput::Single(crate::CompileOutput::failed("syntax error")),
        );

        submit(&collection, 2, Priority::Normal, "bad");
        assert_eq!(collection.pending_count(), 1);
        assert_eq!(collection.cache().stats().num_outputs, 0);
    }

    #[test]
    fn set_priority_relinks_queued_job() {
        let collection = collection(false);
        submit(&collection, 1, Priority::Low, "a");
        let b = submit(&collection, 1, Priority::Low, "b");

        assert!(collection.set_priority(b, Priority::High));
        assert!(!collection.set_priority(b, Priority::High));
        assert_eq!(collection.pending_count_for(Priority::Low), 1);
        assert_eq!(collection.pending_count_for(Priority::High), 1);

        let high = collection.get_pending_jobs(ChannelKind::Local, Priority::High, 1, 10);
        assert_eq!(names(&high), vec!["b"]);
        // The stale Low entry for b is skipped
        let low = collection.get_pending_jobs(ChannelKind::Local, Priority::Low, 1, 10);
        assert_eq!(names(&low), vec!["a"]);
    }

    #[test]
    fn relinking_back_and_forth_keeps_queues_bounded() {
        let collection = collection(false);
        let kept = submit(&collection, 1, Priority::Low, "kept");
        let bounced = submit(&collection, 1, Priority::Normal, "bounced");
        for round in 0..500 {
            let priority = if round % 2 == 0 { Priority::High } else { Priority::Normal };
            assert!(collection.set_priority(bounced, priority));
        }

        {
            let inner = collection.inner.read().unwrap();
            for priority in [Priority::Normal, Priority::High] {
                assert!(inner.queues[priority.index()].len() <= MIN_QUEUE_COMPACTION_LEN);
            }
        }

        // Ended on Normal after an odd number of rounds
        assert_eq!(collection.pending_count_for(Priority::High), 0);
        assert!(collection
            .get_pending_jobs(ChannelKind::Local, Priority::High, 1, 10)
            .is_empty());
        let normal = collection.get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 10);
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].handle, bounced);
        let low = collection.get_pending_jobs(ChannelKind::Local, Priority::Low, 1, 10);
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].handle, kept);
    }

    #[test]
    fn removing_many_queued_jobs_compacts_their_tier() {
        let collection = collection(false);
        for index in 0..200 {
            submit(&collection, 2, Priority::Low, &format!("cancelled{}", index));
        }
        let kept = submit(&collection, 1, Priority::Low, "kept");

        assert_eq!(collection.remove_all_pending_with_unit(UnitId(2)), 200);
        let low_queue_len = collection.inner.read().unwrap().queues[Priority::Low.index()].len();
        assert!(low_queue_len <= MIN_QUEUE_COMPACTION_LEN);

        let low = collection.get_pending_jobs(ChannelKind::Local, Priority::Low, 1, 10);
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].handle, kept);
    }

    #[test]
    fn promoting_a_distributed_job_races_a_clone() {
        let collection = collection(true);
        let original = submit(&collection, 1, Priority::Normal, "slow");
        let dispatched =
            collection.get_pending_jobs(ChannelKind::Distributed, Priority::Normal, 1, 1);
        assert_eq!(dispatched.len(), 1);

        // Only a promotion to the top tier of a distributed job clones
        assert!(!collection.set_priority(original, Priority::High));
        assert!(collection.set_priority(original, Priority::ForceLocal));
        assert!(!collection.set_priority(original, Priority::ForceLocal));
        assert_eq!(collection.outstanding_count(), 2);

        let clone = collection.get_pending_jobs(ChannelKind::Local, Priority::ForceLocal, 1, 1);
        assert_eq!(clone.len(), 1);
        assert_ne!(clone[0].handle, original);

        // The clone wins. Net outstanding drops by two and the unit gets one result.
        collection.process_finished_job(clone[0].handle, ok_output("slow"));
        assert_eq!(collection.outstanding_count(), 0);
        let units = collection.take_completed_units(None);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].take_compiled_unit().jobs.len(), 1);

        // The loser still finishes later, without touching the unit
        collection.process_finished_job(original, ok_output("slow"));
        assert_eq!(collection.outstanding_count(), 0);
        assert_eq!(collection.live_job_count(), 0);
    }

    #[test]
    fn original_winning_the_race_drops_the_queued_clone() {
        let collection = collection(false);
        let original = submit(&collection, 1, Priority::Low, "slow");
        collection.get_pending_jobs(ChannelKind::Distributed, Priority::Low, 1, 1);
        assert!(collection.set_priority(original, Priority::ForceLocal));
        assert_eq!(collection.pending_count(), 1);

        collection.process_finished_job(original, ok_output("slow"));
        assert_eq!(collection.pending_count(), 0);
        assert_eq!(collection.outstanding_count(), 0);
        assert_eq!(collection.live_job_count(), 0);
        assert!(collection
            .get_pending_jobs(ChannelKind::Local, Priority::ForceLocal, 1, 1)
            .is_empty());
    }

    #[test]
    fn cancel_removes_only_undispatched_jobs() {
        let collection = collection(false);
        for source in ["a", "b", "c", "d", "e"] {
            submit(&collection, 7, Priority::Normal, source);
        }
        let dispatched = collection.get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 2);
        assert_eq!(dispatched.len(), 2);

        assert_eq!(collection.remove_all_pending_with_unit(UnitId(7)), 3);
        assert_eq!(collection.pending_count(), 0);
        assert_eq!(collection.outstanding_count(), 2);

        for job in dispatched {
            collection.process_finished_job(job.handle, ok_output(job.debug_name()));
        }
        assert_eq!(collection.outstanding_count(), 0);
        assert_eq!(collection.take_completed_units(None).len(), 1);
    }

    #[test]
    fn cancelling_an_in_flight_owner_promotes_another_units_duplicate() {
        let collection = collection(true);
        submit(&collection, 1, Priority::Normal, "shared");
        submit(&collection, 2, Priority::High, "shared");
        assert_eq!(collection.wait_listed_count(), 1);

        assert_eq!(collection.remove_all_pending_with_unit(UnitId(1)), 1);
        assert_eq!(collection.wait_listed_count(), 0);
        assert_eq!(collection.pending_count_for(Priority::High), 1);

        let batch = collection.get_pending_jobs(ChannelKind::Local, Priority::High, 1, 1);
        assert_eq!(batch[0].unit_id, UnitId(2));
        collection.process_finished_job(batch[0].handle, ok_output("shared"));
        assert_eq!(collection.outstanding_count(), 0);
    }

    #[test]
    fn prepared_jobs_hold_the_unit_open() {
        let collection = collection(false);
        let handle = collection
            .prepare_job(UnitId(3), JobKey::new_random(), Priority::Normal, single("a"))
            .unwrap();
        assert!(collection.take_completed_units(None).is_empty());

        collection.submit_jobs(&[handle]);
        let batch = collection.get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 1);
        collection.process_finished_job(batch[0].handle, ok_output("a"));
        assert_eq!(collection.take_completed_units(None).len(), 1);
    }

    #[test]
    fn arena_slots_are_reused_with_new_generations() {
        let collection = collection(false);
        let first = submit(&collection, 1, Priority::Normal, "a");
        collection.get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 1);
        collection.process_finished_job(first, ok_output("a"));

        let second = submit(&collection, 1, Priority::Normal, "b");
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        // A stale handle is a no-op for priority changes
        assert!(!collection.set_priority(first, Priority::High));
    }

    #[test]
    fn pipelines_live_in_their_own_arena() {
        let collection = collection(true);
        let inputs = JobInputs::new(
            crate::JobInput::pipeline(vec![compile_input(2, "vs"), compile_input(2, "ps")]).unwrap(),
        );
        assert_eq!(inputs.input().target(), CompileTarget(2));
        let handle = collection
            .prepare_job(UnitId(1), JobKey::new_random(), Priority::Normal, inputs)
            .unwrap();
        assert_eq!(handle.job_type, JobType::Pipeline);
        collection.submit_jobs(&[handle]);
        assert_eq!(collection.pending_count(), 1);
    }

    #[test]
    #[should_panic]
    fn finishing_an_unknown_job_panics() {
        let collection = collection(false);
        let handle = submit(&collection, 1, Priority::Normal, "a");
        collection.get_pending_jobs(ChannelKind::Local, Priority::Normal, 1, 1);
        collection.process_finished_job(handle, ok_output("a"));
        collection.process_finished_job(handle, ok_output("a"));
    }
}
