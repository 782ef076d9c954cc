mod file_transport;
pub use file_transport::*;

pub mod wire;

use crate::SchedulerResult;
use std::path::PathBuf;

/// Identifies a batch that was handed to a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHandle {
    pub slot_index: usize,
    pub batch_id: u64,
}

/// Where a worker process for a slot finds its input and writes its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFiles {
    pub working_directory: PathBuf,
    pub input_file_name: String,
    pub output_file_name: String,
}

/// Moves encoded batches to workers and their output back. The default implementation uses
/// files in a per-slot directory, a networked transport can replace it without touching the
/// channel.
pub trait Transport: Send {
    fn write(
        &mut self,
        slot_index: usize,
        batch: &[u8],
    ) -> SchedulerResult<TransportHandle>;

    /// Returns the complete output once the worker has published it
    fn try_read(
        &mut self,
        handle: &TransportHandle,
    ) -> SchedulerResult<Option<Vec<u8>>>;

    /// True if output is waiting for the handle. Used to tell a worker that exited after finishing
    /// from one that crashed.
    fn has_output(
        &self,
        handle: &TransportHandle,
    ) -> bool;

    /// True while the batch is still waiting to be picked up by a worker
    fn has_pending_input(
        &self,
        handle: &TransportHandle,
    ) -> bool;

    /// Removes everything left for the handle so stale data is never read twice
    fn release(
        &mut self,
        handle: &TransportHandle,
    ) -> SchedulerResult<()>;

    fn worker_files(
        &self,
        slot_index: usize,
    ) -> WorkerFiles;
}
