use super::{Transport, TransportHandle, WorkerFiles};
use crate::SchedulerResult;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const WORKER_INPUT_FILE_NAME: &str = "worker_input.kjb";
pub const WORKER_OUTPUT_FILE_NAME: &str = "worker_output.kjb";

// Virus scanners and indexers hold files open for short periods
const WRITE_RETRY_COUNT: u32 = 2000;
const DELETE_RETRY_COUNT: u32 = 200;
const RETRY_DELAY: Duration = Duration::from_millis(10);

fn retry_io<T>(
    description: &str,
    path: &Path,
    attempts: u32,
    mut f: impl FnMut() -> std::io::Result<T>,
) -> SchedulerResult<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    log::error!(
                        "Giving up trying to {} {:?} after {} attempts: {}",
                        description,
                        path,
                        attempt,
                        e
                    );
                    return Err(e.into());
                }

                if attempt == 1 {
                    log::warn!("Could not {} {:?}, retrying: {}", description, path, e);
                }
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }
}

/// File based transport. Each worker slot owns a directory. A batch is written to a temporary
/// name and renamed into place, so a worker never sees a partial input, and workers publish their
/// output the same way.
pub struct FileTransport {
    root: PathBuf,
    next_batch_id: u64,
}

impl FileTransport {
    /// Slot directories live under `working_directory/<pid>`, anything left there by a previous
    /// run is removed.
    pub fn new(working_directory: &Path) -> SchedulerResult<Self> {
        let root = working_directory.join(std::process::id().to_string());
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;
        log::debug!("Worker transport files are in {:?}", root);

        Ok(FileTransport {
            root,
            next_batch_id: 0,
        })
    }

    fn slot_directory(
        &self,
        slot_index: usize,
    ) -> PathBuf {
        self.root.join(slot_index.to_string())
    }

    fn input_path(
        &self,
        slot_index: usize,
    ) -> PathBuf {
        self.slot_directory(slot_index).join(WORKER_INPUT_FILE_NAME)
    }

    fn output_path(
        &self,
        slot_index: usize,
    ) -> PathBuf {
        self.slot_directory(slot_index)
            .join(WORKER_OUTPUT_FILE_NAME)
    }
}

impl Transport for FileTransport {
    fn write(
        &mut self,
        slot_index: usize,
        batch: &[u8],
    ) -> SchedulerResult<TransportHandle> {
        profiling::scope!("FileTransport::write");
        let directory = self.slot_directory(slot_index);
        std::fs::create_dir_all(&directory)?;

        let temp_path = directory.join(format!("{}.tmp", uuid::Uuid::new_v4()));
        retry_io("write", &temp_path, WRITE_RETRY_COUNT, || {
            std::fs::write(&temp_path, batch)
        })?;

        let input_path = self.input_path(slot_index);
        retry_io("publish", &input_path, WRITE_RETRY_COUNT, || {
            std::fs::rename(&temp_path, &input_path)
        })?;

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        Ok(TransportHandle {
            slot_index,
            batch_id,
        })
    }

    fn try_read(
        &mut self,
        handle: &TransportHandle,
    ) -> SchedulerResult<Option<Vec<u8>>> {
        match std::fs::read(self.output_path(handle.slot_index)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn has_output(
        &self,
        handle: &TransportHandle,
    ) -> bool {
        self.output_path(handle.slot_index).exists()
    }

    fn has_pending_input(
        &self,
        handle: &TransportHandle,
    ) -> bool {
        self.input_path(handle.slot_index).exists()
    }

    fn release(
        &mut self,
        handle: &TransportHandle,
    ) -> SchedulerResult<()> {
        for path in [
            self.output_path(handle.slot_index),
            self.input_path(handle.slot_index),
        ] {
            retry_io("delete", &path, DELETE_RETRY_COUNT, || {
                match std::fs::remove_file(&path) {
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    result => result,
                }
            })?;
        }

        Ok(())
    }

    fn worker_files(
        &self,
        slot_index: usize,
    ) -> WorkerFiles {
        WorkerFiles {
            working_directory: self.slot_directory(slot_index),
            input_file_name: WORKER_INPUT_FILE_NAME.to_string(),
            output_file_name: WORKER_OUTPUT_FILE_NAME.to_string(),
        }
    }
}

impl Drop for FileTransport {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            log::debug!("Could not clean up {:?}: {}", self.root, e);
        }
    }
}

/// Publishes `bytes` at `path` by writing a sibling temporary file and renaming it over `path`
pub fn write_file_atomically(
    path: &Path,
    bytes: &[u8],
) -> SchedulerResult<()> {
    let directory = path
        .parent()
        .ok_or_else(|| format!("{:?} has no parent directory", path))?;
    let temp_path = directory.join(format!("{}.tmp", uuid::Uuid::new_v4()));
    retry_io("write", &temp_path, WRITE_RETRY_COUNT, || {
        std::fs::write(&temp_path, bytes)
    })?;
    retry_io("publish", path, WRITE_RETRY_COUNT, || {
        std::fs::rename(&temp_path, path)
    })
}
