use crate::transport::WorkerFiles;
use crate::{SchedulerError, SchedulerResult};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

pub trait WorkerProcess: Send {
    fn is_running(&mut self) -> bool;

    fn terminate(&mut self);
}

/// Starts worker processes for a channel's slots
pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        files: &WorkerFiles,
        slot_index: usize,
    ) -> SchedulerResult<Box<dyn WorkerProcess>>;
}

/// Launches a worker executable that understands the `kiln-worker` command line
pub struct CommandLauncher {
    executable: PathBuf,
    keep_alive: bool,
    idle_timeout: Duration,
}

impl CommandLauncher {
    pub fn new(executable: PathBuf) -> Self {
        CommandLauncher {
            executable,
            keep_alive: true,
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Keep-alive workers stay up between batches until they have been idle for `idle_timeout`
    pub fn with_keep_alive(
        mut self,
        keep_alive: bool,
        idle_timeout: Duration,
    ) -> Self {
        self.keep_alive = keep_alive;
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(
        &self,
        files: &WorkerFiles,
        slot_index: usize,
    ) -> SchedulerResult<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&self.executable);
        command
            .arg("--working-directory")
            .arg(&files.working_directory)
            .arg("--input-file")
            .arg(&files.input_file_name)
            .arg("--output-file")
            .arg(&files.output_file_name)
            .arg("--parent-pid")
            .arg(std::process::id().to_string())
            .arg("--idle-timeout-secs")
            .arg(self.idle_timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null());
        if self.keep_alive {
            command.arg("--keep-alive");
        }

        let child = command.spawn().map_err(|e| {
            SchedulerError::WorkerLaunchFailed(format!("{:?}: {}", self.executable, e))
        })?;

        log::debug!(
            "Launched worker process {} for slot {}",
            child.id(),
            slot_index
        );
        Ok(Box::new(ChildWorkerProcess { child }))
    }
}

struct ChildWorkerProcess {
    child: Child,
}

impl WorkerProcess for ChildWorkerProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        if self.is_running() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for ChildWorkerProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}
