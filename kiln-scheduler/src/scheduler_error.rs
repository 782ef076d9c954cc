use crate::{CompileTarget, UnitId};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum SchedulerError {
    StringError(String),
    IoError(Arc<std::io::Error>),
    BincodeError(Arc<bincode::Error>),
    JsonError(Arc<serde_json::Error>),
    TransportVersionMismatch { expected: u32, found: u32 },
    TransportCorrupt(String),
    JobCountMismatch { expected: usize, found: usize },
    WorkerCrashed { jobs_processed: usize, message: String },
    BackendNotFound(CompileTarget),
    WorkerLaunchFailed(String),
    ChannelTerminated { channel: String, message: String },
    UnitHung { unit_id: UnitId, elapsed: Duration },
}

impl SchedulerError {
    /// Errors that mean a worker channel can no longer be trusted. The channel abandons its workers
    /// and falls back to compiling in-process rather than failing the caller.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::TransportVersionMismatch { .. }
                | SchedulerError::TransportCorrupt(_)
                | SchedulerError::JobCountMismatch { .. }
                | SchedulerError::WorkerCrashed { .. }
                | SchedulerError::WorkerLaunchFailed(_)
        )
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            SchedulerError::StringError(_) => None,
            SchedulerError::IoError(ref e) => Some(&**e),
            SchedulerError::BincodeError(ref e) => Some(&**e),
            SchedulerError::JsonError(ref e) => Some(&**e),
            SchedulerError::TransportVersionMismatch { .. } => None,
            SchedulerError::TransportCorrupt(_) => None,
            SchedulerError::JobCountMismatch { .. } => None,
            SchedulerError::WorkerCrashed { .. } => None,
            SchedulerError::BackendNotFound(_) => None,
            SchedulerError::WorkerLaunchFailed(_) => None,
            SchedulerError::ChannelTerminated { .. } => None,
            SchedulerError::UnitHung { .. } => None,
        }
    }
}

impl core::fmt::Display for SchedulerError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            SchedulerError::StringError(ref e) => e.fmt(fmt),
            SchedulerError::IoError(ref e) => e.fmt(fmt),
            SchedulerError::BincodeError(ref e) => e.fmt(fmt),
            SchedulerError::JsonError(ref e) => e.fmt(fmt),
            SchedulerError::TransportVersionMismatch { expected, found } => write!(
                fmt,
                "Worker transport version mismatch (expected {}, found {}), the worker binary is stale or incompatible",
                expected, found
            ),
            SchedulerError::TransportCorrupt(ref message) => {
                write!(fmt, "Worker transport data is corrupt: {}", message)
            }
            SchedulerError::JobCountMismatch { expected, found } => write!(
                fmt,
                "Worker returned {} job outputs but {} jobs were dispatched",
                found, expected
            ),
            SchedulerError::WorkerCrashed {
                jobs_processed,
                ref message,
            } => write!(
                fmt,
                "Worker crashed after processing {} jobs: {}",
                jobs_processed, message
            ),
            SchedulerError::BackendNotFound(target) => {
                write!(fmt, "No compiler backend is registered for {}", target)
            }
            SchedulerError::WorkerLaunchFailed(ref message) => {
                write!(fmt, "Failed to launch worker process: {}", message)
            }
            SchedulerError::ChannelTerminated {
                ref channel,
                ref message,
            } => write!(fmt, "Worker channel '{}' terminated: {}", channel, message),
            SchedulerError::UnitHung { unit_id, elapsed } => write!(
                fmt,
                "Compile unit {:?} has not finished after {:.1} seconds",
                unit_id,
                elapsed.as_secs_f32()
            ),
        }
    }
}

impl From<&str> for SchedulerError {
    fn from(str: &str) -> Self {
        SchedulerError::StringError(str.to_string())
    }
}

impl From<String> for SchedulerError {
    fn from(string: String) -> Self {
        SchedulerError::StringError(string)
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(error: std::io::Error) -> Self {
        SchedulerError::IoError(Arc::new(error))
    }
}

impl From<bincode::Error> for SchedulerError {
    fn from(error: bincode::Error) -> Self {
        SchedulerError::BincodeError(Arc::new(error))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        SchedulerError::JsonError(Arc::new(error))
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
