mod scheduler_error;
pub use scheduler_error::*;

mod job;
pub use job::*;

mod job_cache;
pub use job_cache::*;

mod pending_compile_results;
pub use pending_compile_results::*;

mod job_collection;
pub use job_collection::*;

mod backend;
pub use backend::*;

mod config;
pub use config::*;

mod context;
pub use context::*;

pub mod system;
pub mod transport;
pub mod process_launcher;
pub mod channel;

mod compiling_manager;
pub use compiling_manager::*;

pub use channel::{ChannelStatsSnapshot, WorkerChannel};
pub use process_launcher::{CommandLauncher, ProcessLauncher, WorkerProcess};

#[cfg(test)]
mod tests;
