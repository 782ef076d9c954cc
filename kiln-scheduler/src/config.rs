use crate::system;
use crate::{ChannelKind, Priority, PriorityRange, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOnError {
    /// Failed units are handed to the caller as-is (unattended runs)
    Disabled,
    /// Ask a `RetryPrompt` whether to resubmit
    Prompt,
    /// Always resubmit, up to `max_retries` times
    Always,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(default)]
pub struct ChannelConfigJson {
    pub name: String,
    pub kind: Option<ChannelKind>,
    pub min_priority: Option<Priority>,
    pub max_priority: Option<Priority>,
    pub min_batch_size: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub batch_hold_time_ms: Option<u64>,
    pub worker_slots: Option<usize>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfigJson {
    pub job_cache_enabled: Option<bool>,
    pub cache_memory_budget_mb: Option<u64>,
    pub cache_memory_budget_percent_of_ram: Option<u32>,
    pub worker_slots: Option<usize>,
    pub num_unused_worker_slots: Option<usize>,
    pub worker_slots_during_game: Option<usize>,
    pub hang_timeout_secs: Option<u64>,
    pub hang_is_fatal: Option<bool>,
    pub retry_on_error: Option<RetryOnError>,
    pub max_retries: Option<u32>,
    pub allow_asynchronous_compiling: Option<bool>,
    pub log_job_completion_times: Option<bool>,
    pub slow_batch_warning_secs: Option<u64>,
    pub process_async_time_budget_ms: Option<u64>,
    pub fallback_batches: Option<u32>,
    pub max_fallback_batches: Option<u32>,
    pub worker_executable: Option<String>,
    pub working_directory: Option<String>,
    pub channels: Option<Vec<ChannelConfigJson>>,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
    pub priority_range: PriorityRange,
    // A channel waits for at least this many jobs unless the oldest has been queued longer than
    // batch_hold_time
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub batch_hold_time: Duration,
    pub worker_slots: usize,
}

impl ChannelConfig {
    fn from_json(
        json: ChannelConfigJson,
        default_worker_slots: usize,
    ) -> Self {
        let kind = json.kind.unwrap_or(ChannelKind::Local);
        // Remote dispatch adds latency that ForceLocal jobs can't afford
        let default_max_priority = match kind {
            ChannelKind::Distributed => Priority::High,
            _ => Priority::ForceLocal,
        };

        let min_priority = json.min_priority.unwrap_or(Priority::Low);
        let max_priority = json.max_priority.unwrap_or(default_max_priority).max(min_priority);
        let max_batch_size = json.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE).max(1);
        let min_batch_size = json.min_batch_size.unwrap_or(1).clamp(1, max_batch_size);

        let name = if json.name.is_empty() {
            format!("{:?}", kind).to_lowercase()
        } else {
            json.name
        };

        ChannelConfig {
            name,
            kind,
            priority_range: PriorityRange {
                min: min_priority,
                max: max_priority,
            },
            min_batch_size,
            max_batch_size,
            batch_hold_time: Duration::from_millis(json.batch_hold_time_ms.unwrap_or(0)),
            worker_slots: json.worker_slots.unwrap_or(default_worker_slots).max(1),
        }
    }

    pub fn local(worker_slots: usize) -> Self {
        Self::from_json(
            ChannelConfigJson {
                name: "local".to_string(),
                kind: Some(ChannelKind::Local),
                ..Default::default()
            },
            worker_slots,
        )
    }

    pub fn in_process() -> Self {
        Self::from_json(
            ChannelConfigJson {
                name: "in_process".to_string(),
                kind: Some(ChannelKind::InProcess),
                ..Default::default()
            },
            1,
        )
    }
}

const DEFAULT_MAX_BATCH_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub job_cache_enabled: bool,
    // 0 = no absolute limit
    pub cache_memory_budget_mb: u64,
    // 0 = no relative limit
    pub cache_memory_budget_percent_of_ram: u32,

    pub worker_slots: usize,
    // Slots local channels may use after set_compiling_during_game(true)
    pub worker_slots_during_game: usize,

    // None disables hang detection
    pub hang_timeout: Option<Duration>,
    pub hang_is_fatal: bool,

    pub retry_on_error: RetryOnError,
    pub max_retries: u32,

    // When false, channels are ticked from the caller's polling loops instead of their own threads
    pub allow_asynchronous_compiling: bool,

    pub log_job_completion_times: bool,
    pub slow_batch_warning: Duration,
    pub process_async_time_budget: Option<Duration>,

    // After a worker crash a channel compiles in-process for fallback_batches * 2^(crashes - 1)
    // batches, capped at max_fallback_batches, before trying workers again
    pub fallback_batches: u32,
    pub max_fallback_batches: u32,

    pub worker_executable: Option<PathBuf>,
    // Root of per-slot directories used by the file transport
    pub working_directory: PathBuf,

    pub channels: Vec<ChannelConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_json(SchedulerConfigJson::default(), Path::new("."))
    }
}

impl SchedulerConfig {
    fn resolve_path(
        root_path: &Path,
        json_path: &str,
    ) -> PathBuf {
        if Path::new(json_path).is_absolute() {
            PathBuf::from(json_path)
        } else {
            root_path.join(json_path)
        }
    }

    /// `root_path` is the directory relative paths in the json are resolved against
    pub fn from_json(
        json: SchedulerConfigJson,
        root_path: &Path,
    ) -> Self {
        let worker_slots = match json.worker_slots {
            Some(slots) if slots > 0 => slots,
            _ => system::default_worker_slots(json.num_unused_worker_slots.unwrap_or(1)),
        };
        let worker_slots_during_game = json
            .worker_slots_during_game
            .unwrap_or(1)
            .clamp(1, worker_slots);

        let hang_timeout = match json.hang_timeout_secs.unwrap_or(30 * 60) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let process_async_time_budget = match json.process_async_time_budget_ms.unwrap_or(10) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let working_directory = match &json.working_directory {
            Some(dir) => Self::resolve_path(root_path, dir),
            None => std::env::temp_dir().join("kiln-workers"),
        };

        let channels = match json.channels {
            Some(channels) if !channels.is_empty() => channels
                .into_iter()
                .map(|channel| ChannelConfig::from_json(channel, worker_slots))
                .collect(),
            _ => vec![ChannelConfig::local(worker_slots)],
        };

        let fallback_batches = json.fallback_batches.unwrap_or(4).max(1);

        SchedulerConfig {
            job_cache_enabled: json.job_cache_enabled.unwrap_or(true),
            cache_memory_budget_mb: json.cache_memory_budget_mb.unwrap_or(256),
            cache_memory_budget_percent_of_ram: json
                .cache_memory_budget_percent_of_ram
                .unwrap_or(5),
            worker_slots,
            worker_slots_during_game,
            hang_timeout,
            hang_is_fatal: json.hang_is_fatal.unwrap_or(false),
            retry_on_error: json.retry_on_error.unwrap_or(RetryOnError::Disabled),
            max_retries: json.max_retries.unwrap_or(3),
            allow_asynchronous_compiling: json.allow_asynchronous_compiling.unwrap_or(true),
            log_job_completion_times: json.log_job_completion_times.unwrap_or(false),
            slow_batch_warning: Duration::from_secs(json.slow_batch_warning_secs.unwrap_or(30)),
            process_async_time_budget,
            fallback_batches,
            max_fallback_batches: json
                .max_fallback_batches
                .unwrap_or(64)
                .max(fallback_batches),
            worker_executable: json
                .worker_executable
                .as_deref()
                .map(|path| Self::resolve_path(root_path, path)),
            working_directory,
            channels,
        }
    }

    pub fn from_json_str(
        json: &str,
        root_path: &Path,
    ) -> SchedulerResult<Self> {
        let config_json: SchedulerConfigJson = serde_json::from_str(json)?;
        Ok(Self::from_json(config_json, root_path))
    }

    pub fn read_from_path(path: &Path) -> SchedulerResult<Self> {
        let root_path = path
            .parent()
            .ok_or_else(|| format!("Parent of config file path {:?} could not be found", path))?;
        let file_contents = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&file_contents, root_path)?;
        log::info!("Using scheduler configuration at {:?}", path);
        Ok(config)
    }

    /// Cache budget in bytes, `u64::MAX` if unlimited
    pub fn cache_memory_budget(&self) -> u64 {
        system::memory_budget_bytes(
            self.cache_memory_budget_mb,
            self.cache_memory_budget_percent_of_ram,
            system::detect_total_memory(),
        )
    }

    /// Number of crash fail-over batches after `consecutive_crashes` crashes in a row
    pub fn fallback_batches_after_crashes(
        &self,
        consecutive_crashes: u32,
    ) -> u32 {
        let shift = consecutive_crashes.saturating_sub(1).min(31);
        self.fallback_batches
            .saturating_mul(1u32 << shift)
            .min(self.max_fallback_batches)
    }
}
