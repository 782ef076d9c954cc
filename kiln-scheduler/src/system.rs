//! Host resource detection used to derive defaults for worker slots and the cache budget

/// Total physical memory in bytes
#[cfg(target_os = "linux")]
pub fn detect_total_memory() -> u64 {
    // Format: "MemTotal:       16384000 kB"
    if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(total) = parse_mem_total(&content) {
            return total;
        }
    }

    fallback_memory()
}

#[cfg(not(target_os = "linux"))]
pub fn detect_total_memory() -> u64 {
    fallback_memory()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1024)
}

const fn fallback_memory() -> u64 {
    8 * 1024 * 1024 * 1024
}

/// Number of worker slots to run when the configuration doesn't say. Small machines keep one core
/// free for the process doing the scheduling.
pub fn default_worker_slots(num_unused_slots: usize) -> usize {
    worker_slots_for_cores(num_cpus::get(), num_unused_slots)
}

pub(crate) fn worker_slots_for_cores(
    cores: usize,
    num_unused_slots: usize,
) -> usize {
    if cores <= 4 {
        cores.saturating_sub(1).max(1)
    } else {
        cores.saturating_sub(num_unused_slots).max(1)
    }
}

/// Combines an absolute and a relative cache budget. Zero on either dimension means that
/// dimension is unlimited. `u64::MAX` means no limit at all.
pub fn memory_budget_bytes(
    absolute_mb: u64,
    percent_of_ram: u32,
    total_memory: u64,
) -> u64 {
    let absolute = if absolute_mb == 0 {
        u64::MAX
    } else {
        absolute_mb.saturating_mul(1024 * 1024)
    };

    let relative = if percent_of_ram == 0 {
        u64::MAX
    } else {
        (total_memory as u128 * percent_of_ram.min(100) as u128 / 100) as u64
    };

    absolute.min(relative)
}

#[cfg(test)]
mod test {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn parses_meminfo() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:         1000 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16384000 * 1024));
        assert_eq!(parse_mem_total("MemFree: 12 kB"), None);
        assert!(detect_total_memory() > 0);
    }

    #[test]
    fn budget_takes_the_smaller_limit() {
        assert_eq!(memory_budget_bytes(0, 0, 1024 * MB), u64::MAX);
        assert_eq!(memory_budget_bytes(100, 0, 1024 * MB), 100 * MB);
        assert_eq!(memory_budget_bytes(0, 50, 1024 * MB), 512 * MB);
        assert_eq!(memory_budget_bytes(100, 50, 1024 * MB), 100 * MB);
        assert_eq!(memory_budget_bytes(1000, 10, 1024 * MB), 1024 * MB / 10);
    }

    #[test]
    fn worker_slot_defaults() {
        assert_eq!(worker_slots_for_cores(1, 1), 1);
        assert_eq!(worker_slots_for_cores(4, 0), 3);
        assert_eq!(worker_slots_for_cores(16, 2), 14);
        assert_eq!(worker_slots_for_cores(8, 100), 1);
    }
}
