// src/utils/system.rs: System functions

use std::time::Duration;

use anyhow::{anyhow, Result};
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for CPU based tasks
///
/// # Arguments
///
/// * `args_threads` - User cap on threads.
///
/// # Returns
///
/// Result<(usize, f32)> maximum cores, current cpu usage
pub async fn detect_cores_and_load(args_threads: usize) -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    let max_cores = physical_cores.min(args_threads).max(1);
    Ok((max_cores, cpu_load))
}


/// Threads handed to each tool invocation of a stage, so that a stage at
/// full concurrency does not oversubscribe the cores.
///
/// # Arguments
///
/// * `max_cores` - Cores available to the run.
/// * `concurrency` - Stage's maximum concurrent tasks.
///
/// # Returns
/// max(1, max_cores / concurrency)
pub fn compute_task_threads(max_cores: usize, concurrency: usize) -> usize {
    (max_cores / concurrency.max(1)).max(1)
}


/// Finds the amount of total and available RAM
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram
pub fn detect_ram() -> Result<(u64, u64)> {
    let mut system = System::new();
    system.refresh_memory();
    let (total_ram, available_ram) = (system.total_memory(), system.available_memory());
    if total_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }
    Ok((total_ram, available_ram))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_task_threads() {
        assert_eq!(compute_task_threads(16, 4), 4);
        assert_eq!(compute_task_threads(16, 3), 5);
        assert_eq!(compute_task_threads(2, 4), 1);
        assert_eq!(compute_task_threads(8, 0), 8);
    }

    #[tokio::test]
    async fn test_detect_cores_respects_cap() {
        let (cores, _load) = detect_cores_and_load(1).await.unwrap();
        assert_eq!(cores, 1);
    }
}
