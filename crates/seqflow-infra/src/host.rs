//! Host resource probe used for default core budgets and memory limits.

use seqflow_types::resources::MemorySize;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Cores and free memory on the driver machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cores: u32,
    pub free_memory: Option<MemorySize>,
}

impl HostResources {
    pub fn detect() -> Self {
        let system =
            System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()));
        let available = system.available_memory();
        let free_memory = (available > 0).then(|| MemorySize::from_bytes(available));
        let cores = u32::try_from(num_cpus::get()).unwrap_or(u32::MAX).max(1);

        tracing::debug!(
            cores,
            free_memory = ?free_memory.map(|m| m.to_string()),
            "detected host resources"
        );
        Self { cores, free_memory }
    }

    /// `requested` cores, or every host core when unset.
    pub fn cores_or(&self, requested: Option<u32>) -> u32 {
        requested.filter(|&c| c > 0).unwrap_or(self.cores)
    }
}
