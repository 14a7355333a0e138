//! Real implementation of SystemProbe using the sysinfo crate.

use async_trait::async_trait;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

use super::{MemorySample, ProbeError, SystemProbe};

/// Queries the operating system on every call; holds no state.
#[derive(Clone, Default)]
pub struct SysinfoProbe;

impl SysinfoProbe {
    pub fn new() -> Self {
        Self
    }

    fn sample() -> Result<MemorySample, ProbeError> {
        let mut system = System::new();
        system.refresh_memory();

        let pid = sysinfo::get_current_pid().map_err(|e| ProbeError::SystemError(e.to_string()))?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        let process_bytes = system.process(pid).map(|p| p.memory()).unwrap_or(0);

        Ok(MemorySample {
            used_bytes: system.used_memory(),
            total_bytes: system.total_memory(),
            process_bytes,
        })
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn memory(&self) -> Result<MemorySample, ProbeError> {
        // sysinfo refreshes are blocking
        tokio::task::spawn_blocking(Self::sample)
            .await
            .map_err(|e| ProbeError::SystemError(e.to_string()))?
    }
}
