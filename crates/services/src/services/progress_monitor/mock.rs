//! Mock implementation of SystemProbe for testing.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;

use super::{MemorySample, ProbeError, SystemProbe};

#[derive(Debug, Default)]
struct MockState {
    sample: Option<MemorySample>,
    delay: Option<Duration>,
}

/// Returns whatever memory sample the test sets; fails when none is set.
#[derive(Clone)]
pub struct MockSystemProbe {
    state: Arc<RwLock<MockState>>,
}

impl Default for MockSystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSystemProbe {
    /// Probe reporting an idle host.
    pub fn new() -> Self {
        Self::with_sample(MemorySample {
            used_bytes: 1024 * 1024 * 1024,
            total_bytes: 8 * 1024 * 1024 * 1024,
            process_bytes: 64 * 1024 * 1024,
        })
    }

    pub fn with_sample(sample: MemorySample) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState {
                sample: Some(sample),
                delay: None,
            })),
        }
    }

    pub fn set_sample(&self, sample: Option<MemorySample>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).sample = sample;
    }

    /// Delay every call, to exercise collection timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).delay = delay;
    }
}

#[async_trait]
impl SystemProbe for MockSystemProbe {
    async fn memory(&self) -> Result<MemorySample, ProbeError> {
        let (sample, delay) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            (state.sample, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        sample.ok_or_else(|| ProbeError::SystemError("no memory sample configured".into()))
    }
}
