//! Progress monitor for a running migration.
//!
//! Runs as a background task next to the orchestrator and never blocks it:
//! it only reads the session status published on a `watch` channel, and every
//! store or system metrics call is bounded by a short timeout.
//!
//! # Design
//!
//! - Samples on a fixed interval, or on demand through the handle
//! - Computes throughput, error rate and ETA between consecutive samples
//! - Raises an alert when a threshold is first breached and clears it on recovery
//! - Keeps samples for the retention window and a bounded status history

mod mock;
mod sysinfo_impl;

pub use mock::MockSystemProbe;
pub use sysinfo_impl::SysinfoProbe;

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::{StoreHealth, TargetStore, models::Entity};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use ts_rs::TS;

use super::{
    config::MonitorConfig,
    events::{EventBus, MigrationEvent},
    session::{EntityStatus, MigrationPhase, SessionSnapshot},
    validation::Severity,
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("System error: {0}")]
    SystemError(String),
}

/// Host and process memory at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
    /// Resident memory of this process.
    pub process_bytes: u64,
}

impl MemorySample {
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 * 100.0 / self.total_bytes as f64
        }
    }
}

/// Source of system metrics, abstracted so tests can inject values.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn memory(&self) -> Result<MemorySample, ProbeError>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum AlertKind {
    ErrorRate,
    LowThroughput,
    MemoryUsage,
    ConnectionPool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    #[ts(type = "Date")]
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MonitorSample {
    #[ts(type = "Date")]
    pub captured_at: DateTime<Utc>,
    pub phase: MigrationPhase,
    pub current_entity: Option<Entity>,
    pub processed: u64,
    pub migrated: u64,
    pub failed: u64,
    pub remaining: u64,
    /// Records per second since the previous sample.
    pub throughput: f64,
    pub error_rate: f64,
    pub eta_secs: Option<u64>,
    pub store: Option<StoreHealth>,
    pub memory: Option<MemorySample>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Raised(Alert),
    Cleared(AlertKind),
}

/// Rolling monitor history and alert state. Pure bookkeeping; the sampling
/// task feeds it.
#[derive(Debug)]
pub struct MonitorState {
    config: MonitorConfig,
    samples: VecDeque<MonitorSample>,
    statuses: VecDeque<SessionSnapshot>,
    active: BTreeMap<AlertKind, Alert>,
}

impl MonitorState {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            statuses: VecDeque::new(),
            active: BTreeMap::new(),
        }
    }

    pub fn latest(&self) -> Option<&MonitorSample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &MonitorSample> {
        self.samples.iter()
    }

    pub fn statuses(&self) -> impl Iterator<Item = &SessionSnapshot> {
        self.statuses.iter()
    }

    pub fn active_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.active.values()
    }

    /// Fold one observation into the history and evaluate the thresholds.
    pub fn record_sample(
        &mut self,
        snapshot: SessionSnapshot,
        store: Option<StoreHealth>,
        memory: Option<MemorySample>,
        now: DateTime<Utc>,
    ) -> (MonitorSample, Vec<AlertTransition>) {
        let processed = snapshot.processed();
        let failed = snapshot.failed();
        let remaining = snapshot.remaining();

        let previous = self.samples.back();
        let throughput = previous
            .map(|prev| {
                let elapsed = (now - prev.captured_at).num_milliseconds() as f64 / 1000.0;
                if elapsed > 0.0 {
                    processed.saturating_sub(prev.processed) as f64 / elapsed
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        // Rate over the interval; cumulative when nothing moved.
        let (delta_processed, delta_failed) = previous
            .map(|prev| {
                (
                    processed.saturating_sub(prev.processed),
                    failed.saturating_sub(prev.failed),
                )
            })
            .unwrap_or((processed, failed));
        let error_rate = if delta_processed > 0 {
            delta_failed as f64 / delta_processed as f64
        } else if processed > 0 {
            failed as f64 / processed as f64
        } else {
            0.0
        };

        let eta_secs = (throughput > 0.0).then(|| (remaining as f64 / throughput).ceil() as u64);
        let in_progress = snapshot
            .entities
            .iter()
            .any(|e| e.status == EntityStatus::InProgress);
        let has_previous = previous.is_some();

        let sample = MonitorSample {
            captured_at: now,
            phase: snapshot.phase,
            current_entity: snapshot.current_entity,
            processed,
            migrated: snapshot.migrated(),
            failed,
            remaining,
            throughput,
            error_rate,
            eta_secs,
            store,
            memory,
        };

        let mut transitions = Vec::new();
        let config = self.config.clone();
        self.evaluate(
            AlertKind::ErrorRate,
            Some(error_rate > config.error_rate_threshold),
            error_rate,
            config.error_rate_threshold,
            Severity::Critical,
            format!("error rate {:.1}% exceeds {:.1}%", error_rate * 100.0, config.error_rate_threshold * 100.0),
            now,
            &mut transitions,
        );
        self.evaluate(
            AlertKind::LowThroughput,
            Some(in_progress && has_previous && throughput < config.min_throughput),
            throughput,
            config.min_throughput,
            Severity::Warning,
            format!("throughput {throughput:.1} rec/s below {:.1} rec/s", config.min_throughput),
            now,
            &mut transitions,
        );
        let memory_usage = memory.map(|m| m.usage_percent());
        self.evaluate(
            AlertKind::MemoryUsage,
            memory_usage.map(|usage| usage > config.memory_threshold_percent),
            memory_usage.unwrap_or_default(),
            config.memory_threshold_percent,
            Severity::Warning,
            format!(
                "memory usage {:.1}% exceeds {:.1}%",
                memory_usage.unwrap_or_default(),
                config.memory_threshold_percent
            ),
            now,
            &mut transitions,
        );
        let pool_usage = sample.store.as_ref().map(StoreHealth::pool_usage);
        self.evaluate(
            AlertKind::ConnectionPool,
            pool_usage.map(|usage| usage > config.pool_usage_threshold),
            pool_usage.unwrap_or_default(),
            config.pool_usage_threshold,
            Severity::Warning,
            format!(
                "connection pool {:.0}% in use, threshold {:.0}%",
                pool_usage.unwrap_or_default() * 100.0,
                config.pool_usage_threshold * 100.0
            ),
            now,
            &mut transitions,
        );

        self.samples.push_back(sample.clone());
        let cutoff = now - chrono::Duration::seconds(config.retention_secs as i64);
        while self
            .samples
            .front()
            .is_some_and(|s| s.captured_at < cutoff)
        {
            self.samples.pop_front();
        }

        self.statuses.push_back(snapshot);
        while self.statuses.len() > config.status_history {
            self.statuses.pop_front();
        }

        (sample, transitions)
    }

    /// `breached` is `None` when the metric could not be collected; the alert
    /// then keeps its current state.
    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &mut self,
        kind: AlertKind,
        breached: Option<bool>,
        value: f64,
        threshold: f64,
        severity: Severity,
        message: String,
        now: DateTime<Utc>,
        transitions: &mut Vec<AlertTransition>,
    ) {
        match (breached, self.active.contains_key(&kind)) {
            (Some(true), false) => {
                let alert = Alert {
                    kind,
                    severity,
                    message,
                    value,
                    threshold,
                    raised_at: now,
                };
                self.active.insert(kind, alert.clone());
                transitions.push(AlertTransition::Raised(alert));
            }
            (Some(false), true) => {
                self.active.remove(&kind);
                transitions.push(AlertTransition::Cleared(kind));
            }
            _ => {}
        }
    }
}

/// Handle for controlling the progress monitor.
#[derive(Clone)]
pub struct ProgressMonitorHandle {
    tx: mpsc::Sender<MonitorCommand>,
    state: Arc<RwLock<MonitorState>>,
}

enum MonitorCommand {
    /// Sample immediately and reply with the result.
    CheckNow(oneshot::Sender<MonitorSample>),
    Shutdown,
}

impl ProgressMonitorHandle {
    /// Take a sample now. `None` once the monitor has stopped.
    pub async fn check_now(&self) -> Option<MonitorSample> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(MonitorCommand::CheckNow(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(MonitorCommand::Shutdown).await;
    }

    pub async fn latest(&self) -> Option<MonitorSample> {
        self.state.read().await.latest().cloned()
    }

    /// Samples within the retention window, oldest first.
    pub async fn history(&self) -> Vec<MonitorSample> {
        self.state.read().await.samples().cloned().collect()
    }

    pub async fn status_history(&self) -> Vec<SessionSnapshot> {
        self.state.read().await.statuses().cloned().collect()
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.state.read().await.active_alerts().cloned().collect()
    }
}

/// Progress monitoring service.
pub struct ProgressMonitor {
    status: watch::Receiver<SessionSnapshot>,
    target: Arc<dyn TargetStore>,
    probe: Arc<dyn SystemProbe>,
    events: EventBus,
    config: MonitorConfig,
    state: Arc<RwLock<MonitorState>>,
}

impl ProgressMonitor {
    /// Spawn the monitor as a background task.
    ///
    /// The task stops on [`ProgressMonitorHandle::shutdown`] or once every
    /// handle is dropped.
    pub fn spawn(
        status: watch::Receiver<SessionSnapshot>,
        target: Arc<dyn TargetStore>,
        probe: Arc<dyn SystemProbe>,
        events: EventBus,
        config: MonitorConfig,
    ) -> ProgressMonitorHandle {
        let (tx, rx) = mpsc::channel(16);
        let state = Arc::new(RwLock::new(MonitorState::new(config.clone())));
        let monitor = Self {
            status,
            target,
            probe,
            events,
            config,
            state: state.clone(),
        };
        tokio::spawn(monitor.run(rx));
        ProgressMonitorHandle { tx, state }
    }

    async fn run(self, mut rx: mpsc::Receiver<MonitorCommand>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval_secs,
            retention_secs = self.config.retention_secs,
            "Progress monitor started"
        );

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(MonitorCommand::CheckNow(reply)) => {
                            let sample = self.collect().await;
                            let _ = reply.send(sample);
                        }
                        Some(MonitorCommand::Shutdown) | None => {
                            tracing::info!("Progress monitor shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    self.collect().await;
                }
            }
        }
    }

    async fn collect(&self) -> MonitorSample {
        let snapshot = self.status.borrow().clone();
        let timeout = self.config.metrics_timeout();

        let store = match tokio::time::timeout(timeout, self.target.health()).await {
            Ok(Ok(health)) => Some(health),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Failed to collect store health");
                None
            }
            Err(_) => {
                tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Store health collection timed out");
                None
            }
        };
        let memory = match tokio::time::timeout(timeout, self.probe.memory()).await {
            Ok(Ok(memory)) => Some(memory),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Failed to sample memory");
                None
            }
            Err(_) => None,
        };

        let (sample, transitions) =
            self.state
                .write()
                .await
                .record_sample(snapshot, store, memory, Utc::now());

        for transition in transitions {
            match transition {
                AlertTransition::Raised(alert) => {
                    tracing::warn!(
                        kind = ?alert.kind,
                        value = alert.value,
                        threshold = alert.threshold,
                        "{}",
                        alert.message
                    );
                    self.events.publish(MigrationEvent::AlertRaised { alert });
                }
                AlertTransition::Cleared(kind) => {
                    tracing::info!(kind = ?kind, "Alert cleared");
                    self.events.publish(MigrationEvent::AlertCleared { kind });
                }
            }
        }

        let traffic = sample.store.as_ref().and_then(|store| store.metrics.as_ref());
        tracing::debug!(
            processed = sample.processed,
            throughput = sample.throughput,
            error_rate = sample.error_rate,
            eta_secs = ?sample.eta_secs,
            rows_written = ?traffic.map(|m| m.rows_written),
            slow_queries = ?traffic.map(|m| m.queries_slow),
            query_p95_ms = ?traffic.map(|m| m.latency_p95_ms),
            "Progress sample"
        );
        sample
    }
}
