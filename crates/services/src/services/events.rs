//! Structured migration events.
//!
//! Progress, findings, alerts and phase changes are published to one
//! [`EventBus`]; the progress monitor, the CLI and any dashboard observe the
//! same stream instead of the pipeline writing to a console.

use std::sync::Arc;

use db::models::Entity;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utils::msg_store::MsgStore;
use uuid::Uuid;

use super::{
    progress_monitor::{Alert, AlertKind},
    report::OverallStatus,
    session::{EntityStatus, MigrationPhase},
    validation::ValidationFinding,
};

/// Events kept for late subscribers.
const EVENT_HISTORY_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export)]
pub enum MigrationEvent {
    SessionStarted {
        session_id: Uuid,
        dry_run: bool,
        entities: Vec<Entity>,
    },
    PhaseChanged {
        session_id: Uuid,
        phase: MigrationPhase,
    },
    EntityStarted {
        entity: Entity,
        total: u64,
    },
    Progress {
        entity: Entity,
        processed: u64,
        total: u64,
        migrated: u64,
        failed: u64,
    },
    BatchCompleted {
        entity: Entity,
        batch: u64,
        read: u64,
        written: u64,
        failed: u64,
        attempts: u32,
    },
    EntityFinished {
        entity: Entity,
        status: EntityStatus,
        total: u64,
        migrated: u64,
        failed: u64,
    },
    FindingRaised {
        finding: ValidationFinding,
    },
    AlertRaised {
        alert: Alert,
    },
    AlertCleared {
        kind: AlertKind,
    },
    RollbackStep {
        strategy: String,
        step: String,
        entity: Option<Entity>,
    },
    SessionFinished {
        session_id: Uuid,
        status: OverallStatus,
    },
}

/// Publish/subscribe channel for [`MigrationEvent`]s. Clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<MsgStore<MigrationEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MsgStore::with_capacity(EVENT_HISTORY_LEN)),
        }
    }

    pub fn publish(&self, event: MigrationEvent) {
        tracing::trace!(?event, "Migration event");
        self.store.push(event);
    }

    /// Events published from now on.
    pub fn subscribe(&self) -> BoxStream<'static, MigrationEvent> {
        self.store.stream_live_only()
    }

    /// Retained history followed by live events.
    pub fn replay_and_subscribe(&self) -> BoxStream<'static, MigrationEvent> {
        self.store.history_plus_stream()
    }

    pub fn history(&self) -> Vec<MigrationEvent> {
        self.store.get_history()
    }
}
