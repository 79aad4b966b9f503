use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};

use crate::error::{FleetError, FleetResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Error,
    Stopping,
    Stopped,
    Deleted,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Created,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Error,
        LifecycleState::Stopping,
        LifecycleState::Stopped,
        LifecycleState::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Error => "error",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn can_transition(from: LifecycleState, to: LifecycleState) -> bool {
    if from == to {
        return true;
    }
    match from {
        LifecycleState::Created => {
            matches!(to, LifecycleState::Starting | LifecycleState::Deleted)
        }
        LifecycleState::Starting => matches!(
            to,
            LifecycleState::Running | LifecycleState::Error | LifecycleState::Stopping
        ),
        LifecycleState::Running => {
            matches!(to, LifecycleState::Stopping | LifecycleState::Error)
        }
        LifecycleState::Error => {
            matches!(to, LifecycleState::Starting | LifecycleState::Stopping)
        }
        LifecycleState::Stopping => matches!(to, LifecycleState::Stopped),
        LifecycleState::Stopped => {
            matches!(to, LifecycleState::Starting | LifecycleState::Deleted)
        }
        LifecycleState::Deleted => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub worker_id: i64,
    pub state: LifecycleState,
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub worker_id: i64,
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Observable lifecycle state of one worker. Rejects illegal transitions.
pub struct StateCell {
    worker_id: i64,
    tx: watch::Sender<RuntimeStatus>,
    events: Option<broadcast::Sender<TransitionEvent>>,
}

impl StateCell {
    pub fn new(worker_id: i64, initial: LifecycleState) -> Self {
        let (tx, _) = watch::channel(RuntimeStatus {
            worker_id,
            state: initial,
            error_count: 0,
        });
        Self {
            worker_id,
            tx,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<TransitionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn current(&self) -> RuntimeStatus {
        *self.tx.borrow()
    }

    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.tx.subscribe()
    }

    /// The event is published while the state lock is held, so subscribers
    /// see each worker's transitions in the order they happened.
    pub fn transition(&self, to: LifecycleState) -> FleetResult<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|status| {
            let from = status.state;
            if !can_transition(from, to) {
                outcome = Err(FleetError::IllegalTransition { from, to });
                return false;
            }
            if from == to {
                return false;
            }
            status.state = to;
            if let Some(events) = &self.events {
                let _ = events.send(TransitionEvent {
                    worker_id: self.worker_id,
                    from,
                    to,
                });
            }
            true
        });
        outcome
    }

    pub fn set_error_count(&self, error_count: u32) {
        self.tx.send_if_modified(|status| {
            let changed = status.error_count != error_count;
            status.error_count = error_count;
            changed
        });
    }
}
