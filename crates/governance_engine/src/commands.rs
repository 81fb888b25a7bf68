use std::collections::VecDeque;

use core_types::EntityId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperatorOp {
    Pause,
    Resume,
    Retire,
}

impl OperatorOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Retire => "retire",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorCommand {
    pub entity: EntityId,
    pub op: OperatorOp,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub requested_at_ms: i64,
}

/// Operator requests wait here until the next cycle applies them, so the cycle stays
/// the single writer of entity state.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Mutex<VecDeque<OperatorCommand>>,
}

impl CommandQueue {
    pub fn push(&self, cmd: OperatorCommand) -> usize {
        let mut pending = self.pending.lock();
        pending.push_back(cmd);
        pending.len()
    }

    pub fn drain(&self) -> Vec<OperatorCommand> {
        self.pending.lock().drain(..).collect()
    }

    /// Put commands back ahead of anything queued since, keeping their order.
    pub fn requeue_front(&self, cmds: Vec<OperatorCommand>) {
        let mut pending = self.pending.lock();
        for cmd in cmds.into_iter().rev() {
            pending.push_front(cmd);
        }
    }

    pub fn pending(&self) -> Vec<OperatorCommand> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
