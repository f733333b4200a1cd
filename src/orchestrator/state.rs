//! Per-agent lifecycle state tracked by the scheduler.

use serde::Serialize;

use crate::wire::DonePayload;

/// Lifecycle of one agent within a run. Pending until a READY is seen;
/// Armed after ACK; terminal states are Done and Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Pending,
    Ready,
    Armed,
    Executing,
    Done,
    Failed,
}

impl AgentState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Armed => "armed",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Everything the scheduler knows about one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEntry {
    pub state: AgentState,
    pub build_tag: Option<String>,
    pub client_type: Option<String>,
    /// DONE payload of the last completed operation.
    pub last_done: Option<DonePayload>,
}

impl AgentEntry {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: AgentState::Pending,
            build_tag: None,
            client_type: None,
            last_done: None,
        }
    }
}

/// Outcome of one phase across the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PhaseCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

impl PhaseCounts {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.pending == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_done_and_failed() {
        assert!(AgentState::Done.is_terminal());
        assert!(AgentState::Failed.is_terminal());
        assert!(!AgentState::Armed.is_terminal());
        assert!(!AgentState::Pending.is_terminal());
    }

    #[test]
    fn counts_report_full_success_only_without_failures() {
        let clean = PhaseCounts {
            succeeded: 3,
            failed: 0,
            pending: 0,
        };
        assert!(clean.all_succeeded());
        let straggler = PhaseCounts {
            succeeded: 2,
            failed: 0,
            pending: 1,
        };
        assert!(!straggler.all_succeeded());
    }
}
