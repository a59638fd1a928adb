//! Coordinator state definitions.

/// Coordinator operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Built, connections not started yet.
    Starting,
    /// Event loop running and accepting operator commands.
    Running,
    /// Disconnecting providers, no new commands.
    ShuttingDown,
    /// Coordinator is stopped.
    Stopped,
}

impl CoordinatorState {
    /// Check if the coordinator is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, CoordinatorState::Running)
    }

    /// Check if operator commands are accepted.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, CoordinatorState::Running)
    }

    /// Check if the coordinator is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Stopped)
    }
}
