use thiserror::Error;

/// Per-instance lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
    #[error("lifecycle lock poisoned")]
    LockPoisoned,
}

#[derive(Debug)]
pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Stopped }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Starting -> Stopped` and `Stopping -> Running` are the rollback edges
    /// taken when a command is not acknowledged.
    pub fn can_transition(&self, to: &State) -> bool {
        matches!(
            (&self.state, to),
            (State::Stopped, State::Starting)
                | (State::Starting, State::Running)
                | (State::Starting, State::Stopped)
                | (State::Running, State::Stopping)
                | (State::Stopping, State::Stopped)
                | (State::Stopping, State::Running)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::trace!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state.clone(), to))
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Stopped;
    }
}
