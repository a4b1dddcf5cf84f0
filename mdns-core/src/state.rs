/// Lifecycle of an owned name, whether a host or a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Probing1,
    Probing2,
    Probing3,
    Announcing1,
    Announcing2,
    Announced,
    Canceled,
}

impl State {
    pub fn is_probing(self) -> bool {
        matches!(self, Self::Probing1 | Self::Probing2 | Self::Probing3)
    }

    pub fn is_announced(self) -> bool {
        matches!(self, Self::Announced)
    }

    pub fn is_canceled(self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Advances through PROBING_1..3 -> ANNOUNCING_1..2 -> ANNOUNCED in order.
/// ANNOUNCED is sticky: further `advance()` calls are no-ops. CANCELED is
/// terminal and exclusive — once set, neither `advance` nor `revert` moves
/// away from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Probing1 }
    }
}

impl StateMachine {
    pub fn current(&self) -> State {
        self.state
    }

    pub fn advance(&mut self) {
        self.state = match self.state {
            State::Probing1 => State::Probing2,
            State::Probing2 => State::Probing3,
            State::Probing3 => State::Announcing1,
            State::Announcing1 => State::Announcing2,
            State::Announcing2 => State::Announced,
            State::Announced => State::Announced,
            State::Canceled => State::Canceled,
        };
    }

    pub fn revert(&mut self) {
        if self.state != State::Canceled {
            self.state = State::Probing1;
        }
    }

    /// Moves an ANNOUNCED descriptor back to ANNOUNCING_1 without a full
    /// probe restart, used when a TXT update needs re-advertising.
    pub fn restart_announcing(&mut self) {
        if self.state != State::Canceled {
            self.state = State::Announcing1;
        }
    }

    pub fn cancel(&mut self) {
        self.state = State::Canceled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_advance_through_the_full_lifecycle() {
        let mut machine = StateMachine::default();
        let expected = [
            State::Probing2,
            State::Probing3,
            State::Announcing1,
            State::Announcing2,
            State::Announced,
            State::Announced,
        ];
        for state in expected {
            machine.advance();
            assert_eq!(machine.current(), state);
        }
    }

    #[test]
    fn should_revert_to_probing_1() {
        let mut machine = StateMachine::default();
        machine.advance();
        machine.advance();
        machine.revert();
        assert_eq!(machine.current(), State::Probing1);
    }

    #[test]
    fn should_not_leave_canceled_state() {
        let mut machine = StateMachine::default();
        machine.cancel();
        machine.advance();
        machine.revert();
        assert_eq!(machine.current(), State::Canceled);
    }
}
