//! Sticky fatal-error state of a parse.

use std::fmt;

/// Why a builder stopped doing productive work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BrokenReason {
    /// Buffer growth failed (or hit the configured operation cap).
    OutOfMemory,
    /// The consumer of the operation stream went away.
    SinkClosed,
    /// A mutation-driving call failed unexpectedly.
    MutationFailed(&'static str),
}

impl fmt::Display for BrokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokenReason::OutOfMemory => f.write_str("out of memory"),
            BrokenReason::SinkClosed => f.write_str("operation sink closed"),
            BrokenReason::MutationFailed(what) => write!(f, "mutation failed: {what}"),
        }
    }
}

/// `Ok -> Broken(reason)`, terminal. The first reason wins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokenState {
    reason: Option<BrokenReason>,
}

impl BrokenState {
    /// Returns `true` if this call performed the `Ok -> Broken` transition.
    pub fn mark(&mut self, reason: BrokenReason) -> bool {
        if self.reason.is_some() {
            return false;
        }
        self.reason = Some(reason);
        true
    }

    pub fn reason(&self) -> Option<BrokenReason> {
        self.reason
    }

    pub fn is_broken(&self) -> bool {
        self.reason.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let mut state = BrokenState::default();
        assert_eq!(state.reason(), None);
        assert!(state.mark(BrokenReason::OutOfMemory));
        assert!(!state.mark(BrokenReason::SinkClosed));
        assert!(!state.mark(BrokenReason::OutOfMemory));
        assert_eq!(state.reason(), Some(BrokenReason::OutOfMemory));
    }
}
