//! Track state management

use std::time::Instant;

/// Track state machine
///
/// `Idle → Receiving → Closed`. A track enters `Receiving` with its first
/// packet and `Closed` on end-of-stream, transport error or shutdown.
/// Nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Track created, no packet seen yet
    Idle,

    /// Track is receiving packets
    Receiving {
        /// When the first packet arrived
        started_at: Instant,
    },

    /// Track has been closed and released its sink
    Closed,
}

impl TrackState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &TrackState) -> bool {
        use TrackState::*;

        match (self, target) {
            (Idle, Receiving { .. }) => true,
            // a track may close before it ever sees a packet
            (Idle, Closed) => true,
            (Receiving { .. }, Closed) => true,

            (Closed, _) => false,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            TrackState::Idle => "Idle",
            TrackState::Receiving { .. } => "Receiving",
            TrackState::Closed => "Closed",
        }
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self, TrackState::Receiving { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TrackState::Closed)
    }

    /// Get the duration since the first packet (if receiving)
    pub fn receiving_duration(&self) -> Option<std::time::Duration> {
        if let TrackState::Receiving { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for TrackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let idle = TrackState::Idle;
        let receiving = TrackState::Receiving {
            started_at: Instant::now(),
        };
        let closed = TrackState::Closed;

        assert!(idle.can_transition_to(&receiving));
        assert!(idle.can_transition_to(&closed));
        assert!(receiving.can_transition_to(&closed));

        // Self-transitions
        assert!(idle.can_transition_to(&idle));
        assert!(receiving.can_transition_to(&receiving));
    }

    #[test]
    fn test_closed_is_terminal() {
        let receiving = TrackState::Receiving {
            started_at: Instant::now(),
        };
        let closed = TrackState::Closed;

        assert!(!closed.can_transition_to(&TrackState::Idle));
        assert!(!closed.can_transition_to(&receiving));
        assert!(!closed.can_transition_to(&closed));
        assert!(!receiving.can_transition_to(&TrackState::Idle));
    }

    #[test]
    fn test_state_checks() {
        let receiving = TrackState::Receiving {
            started_at: Instant::now(),
        };

        assert!(receiving.is_receiving());
        assert!(!receiving.is_closed());
        assert!(receiving.receiving_duration().is_some());

        assert!(!TrackState::Idle.is_receiving());
        assert!(TrackState::Idle.receiving_duration().is_none());
        assert!(TrackState::Closed.is_closed());
        assert_eq!(TrackState::Closed.to_string(), "Closed");
    }
}
