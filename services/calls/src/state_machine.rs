use wavechat_common::AppError;

/// Call lifecycle states. `Ended` is terminal; the cache session never
/// stores it because finalization destroys the session instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    Active,
    Reconnecting,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Initiate,
    Accept,
    Reject,
    Hangup,
    Timeout,
    Disconnect,
    Reconnect,
    Fail,
    Block,
    Cancel,
}

/// Pure transition function over (state, event). The table below is the
/// single source of truth for call transitions; callers must not branch on
/// states outside of it.
pub fn transition(state: CallState, event: CallEvent) -> Result<CallState, AppError> {
    use CallEvent::*;
    use CallState::*;

    let next = match (state, event) {
        (Idle, Initiate) => Some(Ringing),

        (Ringing, Accept) => Some(Active),
        (Ringing, Reject) => Some(Ended),
        (Ringing, Hangup) => Some(Ended),
        (Ringing, Timeout) => Some(Ended),
        (Ringing, Block) => Some(Ended),
        (Ringing, Cancel) => Some(Ended),

        (Active, Hangup) => Some(Ended),
        (Active, Disconnect) => Some(Reconnecting),
        (Active, Block) => Some(Ended),

        (Reconnecting, Hangup) => Some(Ended),
        (Reconnecting, Reconnect) => Some(Active),
        (Reconnecting, Fail) => Some(Ended),
        (Reconnecting, Block) => Some(Ended),

        _ => None,
    };

    next.ok_or_else(|| {
        AppError::BadInput(format!(
            "Invalid call transition: {:?} on {:?}",
            event, state
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [CallState; 5] = [
        CallState::Idle,
        CallState::Ringing,
        CallState::Active,
        CallState::Reconnecting,
        CallState::Ended,
    ];

    const ALL_EVENTS: [CallEvent; 10] = [
        CallEvent::Initiate,
        CallEvent::Accept,
        CallEvent::Reject,
        CallEvent::Hangup,
        CallEvent::Timeout,
        CallEvent::Disconnect,
        CallEvent::Reconnect,
        CallEvent::Fail,
        CallEvent::Block,
        CallEvent::Cancel,
    ];

    #[test]
    fn happy_path_one_to_one() {
        let s = transition(CallState::Idle, CallEvent::Initiate).unwrap();
        let s = transition(s, CallEvent::Accept).unwrap();
        assert_eq!(s, CallState::Active);
        let s = transition(s, CallEvent::Hangup).unwrap();
        assert_eq!(s, CallState::Ended);
    }

    #[test]
    fn reconnect_round_trip() {
        let s = transition(CallState::Active, CallEvent::Disconnect).unwrap();
        assert_eq!(s, CallState::Reconnecting);
        let s = transition(s, CallEvent::Reconnect).unwrap();
        assert_eq!(s, CallState::Active);
    }

    #[test]
    fn reconnect_failure_terminates() {
        let s = transition(CallState::Reconnecting, CallEvent::Fail).unwrap();
        assert_eq!(s, CallState::Ended);
    }

    #[test]
    fn ended_is_terminal_for_every_event() {
        for event in ALL_EVENTS {
            assert!(transition(CallState::Ended, event).is_err());
        }
    }

    #[test]
    fn exhaustive_table_matches_specified_transitions() {
        // Every (state, event) pair either matches a row of the transition
        // table or fails with bad-input. Count the allowed pairs to pin the
        // table's size.
        let mut allowed = 0;
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                if transition(state, event).is_ok() {
                    allowed += 1;
                }
            }
        }
        assert_eq!(allowed, 14);
    }

    #[test]
    fn idle_accepts_only_initiate() {
        for event in ALL_EVENTS {
            let result = transition(CallState::Idle, event);
            if event == CallEvent::Initiate {
                assert_eq!(result.unwrap(), CallState::Ringing);
            } else {
                assert!(result.is_err());
            }
        }
    }

    #[test]
    fn invalid_transition_is_bad_input() {
        let err = transition(CallState::Active, CallEvent::Accept).unwrap_err();
        assert_eq!(err.error_code(), "BAD_INPUT");
    }
}
