//! Raw-mode transition table.

use super::order::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Idle = 0,
    Tx = 1,
    Rx = 2,
    /// Header seen during a single receive, payload still on air.
    Toa = 3,
    /// Header seen during continuous receive.
    ToaTemp = 4,
    /// Transmit that pre-empted continuous receive.
    TxTemp = 5,
    RxCont = 6,
    TxCont = 7,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Tx => "tx",
            Self::Rx => "rx",
            Self::Toa => "toa",
            Self::ToaTemp => "toa_temp",
            Self::TxTemp => "tx_temp",
            Self::RxCont => "rx_cont",
            Self::TxCont => "tx_cont",
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Tx,
            2 => Self::Rx,
            3 => Self::Toa,
            4 => Self::ToaTemp,
            5 => Self::TxTemp,
            6 => Self::RxCont,
            7 => Self::TxCont,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    ReqTx,
    ReqRx,
    ReqRxCont,
    EndRxCont,
    EndTxCont,
    RadioIrq,
    TxDone,
    TxTimeout,
    RxDone,
    RxTimeout,
    RxFail,
    ToaExpire,
    OprTimeout,
}

impl Input {
    /// Input for a table-driven request. Requests handled outside the
    /// table, and inputs no state reacts to, map to `None`.
    pub fn of(request: &Request) -> Option<Self> {
        Some(match request {
            Request::Tx { .. } => Self::ReqTx,
            Request::Rx { .. } => Self::ReqRx,
            Request::RxContStart => Self::ReqRxCont,
            Request::RxContStop => Self::EndRxCont,
            Request::TxContWaveStop => Self::EndTxCont,
            Request::RadioIrq => Self::RadioIrq,
            Request::TxDone => Self::TxDone,
            Request::TxTimeout => Self::TxTimeout,
            Request::RxDone(_) => Self::RxDone,
            Request::RxTimeout => Self::RxTimeout,
            Request::RxError => Self::RxFail,
            Request::ToaExpired => Self::ToaExpire,
            Request::OprTimeout => Self::OprTimeout,
            Request::CadDone(_) | Request::RadioConfig | Request::TxContWaveStart { .. } => {
                return None
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartTx,
    StartRx,
    ProcessIrq,
    HandleTxDone,
    HandleTxTimeout,
    HandleRxDone,
    HandleRxTimeout,
    HandleRxFail,
    BackToRx,
    /// Interrupt while waiting on time-on-air; the ToA timer decides.
    Postpone,
    DoNothing,
    StopRxCont,
    RadioSleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Go { action: Action, next: State },
    /// No row for this input: respond without touching the radio.
    Ignore,
}

/// Look up `(state, input)`.
pub fn transition(state: State, input: Input) -> Step {
    use Action::*;
    use Input::*;

    let (action, next) = match state {
        State::Idle => match input {
            ReqTx => (StartTx, State::Tx),
            ReqRx => (StartRx, State::Rx),
            ReqRxCont => (StartRx, State::RxCont),
            RadioIrq => (ProcessIrq, State::Idle),
            _ => return Step::Ignore,
        },
        State::Tx => match input {
            TxDone => (HandleTxDone, State::Idle),
            TxTimeout | OprTimeout => (HandleTxTimeout, State::Idle),
            RadioIrq => (ProcessIrq, State::Tx),
            _ => return Step::Ignore,
        },
        State::Rx => match input {
            RadioIrq => (ProcessIrq, State::Rx),
            RxDone => (HandleRxDone, State::Idle),
            RxTimeout | OprTimeout => (HandleRxTimeout, State::Idle),
            RxFail => (HandleRxFail, State::Idle),
            ReqTx => (StartTx, State::Tx),
            _ => return Step::Ignore,
        },
        State::Toa => match input {
            ToaExpire => (BackToRx, State::Rx),
            OprTimeout => (HandleRxTimeout, State::Idle),
            RadioIrq => (Postpone, State::Toa),
            ReqTx => (StartTx, State::Tx),
            _ => return Step::Ignore,
        },
        State::RxCont => match input {
            EndRxCont => (StopRxCont, State::Idle),
            RadioIrq => (ProcessIrq, State::RxCont),
            RxDone => (HandleRxDone, State::RxCont),
            ReqTx => (StartTx, State::TxTemp),
            _ => return Step::Ignore,
        },
        State::ToaTemp => match input {
            EndRxCont => (StopRxCont, State::Idle),
            ToaExpire => (BackToRx, State::RxCont),
            RadioIrq => (Postpone, State::ToaTemp),
            ReqTx => (StartTx, State::TxTemp),
            _ => return Step::Ignore,
        },
        State::TxTemp => match input {
            EndRxCont => (DoNothing, State::Tx),
            TxDone => (HandleTxDone, State::RxCont),
            TxTimeout | OprTimeout => (HandleTxTimeout, State::RxCont),
            RadioIrq => (ProcessIrq, State::TxTemp),
            _ => return Step::Ignore,
        },
        State::TxCont => match input {
            TxTimeout | EndTxCont => (RadioSleep, State::Idle),
            _ => return Step::Ignore,
        },
    };
    Step::Go { action, next }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [State; 8] = [
        State::Idle,
        State::Tx,
        State::Rx,
        State::Toa,
        State::ToaTemp,
        State::TxTemp,
        State::RxCont,
        State::TxCont,
    ];

    const INPUTS: [Input; 13] = [
        Input::ReqTx,
        Input::ReqRx,
        Input::ReqRxCont,
        Input::EndRxCont,
        Input::EndTxCont,
        Input::RadioIrq,
        Input::TxDone,
        Input::TxTimeout,
        Input::RxDone,
        Input::RxTimeout,
        Input::RxFail,
        Input::ToaExpire,
        Input::OprTimeout,
    ];

    fn go(action: Action, next: State) -> Step {
        Step::Go { action, next }
    }

    #[test]
    fn test_table_rows() {
        assert_eq!(transition(State::Idle, Input::ReqTx), go(Action::StartTx, State::Tx));
        assert_eq!(
            transition(State::Idle, Input::ReqRxCont),
            go(Action::StartRx, State::RxCont)
        );
        assert_eq!(
            transition(State::Tx, Input::OprTimeout),
            go(Action::HandleTxTimeout, State::Idle)
        );
        assert_eq!(
            transition(State::Rx, Input::RxFail),
            go(Action::HandleRxFail, State::Idle)
        );
        assert_eq!(
            transition(State::Toa, Input::ToaExpire),
            go(Action::BackToRx, State::Rx)
        );
        assert_eq!(
            transition(State::RxCont, Input::ReqTx),
            go(Action::StartTx, State::TxTemp)
        );
        assert_eq!(
            transition(State::TxTemp, Input::TxDone),
            go(Action::HandleTxDone, State::RxCont)
        );
        assert_eq!(
            transition(State::TxCont, Input::EndTxCont),
            go(Action::RadioSleep, State::Idle)
        );
    }

    #[test]
    fn test_unlisted_inputs_are_ignored() {
        assert_eq!(transition(State::Idle, Input::TxDone), Step::Ignore);
        assert_eq!(transition(State::Idle, Input::OprTimeout), Step::Ignore);
        assert_eq!(transition(State::Tx, Input::ReqTx), Step::Ignore);
        assert_eq!(transition(State::TxCont, Input::RadioIrq), Step::Ignore);
    }

    #[test]
    fn test_every_pair_resolves() {
        let mut rows = 0;
        for state in STATES {
            for input in INPUTS {
                if let Step::Go { .. } = transition(state, input) {
                    rows += 1;
                }
            }
        }
        assert_eq!(rows, 33);
    }

    #[test]
    fn test_req_tx_always_reaches_a_transmit_state() {
        for state in STATES {
            if let Step::Go { action, next } = transition(state, Input::ReqTx) {
                assert_eq!(action, Action::StartTx);
                assert!(matches!(next, State::Tx | State::TxTemp));
            }
        }
    }

    #[test]
    fn test_state_u8_roundtrip() {
        for state in STATES {
            assert_eq!(State::from_u8(state as u8), state);
        }
    }
}
