//! WAN mode state machine and its consumer.

use super::mac::{MacStatus, RxStatus, TxStatus};
use super::port::{IndKind, RxInfo, TxHeader, TxInfo};
use super::settings::DeviceClass;
use super::WanShared;
use crate::lock;
use crate::lora::Region;
use crate::sync_pool::SyncHandle;
use crate::timer::Timer;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Everything posted into the WAN mailbox.
#[derive(Debug)]
pub enum WanRequest {
    JoinReq,
    JoinDone,
    JoinFail,
    /// New credentials were stored.
    Commission,
    DutyCycle,
    /// The MAC asks to be serviced.
    MacReq,
    RadioEvt,
    /// Message deadline of the uplink in flight.
    Timeout,
    ReqClass(DeviceClass),
    ClassChanged(DeviceClass),
    JoinStatus {
        handle: SyncHandle,
        reply: Arc<AtomicBool>,
    },
    MacTx(TxStatus),
    MacRx(RxStatus),
    /// Region changed: drop the session and start over.
    Restart(Region),
}

impl WanRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinReq => "join-request",
            Self::JoinDone => "join-done",
            Self::JoinFail => "join-fail",
            Self::Commission => "commission",
            Self::DutyCycle => "duty-cycle",
            Self::MacReq => "mac-request",
            Self::RadioEvt => "radio-event",
            Self::Timeout => "timeout",
            Self::ReqClass(_) => "request-class",
            Self::ClassChanged(_) => "class-changed",
            Self::JoinStatus { .. } => "join-status",
            Self::MacTx(_) => "mac-tx-status",
            Self::MacRx(_) => "mac-rx-data",
            Self::Restart(_) => "restart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    NotJoined = 0,
    Joined = 1,
    /// An uplink is being processed.
    Trx = 2,
    /// Waiting for the MAC to confirm a class switch.
    ChgClass = 3,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            Self::NotJoined => "not_joined",
            Self::Joined => "joined",
            Self::Trx => "trx",
            Self::ChgClass => "chg_class",
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Joined,
            2 => Self::Trx,
            3 => Self::ChgClass,
            _ => Self::NotJoined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    JoinReq,
    JoinDone,
    JoinFail,
    Commission,
    DutyCycle,
    MacReq,
    RadioEvt,
    Timeout,
    ReqClass,
    ClassChg,
}

impl Input {
    /// Table input of a request; `None` for requests served in any state.
    pub fn of(request: &WanRequest) -> Option<Self> {
        Some(match request {
            WanRequest::JoinReq => Self::JoinReq,
            WanRequest::JoinDone => Self::JoinDone,
            WanRequest::JoinFail => Self::JoinFail,
            WanRequest::Commission => Self::Commission,
            WanRequest::DutyCycle => Self::DutyCycle,
            WanRequest::MacReq => Self::MacReq,
            WanRequest::RadioEvt => Self::RadioEvt,
            WanRequest::Timeout => Self::Timeout,
            WanRequest::ReqClass(_) => Self::ReqClass,
            WanRequest::ClassChanged(_) => Self::ClassChg,
            WanRequest::JoinStatus { .. }
            | WanRequest::MacTx(_)
            | WanRequest::MacRx(_)
            | WanRequest::Restart(_) => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartJoin,
    RestartJoin,
    Commission,
    ProcessMac,
    ProcessRadio,
    SwitchClass,
    IndClass,
    StartTrx,
    TrxTimeout,
    DoNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Go { action: Action, next: State },
    Ignore,
}

pub fn transition(state: State, input: Input) -> Step {
    use Action::*;
    use Input::*;

    let (action, next) = match state {
        State::NotJoined => match input {
            JoinReq => (StartJoin, State::NotJoined),
            MacReq => (ProcessMac, State::NotJoined),
            RadioEvt => (ProcessRadio, State::NotJoined),
            JoinDone => (SwitchClass, State::ChgClass),
            JoinFail => (RestartJoin, State::NotJoined),
            Input::Commission => (Action::Commission, State::NotJoined),
            _ => return Step::Ignore,
        },
        State::Joined => match input {
            DutyCycle => (StartTrx, State::Trx),
            MacReq => (ProcessMac, State::Joined),
            RadioEvt => (ProcessRadio, State::Joined),
            JoinReq => (StartJoin, State::NotJoined),
            Input::Commission => (Action::Commission, State::NotJoined),
            ReqClass => (SwitchClass, State::ChgClass),
            _ => return Step::Ignore,
        },
        State::Trx => match input {
            DutyCycle => (StartTrx, State::Trx),
            MacReq => (ProcessMac, State::Trx),
            RadioEvt => (ProcessRadio, State::Trx),
            JoinReq => (StartJoin, State::NotJoined),
            Input::Commission => (Action::Commission, State::NotJoined),
            Timeout => (TrxTimeout, State::Joined),
            ReqClass => (SwitchClass, State::Trx),
            _ => return Step::Ignore,
        },
        State::ChgClass => match input {
            ReqClass => (SwitchClass, State::ChgClass),
            ClassChg => (IndClass, State::Joined),
            MacReq => (ProcessMac, State::ChgClass),
            DutyCycle => (DoNothing, State::ChgClass),
            RadioEvt => (ProcessRadio, State::ChgClass),
            JoinReq => (StartJoin, State::NotJoined),
            Input::Commission => (Action::Commission, State::NotJoined),
            Timeout => (TrxTimeout, State::ChgClass),
            _ => return Step::Ignore,
        },
    };
    Step::Go { action, next }
}

/// Uplink handed to the MAC and not yet resolved.
struct InFlight {
    header: TxHeader,
    data: Vec<u8>,
}

pub(crate) struct Processor {
    shared: Arc<WanShared>,
    state: State,
    manual: Option<State>,
    processing: Option<InFlight>,
    /// The in-flight message failed and is resent on the next duty cycle.
    retry: bool,
    class_pending: Option<DeviceClass>,
    msg_timer: Timer,
}

impl Processor {
    pub(crate) fn new(shared: Arc<WanShared>, runtime: Handle, joined: bool) -> Self {
        let weak = Arc::downgrade(&shared);
        let processor = Self {
            msg_timer: Timer::new("wan-msg-timeout", runtime, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.post(WanRequest::Timeout);
                }
            }),
            state: if joined { State::Joined } else { State::NotJoined },
            shared,
            manual: None,
            processing: None,
            retry: false,
            class_pending: None,
        };
        processor.publish();
        processor
    }

    pub(crate) fn handle(&mut self, request: WanRequest) {
        self.shared.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.manual = None;
        match request {
            WanRequest::JoinStatus { handle, reply } => {
                reply.store(self.state != State::NotJoined, Ordering::Release);
                self.shared.sync.release(handle);
            }
            WanRequest::MacTx(status) => self.on_mac_tx(status),
            WanRequest::MacRx(rx) => self.on_mac_rx(rx),
            WanRequest::Restart(region) => self.restart(region),
            request => self.step(request),
        }
        if let Some(next) = self.manual.take() {
            self.goto(next);
        }
        self.publish();
    }

    fn publish(&self) {
        self.shared.state.store(self.state as u8, Ordering::Relaxed);
        self.shared
            .processing
            .store(self.processing.is_some(), Ordering::Relaxed);
    }

    fn step(&mut self, request: WanRequest) {
        let step = match Input::of(&request) {
            Some(input) => transition(self.state, input),
            None => Step::Ignore,
        };
        let Step::Go { action, next } = step else {
            debug!("[{}] {}: ignored", self.state.name(), request.name());
            self.shared.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        };
        debug!(
            "[{}] {} -> {:?} -> [{}]",
            self.state.name(),
            request.name(),
            action,
            next.name()
        );
        self.run(action, &request);
        let next = self.manual.take().unwrap_or(next);
        self.goto(next);
    }

    fn goto(&mut self, next: State) {
        if next == self.state {
            return;
        }
        match next {
            State::NotJoined => self.shared.duty.suspend(),
            _ if self.state == State::NotJoined => self.shared.duty.resume(),
            _ => {}
        }
        info!("wan: {} -> {}", self.state.name(), next.name());
        self.state = next;
    }

    fn run(&mut self, action: Action, request: &WanRequest) {
        match action {
            Action::StartJoin => self.start_join(),
            Action::RestartJoin => {
                warn!("wan: join failed, retrying");
                self.shared.mac(|m| m.reset(None));
                self.start_join();
            }
            Action::Commission => self.commission(),
            Action::ProcessMac => self.shared.mac(|m| m.process()),
            Action::ProcessRadio => {
                let events = lock(&self.shared.radio).process_irqs();
                self.shared.mac(|m| {
                    m.process_radio(events);
                    m.process();
                });
            }
            Action::SwitchClass => {
                let class = match request {
                    WanRequest::ReqClass(class) => *class,
                    _ => self.shared.settings().class,
                };
                self.switch_class(class);
            }
            Action::IndClass => {
                if let WanRequest::ClassChanged(class) = request {
                    info!("wan: now in {}", class);
                }
                if let Some(class) = self.class_pending.take() {
                    self.change_class(class);
                    self.manual = Some(State::ChgClass);
                }
            }
            Action::StartTrx => {
                if self.shared.mac(|m| m.is_busy()) {
                    self.shared.mac(|m| m.process());
                } else {
                    self.trx_start();
                }
            }
            Action::TrxTimeout => {
                if let Some(msg) = self.processing.take() {
                    info!(
                        "wan: msg seq {} on port {} timed out",
                        msg.header.seq, msg.header.port
                    );
                    self.retry = false;
                    self.shared.mac(|m| m.cancel());
                    self.finish(&msg.header, IndKind::TxTimeout, TxInfo::for_msg(&msg.header));
                }
                if self.state == State::Trx {
                    self.after_processing();
                }
            }
            Action::DoNothing => {}
        }
    }

    fn start_join(&mut self) {
        self.cancel_ongoing();
        self.class_pending = None;
        if self.is_abp() {
            self.manual = Some(State::Joined);
        } else {
            self.shared.mac(|m| m.join());
        }
    }

    fn commission(&mut self) {
        self.cancel_ongoing();
        self.class_pending = None;
        let commission = lock(&self.shared.commission).get().clone();
        self.shared.mac(|m| m.reset(Some(&commission)));
        if commission.is_abp() {
            self.manual = Some(State::Joined);
        }
    }

    fn restart(&mut self, region: Region) {
        self.cancel_ongoing();
        self.class_pending = None;
        self.shared.mac(|m| {
            m.set_region(region);
            m.reset(None);
        });
        self.manual = Some(if self.is_abp() {
            State::Joined
        } else {
            State::NotJoined
        });
    }

    fn is_abp(&self) -> bool {
        lock(&self.shared.commission).get().is_abp()
    }

    fn switch_class(&mut self, class: DeviceClass) {
        let deferred = matches!(self.state, State::Trx | State::ChgClass)
            || self.shared.mac(|m| m.is_busy());
        if !deferred || self.state == State::NotJoined {
            self.change_class(class);
            return;
        }
        debug!("wan: {} deferred", class);
        self.class_pending = Some(class);
        if self.state == State::Joined {
            self.manual = Some(State::Joined);
        }
    }

    fn change_class(&mut self, class: DeviceClass) {
        if self.shared.mac(|m| m.current_class()) == class {
            self.shared.post(WanRequest::ClassChanged(class));
        } else {
            info!("wan: switching to {}", class);
            self.shared.mac(|m| m.change_class(class));
        }
    }

    fn trx_start(&mut self) {
        if let Some(msg) = &self.processing {
            if !self.retry {
                warn!("wan: msg seq {} still in flight", msg.header.seq);
                return;
            }
            self.retry = false;
            let now = self.shared.ports.now_ms();
            let header = msg.header;
            if header.has_timeout && header.expire_at <= now {
                self.processing = None;
                self.finish(&header, IndKind::TxTimeout, TxInfo::for_msg(&header));
                self.after_processing();
                return;
            }
            if header.has_timeout {
                self.msg_timer.start(Duration::from_millis(header.expire_at - now));
            }
            debug!("wan: resending msg seq {}, {} retries left", header.seq, header.retries);
            let data = msg.data.clone();
            self.shared
                .mac(|m| m.send(header.port, &data, header.confirm));
            return;
        }

        while let Some((header, data)) = self.shared.ports.get_tx_data() {
            let now = self.shared.ports.now_ms();
            if header.has_timeout && header.expire_at <= now {
                self.finish(&header, IndKind::TxTimeout, TxInfo::for_msg(&header));
                continue;
            }
            if header.has_timeout {
                self.msg_timer.start(Duration::from_millis(header.expire_at - now));
            }
            debug!(
                "wan: sending msg seq {} on port {} ({} bytes)",
                header.seq,
                header.port,
                data.len()
            );
            self.shared
                .mac(|m| m.send(header.port, &data, header.confirm));
            self.processing = Some(InFlight { header, data });
            return;
        }

        if self.shared.rx_listening.load(Ordering::Relaxed) {
            self.shared.mac(|m| m.send_empty());
        } else {
            self.shared.mac(|m| m.process());
            self.manual = Some(State::Joined);
        }
    }

    fn on_mac_tx(&mut self, status: TxStatus) {
        let Some(mut msg) = self.processing.take() else {
            if self.state == State::Trx {
                self.after_processing();
            }
            return;
        };
        self.msg_timer.stop();

        let info = TxInfo {
            ul_frame_counter: status.ul_counter,
            tx_power: status.tx_power,
            data_rate: status.data_rate,
            ..TxInfo::for_msg(&msg.header)
        };
        let ok = status.status == MacStatus::Ok && status.port == msg.header.port;
        let kind = match (ok, msg.header.confirm) {
            (true, true) if status.ack_received => Some(IndKind::TxConfirm),
            (true, false) => Some(IndKind::TxDone),
            _ if msg.header.retries > 0 => None,
            _ => Some(IndKind::TxFail),
        };

        match kind {
            Some(kind) => {
                self.finish(&msg.header, kind, info);
                self.after_processing();
            }
            None => {
                msg.header.retries -= 1;
                debug!(
                    "wan: msg seq {} not through ({:?}), {} retries left",
                    msg.header.seq, status.status, msg.header.retries
                );
                self.retry = true;
                self.processing = Some(msg);
            }
        }
    }

    fn on_mac_rx(&mut self, rx: RxStatus) {
        if self.state == State::NotJoined {
            debug!("wan: downlink while not joined dropped");
            return;
        }
        if rx.port != 0 && !rx.data.is_empty() {
            let info = RxInfo {
                dl_frame_counter: rx.dl_counter,
                rssi: rx.rssi,
                snr: rx.snr,
                data_rate: rx.data_rate,
            };
            match self.shared.ports.rx_indication(rx.port, &info, &rx.data) {
                Ok(()) => {
                    self.shared.counters.rx_data.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("wan: downlink on port {} dropped: {}", rx.port, e),
            }
        }
        if self.state == State::Trx && self.processing.is_none() {
            self.after_processing();
        }
    }

    fn finish(&self, header: &TxHeader, kind: IndKind, info: TxInfo) {
        self.shared.counters.record(kind);
        self.shared.ports.complete(header, kind, info);
    }

    /// Abort the message in flight with a `TxFail` indication.
    fn cancel_ongoing(&mut self) {
        self.msg_timer.stop();
        self.retry = false;
        if let Some(msg) = self.processing.take() {
            info!("wan: msg seq {} cancelled", msg.header.seq);
            self.finish(&msg.header, IndKind::TxFail, TxInfo::for_msg(&msg.header));
        }
    }

    fn after_processing(&mut self) {
        match self.class_pending.take() {
            Some(class) => {
                self.change_class(class);
                self.manual = Some(State::ChgClass);
            }
            None => self.manual = Some(State::Joined),
        }
    }
}

impl Drop for Processor {
    /// The consumer is gone: a message still in flight fails.
    fn drop(&mut self) {
        self.cancel_ongoing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [State; 4] = [State::NotJoined, State::Joined, State::Trx, State::ChgClass];

    const INPUTS: [Input; 10] = [
        Input::JoinReq,
        Input::JoinDone,
        Input::JoinFail,
        Input::Commission,
        Input::DutyCycle,
        Input::MacReq,
        Input::RadioEvt,
        Input::Timeout,
        Input::ReqClass,
        Input::ClassChg,
    ];

    fn go(action: Action, next: State) -> Step {
        Step::Go { action, next }
    }

    #[test]
    fn test_table_rows() {
        assert_eq!(
            transition(State::NotJoined, Input::JoinDone),
            go(Action::SwitchClass, State::ChgClass)
        );
        assert_eq!(
            transition(State::NotJoined, Input::JoinFail),
            go(Action::RestartJoin, State::NotJoined)
        );
        assert_eq!(
            transition(State::Joined, Input::DutyCycle),
            go(Action::StartTrx, State::Trx)
        );
        assert_eq!(
            transition(State::Trx, Input::Timeout),
            go(Action::TrxTimeout, State::Joined)
        );
        assert_eq!(
            transition(State::Trx, Input::ReqClass),
            go(Action::SwitchClass, State::Trx)
        );
        assert_eq!(
            transition(State::ChgClass, Input::ClassChg),
            go(Action::IndClass, State::Joined)
        );
        assert_eq!(
            transition(State::ChgClass, Input::DutyCycle),
            go(Action::DoNothing, State::ChgClass)
        );
    }

    #[test]
    fn test_join_and_commission_always_leave_to_not_joined() {
        for state in STATES {
            for input in [Input::JoinReq, Input::Commission] {
                match transition(state, input) {
                    Step::Go { next, .. } => assert_eq!(next, State::NotJoined),
                    Step::Ignore => panic!("{:?} ignores {:?}", state, input),
                }
            }
        }
    }

    #[test]
    fn test_not_joined_ignores_traffic() {
        assert_eq!(transition(State::NotJoined, Input::DutyCycle), Step::Ignore);
        assert_eq!(transition(State::NotJoined, Input::ReqClass), Step::Ignore);
        assert_eq!(transition(State::NotJoined, Input::Timeout), Step::Ignore);
        assert_eq!(transition(State::Joined, Input::JoinDone), Step::Ignore);
    }

    #[test]
    fn test_row_count() {
        let rows = STATES
            .iter()
            .flat_map(|s| INPUTS.iter().map(move |i| transition(*s, *i)))
            .filter(|step| matches!(step, Step::Go { .. }))
            .count();
        assert_eq!(rows, 27);
    }

    #[test]
    fn test_only_callback_requests_bypass_the_table() {
        assert!(Input::of(&WanRequest::MacReq).is_some());
        assert!(Input::of(&WanRequest::Restart(Region::Eu868)).is_none());
        assert_eq!(WanRequest::ReqClass(DeviceClass::C).name(), "request-class");
    }
}
