//! Consumer side of the raw mode: one order at a time through the table.

use super::fsm::{transition, Action, Input, State, Step};
use super::order::{Request, Response};
use super::RawShared;
use crate::event::{LoraEvent, RxPacket};
use crate::lock;
use crate::lora::{Radio, RadioEvent};
use crate::timer::Timer;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// Receive buffer size; longer frames are cut.
pub const RX_BUF_LEN: usize = 256;

#[derive(Debug, Clone, Copy)]
struct PendingRx {
    index: usize,
    max_len: usize,
}

pub(crate) struct Processor {
    shared: Arc<RawShared>,
    state: State,
    /// Set by an action that picks the next state itself.
    manual: Option<State>,
    rx_order: Option<PendingRx>,
    tx_order: Option<usize>,
    toa_timer: Timer,
    deadline: Timer,
    /// When the armed deadline is due; `None` while it is disarmed.
    deadline_at: Option<Instant>,
}

fn timer_post(shared: Weak<RawShared>, request: fn() -> Request) -> impl Fn() + Send + Sync {
    move || {
        if let Some(shared) = shared.upgrade() {
            shared.post_async(request());
        }
    }
}

impl Processor {
    pub(crate) fn new(shared: Arc<RawShared>, runtime: Handle) -> Self {
        let weak = Arc::downgrade(&shared);
        Self {
            toa_timer: Timer::new(
                "raw-toa",
                runtime.clone(),
                timer_post(weak.clone(), || Request::ToaExpired),
            ),
            deadline: Timer::new(
                "raw-deadline",
                runtime,
                timer_post(weak, || Request::OprTimeout),
            ),
            shared,
            state: State::Idle,
            manual: None,
            rx_order: None,
            tx_order: None,
            deadline_at: None,
        }
    }

    /// Service one order and drain everything it produced.
    pub(crate) fn handle(&mut self, index: usize) {
        let Some((request, sync)) = self.shared.pool.request(index) else {
            debug!("order[{}] no longer requested, skipping", index);
            return;
        };
        self.shared.counters.requests.fetch_add(1, Ordering::Relaxed);

        if request == Request::OprTimeout && !self.deadline_due() {
            debug!("[{}] stale {}: ignored", self.state.name(), request.name());
            self.shared.counters.ignored.fetch_add(1, Ordering::Relaxed);
            self.respond(index, Response::NoCallback);
            self.drain();
            return;
        }

        match &request {
            Request::RadioConfig => self.radio_config(index),
            Request::TxContWaveStart {
                freq_hz,
                power,
                duration,
            } => self.start_tx_cont_wave(index, *freq_hz, *power, *duration),
            _ => self.step(index, &request, sync),
        }

        self.shared.state.store(self.state as u8, Ordering::Relaxed);
        self.drain();
    }

    fn step(&mut self, index: usize, request: &Request, sync: bool) {
        let step = match Input::of(request) {
            Some(input) => transition(self.state, input),
            None => Step::Ignore,
        };
        let Step::Go { action, next } = step else {
            debug!("[{}] {}: ignored", self.state.name(), request.name());
            self.shared.counters.ignored.fetch_add(1, Ordering::Relaxed);
            self.respond(index, Response::NoCallback);
            return;
        };

        debug!(
            "[{}] {} -> {:?} -> [{}]",
            self.state.name(),
            request.name(),
            action,
            next.name()
        );
        if next != self.state {
            self.leave(self.state);
            self.enter(next, request);
        }
        self.manual = None;
        self.run(action, index, request, sync);
        self.state = self.manual.take().unwrap_or(next);
    }

    /// A queued deadline expiry counts only while the deadline that
    /// produced it is still the armed one.
    fn deadline_due(&self) -> bool {
        self.deadline_at.is_some_and(|at| Instant::now() >= at)
    }

    fn arm_deadline(&mut self, timeout: Duration) {
        self.deadline_at = Some(Instant::now() + timeout);
        self.deadline.start(timeout);
    }

    fn disarm_deadline(&mut self) {
        self.deadline_at = None;
        self.deadline.stop();
    }

    fn enter(&mut self, next: State, request: &Request) {
        match next {
            State::Idle | State::RxCont => self.disarm_deadline(),
            State::Tx | State::TxTemp => {
                if self.state != State::TxTemp {
                    let timeout = match request {
                        Request::Tx { timeout, .. } if !timeout.is_zero() => *timeout,
                        _ => self.params(|p| p.tx_timeout()),
                    };
                    self.arm_deadline(timeout);
                }
            }
            State::Rx => {
                if self.state == State::Idle {
                    let timeout = match request {
                        Request::Rx { timeout, .. } if !timeout.is_zero() => *timeout,
                        _ => self.params(|p| p.rx_timeout()),
                    };
                    self.arm_deadline(timeout);
                }
            }
            State::Toa | State::ToaTemp | State::TxCont => {}
        }
    }

    fn leave(&mut self, previous: State) {
        if matches!(previous, State::Toa | State::ToaTemp) {
            self.toa_timer.stop();
        }
    }

    fn run(&mut self, action: Action, index: usize, request: &Request, sync: bool) {
        match action {
            Action::StartTx => self.start_tx(index, request, sync),
            Action::StartRx => self.start_rx(index, request, sync),
            Action::ProcessIrq => self.process_irq(index),
            Action::HandleTxDone => self.handle_tx_done(index),
            Action::HandleTxTimeout => self.handle_tx_timeout(index),
            Action::HandleRxDone => {
                let packet = match request {
                    Request::RxDone(packet) => packet.clone(),
                    _ => RxPacket::default(),
                };
                self.handle_rx_done(index, packet);
            }
            Action::HandleRxTimeout => self.handle_rx_end(index, LoraEvent::RxTimeout),
            Action::HandleRxFail => self.handle_rx_end(index, LoraEvent::RxFail),
            Action::BackToRx => {
                self.shared.post_async(Request::RadioIrq);
                self.respond(index, Response::NoCallback);
            }
            Action::Postpone | Action::DoNothing => self.respond(index, Response::NoCallback),
            Action::StopRxCont | Action::RadioSleep => {
                self.radio(|r| r.sleep());
                self.respond(index, Response::NoCallback);
            }
        }
    }

    fn start_tx(&mut self, index: usize, request: &Request, sync: bool) {
        if let Some(rx) = self.rx_order.take() {
            self.respond(rx.index, Response::NoCallback);
        }
        if let Request::Tx { data, .. } = request {
            self.radio(|r| r.send(data));
        }
        if sync {
            self.tx_order = Some(index);
        } else {
            self.respond(index, Response::NoCallback);
        }
    }

    fn start_rx(&mut self, index: usize, request: &Request, sync: bool) {
        self.radio(|r| r.recv());
        if sync {
            let max_len = match request {
                Request::Rx { max_len, .. } => (*max_len).min(RX_BUF_LEN),
                _ => RX_BUF_LEN,
            };
            self.rx_order = Some(PendingRx { index, max_len });
        } else {
            self.respond(index, Response::NoCallback);
        }
    }

    fn process_irq(&mut self, index: usize) {
        if matches!(self.state, State::Rx | State::RxCont) {
            let flags = self.radio(|r| r.irq_flags());
            if flags.header_only() {
                let toa = self.params(|p| p.time_on_air());
                self.toa_timer.start(toa);
                self.manual = Some(if self.state == State::Rx {
                    State::Toa
                } else {
                    State::ToaTemp
                });
                self.respond(index, Response::NoCallback);
                return;
            }
        }

        let events = self.radio(|r| r.process_irqs());
        for event in events {
            self.shared.post_async(match event {
                RadioEvent::TxDone => Request::TxDone,
                RadioEvent::TxTimeout => Request::TxTimeout,
                RadioEvent::RxDone(packet) => Request::RxDone(packet),
                RadioEvent::RxTimeout => Request::RxTimeout,
                RadioEvent::RxError => Request::RxError,
                RadioEvent::CadDone(detected) => Request::CadDone(detected),
            });
        }
        self.respond(index, Response::NoCallback);
    }

    fn handle_tx_done(&mut self, index: usize) {
        let resume_rx = self.state == State::TxTemp;
        self.radio(|r| {
            r.sleep();
            if resume_rx {
                r.recv();
            }
        });

        match self.tx_order.take() {
            Some(tx) => {
                self.respond(tx, Response::event(LoraEvent::TxDone));
                self.respond(index, Response::NoCallback);
            }
            None => self.respond(index, Response::event(LoraEvent::TxDone)),
        }
    }

    fn handle_tx_timeout(&mut self, index: usize) {
        self.disarm_deadline();
        let resume_rx = self.state == State::TxTemp;
        self.radio(|r| {
            r.sleep();
            if resume_rx {
                r.recv();
            }
        });

        match self.tx_order.take() {
            Some(tx) => {
                let response = if self.shared.pool.is_sync(tx) {
                    Response::event(LoraEvent::TxTimeout)
                } else {
                    Response::NoCallback
                };
                self.respond(tx, response);
                self.respond(index, Response::NoCallback);
            }
            None => self.respond(index, Response::event(LoraEvent::TxTimeout)),
        }
    }

    fn handle_rx_done(&mut self, index: usize, mut packet: RxPacket) {
        if self.state != State::RxCont {
            self.radio(|r| r.sleep());
        }
        packet.data.truncate(RX_BUF_LEN);

        match self.rx_order.take() {
            Some(rx) => {
                packet.data.truncate(rx.max_len);
                self.respond(
                    rx.index,
                    Response::Event {
                        event: LoraEvent::RxDone,
                        rx: Some(packet),
                    },
                );
                self.respond(index, Response::NoCallback);
            }
            None => self.respond(
                index,
                Response::Event {
                    event: LoraEvent::RxDone,
                    rx: Some(packet),
                },
            ),
        }
    }

    /// Shared tail of rx-timeout and rx-fail.
    fn handle_rx_end(&mut self, index: usize, event: LoraEvent) {
        let continuous = self.state == State::RxCont;
        if event == LoraEvent::RxFail || !continuous {
            self.radio(|r| {
                r.sleep();
                if continuous {
                    r.recv();
                }
            });
        }

        match self.rx_order.take() {
            Some(rx) => {
                self.respond(rx.index, Response::event(event));
                self.respond(index, Response::NoCallback);
            }
            None => self.respond(index, Response::event(event)),
        }
    }

    /// Re-initialise the radio from the (re-synced) parameter record.
    fn radio_config(&mut self, index: usize) {
        info!("raw: reconfiguring radio");
        self.stop_timers();
        self.radio(|r| r.sleep());
        self.shared.configure_radio();
        self.state = State::Idle;
        self.respond(index, Response::NoCallback);
        self.cancel_all();
    }

    fn start_tx_cont_wave(&mut self, index: usize, freq_hz: u32, power: i8, duration: Duration) {
        info!(
            "raw: continuous wave at {} Hz, {} dBm for {:?}",
            freq_hz, power, duration
        );
        self.stop_timers();
        self.radio(|r| {
            r.sleep();
            r.tx_cont_wave(freq_hz, power, duration);
        });
        self.state = State::TxCont;
        self.respond(index, Response::NoCallback);
        self.cancel_all();
    }

    fn stop_timers(&mut self) {
        self.toa_timer.stop();
        self.disarm_deadline();
    }

    fn cancel_all(&mut self) {
        self.shared.pool.cancel_all(&self.shared.sync);
        self.rx_order = None;
        self.tx_order = None;
    }

    fn respond(&self, index: usize, response: Response) {
        self.shared.pool.respond(index, response);
    }

    fn drain(&self) {
        let deliveries = self.shared.pool.drain(&self.shared.sync);
        if deliveries.is_empty() {
            return;
        }
        let callback = lock(&self.shared.callback).clone();
        for delivery in deliveries {
            self.shared.counters.record(delivery.event);
            match &callback {
                Some(cb) => cb(delivery.event, delivery.rx.as_ref()),
                None => debug!("no callback for {}", delivery.event),
            }
        }
    }

    fn radio<T>(&self, f: impl FnOnce(&mut dyn Radio) -> T) -> T {
        let mut radio = lock(&self.shared.radio);
        f(&mut **radio)
    }

    fn params<T>(&self, f: impl FnOnce(&crate::lora::RadioParams) -> T) -> T {
        f(lock(&self.shared.params).get())
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop_timers();
        if self.tx_order.is_some() || self.rx_order.is_some() {
            warn!("raw processor stopped with a pending order");
        }
    }
}
