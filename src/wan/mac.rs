//! Seam to the LoRaWAN MAC stack.
//!
//! The MAC itself (framing, crypto, channel plans) lives outside this
//! crate. The WAN mode drives it through [`Mac`] and hears back through
//! [`MacEvents`], which only posts into the WAN mailbox and never blocks.

use super::commission::Commission;
use super::process::WanRequest;
use super::settings::{DeviceClass, WanSettings};
use crate::event_loop::Mailbox;
use crate::lock;
use crate::lora::{RadioEvent, Region};
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub type SharedMac = Arc<Mutex<Box<dyn Mac>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacStatus {
    Ok,
    Error,
    Timeout,
    Other,
}

/// Outcome of one uplink as reported by the MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    pub status: MacStatus,
    pub port: u8,
    pub ack_received: bool,
    pub ul_counter: u32,
    pub tx_power: i8,
    pub data_rate: i8,
}

/// A received downlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxStatus {
    pub port: u8,
    pub data: Vec<u8>,
    pub dl_counter: u32,
    pub rssi: i16,
    pub snr: i8,
    pub data_rate: i8,
}

/// Notification handle given to the MAC on [`Mac::init`].
#[derive(Clone)]
pub struct MacEvents {
    mailbox: Mailbox<WanRequest>,
}

impl MacEvents {
    pub(crate) fn new(mailbox: Mailbox<WanRequest>) -> Self {
        Self { mailbox }
    }

    pub fn join_result(&self, joined: bool) {
        self.post(if joined {
            WanRequest::JoinDone
        } else {
            WanRequest::JoinFail
        });
    }

    pub fn tx_status(&self, status: TxStatus) {
        self.post(WanRequest::MacTx(status));
    }

    pub fn rx_data(&self, status: RxStatus) {
        self.post(WanRequest::MacRx(status));
    }

    pub fn class_changed(&self, class: DeviceClass) {
        self.post(WanRequest::ClassChanged(class));
    }

    /// The MAC has pending work and wants [`Mac::process`] called.
    pub fn process_notify(&self) {
        self.post(WanRequest::MacReq);
    }

    fn post(&self, request: WanRequest) {
        if !self.mailbox.post(request) {
            debug!("mac: wan mode gone, notification dropped");
        }
    }
}

/// LoRaWAN MAC driven by the WAN mode consumer thread.
pub trait Mac: Send {
    fn init(&mut self, events: MacEvents, commission: &Commission, settings: &WanSettings);

    fn is_joined(&self) -> bool;

    /// Start an OTAA join. The result arrives via [`MacEvents::join_result`].
    fn join(&mut self);

    /// Drop the session. `Some` also replaces the credentials.
    fn reset(&mut self, commission: Option<&Commission>);

    fn send(&mut self, port: u8, data: &[u8], confirm: bool);

    /// Uplink without payload, opening receive windows.
    fn send_empty(&mut self);

    /// Negotiate a class change with the network.
    fn change_class(&mut self, class: DeviceClass);

    /// Set the class used after the next join, without negotiation.
    fn set_class(&mut self, class: DeviceClass);

    fn current_class(&self) -> DeviceClass;

    fn is_busy(&self) -> bool;

    fn process(&mut self);

    fn process_radio(&mut self, events: Vec<RadioEvent>);

    fn set_region(&mut self, region: Region);

    /// Abort whatever the MAC is doing.
    fn cancel(&mut self);
}

#[derive(Debug, Clone, Copy)]
struct ScriptedTx {
    status: MacStatus,
    ack: bool,
}

#[derive(Default)]
struct SimMacState {
    events: Option<MacEvents>,
    joined: bool,
    abp: bool,
    class: DeviceClass,
    region: Option<Region>,
    busy: bool,
    silent: bool,
    fail_joins: usize,
    ul_counter: u32,
    dl_counter: u32,
    script: VecDeque<ScriptedTx>,
    downlinks: VecDeque<(u8, Vec<u8>)>,
    sent: Vec<(u8, Vec<u8>, bool)>,
    joins: usize,
    resets: usize,
    processed: usize,
    radio_events: usize,
    cancels: usize,
}

/// Scripted MAC for host builds and tests.
///
/// Joins succeed and uplinks are acknowledged unless the paired
/// [`SimMacHandle`] scripts otherwise. A queued downlink is delivered
/// right after the next uplink, as in a class A receive window.
pub struct SimMac {
    state: Arc<Mutex<SimMacState>>,
}

#[derive(Clone)]
pub struct SimMacHandle {
    state: Arc<Mutex<SimMacState>>,
}

impl SimMac {
    pub fn new() -> (Self, SimMacHandle) {
        let state = Arc::new(Mutex::new(SimMacState::default()));
        (
            Self {
                state: state.clone(),
            },
            SimMacHandle { state },
        )
    }

    fn uplink(&mut self, port: u8, data: &[u8], confirm: bool) {
        let mut s = lock(&self.state);
        s.sent.push((port, data.to_vec(), confirm));
        s.ul_counter += 1;
        if s.silent {
            return;
        }
        let outcome = s.script.pop_front().unwrap_or(ScriptedTx {
            status: MacStatus::Ok,
            ack: confirm,
        });
        let status = TxStatus {
            status: outcome.status,
            port,
            ack_received: outcome.ack,
            ul_counter: s.ul_counter,
            tx_power: 14,
            data_rate: 5,
        };
        let downlink = s.downlinks.pop_front().map(|(port, data)| {
            s.dl_counter += 1;
            RxStatus {
                port,
                data,
                dl_counter: s.dl_counter,
                rssi: -60,
                snr: 7,
                data_rate: 5,
            }
        });
        let events = s.events.clone();
        drop(s);

        if let Some(events) = events {
            events.tx_status(status);
            if let Some(rx) = downlink {
                events.rx_data(rx);
            }
        }
    }
}

impl Mac for SimMac {
    fn init(&mut self, events: MacEvents, commission: &Commission, settings: &WanSettings) {
        let mut s = lock(&self.state);
        s.events = Some(events);
        s.abp = commission.is_abp();
        s.joined = s.abp;
        s.class = settings.class;
        s.region = Some(settings.region);
    }

    fn is_joined(&self) -> bool {
        lock(&self.state).joined
    }

    fn join(&mut self) {
        let (events, result) = {
            let mut s = lock(&self.state);
            s.joins += 1;
            if s.silent {
                return;
            }
            let result = if s.fail_joins > 0 {
                s.fail_joins -= 1;
                false
            } else {
                true
            };
            s.joined = result;
            (s.events.clone(), result)
        };
        if let Some(events) = events {
            events.join_result(result);
        }
    }

    fn reset(&mut self, commission: Option<&Commission>) {
        let mut s = lock(&self.state);
        s.resets += 1;
        if let Some(commission) = commission {
            s.abp = commission.is_abp();
        }
        s.joined = s.abp;
        s.ul_counter = 0;
        s.dl_counter = 0;
    }

    fn send(&mut self, port: u8, data: &[u8], confirm: bool) {
        self.uplink(port, data, confirm);
    }

    fn send_empty(&mut self) {
        self.uplink(0, &[], false);
    }

    fn change_class(&mut self, class: DeviceClass) {
        let events = {
            let mut s = lock(&self.state);
            s.class = class;
            s.events.clone()
        };
        if let Some(events) = events {
            events.class_changed(class);
        }
    }

    fn set_class(&mut self, class: DeviceClass) {
        lock(&self.state).class = class;
    }

    fn current_class(&self) -> DeviceClass {
        lock(&self.state).class
    }

    fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    fn process(&mut self) {
        lock(&self.state).processed += 1;
    }

    fn process_radio(&mut self, events: Vec<RadioEvent>) {
        lock(&self.state).radio_events += events.len();
    }

    fn set_region(&mut self, region: Region) {
        lock(&self.state).region = Some(region);
    }

    fn cancel(&mut self) {
        lock(&self.state).cancels += 1;
    }
}

impl SimMacHandle {
    /// Outcome for the next uplink that has no other script.
    pub fn script_tx(&self, status: MacStatus, ack: bool) {
        lock(&self.state).script.push_back(ScriptedTx { status, ack });
    }

    pub fn queue_downlink(&self, port: u8, data: &[u8]) {
        lock(&self.state).downlinks.push_back((port, data.to_vec()));
    }

    pub fn fail_joins(&self, count: usize) {
        lock(&self.state).fail_joins = count;
    }

    /// Stop reporting anything back, as a MAC that lost the network.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    pub fn set_busy(&self, busy: bool) {
        lock(&self.state).busy = busy;
    }

    /// Uplinks as `(port, payload, confirmed)`; empty frames use port 0.
    pub fn sent(&self) -> Vec<(u8, Vec<u8>, bool)> {
        lock(&self.state).sent.clone()
    }

    pub fn joins(&self) -> usize {
        lock(&self.state).joins
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }

    pub fn cancels(&self) -> usize {
        lock(&self.state).cancels
    }

    pub fn class(&self) -> DeviceClass {
        lock(&self.state).class
    }

    pub fn region(&self) -> Option<Region> {
        lock(&self.state).region
    }

    pub fn radio_events(&self) -> usize {
        lock(&self.state).radio_events
    }
}
