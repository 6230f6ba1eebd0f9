//! Application ports of the WAN mode.
//!
//! Every open port owns three FIFO chains: outgoing messages, incoming
//! data, and indications (terminal events of outgoing messages). Chains
//! store byte-encoded messages in two shared arenas, one for the outgoing
//! direction and one for incoming data plus indications, so a flood in one
//! direction cannot starve the other.
//!
//! Outgoing messages may carry an absolute deadline. One timer per port is
//! kept armed for the earliest deadline still queued; on expiry the port is
//! rescanned, expired messages are dropped with a `TxTimeout` indication,
//! and the timer is re-armed.
//!
//! # Example
//!
//! ```ignore
//! let ports = PortTable::new(&ctx);
//! ports.open(5)?;
//! ports.send(&TxParams::new(b"ping").port(5))?;
//! let (header, data) = ports.get_tx_data().unwrap();
//! ports.complete(&header, IndKind::TxDone, TxInfo::for_msg(&header));
//! assert_eq!(ports.get_ind_params().event(), LoraEvent::TxDone);
//! ```

use super::arena::{Arena, Block};
use crate::codec::{Reader, Writer};
use crate::context::StackContext;
use crate::error::PortError;
use crate::event::{EventCallback, LoraEvent, PortSelector, RxPacket, TxParams};
use crate::lock;
use crate::sync_pool::{SyncHandle, SyncPool};
use crate::timer::Timer;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

pub const MIN_PORT: u8 = 1;
pub const MAX_PORT: u8 = 250;

/// Encoded size of [`TxHeader`].
pub const TX_HEADER_LEN: usize = 28;
const IND_MSG_LEN: usize = 16;
const RX_HEADER_LEN: usize = 8;

/// Longest a full indication chain may hold up the producer.
const INDICATION_WAIT: Duration = Duration::from_secs(1);

const FLAG_TIMEOUT: u8 = 1 << 0;
const FLAG_SYNC: u8 = 1 << 1;
const FLAG_CONFIRM: u8 = 1 << 2;

/// Header stored in front of every outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHeader {
    pub port: u8,
    pub retries: u8,
    pub len: u8,
    pub has_timeout: bool,
    pub sync: bool,
    pub confirm: bool,
    /// Deadline in milliseconds since the table was created.
    pub expire_at: u64,
    pub handle: Option<SyncHandle>,
    pub seq: u32,
    pub app_id: u32,
}

impl TxHeader {
    fn encode(&self) -> [u8; TX_HEADER_LEN] {
        let mut out = [0u8; TX_HEADER_LEN];
        let mut flags = 0;
        if self.has_timeout {
            flags |= FLAG_TIMEOUT;
        }
        if self.sync {
            flags |= FLAG_SYNC;
        }
        if self.confirm {
            flags |= FLAG_CONFIRM;
        }
        Writer::new(&mut out)
            .u8(self.port)
            .u8(self.retries)
            .u8(self.len)
            .u8(flags)
            .u64(self.expire_at)
            .u64(self.handle.map_or(0, SyncHandle::to_bits))
            .u32(self.seq)
            .u32(self.app_id);
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut r = Reader::new(bytes);
        let port = r.u8();
        let retries = r.u8();
        let len = r.u8();
        let flags = r.u8();
        let expire_at = r.u64();
        let handle = r.u64();
        let sync = flags & FLAG_SYNC != 0;
        Self {
            port,
            retries,
            len,
            has_timeout: flags & FLAG_TIMEOUT != 0,
            sync,
            confirm: flags & FLAG_CONFIRM != 0,
            expire_at,
            handle: sync.then(|| SyncHandle::from_bits(handle)),
            seq: r.u32(),
            app_id: r.u32(),
        }
    }
}

/// Indication kinds queued on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndKind {
    TxTimeout = 0,
    TxDone = 1,
    TxFail = 2,
    TxConfirm = 3,
    RxDone = 4,
    RxTimeout = 5,
}

impl IndKind {
    pub fn event(self) -> LoraEvent {
        match self {
            Self::TxTimeout => LoraEvent::TxTimeout,
            Self::TxDone => LoraEvent::TxDone,
            Self::TxFail => LoraEvent::TxFail,
            Self::TxConfirm => LoraEvent::TxConfirm,
            Self::RxDone => LoraEvent::RxDone,
            Self::RxTimeout => LoraEvent::RxTimeout,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::TxDone,
            2 => Self::TxFail,
            3 => Self::TxConfirm,
            4 => Self::RxDone,
            5 => Self::RxTimeout,
            _ => Self::TxTimeout,
        }
    }
}

/// Details of an outgoing message's terminal event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxInfo {
    pub seq: u32,
    pub app_id: u32,
    pub ul_frame_counter: u32,
    pub tx_power: i8,
    pub data_rate: i8,
}

impl TxInfo {
    /// Identification of `header` with no radio details.
    pub fn for_msg(header: &TxHeader) -> Self {
        Self {
            seq: header.seq,
            app_id: header.app_id,
            ..Self::default()
        }
    }
}

/// Details of a received downlink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RxInfo {
    pub dl_frame_counter: u32,
    pub rssi: i16,
    pub snr: i8,
    pub data_rate: i8,
}

fn encode_ind(kind: IndKind, info: &TxInfo) -> [u8; IND_MSG_LEN] {
    let mut out = [0u8; IND_MSG_LEN];
    Writer::new(&mut out)
        .u8(kind as u8)
        .u32(info.seq)
        .u32(info.app_id)
        .u32(info.ul_frame_counter)
        .i8(info.tx_power)
        .i8(info.data_rate);
    out
}

fn decode_ind(bytes: &[u8]) -> (IndKind, TxInfo) {
    let mut r = Reader::new(bytes);
    let kind = IndKind::from_u8(r.u8());
    let info = TxInfo {
        seq: r.u32(),
        app_id: r.u32(),
        ul_frame_counter: r.u32(),
        tx_power: r.i8(),
        data_rate: r.i8(),
    };
    (kind, info)
}

fn encode_rx(info: &RxInfo) -> [u8; RX_HEADER_LEN] {
    let mut out = [0u8; RX_HEADER_LEN];
    Writer::new(&mut out)
        .u32(info.dl_frame_counter)
        .i16(info.rssi)
        .i8(info.snr)
        .i8(info.data_rate);
    out
}

fn decode_rx(bytes: &[u8]) -> RxInfo {
    let mut r = Reader::new(bytes);
    RxInfo {
        dl_frame_counter: r.u32(),
        rssi: r.i16(),
        snr: r.i8(),
        data_rate: r.i8(),
    }
}

/// One pending item as reported by [`PortTable::get_ind_params`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    /// Nothing pending on any port.
    None,
    Tx {
        port: u8,
        event: LoraEvent,
        info: TxInfo,
    },
    Rx {
        port: u8,
        info: RxInfo,
        data: Vec<u8>,
    },
}

impl Indication {
    pub fn event(&self) -> LoraEvent {
        match self {
            Self::None => LoraEvent::None,
            Self::Tx { event, .. } => *event,
            Self::Rx { .. } => LoraEvent::RxDone,
        }
    }
}

/// How a synchronous send ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Event(IndKind),
    /// The port was closed while the message was still queued.
    Closed,
}

/// Result of [`PortTable::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub seq: u32,
    /// Set for synchronous sends.
    pub terminal: Option<Terminal>,
}

/// Chain and arena occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortUsage {
    pub open: Vec<u8>,
    pub tx_queued: usize,
    pub rx_queued: usize,
    pub ind_queued: usize,
    pub tx_arena_used: usize,
    pub tx_arena_capacity: usize,
    pub rx_arena_used: usize,
    pub rx_arena_capacity: usize,
}

struct Port {
    num: u8,
    seq: u32,
    tx: VecDeque<Block>,
    rx: VecDeque<Block>,
    ind: VecDeque<Block>,
    callback: Option<EventCallback>,
    timer: Timer,
}

struct PortsInner {
    /// Open ports in open order.
    ports: Vec<Port>,
    tx_arena: Arena,
    rx_arena: Arena,
    common_callback: Option<EventCallback>,
    outcomes: HashMap<(u8, u32), Terminal>,
}

fn find(ports: &mut [Port], num: u8) -> Option<&mut Port> {
    ports.iter_mut().find(|p| p.num == num)
}

fn check_num(num: u8) -> Result<(), PortError> {
    if (MIN_PORT..=MAX_PORT).contains(&num) {
        Ok(())
    } else {
        error!(
            "invalid lora port number: {} (allowed {}..={})",
            num, MIN_PORT, MAX_PORT
        );
        Err(PortError::BadNum)
    }
}

/// All open ports and their shared arenas.
pub struct PortTable {
    inner: Mutex<PortsInner>,
    sync: Arc<SyncPool>,
    runtime: Handle,
    epoch: Instant,
    max_app_ports: usize,
    /// Signalled when incoming data arrives or a port closes.
    rx_ready: Condvar,
    /// Signalled when incoming-arena space is freed.
    rx_space: Condvar,
    me: Weak<PortTable>,
}

impl PortTable {
    pub fn new(ctx: &StackContext) -> Arc<Self> {
        let config = &ctx.config;
        Arc::new_cyclic(|me| Self {
            inner: Mutex::new(PortsInner {
                ports: Vec::new(),
                tx_arena: Arena::new("tx", config.tx_arena_bytes, config.arena_unit_bytes),
                rx_arena: Arena::new("rx", config.rx_arena_bytes, config.arena_unit_bytes),
                common_callback: None,
                outcomes: HashMap::new(),
            }),
            sync: ctx.sync.clone(),
            runtime: ctx.runtime.clone(),
            epoch: Instant::now(),
            max_app_ports: config.max_app_ports,
            rx_ready: Condvar::new(),
            rx_space: Condvar::new(),
            me: me.clone(),
        })
    }

    /// Milliseconds since the table was created; the time base of
    /// [`TxHeader::expire_at`].
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn open(&self, num: u8) -> Result<(), PortError> {
        check_num(num)?;
        let mut inner = lock(&self.inner);
        if inner.ports.iter().any(|p| p.num == num) {
            return Err(PortError::InUse);
        }
        if inner.ports.len() >= self.max_app_ports {
            warn!(
                "opening port {} exceeds {} application ports",
                num, self.max_app_ports
            );
        }

        let me = self.me.clone();
        let timer = Timer::new("port-tx-timeout", self.runtime.clone(), move || {
            if let Some(table) = me.upgrade() {
                table.reschedule(num);
            }
        });
        let callback = inner.common_callback.clone();
        inner.ports.push(Port {
            num,
            seq: 0,
            tx: VecDeque::new(),
            rx: VecDeque::new(),
            ind: VecDeque::new(),
            callback,
            timer,
        });
        info!("port {} opened", num);
        Ok(())
    }

    /// Close a port, dropping everything it still holds. Synchronous
    /// senders of queued messages are released with [`Terminal::Closed`].
    pub fn close(&self, num: u8) -> Result<(), PortError> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let Some(at) = inner.ports.iter().position(|p| p.num == num) else {
            return Err(PortError::NotOpened);
        };
        let port = inner.ports.remove(at);
        port.timer.stop();

        let mut waiters = Vec::new();
        for block in port.tx {
            let header = TxHeader::decode(inner.tx_arena.read(&block));
            inner.tx_arena.free(block);
            if let Some(handle) = header.handle {
                inner.outcomes.insert((num, header.seq), Terminal::Closed);
                waiters.push(handle);
            }
        }
        for block in port.rx.into_iter().chain(port.ind) {
            inner.rx_arena.free(block);
        }
        drop(guard);

        for handle in waiters {
            self.sync.release(handle);
        }
        self.rx_ready.notify_all();
        self.rx_space.notify_all();
        info!("port {} closed", num);
        Ok(())
    }

    pub fn close_all(&self) {
        for num in self.open_ports() {
            let _ = self.close(num);
        }
    }

    pub fn is_open(&self, num: u8) -> bool {
        lock(&self.inner).ports.iter().any(|p| p.num == num)
    }

    pub fn open_ports(&self) -> Vec<u8> {
        lock(&self.inner).ports.iter().map(|p| p.num).collect()
    }

    /// Queue an outgoing message. A synchronous send blocks until the
    /// message reaches a terminal event or its port is closed.
    pub fn send(&self, params: &TxParams<'_>) -> Result<Sent, PortError> {
        check_num(params.port)?;
        let num = params.port;
        let Ok(len) = u8::try_from(params.data.len()) else {
            warn!("port {}: {} byte payload too long", num, params.data.len());
            return Err(PortError::NoMemory);
        };

        let header = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let Some(port) = find(&mut inner.ports, num) else {
                error!("sending on closed port {}", num);
                return Err(PortError::NotOpened);
            };

            let seq = port.seq;
            port.seq = port.seq.wrapping_add(1);
            let has_timeout = !params.timeout.is_zero();
            let header = TxHeader {
                port: num,
                retries: params.retries,
                len,
                has_timeout,
                sync: params.sync,
                confirm: params.confirm,
                expire_at: if has_timeout {
                    self.now_ms() + params.timeout.as_millis() as u64
                } else {
                    0
                },
                handle: params.sync.then(|| self.sync.acquire("lora-wan-tx-msg")),
                seq,
                app_id: params.app_id,
            };

            match inner.tx_arena.write(&[&header.encode(), params.data]) {
                Ok(block) => port.tx.push_back(block),
                Err(e) => {
                    if let Some(handle) = header.handle {
                        self.sync.release(handle);
                    }
                    return Err(e);
                }
            }
            info!(
                "port {}: queued msg seq {} app_id {} len {} sync {} confirm {} timeout {:?}",
                num, seq, params.app_id, len, params.sync, params.confirm, params.timeout
            );
            header
        };

        if header.has_timeout {
            self.reschedule(num);
        }

        let terminal = header.handle.map(|handle| {
            self.sync.wait(&handle);
            lock(&self.inner)
                .outcomes
                .remove(&(num, header.seq))
                .unwrap_or_else(|| {
                    warn!("port {}: msg {} released without outcome", num, header.seq);
                    Terminal::Closed
                })
        });
        Ok(Sent {
            seq: header.seq,
            terminal,
        })
    }

    /// Take the oldest incoming frame of a port.
    ///
    /// Without `blocking` an empty chain is `NoRxData`. Blocking waits for
    /// data, up to `timeout` when it is non-zero.
    pub fn receive(
        &self,
        num: u8,
        max_len: usize,
        blocking: bool,
        timeout: Duration,
    ) -> Result<RxPacket, PortError> {
        check_num(num)?;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut guard = lock(&self.inner);
        loop {
            let inner = &mut *guard;
            let port = find(&mut inner.ports, num).ok_or(PortError::NotOpened)?;
            if let Some(block) = port.rx.pop_front() {
                let bytes = inner.rx_arena.take(block);
                drop(guard);
                self.rx_space.notify_all();

                let info = decode_rx(&bytes);
                let mut data = bytes[RX_HEADER_LEN.min(bytes.len())..].to_vec();
                data.truncate(max_len);
                return Ok(RxPacket {
                    data,
                    rssi: info.rssi,
                    snr: info.snr,
                });
            }
            if !blocking {
                return Err(PortError::NoRxData);
            }
            guard = match deadline {
                None => self
                    .rx_ready
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PortError::NoRxData);
                    }
                    self.rx_ready
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Dequeue the first outgoing message, scanning ports in open order.
    pub fn get_tx_data(&self) -> Option<(TxHeader, Vec<u8>)> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        for port in inner.ports.iter_mut() {
            if let Some(block) = port.tx.pop_front() {
                let bytes = inner.tx_arena.take(block);
                let header = TxHeader::decode(&bytes);
                let end = (TX_HEADER_LEN + header.len as usize).min(bytes.len());
                return Some((header, bytes[TX_HEADER_LEN..end].to_vec()));
            }
        }
        None
    }

    pub fn is_pending_tx(&self) -> bool {
        lock(&self.inner).ports.iter().any(|p| !p.tx.is_empty())
    }

    /// Deliver downlink data to a port. Never blocks: a full arena drops the
    /// frame with `NoMemory`.
    pub fn rx_indication(&self, num: u8, info: &RxInfo, data: &[u8]) -> Result<(), PortError> {
        let callback = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let Some(port) = find(&mut inner.ports, num) else {
                error!("incoming rx data on closed port {}", num);
                return Err(PortError::NotOpened);
            };
            let block = inner.rx_arena.write(&[&encode_rx(info), data])?;
            port.rx.push_back(block);
            port.callback.clone()
        };
        self.rx_ready.notify_all();
        if let Some(cb) = callback {
            cb(LoraEvent::Indication, None);
        }
        Ok(())
    }

    /// Queue an indication on a port, waiting a bounded time for arena
    /// space.
    pub fn indication(&self, num: u8, kind: IndKind, info: &TxInfo) -> Result<(), PortError> {
        let deadline = Instant::now() + INDICATION_WAIT;
        let encoded = encode_ind(kind, info);
        let mut guard = lock(&self.inner);
        let callback = loop {
            let inner = &mut *guard;
            let Some(port) = find(&mut inner.ports, num) else {
                debug!("indication {:?} on closed port {}", kind, num);
                return Err(PortError::NotOpened);
            };
            if let Ok(block) = inner.rx_arena.write(&[&encoded]) {
                port.ind.push_back(block);
                break port.callback.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("port {}: indication {:?} dropped, arena full", num, kind);
                return Err(PortError::NoMemory);
            }
            guard = self
                .rx_space
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        drop(guard);

        debug!("port {}: indication {:?} seq {}", num, kind, info.seq);
        if let Some(cb) = callback {
            cb(LoraEvent::Indication, None);
        }
        Ok(())
    }

    /// Report a terminal event for a message taken off its chain: queue
    /// the indication and release a synchronous sender.
    pub fn complete(&self, header: &TxHeader, kind: IndKind, info: TxInfo) {
        let _ = self.indication(header.port, kind, &info);
        if let Some(handle) = header.handle {
            lock(&self.inner)
                .outcomes
                .insert((header.port, header.seq), Terminal::Event(kind));
            self.sync.release(handle);
        }
    }

    /// Pop one pending item: indications of every port first, then
    /// incoming data.
    pub fn get_ind_params(&self) -> Indication {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        let mut found = None;
        for port in inner.ports.iter_mut() {
            if let Some(block) = port.ind.pop_front() {
                let (kind, info) = decode_ind(inner.rx_arena.read(&block));
                inner.rx_arena.free(block);
                found = Some(Indication::Tx {
                    port: port.num,
                    event: kind.event(),
                    info,
                });
                break;
            }
        }
        if found.is_none() {
            for port in inner.ports.iter_mut() {
                if let Some(block) = port.rx.pop_front() {
                    let bytes = inner.rx_arena.take(block);
                    found = Some(Indication::Rx {
                        port: port.num,
                        info: decode_rx(&bytes),
                        data: bytes[RX_HEADER_LEN.min(bytes.len())..].to_vec(),
                    });
                    break;
                }
            }
        }
        drop(guard);

        match found {
            Some(ind) => {
                self.rx_space.notify_all();
                ind
            }
            None => Indication::None,
        }
    }

    /// Register a callback for one port, or for every port with
    /// [`PortSelector::Any`]. The common callback also goes to ports
    /// opened later and to open ports that have none.
    pub fn set_callback(&self, selector: PortSelector, callback: EventCallback) -> Result<(), PortError> {
        let mut inner = lock(&self.inner);
        match selector {
            PortSelector::Any => {
                for port in inner.ports.iter_mut().filter(|p| p.callback.is_none()) {
                    port.callback = Some(callback.clone());
                }
                inner.common_callback = Some(callback);
                Ok(())
            }
            PortSelector::Port(num) => match find(&mut inner.ports, num) {
                Some(port) => {
                    port.callback = Some(callback);
                    Ok(())
                }
                None => {
                    error!("set callback on closed port {}", num);
                    Err(PortError::NotOpened)
                }
            },
        }
    }

    pub fn usage(&self) -> PortUsage {
        let inner = lock(&self.inner);
        PortUsage {
            open: inner.ports.iter().map(|p| p.num).collect(),
            tx_queued: inner.ports.iter().map(|p| p.tx.len()).sum(),
            rx_queued: inner.ports.iter().map(|p| p.rx.len()).sum(),
            ind_queued: inner.ports.iter().map(|p| p.ind.len()).sum(),
            tx_arena_used: inner.tx_arena.used_bytes(),
            tx_arena_capacity: inner.tx_arena.capacity(),
            rx_arena_used: inner.rx_arena.used_bytes(),
            rx_arena_capacity: inner.rx_arena.capacity(),
        }
    }

    /// Drop expired messages of a port and re-arm its timer for the
    /// earliest remaining deadline.
    fn reschedule(&self, num: u8) {
        let now = self.now_ms();
        let mut expired = Vec::new();
        {
            let mut guard: MutexGuard<'_, PortsInner> = lock(&self.inner);
            let inner = &mut *guard;
            let Some(port) = find(&mut inner.ports, num) else {
                return;
            };

            let mut next: Option<u64> = None;
            let mut kept = VecDeque::with_capacity(port.tx.len());
            while let Some(block) = port.tx.pop_front() {
                let header = TxHeader::decode(inner.tx_arena.read(&block));
                if header.has_timeout {
                    if header.expire_at <= now {
                        inner.tx_arena.free(block);
                        expired.push(header);
                        continue;
                    }
                    let remaining = header.expire_at - now;
                    next = Some(next.map_or(remaining, |n| n.min(remaining)));
                }
                kept.push_back(block);
            }
            port.tx = kept;

            port.timer.stop();
            match next {
                Some(ms) => port.timer.start(Duration::from_millis(ms)),
                None => debug!("port {}: no message with a deadline", num),
            }
        }

        for header in expired {
            info!(
                "port {}: msg seq {} app_id {} expired at {} ms",
                num, header.seq, header.app_id, header.expire_at
            );
            self.complete(&header, IndKind::TxTimeout, TxInfo::for_msg(&header));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoraConfig;
    use crate::context::fixtures;
    use std::thread;

    fn table() -> Arc<PortTable> {
        let (ctx, _) = fixtures::context();
        PortTable::new(&ctx)
    }

    #[test]
    fn test_open_rules() {
        let ports = table();
        assert_eq!(ports.open(0), Err(PortError::BadNum));
        assert_eq!(ports.open(251), Err(PortError::BadNum));
        ports.open(5).unwrap();
        assert_eq!(ports.open(5), Err(PortError::InUse));
        assert_eq!(ports.close(6), Err(PortError::NotOpened));
        ports.close(5).unwrap();
        ports.open(5).unwrap();
    }

    #[test]
    fn test_open_beyond_app_port_limit_succeeds() {
        let ports = table();
        for num in 1..=12 {
            ports.open(num).unwrap();
        }
        assert_eq!(ports.open_ports().len(), 12);
    }

    #[test]
    fn test_send_then_dequeue_in_open_order() {
        let ports = table();
        ports.open(9).unwrap();
        ports.open(3).unwrap();

        ports.send(&TxParams::new(b"three").port(3)).unwrap();
        let sent = ports.send(&TxParams::new(b"nine").port(9).app_id(7)).unwrap();
        assert_eq!(sent, Sent { seq: 0, terminal: None });
        let again = ports.send(&TxParams::new(b"nine2").port(9)).unwrap();
        assert_eq!(again.seq, 1);
        assert!(ports.is_pending_tx());

        let (header, data) = ports.get_tx_data().unwrap();
        assert_eq!((header.port, header.app_id, data.as_slice()), (9, 7, &b"nine"[..]));
        assert_eq!(ports.get_tx_data().unwrap().1, b"nine2");
        assert_eq!(ports.get_tx_data().unwrap().1, b"three");
        assert!(ports.get_tx_data().is_none());
        assert!(!ports.is_pending_tx());
    }

    #[test]
    fn test_send_errors() {
        let ports = table();
        assert_eq!(
            ports.send(&TxParams::new(b"x").port(4)),
            Err(PortError::NotOpened)
        );
        assert_eq!(ports.send(&TxParams::new(b"x").port(0)), Err(PortError::BadNum));
    }

    #[test]
    fn test_send_without_memory() {
        let config = LoraConfig {
            tx_arena_bytes: 64,
            ..LoraConfig::default()
        };
        let (ctx, _) = fixtures::context_with(config);
        let ports = PortTable::new(&ctx);
        ports.open(1).unwrap();

        ports.send(&TxParams::new(&[0u8; 4]).port(1)).unwrap();
        assert_eq!(
            ports.send(&TxParams::new(&[0u8; 40]).port(1)),
            Err(PortError::NoMemory)
        );
        // Sync handle of the rejected message went back to the pool.
        assert_eq!(ctx.sync.in_use(), 0);
    }

    #[test]
    fn test_timeouts_fire_in_deadline_order() {
        let ports = table();
        ports.open(5).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let weak = Arc::downgrade(&ports);
        let s = seen.clone();
        ports
            .set_callback(
                PortSelector::Port(5),
                Arc::new(move |_: LoraEvent, _: Option<&RxPacket>| {
                    if let Some(table) = weak.upgrade() {
                        if let Indication::Tx { event, info, .. } = table.get_ind_params() {
                            assert_eq!(event, LoraEvent::TxTimeout);
                            s.lock().unwrap().push((info.app_id, start.elapsed()));
                        }
                    }
                }),
            )
            .unwrap();

        for (app_id, ms) in [(500u32, 500u64), (100, 100), (300, 300)] {
            ports
                .send(
                    &TxParams::new(b"t")
                        .port(5)
                        .app_id(app_id)
                        .timeout(Duration::from_millis(ms)),
                )
                .unwrap();
        }

        thread::sleep(Duration::from_millis(800));
        let seen = seen.lock().unwrap();
        let order: Vec<u32> = seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![100, 300, 500]);
        for (id, at) in seen.iter() {
            assert!(*at >= Duration::from_millis(*id as u64), "{} fired at {:?}", id, at);
        }
        assert!(!ports.is_pending_tx());
    }

    #[test]
    fn test_sync_send_waits_for_its_terminal_event() {
        let ports = table();
        ports.open(5).unwrap();

        let consumer = {
            let ports = ports.clone();
            thread::spawn(move || loop {
                if let Some((header, data)) = ports.get_tx_data() {
                    assert_eq!(data, b"ping");
                    thread::sleep(Duration::from_millis(20));
                    ports.complete(&header, IndKind::TxDone, TxInfo::for_msg(&header));
                    return header.seq;
                }
                thread::sleep(Duration::from_millis(2));
            })
        };

        let sent = ports.send(&TxParams::new(b"ping").port(5).sync()).unwrap();
        assert_eq!(sent.terminal, Some(Terminal::Event(IndKind::TxDone)));
        assert_eq!(sent.seq, consumer.join().unwrap());
        assert_eq!(
            ports.get_ind_params(),
            Indication::Tx {
                port: 5,
                event: LoraEvent::TxDone,
                info: TxInfo {
                    seq: sent.seq,
                    ..TxInfo::default()
                },
            }
        );
    }

    #[test]
    fn test_close_releases_sync_sender() {
        let ports = table();
        ports.open(5).unwrap();

        let sender = {
            let ports = ports.clone();
            thread::spawn(move || ports.send(&TxParams::new(b"ping").port(5).sync()))
        };
        while !ports.is_pending_tx() {
            thread::sleep(Duration::from_millis(2));
        }
        ports.close(5).unwrap();

        let sent = sender.join().unwrap().unwrap();
        assert_eq!(sent.terminal, Some(Terminal::Closed));
        assert_eq!(ports.usage().tx_arena_used, 0);
    }

    #[test]
    fn test_close_with_message_in_flight() {
        let ports = table();
        ports.open(5).unwrap();

        let sender = {
            let ports = ports.clone();
            thread::spawn(move || ports.send(&TxParams::new(b"ping").port(5).sync()))
        };
        while !ports.is_pending_tx() {
            thread::sleep(Duration::from_millis(2));
        }
        let (header, data) = ports.get_tx_data().unwrap();
        assert_eq!(data, b"ping");

        ports.close(5).unwrap();
        assert!(!sender.is_finished());

        // The MAC reports back after the port is gone.
        ports.complete(&header, IndKind::TxDone, TxInfo::for_msg(&header));
        let sent = sender.join().unwrap().unwrap();
        assert_eq!(sent.terminal, Some(Terminal::Event(IndKind::TxDone)));
        assert_eq!(ports.usage().tx_arena_used, 0);
        assert_eq!(ports.usage().rx_arena_used, 0);
        assert_eq!(ports.get_ind_params(), Indication::None);
    }

    #[test]
    fn test_receive_and_indication_priority() {
        let ports = table();
        ports.open(2).unwrap();
        assert_eq!(
            ports.receive(2, 64, false, Duration::ZERO),
            Err(PortError::NoRxData)
        );

        let info = RxInfo {
            dl_frame_counter: 11,
            rssi: -90,
            snr: 4,
            data_rate: 5,
        };
        ports.rx_indication(2, &info, b"down").unwrap();
        ports
            .indication(2, IndKind::TxFail, &TxInfo { seq: 3, ..TxInfo::default() })
            .unwrap();

        assert_eq!(ports.get_ind_params().event(), LoraEvent::TxFail);
        assert_eq!(
            ports.get_ind_params(),
            Indication::Rx {
                port: 2,
                info,
                data: b"down".to_vec()
            }
        );
        assert_eq!(ports.get_ind_params(), Indication::None);
    }

    #[test]
    fn test_blocking_receive_wakes_on_data() {
        let ports = table();
        ports.open(2).unwrap();

        let reader = {
            let ports = ports.clone();
            thread::spawn(move || ports.receive(2, 3, true, Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(30));
        ports
            .rx_indication(2, &RxInfo { rssi: -50, snr: 7, ..RxInfo::default() }, b"hello")
            .unwrap();

        let packet = reader.join().unwrap().unwrap();
        assert_eq!(packet.data, b"hel");
        assert_eq!((packet.rssi, packet.snr), (-50, 7));
    }

    #[test]
    fn test_blocking_receive_times_out() {
        let ports = table();
        ports.open(2).unwrap();
        assert_eq!(
            ports.receive(2, 8, true, Duration::from_millis(20)),
            Err(PortError::NoRxData)
        );
    }

    #[test]
    fn test_common_callback_reaches_later_ports() {
        let ports = table();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        ports
            .set_callback(
                PortSelector::Any,
                Arc::new(move |event: LoraEvent, _: Option<&RxPacket>| {
                    assert_eq!(event, LoraEvent::Indication);
                    *h.lock().unwrap() += 1;
                }),
            )
            .unwrap();
        ports.open(8).unwrap();
        ports.rx_indication(8, &RxInfo::default(), b"x").unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);

        assert_eq!(
            ports.set_callback(PortSelector::Port(9), Arc::new(|_: LoraEvent, _: Option<&RxPacket>| {})),
            Err(PortError::NotOpened)
        );
    }

    #[test]
    fn test_header_survives_encoding() {
        let header = TxHeader {
            port: 5,
            retries: 2,
            len: 4,
            has_timeout: true,
            sync: false,
            confirm: true,
            expire_at: 123_456,
            handle: None,
            seq: 9,
            app_id: 77,
        };
        assert_eq!(TxHeader::decode(&header.encode()), header);
    }
}
