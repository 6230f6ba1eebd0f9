//! Fixed pool of request records ("orders").
//!
//! An order moves `Free -> Requested -> Responded -> Free`. The consumer
//! responds orders while stepping the state machine and drains them right
//! after, waking synchronous callers and collecting callback deliveries.

use crate::event::{LoraEvent, RxPacket};
use crate::lock;
use crate::sync_pool::{SyncHandle, SyncPool};
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default number of order slots.
pub const MAX_ORDERS: usize = 10;

/// Slots callers may not take, kept for events the consumer and timers post.
pub const INTERNAL_ORDERS: usize = 2;

/// Outcome attached to a responded order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Handled; nothing to report to callbacks.
    NoCallback,
    /// Dropped by a cancel-all before it was handled.
    Cancelled,
    Event {
        event: LoraEvent,
        rx: Option<RxPacket>,
    },
}

impl Response {
    pub fn event(event: LoraEvent) -> Self {
        Self::Event { event, rx: None }
    }
}

/// Where a synchronous caller picks up its response.
pub type ReplySlot = Arc<Mutex<Option<Response>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Free,
    Requested,
    Responded,
}

/// Raw-mode request payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Tx { data: Vec<u8>, timeout: Duration },
    TxDone,
    TxTimeout,
    Rx { max_len: usize, timeout: Duration },
    RxDone(RxPacket),
    RxTimeout,
    RxError,
    RxContStart,
    RxContStop,
    CadDone(bool),
    RadioIrq,
    RadioConfig,
    ToaExpired,
    OprTimeout,
    TxContWaveStart { freq_hz: u32, power: i8, duration: Duration },
    TxContWaveStop,
}

impl Request {
    /// Diagnostic name, also used to label sync handles.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tx { .. } => "tx-request",
            Self::TxDone => "tx-done",
            Self::TxTimeout => "tx-timeout",
            Self::Rx { .. } => "rx-request",
            Self::RxDone(_) => "rx-done",
            Self::RxTimeout => "rx-timeout",
            Self::RxError => "rx-error",
            Self::RxContStart => "rx-cont-start",
            Self::RxContStop => "rx-cont-stop",
            Self::CadDone(_) => "cad-done",
            Self::RadioIrq => "radio-irq",
            Self::RadioConfig => "radio-config",
            Self::ToaExpired => "ToA-expired",
            Self::OprTimeout => "opr-timeout",
            Self::TxContWaveStart { .. } => "start-tx_cont-wave",
            Self::TxContWaveStop => "end-tx_cont-wave",
        }
    }
}

#[derive(Debug)]
struct Order {
    state: OrderState,
    request: Option<Request>,
    sync: Option<SyncHandle>,
    reply: Option<ReplySlot>,
    response: Option<Response>,
}

impl Order {
    fn free() -> Self {
        Self {
            state: OrderState::Free,
            request: None,
            sync: None,
            reply: None,
            response: None,
        }
    }
}

struct PoolInner {
    orders: Vec<Order>,
    responded: VecDeque<usize>,
}

impl PoolInner {
    fn free_slots(&self) -> usize {
        self.orders
            .iter()
            .filter(|o| o.state == OrderState::Free)
            .count()
    }

    fn claim(
        &mut self,
        request: Request,
        sync: Option<SyncHandle>,
        reply: Option<ReplySlot>,
    ) -> Result<usize, Request> {
        let Some(index) = self.orders.iter().position(|o| o.state == OrderState::Free) else {
            return Err(request);
        };
        debug!("order[{}] <- {}", index, request.name());
        self.orders[index] = Order {
            state: OrderState::Requested,
            request: Some(request),
            sync,
            reply,
            response: None,
        };
        Ok(index)
    }
}

/// A response that still has to reach the registered callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub event: LoraEvent,
    pub rx: Option<RxPacket>,
}

/// The order array with its free-slot signal.
pub struct OrderPool {
    inner: Mutex<PoolInner>,
    freed: Condvar,
    reserved: usize,
}

impl OrderPool {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                orders: (0..size).map(|_| Order::free()).collect(),
                responded: VecDeque::new(),
            }),
            freed: Condvar::new(),
            reserved: INTERNAL_ORDERS.min(size.saturating_sub(1)),
        }
    }

    /// Claim a free slot outside the internal reserve, waiting up to `wait`
    /// for one. Returns `None` when the pool stayed full.
    pub fn alloc(
        &self,
        request: Request,
        sync: Option<SyncHandle>,
        reply: Option<ReplySlot>,
        wait: Duration,
    ) -> Option<usize> {
        let deadline = Instant::now() + wait;
        let mut inner = lock(&self.inner);
        loop {
            if inner.free_slots() > self.reserved {
                return inner.claim(request, sync, reply).ok();
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("order pool full, dropping {}", request.name());
                return None;
            }
            inner = self
                .freed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    /// Claim any free slot, reserve included, without waiting. Used from
    /// the consumer thread and timer callbacks, which must never block on
    /// the pool.
    pub fn alloc_internal(&self, request: Request) -> Option<usize> {
        match lock(&self.inner).claim(request, None, None) {
            Ok(index) => Some(index),
            Err(request) => {
                warn!("order pool exhausted, dropping {}", request.name());
                None
            }
        }
    }

    /// Request of an order still in `Requested`, with its sync flag.
    pub fn request(&self, index: usize) -> Option<(Request, bool)> {
        let inner = lock(&self.inner);
        let order = inner.orders.get(index)?;
        if order.state != OrderState::Requested {
            return None;
        }
        Some((order.request.clone()?, order.sync.is_some()))
    }

    pub fn is_sync(&self, index: usize) -> bool {
        lock(&self.inner)
            .orders
            .get(index)
            .is_some_and(|o| o.sync.is_some())
    }

    pub fn state(&self, index: usize) -> OrderState {
        lock(&self.inner).orders[index].state
    }

    /// Attach a response. Responding twice is ignored.
    pub fn respond(&self, index: usize, response: Response) {
        let mut inner = lock(&self.inner);
        let order = &mut inner.orders[index];
        if order.state != OrderState::Requested {
            warn!("order[{}]: respond in state {:?}", index, order.state);
            return;
        }
        debug!("order[{}] -> {:?}", index, response);
        order.state = OrderState::Responded;
        order.response = Some(response);
        inner.responded.push_back(index);
    }

    /// Complete every responded order in response order.
    ///
    /// Synchronous callers get their reply and are released; orders are
    /// freed. Returns the events still to be handed to the callback.
    pub fn drain(&self, sync_pool: &SyncPool) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let mut inner = lock(&self.inner);
        while let Some(index) = inner.responded.pop_front() {
            let order = std::mem::replace(&mut inner.orders[index], Order::free());
            let response = order.response.unwrap_or(Response::NoCallback);
            if let Some(reply) = &order.reply {
                *lock(reply) = Some(response.clone());
            }
            if let Some(handle) = order.sync {
                sync_pool.release(handle);
            }
            if let Response::Event { event, rx } = response {
                deliveries.push(Delivery { event, rx });
            }
        }
        drop(inner);
        self.freed.notify_all();
        deliveries
    }

    /// Release every waiter with a neutral result and free all slots.
    /// Callbacks are not notified.
    pub fn cancel_all(&self, sync_pool: &SyncPool) {
        let mut inner = lock(&self.inner);
        for (index, slot) in inner.orders.iter_mut().enumerate() {
            if slot.state == OrderState::Free {
                continue;
            }
            let order = std::mem::replace(slot, Order::free());
            let response = order.response.unwrap_or(Response::Cancelled);
            if let Some(reply) = &order.reply {
                *lock(reply) = Some(response);
            }
            if let Some(handle) = order.sync {
                sync_pool.release(handle);
            }
            debug!("order[{}]: cancelled", index);
        }
        inner.responded.clear();
        drop(inner);
        self.freed.notify_all();
    }

    /// Orders not yet freed.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner)
            .orders
            .iter()
            .filter(|o| o.state != OrderState::Free)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(0);

    #[test]
    fn test_lifecycle() {
        let pool = OrderPool::new(2);
        let sync_pool = SyncPool::new(2);
        let i = pool.alloc(Request::RadioIrq, None, None, NO_WAIT).unwrap();
        assert_eq!(pool.state(i), OrderState::Requested);
        pool.respond(i, Response::event(LoraEvent::TxDone));
        assert_eq!(pool.state(i), OrderState::Responded);
        let delivered = pool.drain(&sync_pool);
        assert_eq!(pool.state(i), OrderState::Free);
        assert_eq!(
            delivered,
            vec![Delivery {
                event: LoraEvent::TxDone,
                rx: None
            }]
        );
    }

    #[test]
    fn test_requested_slots_are_distinct() {
        let pool = OrderPool::new(5);
        let a = pool.alloc(Request::TxDone, None, None, NO_WAIT).unwrap();
        let b = pool.alloc(Request::TxDone, None, None, NO_WAIT).unwrap();
        let c = pool.alloc(Request::TxDone, None, None, NO_WAIT).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(pool.in_flight(), 3);
    }

    #[test]
    fn test_full_pool_times_out() {
        let pool = OrderPool::new(1);
        pool.alloc(Request::TxDone, None, None, NO_WAIT).unwrap();
        let start = Instant::now();
        assert!(pool
            .alloc(Request::TxDone, None, None, Duration::from_millis(30))
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_callers_leave_internal_slots() {
        let pool = OrderPool::new(4);
        let sync_pool = SyncPool::new(1);
        assert!(pool.alloc(Request::RxContStart, None, None, NO_WAIT).is_some());
        assert!(pool.alloc(Request::RxContStop, None, None, NO_WAIT).is_some());
        assert!(pool.alloc(Request::RxContStart, None, None, NO_WAIT).is_none());

        let irq = pool.alloc_internal(Request::RadioIrq).unwrap();
        let done = pool.alloc_internal(Request::TxDone).unwrap();
        assert_ne!(irq, done);
        assert_eq!(pool.in_flight(), 4);

        let start = Instant::now();
        assert!(pool.alloc_internal(Request::RxTimeout).is_none());
        assert!(start.elapsed() < Duration::from_millis(100));

        pool.respond(irq, Response::NoCallback);
        pool.drain(&sync_pool);
        assert!(pool.alloc_internal(Request::RxTimeout).is_some());
    }

    #[test]
    fn test_single_slot_pool_has_no_reserve() {
        let pool = OrderPool::new(1);
        assert!(pool.alloc(Request::TxDone, None, None, NO_WAIT).is_some());
    }

    #[test]
    fn test_alloc_waits_for_drain() {
        let pool = Arc::new(OrderPool::new(1));
        let sync_pool = Arc::new(SyncPool::new(1));
        let first = pool.alloc(Request::TxDone, None, None, NO_WAIT).unwrap();
        let consumer = {
            let pool = pool.clone();
            let sync_pool = sync_pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                pool.respond(first, Response::NoCallback);
                pool.drain(&sync_pool);
            })
        };
        let second = pool.alloc(Request::RxTimeout, None, None, Duration::from_secs(2));
        consumer.join().unwrap();
        assert_eq!(second, Some(first));
    }

    #[test]
    fn test_no_callback_is_not_delivered() {
        let pool = OrderPool::new(2);
        let sync_pool = SyncPool::new(2);
        let i = pool.alloc(Request::RadioIrq, None, None, NO_WAIT).unwrap();
        pool.respond(i, Response::NoCallback);
        assert!(pool.drain(&sync_pool).is_empty());
    }

    #[test]
    fn test_sync_reply_and_release() {
        let pool = OrderPool::new(2);
        let sync_pool = SyncPool::new(2);
        let handle = sync_pool.acquire("tx-request");
        let reply = ReplySlot::default();
        let i = pool
            .alloc(
                Request::Tx {
                    data: vec![1],
                    timeout: Duration::ZERO,
                },
                Some(handle),
                Some(reply.clone()),
                NO_WAIT,
            )
            .unwrap();
        assert!(pool.is_sync(i));
        pool.respond(i, Response::event(LoraEvent::TxDone));
        pool.drain(&sync_pool);
        assert_eq!(sync_pool.in_use(), 0);
        assert_eq!(*reply.lock().unwrap(), Some(Response::event(LoraEvent::TxDone)));
    }

    #[test]
    fn test_cancel_all_releases_waiters() {
        let pool = OrderPool::new(4);
        let sync_pool = SyncPool::new(3);
        let handle = sync_pool.acquire("rx-request");
        let reply = ReplySlot::default();
        pool.alloc(
            Request::Rx {
                max_len: 16,
                timeout: Duration::ZERO,
            },
            Some(handle),
            Some(reply.clone()),
            NO_WAIT,
        )
        .unwrap();
        let done = pool.alloc(Request::RadioConfig, None, None, NO_WAIT).unwrap();
        pool.respond(done, Response::NoCallback);

        pool.cancel_all(&sync_pool);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(sync_pool.in_use(), 0);
        assert_eq!(*reply.lock().unwrap(), Some(Response::Cancelled));
        assert!(pool.drain(&sync_pool).is_empty());
    }

    #[test]
    fn test_double_respond_keeps_first() {
        let pool = OrderPool::new(1);
        let sync_pool = SyncPool::new(1);
        let i = pool.alloc(Request::TxDone, None, None, NO_WAIT).unwrap();
        pool.respond(i, Response::event(LoraEvent::TxDone));
        pool.respond(i, Response::event(LoraEvent::TxTimeout));
        let delivered = pool.drain(&sync_pool);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event, LoraEvent::TxDone);
    }

    #[test]
    fn test_request_names() {
        assert_eq!(Request::ToaExpired.name(), "ToA-expired");
        assert_eq!(Request::RxContStop.name(), "rx-cont-stop");
        assert_eq!(
            Request::TxContWaveStart {
                freq_hz: 0,
                power: 0,
                duration: Duration::ZERO
            }
            .name(),
            "start-tx_cont-wave"
        );
    }
}
