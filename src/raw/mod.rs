//! Raw radio mode.
//!
//! Every request becomes an order in a fixed pool and is serviced by a
//! single consumer thread driving the state machine in [`fsm`]. Callers
//! posting a synchronous request block on a sync handle until the consumer
//! responds their order.

pub mod fsm;
pub mod order;
mod process;

pub use fsm::State;
pub use order::{OrderPool, Request, Response, MAX_ORDERS};
pub use process::RX_BUF_LEN;

use crate::context::StackContext;
use crate::error::LoraError;
use crate::event::{EventCallback, LoraEvent, RxPacket, RxParams, TxParams};
use crate::event_loop::{EventLoop, Mailbox};
use crate::lock;
use crate::lora::{IrqNotifier, Radio, RadioParams, RawParam, RawParamKind, Region};
use crate::nvm::{NvmRecord, NvmStore};
use crate::sync_pool::SyncPool;
use log::{debug, info, warn};
use order::ReplySlot;
use process::Processor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Radio shared between the stack and whoever built it.
pub type SharedRadio = Arc<Mutex<Box<dyn Radio>>>;

#[derive(Debug, Default)]
pub(crate) struct RawCounters {
    pub requests: AtomicU32,
    pub ignored: AtomicU32,
    pub busy: AtomicU32,
    pub tx_done: AtomicU32,
    pub tx_timeout: AtomicU32,
    pub rx_done: AtomicU32,
    pub rx_timeout: AtomicU32,
    pub rx_fail: AtomicU32,
}

impl RawCounters {
    pub fn record(&self, event: LoraEvent) {
        let counter = match event {
            LoraEvent::TxDone => &self.tx_done,
            LoraEvent::TxTimeout => &self.tx_timeout,
            LoraEvent::RxDone => &self.rx_done,
            LoraEvent::RxTimeout => &self.rx_timeout,
            LoraEvent::RxFail => &self.rx_fail,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Raw mode snapshot for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawStats {
    pub state: &'static str,
    pub orders_in_flight: usize,
    pub requests: u32,
    pub ignored: u32,
    pub busy: u32,
    pub tx_done: u32,
    pub tx_timeout: u32,
    pub rx_done: u32,
    pub rx_timeout: u32,
    pub rx_fail: u32,
    pub region: String,
    pub freq_hz: u32,
    pub sf: u8,
}

pub(crate) struct RawShared {
    pub pool: OrderPool,
    pub sync: Arc<SyncPool>,
    pub store: Arc<NvmStore>,
    pub radio: SharedRadio,
    pub params: Mutex<NvmRecord<RadioParams>>,
    pub callback: Mutex<Option<EventCallback>>,
    pub state: AtomicU8,
    pub counters: RawCounters,
    mailbox: Mailbox<usize>,
    running: AtomicBool,
    order_wait: Duration,
}

impl RawShared {
    /// Queue a request; a synchronous one blocks until it is responded.
    fn submit(&self, request: Request, sync: bool) -> Result<Option<Response>, LoraError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(LoraError::PoweredOff);
        }
        let handle = sync.then(|| self.sync.acquire(request.name()));
        let reply = sync.then(ReplySlot::default);

        let Some(index) = self
            .pool
            .alloc(request, handle, reply.clone(), self.order_wait)
        else {
            if let Some(handle) = handle {
                self.sync.release(handle);
            }
            self.counters.busy.fetch_add(1, Ordering::Relaxed);
            return Err(LoraError::Busy);
        };

        if !self.mailbox.post(index) {
            self.pool.respond(index, Response::Cancelled);
            self.pool.drain(&self.sync);
            return Err(LoraError::PoweredOff);
        }

        match (handle, reply) {
            (Some(handle), Some(reply)) => {
                self.sync.wait(&handle);
                let response = lock(&reply).take();
                Ok(Some(response.unwrap_or(Response::Cancelled)))
            }
            _ => Ok(None),
        }
    }

    /// Fire-and-forget post used by timers, interrupts and driver events.
    /// Never blocks: it runs on the consumer thread and on timer tasks.
    pub fn post_async(&self, request: Request) {
        if !self.running.load(Ordering::Acquire) {
            debug!("raw: stopped, dropping {}", request.name());
            return;
        }
        let Some(index) = self.pool.alloc_internal(request) else {
            self.counters.busy.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !self.mailbox.post(index) {
            self.pool.respond(index, Response::Cancelled);
            self.pool.drain(&self.sync);
        }
    }

    /// Sync the parameter record and re-initialise the radio from it.
    pub fn configure_radio(self: &Arc<Self>) {
        let mut params = lock(&self.params);
        if let Err(e) = params.sync(&self.store) {
            warn!("raw: radio params not persisted: {}", e);
        }
        let p = params.get();
        let mut radio = lock(&self.radio);
        radio.init(self.irq_notifier());
        radio.set_channel(p.freq_hz);
        radio.set_tx_config(&p.tx_config());
        radio.set_rx_config(&p.rx_config());
    }

    fn irq_notifier(self: &Arc<Self>) -> IrqNotifier {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.post_async(Request::RadioIrq);
            }
        })
    }
}

/// Raw radio mode instance.
pub struct RawMode {
    shared: Arc<RawShared>,
    event_loop: EventLoop<usize>,
}

impl RawMode {
    /// Load the radio parameters, initialise the radio and start the
    /// consumer thread.
    pub fn new(ctx: &StackContext, radio: SharedRadio) -> Result<Self, LoraError> {
        let params = NvmRecord::<RadioParams>::load(&ctx.store)?;
        let (mailbox, inbox) = Mailbox::channel();
        let shared = Arc::new(RawShared {
            pool: OrderPool::new(ctx.config.order_pool_size),
            sync: ctx.sync.clone(),
            store: ctx.store.clone(),
            radio,
            params: Mutex::new(params),
            callback: Mutex::new(None),
            state: AtomicU8::new(State::Idle as u8),
            counters: RawCounters::default(),
            mailbox: mailbox.clone(),
            running: AtomicBool::new(true),
            order_wait: ctx.config.order_wait(),
        });

        shared.configure_radio();

        let mut processor = Processor::new(shared.clone(), ctx.runtime.clone());
        let event_loop = EventLoop::spawn("lora-raw", mailbox, inbox, move |index| {
            processor.handle(index)
        })
        .map_err(|e| {
            warn!("raw: cannot start consumer: {}", e);
            LoraError::Error
        })?;

        info!("raw mode started");
        Ok(Self { shared, event_loop })
    }

    /// Transmit. An empty payload is accepted and ignored.
    pub fn tx(&self, tx: &TxParams<'_>) -> Result<(), LoraError> {
        if tx.data.is_empty() {
            return Ok(());
        }
        let request = Request::Tx {
            data: tx.data.to_vec(),
            timeout: tx.timeout,
        };
        match self.shared.submit(request, tx.sync)? {
            None | Some(Response::NoCallback) => Ok(()),
            Some(Response::Event { event, .. }) => match event {
                LoraEvent::TxDone => Ok(()),
                LoraEvent::TxTimeout => Err(LoraError::Timeout),
                _ => Err(LoraError::Error),
            },
            Some(Response::Cancelled) => Err(LoraError::Error),
        }
    }

    /// Receive. A synchronous call returns the frame, or `None` when a
    /// transmission pre-empted the receive.
    pub fn rx(&self, rx: &RxParams) -> Result<Option<RxPacket>, LoraError> {
        let request = Request::Rx {
            max_len: rx.max_len,
            timeout: rx.timeout,
        };
        match self.shared.submit(request, rx.sync)? {
            None | Some(Response::NoCallback) => Ok(None),
            Some(Response::Event { event, rx }) => match event {
                LoraEvent::RxDone => Ok(Some(rx.unwrap_or_default())),
                LoraEvent::RxTimeout => Err(LoraError::Timeout),
                _ => Err(LoraError::Error),
            },
            Some(Response::Cancelled) => Err(LoraError::Error),
        }
    }

    pub fn set_callback(&self, callback: EventCallback) {
        *lock(&self.shared.callback) = Some(callback);
    }

    pub fn get_param(&self, kind: RawParamKind) -> RawParam {
        lock(&self.shared.params).get().get(kind)
    }

    /// Verify and store a parameter. The radio picks it up on the next
    /// [`RawMode::reconfigure`].
    pub fn set_param(&self, param: RawParam) -> Result<(), LoraError> {
        lock(&self.shared.params).get_mut().set(param)?;
        Ok(())
    }

    pub fn verify_param(&self, region: Region, param: &RawParam) -> bool {
        lock(&self.shared.params).get().verify(region, param)
    }

    pub fn default_region_param(&self, region: Region, kind: RawParamKind) -> RawParam {
        RadioParams::for_region(region).get(kind)
    }

    /// Restore defaults, persist them and reconfigure the radio.
    pub fn reset_params(&self) -> Result<(), LoraError> {
        *lock(&self.shared.params).get_mut() = RadioParams::default();
        self.reconfigure()
    }

    /// Persist the parameters and re-initialise the radio. Pending
    /// operations are cancelled.
    pub fn reconfigure(&self) -> Result<(), LoraError> {
        self.shared.submit(Request::RadioConfig, true)?;
        Ok(())
    }

    pub fn tx_cont_wave_start(&self, freq_hz: u32, power: i8, duration: Duration) -> Result<(), LoraError> {
        self.shared.submit(
            Request::TxContWaveStart {
                freq_hz,
                power,
                duration,
            },
            false,
        )?;
        Ok(())
    }

    pub fn tx_cont_wave_stop(&self) -> Result<(), LoraError> {
        self.shared.submit(Request::TxContWaveStop, false)?;
        Ok(())
    }

    pub fn rx_cont_start(&self) -> Result<(), LoraError> {
        self.shared.submit(Request::RxContStart, false)?;
        Ok(())
    }

    /// Leave continuous receive; returns once the radio is asleep.
    pub fn rx_cont_stop(&self) -> Result<(), LoraError> {
        self.shared.submit(Request::RxContStop, true)?;
        Ok(())
    }

    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> RawStats {
        let c = &self.shared.counters;
        let params = lock(&self.shared.params);
        let p = params.get();
        RawStats {
            state: self.state().name(),
            orders_in_flight: self.shared.pool.in_flight(),
            requests: c.requests.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            busy: c.busy.load(Ordering::Relaxed),
            tx_done: c.tx_done.load(Ordering::Relaxed),
            tx_timeout: c.tx_timeout.load(Ordering::Relaxed),
            rx_done: c.rx_done.load(Ordering::Relaxed),
            rx_timeout: c.rx_timeout.load(Ordering::Relaxed),
            rx_fail: c.rx_fail.load(Ordering::Relaxed),
            region: p.region.to_string(),
            freq_hz: p.freq_hz,
            sf: p.sf,
        }
    }

    /// Post a radio interrupt as the driver's IRQ line would.
    pub fn notify_irq(&self) {
        self.shared.post_async(Request::RadioIrq);
    }
}

impl RawMode {
    /// Refuse new requests, stop the consumer, put the radio to sleep and
    /// release every caller still waiting on an order. Calling it again is
    /// a no-op.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.event_loop.stop();
        lock(&self.shared.radio).sleep();
        self.shared.pool.cancel_all(&self.shared.sync);
        info!("raw mode stopped");
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        self.stop();
    }
}
