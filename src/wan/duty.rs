//! Application duty cycle: the period at which queued uplinks are picked
//! up for transmission.

use super::process::WanRequest;
use crate::codec::{Reader, Writer};
use crate::event_loop::Mailbox;
use crate::lock;
use crate::nvm::{NvmAction, NvmError, NvmRecord, NvmStore, Record};
use crate::timer::Timer;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

pub const DUTY_KEY: &str = "lora-wan-duty";
pub const DEFAULT_DUTY_CYCLE_MS: u32 = 30_000;

/// Persisted duty-cycle period in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyPeriod(pub u32);

impl Record for DutyPeriod {
    const KEY: &'static str = DUTY_KEY;
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        Writer::new(out).u32(self.0);
    }

    fn decode(bytes: &[u8]) -> Self {
        match Reader::new(bytes).u32() {
            0 => Self::defaults(),
            ms => Self(ms),
        }
    }

    fn defaults() -> Self {
        Self(DEFAULT_DUTY_CYCLE_MS)
    }
}

/// Periodic trigger posting [`WanRequest::DutyCycle`] while running.
///
/// The timer is suspended while the device is not joined. Running and
/// suspended are independent: a resume only re-arms a started cycle and a
/// start while suspended waits for the resume.
pub struct Duty {
    timer: Timer,
    running: AtomicBool,
    suspended: AtomicBool,
    period: Mutex<NvmRecord<DutyPeriod>>,
    store: Arc<NvmStore>,
}

impl Duty {
    /// Load the persisted period; a first run stores `initial`.
    pub fn new(
        store: Arc<NvmStore>,
        runtime: Handle,
        mailbox: Mailbox<WanRequest>,
        initial: Duration,
    ) -> Result<Arc<Self>, NvmError> {
        let mut period = NvmRecord::<DutyPeriod>::new();
        if period.sync(&store)? == NvmAction::Init {
            period.get_mut().0 = initial.as_millis() as u32;
            period.sync(&store)?;
        }

        Ok(Arc::new_cyclic(|me: &std::sync::Weak<Duty>| {
            let me = me.clone();
            Self {
                timer: Timer::new("duty-cycle", runtime, move || {
                    if let Some(duty) = me.upgrade() {
                        if !duty.is_armed() {
                            return;
                        }
                        duty.restart();
                        mailbox.post(WanRequest::DutyCycle);
                    }
                }),
                running: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                period: Mutex::new(period),
                store,
            }
        }))
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(lock(&self.period).get().0 as u64)
    }

    /// Change and persist the period. A running cycle restarts with it.
    pub fn set(&self, period: Duration) -> Result<(), NvmError> {
        let ms = (period.as_millis() as u32).max(1);
        {
            let mut record = lock(&self.period);
            record.get_mut().0 = ms;
            record.sync(&self.store)?;
        }
        info!("duty cycle period {} ms", ms);
        if self.is_armed() {
            self.timer.stop();
            self.restart();
        }
        Ok(())
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        if self.is_armed() {
            self.restart();
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.timer.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Pause the timer without forgetting that the cycle is running.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        self.timer.stop();
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        if self.is_running() {
            self.restart();
        }
    }

    fn is_armed(&self) -> bool {
        self.is_running() && !self.suspended.load(Ordering::Acquire)
    }

    fn restart(&self) {
        let period = self.period();
        if period.is_zero() {
            warn!("duty cycle period is zero, not arming");
            return;
        }
        self.timer.start(period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures;
    use crate::event_loop::Mailbox;
    use std::thread;

    fn duty(initial_ms: u64) -> (Arc<Duty>, crate::event_loop::Inbox<WanRequest>, crate::nvm::MemStorage) {
        let (ctx, storage) = fixtures::context();
        let (mailbox, inbox) = Mailbox::channel();
        let duty = Duty::new(
            ctx.store.clone(),
            ctx.runtime.clone(),
            mailbox,
            Duration::from_millis(initial_ms),
        )
        .unwrap();
        (duty, inbox, storage)
    }

    fn drain(inbox: &mut crate::event_loop::Inbox<WanRequest>) -> usize {
        let mut n = 0;
        while inbox.try_recv().is_some() {
            n += 1;
        }
        n
    }

    #[test]
    fn test_first_run_persists_initial_period() {
        let (duty, _inbox, storage) = duty(1234);
        assert_eq!(duty.period(), Duration::from_millis(1234));
        assert!(storage.raw(DUTY_KEY).is_some());
    }

    #[test]
    fn test_running_cycle_posts_periodically() {
        let (duty, mut inbox, _) = duty(20);
        duty.start();
        thread::sleep(Duration::from_millis(110));
        duty.stop();
        let fired = drain(&mut inbox);
        assert!((3..=6).contains(&fired), "fired {} times", fired);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(drain(&mut inbox), 0);
    }

    #[test]
    fn test_suspend_and_resume() {
        let (duty, mut inbox, _) = duty(20);
        duty.suspend();
        duty.resume();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(drain(&mut inbox), 0, "resume must not start a stopped cycle");

        duty.start();
        duty.suspend();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(drain(&mut inbox), 0);
        assert!(duty.is_running());

        duty.resume();
        thread::sleep(Duration::from_millis(50));
        assert!(drain(&mut inbox) >= 1);
        duty.stop();
    }

    #[test]
    fn test_set_persists() {
        let (ctx, storage) = fixtures::context();
        let (mailbox, _inbox) = Mailbox::channel();
        let duty = Duty::new(ctx.store.clone(), ctx.runtime.clone(), mailbox, Duration::from_secs(30)).unwrap();
        duty.set(Duration::from_secs(5)).unwrap();

        let store = Arc::new(NvmStore::new(Box::new(storage)));
        let (mailbox, _inbox) = Mailbox::channel();
        let reloaded = Duty::new(store, ctx.runtime.clone(), mailbox, Duration::from_secs(30)).unwrap();
        assert_eq!(reloaded.period(), Duration::from_secs(5));
    }
}
