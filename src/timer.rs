//! One-shot restartable timers on a tokio runtime.
//!
//! Expiry only runs the registered callback, which is expected to post an
//! event into a mode's mailbox. Nothing touches radio state from here.

use crate::lock;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Named one-shot timer. Starting an armed timer restarts it.
pub struct Timer {
    name: &'static str,
    runtime: Handle,
    callback: Callback,
    armed: Mutex<Option<CancellationToken>>,
}

impl Timer {
    pub fn new(name: &'static str, runtime: Handle, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            name,
            runtime,
            callback: Arc::new(callback),
            armed: Mutex::new(None),
        }
    }

    /// Arm the timer to fire once after `after`, cancelling any previous arm.
    pub fn start(&self, after: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.armed).replace(token.clone()) {
            previous.cancel();
        }

        debug!("timer {}: start {:?}", self.name, after);
        let callback = self.callback.clone();
        let name = self.name;
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    // stop() may have raced the sleep
                    if !token.is_cancelled() {
                        debug!("timer {}: expired", name);
                        callback();
                    }
                }
            }
        });
    }

    /// Disarm the timer. Stopping an idle timer is a no-op.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.armed).take() {
            token.cancel();
            debug!("timer {}: stop", self.name);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap()
    }

    fn counting_timer(rt: &tokio::runtime::Runtime) -> (Timer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = Timer::new("test", rt.handle().clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[test]
    fn test_timer_fires_once() {
        let rt = runtime();
        let (timer, fired) = counting_timer(&rt);
        timer.start(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_prevents_expiry() {
        let rt = runtime();
        let (timer, fired) = counting_timer(&rt);
        timer.start(Duration::from_millis(50));
        timer.stop();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_replaces_previous_arm() {
        let rt = runtime();
        let (timer, fired) = counting_timer(&rt);
        timer.start(Duration::from_millis(40));
        timer.start(Duration::from_millis(120));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_disarms() {
        let rt = runtime();
        let (timer, fired) = counting_timer(&rt);
        timer.start(Duration::from_millis(30));
        drop(timer);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
