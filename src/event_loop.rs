//! Single-consumer mailbox and the thread that drains it.
//!
//! Producers (callers, timer callbacks, interrupt notifiers) post into a
//! [`Mailbox`]. Exactly one [`EventLoop`] thread receives and handles the
//! events in order.

use crate::lock;
use log::{debug, warn};
use std::io;
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;

enum Envelope<T> {
    Event(T),
    Stop,
}

/// Receiving end of a mailbox, consumed by [`EventLoop::spawn`].
pub struct Inbox<T>(mpsc::UnboundedReceiver<Envelope<T>>);

impl<T> Inbox<T> {
    /// Take a queued event without blocking, for inspecting a mailbox
    /// that no loop drains.
    pub fn try_recv(&mut self) -> Option<T> {
        match self.0.try_recv() {
            Ok(Envelope::Event(event)) => Some(event),
            _ => None,
        }
    }
}

/// Cloneable producer handle.
pub struct Mailbox<T> {
    tx: mpsc::UnboundedSender<Envelope<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> Mailbox<T> {
    /// Create a connected mailbox and inbox.
    pub fn channel() -> (Self, Inbox<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, Inbox(rx))
    }

    /// Post an event. Returns `false` once the consumer is gone.
    pub fn post(&self, event: T) -> bool {
        self.tx.send(Envelope::Event(event)).is_ok()
    }
}

/// Dedicated consumer thread.
pub struct EventLoop<T> {
    mailbox: Mailbox<T>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<T: Send + 'static> EventLoop<T> {
    /// Start the consumer thread running `handler` for every posted event.
    pub fn spawn(
        name: &str,
        mailbox: Mailbox<T>,
        inbox: Inbox<T>,
        mut handler: impl FnMut(T) + Send + 'static,
    ) -> io::Result<Self> {
        let mut rx = inbox.0;
        let label = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("{}: loop started", label);
            while let Some(envelope) = rx.blocking_recv() {
                match envelope {
                    Envelope::Event(event) => handler(event),
                    Envelope::Stop => break,
                }
            }
            debug!("{}: loop stopped", label);
        })?;
        Ok(Self {
            mailbox,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }
}

impl<T> EventLoop<T> {
    pub fn mailbox(&self) -> &Mailbox<T> {
        &self.mailbox
    }

    /// Stop the loop after the events already queued, then join it.
    ///
    /// Called from the loop thread itself, the stop is queued but not joined.
    pub fn stop(&self) {
        let Some(handle) = lock(&self.thread).take() else {
            return;
        };
        let _ = self.mailbox.tx.send(Envelope::Stop);
        if thread::current().id() == self.thread_id {
            return;
        }
        if handle.join().is_err() {
            warn!("event loop thread panicked");
        }
    }
}

impl<T> Drop for EventLoop<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_events_handled_in_order() {
        let (mailbox, inbox) = Mailbox::channel();
        let (seen_tx, seen_rx) = std_mpsc::channel();
        let event_loop = EventLoop::spawn("order", mailbox, inbox, move |n: u32| {
            seen_tx.send(n).unwrap();
        })
        .unwrap();

        for n in 0..5 {
            assert!(event_loop.mailbox().post(n));
        }
        let seen: Vec<u32> = (0..5)
            .map(|_| seen_rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stop_drains_queued_events_first() {
        let (mailbox, inbox) = Mailbox::channel();
        let producer = mailbox.clone();
        let (seen_tx, seen_rx) = std_mpsc::channel();
        let event_loop = EventLoop::spawn("drain", mailbox, inbox, move |n: u32| {
            seen_tx.send(n).unwrap();
        })
        .unwrap();

        producer.post(1);
        producer.post(2);
        event_loop.stop();
        assert_eq!(seen_rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(!producer.post(3));
    }
}
