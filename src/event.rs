//! Request parameters and the event model shared by both modes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Completion events delivered to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraEvent {
    TxDone,
    TxTimeout,
    TxFail,
    TxConfirm,
    RxDone,
    RxTimeout,
    RxFail,
    /// Poll [`crate::Ioctl::GetIndParams`] until it reports `None`.
    Indication,
    None,
}

impl LoraEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TxDone => "tx-done",
            Self::TxTimeout => "tx-timeout",
            Self::TxFail => "tx-fail",
            Self::TxConfirm => "tx-confirm",
            Self::RxDone => "rx-done",
            Self::RxTimeout => "rx-timeout",
            Self::RxFail => "rx-fail",
            Self::Indication => "indication",
            Self::None => "none",
        }
    }
}

impl fmt::Display for LoraEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A received frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RxPacket {
    pub data: Vec<u8>,
    pub rssi: i16,
    pub snr: i8,
}

/// Completion handler. Runs on the mode's consumer thread or a timer
/// thread, never while internal locks are held.
pub type EventCallback = Arc<dyn Fn(LoraEvent, Option<&RxPacket>) + Send + Sync>;

/// Port selector for callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSelector {
    /// Every port, plus ports opened later without their own callback.
    Any,
    Port(u8),
}

/// Transmit request.
///
/// `port`, `confirm`, `retries` and `app_id` only matter in WAN mode.
#[derive(Debug, Clone, Default)]
pub struct TxParams<'a> {
    pub data: &'a [u8],
    pub port: u8,
    pub confirm: bool,
    /// Block until the transmission reaches a terminal event.
    pub sync: bool,
    /// Zero means no deadline in WAN mode and the configured default in raw
    /// mode.
    pub timeout: Duration,
    pub retries: u8,
    /// Opaque id echoed back in indications.
    pub app_id: u32,
}

impl<'a> TxParams<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn port(mut self, port: u8) -> Self {
        self.port = port;
        self
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn confirmed(mut self, retries: u8) -> Self {
        self.confirm = true;
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn app_id(mut self, app_id: u32) -> Self {
        self.app_id = app_id;
        self
    }
}

/// Receive request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxParams {
    pub max_len: usize,
    /// WAN port to read from; ignored in raw mode.
    pub port: u8,
    /// Zero waits indefinitely in WAN mode and uses the configured default
    /// in raw mode.
    pub timeout: Duration,
    pub sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_params_builder() {
        let tx = TxParams::new(b"abc")
            .port(5)
            .confirmed(3)
            .sync()
            .timeout(Duration::from_millis(500))
            .app_id(42);
        assert_eq!(tx.data, b"abc");
        assert_eq!(tx.port, 5);
        assert!(tx.confirm && tx.sync);
        assert_eq!(tx.retries, 3);
        assert_eq!(tx.timeout, Duration::from_millis(500));
        assert_eq!(tx.app_id, 42);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(LoraEvent::TxConfirm.to_string(), "tx-confirm");
        assert_eq!(LoraEvent::None.as_str(), "none");
    }
}
