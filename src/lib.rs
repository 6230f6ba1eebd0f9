//! Orchestration core of a LoRa radio stack.
//!
//! Two mutually exclusive modes share one radio: [`raw::RawMode`] drives the
//! transceiver directly through an order queue and state machine, and
//! [`wan::WanMode`] runs LoRaWAN port transactions over an external MAC.
//! [`LoraManager`] owns the active mode and exposes a single tx/rx/ioctl
//! surface. Settings survive restarts through the [`nvm`] record store.
//!
//! Platform-independent; hardware is reached through the [`lora::Radio`]
//! and [`wan::Mac`] traits, with simulated implementations for host builds.

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod lora;
pub mod manager;
pub mod nvm;
pub mod raw;
pub mod stats;
pub mod stats_server;
pub mod sync_pool;
pub mod timer;
pub mod wan;

pub use config::{ConfigError, LoraConfig};
pub use context::StackContext;
pub use error::{LoraError, PortError};
pub use event::{EventCallback, LoraEvent, PortSelector, RxPacket, RxParams, TxParams};
pub use manager::{Ioctl, IoctlReply, LoraManager, Mode, ModeKind};
pub use stats::LoraStats;
pub use stats_server::{StatsServer, StatsSource};
pub use sync_pool::{SyncHandle, SyncPool};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
