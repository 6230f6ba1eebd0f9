//! LoRa radio surface.
//!
//! This module contains:
//! - [`region`]: regional band limits and default channels
//! - [`airtime`]: time-on-air calculation
//! - [`params`]: raw-mode radio parameters and their validation
//! - [`radio`]: the transceiver driver trait
//! - [`sim`]: a simulated transceiver for host builds and tests

pub mod airtime;
pub mod params;
pub mod radio;
pub mod region;
pub mod sim;

pub use airtime::{airtime, airtime_us, Bandwidth, CodingRate, Modulation};
pub use params::{ParamError, RadioParams, RawParam, RawParamKind, RADIO_PARAMS_KEY};
pub use radio::{IrqFlags, IrqNotifier, Radio, RadioEvent, RxConfig, TxConfig};
pub use region::Region;
pub use sim::{SimMode, SimRadio, SimRadioHandle};
