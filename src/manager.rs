//! Mode-agnostic control surface.
//!
//! [`LoraManager`] owns the shared context and exactly one active mode.
//! Everything an application does goes through `tx`, `rx` and
//! [`LoraManager::ioctl`]; the active mode decides what each means.

use crate::codec::{Reader, Writer};
use crate::config::LoraConfig;
use crate::context::StackContext;
use crate::error::LoraError;
use crate::event::{EventCallback, LoraEvent, PortSelector, RxPacket, RxParams, TxParams};
use crate::lock;
use crate::lora::{Radio, RawParam, RawParamKind, Region};
use crate::nvm::{NvmRecord, NvmStore, Record, Storage};
use crate::raw::{RawMode, SharedRadio};
use crate::stats::LoraStats;
use crate::sync_pool::SyncPool;
use crate::wan::{Commission, Indication, Mac, SharedMac, WanMode, WanParam, WanParamKind};
use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

pub const MODE_KEY: &str = "lora-mgr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ModeKind {
    Raw = 0,
    #[default]
    Wan = 1,
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Wan => f.write_str("wan"),
        }
    }
}

/// Persisted mode choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModeSetting(ModeKind);

impl Record for ModeSetting {
    const KEY: &'static str = MODE_KEY;
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        Writer::new(out).u8(self.0 as u8);
    }

    fn decode(bytes: &[u8]) -> Self {
        match Reader::new(bytes).u8() {
            0 => Self(ModeKind::Raw),
            _ => Self(ModeKind::Wan),
        }
    }

    fn defaults() -> Self {
        Self(ModeKind::default())
    }
}

pub enum Mode {
    Raw(RawMode),
    Wan(WanMode),
}

impl Mode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Self::Raw(_) => ModeKind::Raw,
            Self::Wan(_) => ModeKind::Wan,
        }
    }

    /// Cancel everything the mode still holds and release its waiters.
    pub fn stop(&self) {
        match self {
            Self::Raw(raw) => raw.stop(),
            Self::Wan(wan) => wan.stop(),
        }
    }
}

/// Control request for the active mode.
pub enum Ioctl {
    /// In raw mode the selector is ignored.
    SetCallback(PortSelector, EventCallback),

    GetRawParam(RawParamKind),
    SetRawParam(RawParam),
    VerifyRawParam(Region, RawParam),
    DefaultRegionParam(Region, RawParamKind),
    ResetParams,
    Reconfigure,
    TxContWaveStart {
        freq_hz: u32,
        power: i8,
        duration: Duration,
    },
    TxContWaveStop,
    RxContStart,
    RxContStop,

    Commission(Commission),
    Join,
    JoinStatus,
    DutySet(Duration),
    DutyGet,
    DutyStart,
    DutyStop,
    IsPendingTx,
    EnableRxListening,
    DisableRxListening,
    PortOpen(u8),
    PortClose(u8),
    GetIndParams,
    GetWanParam(WanParamKind),
    SetWanParam(WanParam),
}

impl Ioctl {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetCallback(..) => "set-callback",
            Self::GetRawParam(_) => "get-raw-param",
            Self::SetRawParam(_) => "set-raw-param",
            Self::VerifyRawParam(..) => "verify-raw-param",
            Self::DefaultRegionParam(..) => "default-region-param",
            Self::ResetParams => "reset-params",
            Self::Reconfigure => "reconfigure",
            Self::TxContWaveStart { .. } => "tx-cont-wave-start",
            Self::TxContWaveStop => "tx-cont-wave-stop",
            Self::RxContStart => "rx-cont-start",
            Self::RxContStop => "rx-cont-stop",
            Self::Commission(_) => "commission",
            Self::Join => "join",
            Self::JoinStatus => "join-status",
            Self::DutySet(_) => "duty-set",
            Self::DutyGet => "duty-get",
            Self::DutyStart => "duty-start",
            Self::DutyStop => "duty-stop",
            Self::IsPendingTx => "is-pending-tx",
            Self::EnableRxListening => "enable-rx-listening",
            Self::DisableRxListening => "disable-rx-listening",
            Self::PortOpen(_) => "port-open",
            Self::PortClose(_) => "port-close",
            Self::GetIndParams => "get-ind-params",
            Self::GetWanParam(_) => "get-wan-param",
            Self::SetWanParam(_) => "set-wan-param",
        }
    }
}

impl fmt::Debug for Ioctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetCallback(selector, _) => write!(f, "SetCallback({:?})", selector),
            Self::GetRawParam(kind) => write!(f, "GetRawParam({:?})", kind),
            Self::SetRawParam(param) => write!(f, "SetRawParam({:?})", param),
            Self::PortOpen(num) | Self::PortClose(num) => write!(f, "{}({})", self.name(), num),
            Self::SetWanParam(param) => write!(f, "SetWanParam({:?})", param),
            Self::Commission(c) => write!(f, "Commission({:?})", c),
            _ => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IoctlReply {
    Done,
    Param(RawParam),
    Verified(bool),
    Joined(bool),
    Duty(Duration),
    PendingTx(bool),
    Indication(Indication),
    WanParam(WanParam),
}

/// One LoRa stack instance.
pub struct LoraManager {
    ctx: StackContext,
    radio: SharedRadio,
    mac: SharedMac,
    /// Callers clone the mode out, so a blocking call never holds the lock.
    mode: RwLock<Option<Arc<Mode>>>,
    setting: Mutex<NvmRecord<ModeSetting>>,
    runtime: Option<Runtime>,
}

impl LoraManager {
    /// Build the shared context and start the persisted mode (WAN on a
    /// fresh store).
    pub fn new(
        config: LoraConfig,
        storage: Box<dyn Storage>,
        radio: Box<dyn Radio>,
        mac: Box<dyn Mac>,
    ) -> Result<Self, LoraError> {
        if let Err(e) = config.validate() {
            error!("invalid configuration: {}", e);
            return Err(LoraError::Error);
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("lora-timer")
            .enable_time()
            .build()
            .map_err(|e| {
                error!("cannot start timer runtime: {}", e);
                LoraError::Error
            })?;

        let ctx = StackContext {
            sync: Arc::new(SyncPool::new(config.sync_pool_size)),
            store: Arc::new(NvmStore::new(storage)),
            runtime: runtime.handle().clone(),
            config,
        };
        let setting = NvmRecord::<ModeSetting>::load(&ctx.store)?;
        let radio: SharedRadio = Arc::new(Mutex::new(radio));
        let mac: SharedMac = Arc::new(Mutex::new(mac));

        let kind = setting.get().0;
        let manager = Self {
            ctx,
            radio,
            mac,
            mode: RwLock::new(None),
            setting: Mutex::new(setting),
            runtime: Some(runtime),
        };
        let mode = manager.build(kind)?;
        *manager.write() = Some(Arc::new(mode));
        info!("lora stack powered on in {} mode", kind);
        Ok(manager)
    }

    fn build(&self, kind: ModeKind) -> Result<Mode, LoraError> {
        Ok(match kind {
            ModeKind::Raw => Mode::Raw(RawMode::new(&self.ctx, self.radio.clone())?),
            ModeKind::Wan => Mode::Wan(WanMode::new(
                &self.ctx,
                self.radio.clone(),
                self.mac.clone(),
            )?),
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Arc<Mode>>> {
        self.mode.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<Mode>> {
        self.mode
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `f` on the active mode.
    fn with_mode<T>(&self, f: impl FnOnce(&Mode) -> Result<T, LoraError>) -> Result<T, LoraError> {
        match self.current() {
            Some(mode) => f(mode.as_ref()),
            None => Err(LoraError::PoweredOff),
        }
    }

    /// Tear the active mode down and start `kind`, persisting the choice.
    pub fn change_mode(&self, kind: ModeKind) -> Result<(), LoraError> {
        let mut mode = self.write();
        match mode.as_ref() {
            None => return Err(LoraError::PoweredOff),
            Some(current) if current.kind() == kind => {
                warn!("already in {} mode", kind);
                return Err(LoraError::Error);
            }
            Some(_) => {}
        }

        // Callers still blocked in the old mode hold a clone; stopping it
        // releases them before the radio is handed over.
        if let Some(old) = mode.take() {
            old.stop();
        }
        let next = self.build(kind)?;
        *mode = Some(Arc::new(next));

        let mut setting = lock(&self.setting);
        setting.get_mut().0 = kind;
        setting.sync(&self.ctx.store)?;
        info!("switched to {} mode", kind);
        Ok(())
    }

    pub fn mode(&self) -> Result<ModeKind, LoraError> {
        self.with_mode(|mode| Ok(mode.kind()))
    }

    pub fn tx(&self, tx: &TxParams<'_>) -> Result<(), LoraError> {
        self.with_mode(|mode| match mode {
            Mode::Raw(raw) => raw.tx(tx),
            Mode::Wan(wan) => wan.tx(tx),
        })
    }

    pub fn rx(&self, rx: &RxParams) -> Result<Option<RxPacket>, LoraError> {
        self.with_mode(|mode| match mode {
            Mode::Raw(raw) => raw.rx(rx),
            Mode::Wan(wan) => wan.rx(rx),
        })
    }

    pub fn ioctl(&self, ioctl: Ioctl) -> Result<IoctlReply, LoraError> {
        self.with_mode(|mode| match mode {
            Mode::Raw(raw) => raw_ioctl(raw, ioctl),
            Mode::Wan(wan) => wan_ioctl(wan, ioctl),
        })
    }

    /// Log every event of every port and drain announced indications.
    pub fn connect_logging_callback(&self) -> Result<(), LoraError> {
        self.with_mode(|mode| match mode {
            Mode::Raw(raw) => {
                raw.set_callback(Arc::new(|event: LoraEvent, rx: Option<&RxPacket>| {
                    match rx {
                        Some(p) => info!("raw: {} ({} bytes, rssi {})", event, p.data.len(), p.rssi),
                        None => info!("raw: {}", event),
                    }
                }));
                Ok(())
            }
            Mode::Wan(wan) => wan.set_callback(PortSelector::Any, wan.logging_callback()),
        })
    }

    pub fn stats(&self) -> LoraStats {
        let mode = self.current();
        LoraStats {
            mode: mode.as_deref().map(Mode::kind),
            powered: mode.is_some(),
            sync_in_use: self.ctx.sync.in_use(),
            sync_capacity: self.ctx.sync.capacity(),
            raw: match mode.as_deref() {
                Some(Mode::Raw(raw)) => Some(raw.stats()),
                _ => None,
            },
            wan: match mode.as_deref() {
                Some(Mode::Wan(wan)) => Some(wan.stats()),
                _ => None,
            },
        }
    }

    pub fn config(&self) -> &LoraConfig {
        &self.ctx.config
    }

    /// Stop the active mode. Every later call reports `PoweredOff`.
    pub fn shutdown(&self) {
        let Some(mode) = self.write().take() else {
            return;
        };
        mode.stop();
        info!("lora stack powered off");
    }
}

impl Drop for LoraManager {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn wrong_mode(mode: &str, ioctl: &Ioctl) -> LoraError {
    warn!("{} not supported in {} mode", ioctl.name(), mode);
    LoraError::Error
}

fn raw_ioctl(raw: &RawMode, ioctl: Ioctl) -> Result<IoctlReply, LoraError> {
    let reply = match ioctl {
        Ioctl::SetCallback(_, callback) => {
            raw.set_callback(callback);
            IoctlReply::Done
        }
        Ioctl::GetRawParam(kind) => IoctlReply::Param(raw.get_param(kind)),
        Ioctl::SetRawParam(param) => {
            raw.set_param(param)?;
            IoctlReply::Done
        }
        Ioctl::VerifyRawParam(region, param) => IoctlReply::Verified(raw.verify_param(region, &param)),
        Ioctl::DefaultRegionParam(region, kind) => IoctlReply::Param(raw.default_region_param(region, kind)),
        Ioctl::ResetParams => {
            raw.reset_params()?;
            IoctlReply::Done
        }
        Ioctl::Reconfigure => {
            raw.reconfigure()?;
            IoctlReply::Done
        }
        Ioctl::TxContWaveStart {
            freq_hz,
            power,
            duration,
        } => {
            raw.tx_cont_wave_start(freq_hz, power, duration)?;
            IoctlReply::Done
        }
        Ioctl::TxContWaveStop => {
            raw.tx_cont_wave_stop()?;
            IoctlReply::Done
        }
        Ioctl::RxContStart => {
            raw.rx_cont_start()?;
            IoctlReply::Done
        }
        Ioctl::RxContStop => {
            raw.rx_cont_stop()?;
            IoctlReply::Done
        }
        other => return Err(wrong_mode("raw", &other)),
    };
    Ok(reply)
}

fn wan_ioctl(wan: &WanMode, ioctl: Ioctl) -> Result<IoctlReply, LoraError> {
    let reply = match ioctl {
        Ioctl::SetCallback(selector, callback) => {
            wan.set_callback(selector, callback)?;
            IoctlReply::Done
        }
        Ioctl::Commission(commission) => {
            wan.commission(commission)?;
            IoctlReply::Done
        }
        Ioctl::Join => {
            wan.join()?;
            IoctlReply::Done
        }
        Ioctl::JoinStatus => IoctlReply::Joined(wan.join_status()?),
        Ioctl::DutySet(period) => {
            wan.duty_set(period)?;
            IoctlReply::Done
        }
        Ioctl::DutyGet => IoctlReply::Duty(wan.duty_get()),
        Ioctl::DutyStart => {
            wan.duty_start();
            IoctlReply::Done
        }
        Ioctl::DutyStop => {
            wan.duty_stop();
            IoctlReply::Done
        }
        Ioctl::IsPendingTx => IoctlReply::PendingTx(wan.is_pending_tx()),
        Ioctl::EnableRxListening => {
            wan.set_rx_listening(true);
            IoctlReply::Done
        }
        Ioctl::DisableRxListening => {
            wan.set_rx_listening(false);
            IoctlReply::Done
        }
        Ioctl::PortOpen(num) => {
            wan.port_open(num)?;
            IoctlReply::Done
        }
        Ioctl::PortClose(num) => {
            wan.port_close(num)?;
            IoctlReply::Done
        }
        Ioctl::GetIndParams => IoctlReply::Indication(wan.get_ind_params()),
        Ioctl::GetWanParam(kind) => IoctlReply::WanParam(wan.get_param(kind)),
        Ioctl::SetWanParam(param) => {
            wan.set_param(param)?;
            IoctlReply::Done
        }
        other => return Err(wrong_mode("wan", &other)),
    };
    Ok(reply)
}
