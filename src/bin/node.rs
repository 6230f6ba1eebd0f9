//! Host demo node.
//!
//! Runs the stack over a simulated radio and MAC:
//! - WAN mode: joins, opens port 5 and sends a synchronous "ping"
//! - raw mode: transmits a frame and hears it back through the loopback
//!
//! Stats are served at http://localhost:8080/stats until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin node -- [config.json]
//! ```

use log::{error, info, warn};
use lora_core::lora::SimRadio;
use lora_core::nvm::Storage;
use lora_core::wan::SimMac;
use lora_core::{
    Ioctl, IoctlReply, LoraConfig, LoraError, LoraManager, ModeKind, RxParams, StatsServer,
    StatsSource, TxParams,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEMO_PORT: u8 = 5;

#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(feature = "esp32")]
fn open_storage(_config: &LoraConfig) -> Result<Box<dyn Storage>, String> {
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    let partition = EspDefaultNvsPartition::take().map_err(|e| format!("{:?}", e))?;
    let storage = lora_core::nvm::EspStorage::new(partition).map_err(|e| format!("{:?}", e))?;
    Ok(Box::new(storage))
}

#[cfg(not(feature = "esp32"))]
fn open_storage(config: &LoraConfig) -> Result<Box<dyn Storage>, String> {
    use lora_core::nvm::FileStorage;
    let dir = match &config.storage_dir {
        Some(dir) => dir.clone(),
        None => FileStorage::default_dir().map_err(|e| e.to_string())?,
    };
    let storage = FileStorage::new(dir).map_err(|e| e.to_string())?;
    Ok(Box::new(storage))
}

fn load_config() -> LoraConfig {
    match std::env::args().nth(1) {
        Some(path) => match LoraConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => LoraConfig::default(),
    }
}

fn wait_joined(manager: &LoraManager, within: Duration) -> Result<(), LoraError> {
    let deadline = Instant::now() + within;
    loop {
        if manager.ioctl(Ioctl::JoinStatus)? == IoctlReply::Joined(true) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(LoraError::Timeout);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn run_demo(manager: &LoraManager) -> Result<(), LoraError> {
    if manager.mode()? != ModeKind::Wan {
        manager.change_mode(ModeKind::Wan)?;
    }
    manager.connect_logging_callback()?;
    manager.ioctl(Ioctl::DutySet(Duration::from_secs(1)))?;
    manager.ioctl(Ioctl::PortOpen(DEMO_PORT))?;
    manager.ioctl(Ioctl::Join)?;
    wait_joined(manager, Duration::from_secs(5))?;
    info!("Joined, sending ping on port {}", DEMO_PORT);

    manager.tx(
        &TxParams::new(b"ping")
            .port(DEMO_PORT)
            .sync()
            .timeout(Duration::from_secs(10)),
    )?;
    info!("WAN ping delivered");

    manager.change_mode(ModeKind::Raw)?;
    manager.connect_logging_callback()?;
    manager.tx(&TxParams::new(b"raw ping").sync())?;
    let echo = manager.rx(&RxParams {
        max_len: 64,
        sync: true,
        timeout: Duration::from_secs(1),
        ..RxParams::default()
    })?;
    match echo {
        Some(packet) => info!(
            "Raw loopback: {:?} (rssi {}, snr {})",
            String::from_utf8_lossy(&packet.data),
            packet.rssi,
            packet.snr
        ),
        None => warn!("Raw receive pre-empted"),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();
    info!("=== LoRa node starting ===");

    let config = load_config();
    let storage = match open_storage(&config) {
        Ok(storage) => storage,
        Err(e) => {
            error!("Record storage unavailable: {}", e);
            std::process::exit(1);
        }
    };
    let stats_port = config.stats_port;

    let (radio, _radio) = SimRadio::loopback();
    let (mac, _mac) = SimMac::new();
    let manager = match LoraManager::new(config, storage, Box::new(radio), Box::new(mac)) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Stack failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let source: Arc<dyn StatsSource> = manager.clone();
    let _stats_server = match StatsServer::start(None, stats_port, source) {
        Ok(server) => {
            info!("Stats server at http://localhost:{}/stats", server.port());
            Some(server)
        }
        Err(e) => {
            warn!("Failed to start stats server: {}", e);
            None
        }
    };

    let demo = manager.clone();
    match tokio::task::spawn_blocking(move || run_demo(&demo)).await {
        Ok(Ok(())) => info!("Demo finished"),
        Ok(Err(e)) => error!("Demo failed: {}", e),
        Err(e) => error!("Demo task error: {}", e),
    }

    #[cfg(not(feature = "esp32"))]
    {
        info!("Running (Ctrl+C to exit)...");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Signal handler error: {}", e);
        }
    }

    info!("Shutting down...");
    manager.shutdown();
}
