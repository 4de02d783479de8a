//! Flash session - per-device orchestrator for one download attempt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::engine::ProtocolEngine;
use crate::error::OdinError;
use crate::events::{FlashEvent, FlashObserver, TracingObserver};
use crate::package::FirmwarePackage;
use crate::transport::NusbTransport;

/// Configuration for a flash session.
///
/// Mirrors the command-line surface so a profile can be saved and
/// replayed across a fleet of identical devices.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bootloader payload path.
    pub bootloader: Option<String>,
    /// AP (Android platform) payload path.
    pub ap: Option<String>,
    /// CP (modem) payload path.
    pub cp: Option<String>,
    /// CSC payload path.
    pub csc: Option<String>,
    /// UMS payload path.
    pub ums: Option<String>,
    /// PIT file for validation / send.
    pub pit: Option<String>,
    /// Enable NAND erase.
    pub erase: bool,
    /// Reboot to normal mode after flashing.
    pub reboot: bool,
    /// Reboot back into download mode instead of flashing.
    pub redownload: bool,
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ingest every configured payload into a package.
    pub fn build_package(&self) -> Result<FirmwarePackage, OdinError> {
        let mut package = FirmwarePackage::new();
        if let Some(path) = &self.bootloader {
            package.set_bootloader(path)?;
        }
        if let Some(path) = &self.ap {
            package.set_ap(path)?;
        }
        if let Some(path) = &self.cp {
            package.set_cp(path)?;
        }
        if let Some(path) = &self.csc {
            package.set_csc(path)?;
        }
        if let Some(path) = &self.ums {
            package.set_ums(path)?;
        }
        if let Some(path) = &self.pit {
            package.set_pit(path)?;
        }
        package.set_erase(self.erase);
        Ok(package)
    }
}

/// One flashing attempt on one physical device.
///
/// Each session owns its own transport; when several devices are
/// flashed together the front-end runs one session per thread with a
/// per-thread copy of the package.
pub struct FlashSession<O: FlashObserver> {
    device_path: String,
    package: FirmwarePackage,
    config: SessionConfig,
    observer: Arc<O>,
}

impl FlashSession<TracingObserver> {
    /// Create a session with the default tracing observer.
    pub fn new(device_path: String, package: FirmwarePackage, config: SessionConfig) -> Self {
        Self::with_observer(device_path, package, config, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver + 'static> FlashSession<O> {
    pub fn with_observer(
        device_path: String,
        package: FirmwarePackage,
        config: SessionConfig,
        observer: Arc<O>,
    ) -> Self {
        Self {
            device_path,
            package,
            config,
            observer,
        }
    }

    /// Open the transport and run the protocol to completion.
    #[instrument(skip(self), fields(device = %self.device_path))]
    pub fn run(&self) -> Result<(), OdinError> {
        info!(device = %self.device_path, "Starting session");

        let transport = NusbTransport::open(&self.device_path)?;
        self.observer.on_event(&FlashEvent::DeviceConnected {
            path: self.device_path.clone(),
        });

        let mut engine = ProtocolEngine::new(&transport, &self.package, self.observer.as_ref());
        if self.config.redownload {
            engine.redownload()?;
        } else {
            engine.download(self.config.reboot)?;
        }

        info!(device = %self.device_path, "Session finished");
        Ok(())
    }
}
