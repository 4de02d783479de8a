//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front-end) to subscribe to session
//! events without tight coupling to the core logic.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of a flashing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// ODIN/LOKE greeting exchange.
    Handshake,
    /// Session begin, packet-size negotiation, erase mode.
    SessionSetup,
    /// Best-effort device info block.
    DeviceInfo,
    /// PIT receive/send.
    PitExchange,
    /// Per-entry payload transfers.
    FileTransfer,
    /// Session close / reboot.
    Closing,
    Complete,
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Handshake => write!(f, "Handshake"),
            FlashPhase::SessionSetup => write!(f, "Session Setup"),
            FlashPhase::DeviceInfo => write!(f, "Device Info"),
            FlashPhase::PitExchange => write!(f, "PIT Exchange"),
            FlashPhase::FileTransfer => write!(f, "File Transfer"),
            FlashPhase::Closing => write!(f, "Closing"),
            FlashPhase::Complete => write!(f, "Complete"),
            FlashPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by a flashing session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Transport opened on a device.
    DeviceConnected { path: String },
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Progress update for the entry currently being transferred,
    /// reported at 10% boundaries.
    Progress {
        partition: String,
        sent: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { message: String },
    /// Session finished successfully.
    Complete,
}

/// Observer trait for receiving session events.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { path } => {
                tracing::info!(path = %path, "Device connected");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::Progress {
                partition,
                sent,
                total,
            } => {
                let pct = if *total > 0 { sent * 100 / total } else { 0 };
                tracing::info!(partition = %partition, progress = %format!("{pct}%"), "Progress");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Error { message } => {
                tracing::error!("{}", message);
            }
            FlashEvent::Complete => {
                tracing::info!("Session complete");
            }
        }
    }
}
