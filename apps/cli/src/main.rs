use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use clap::Parser;
use odin_core::events::{FlashEvent, FlashObserver, LogLevel};
use odin_core::session::{FlashSession, SessionConfig};
use odin_core::transport::list_download_devices;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const LICENSE_TEXT: &str = "\
odin4 - Samsung firmware flashing tool for Linux

Licensed under the MIT License.

The PIT handling is based on libpit from Heimdall
(MIT License, Benjamin Dobell / Glass Echidna).
";

const UDEV_HINT: &str = "\
IMPORTANT: You must set up your system to detect your device on a Linux host.
 create this file: /etc/udev/rules.d/51-android.rules
 and add this line to the file:
 SUBSYSTEM==\"usb\", ATTR{idVendor}==\"04e8\", MODE=\"0666\", GROUP=\"plugdev\"
 You may also need to unload the cdc_acm module before downloading:
   $ sudo rmmod cdc_acm
 OR
   echo \"blacklist cdc_acm\" > /etc/modprobe.d/cdc_acm-blacklist.conf
";

#[derive(Parser, Debug)]
#[command(
    name = "odin4",
    about = "Samsung firmware downloader",
    disable_version_flag = true,
    after_help = UDEV_HINT
)]
struct Args {
    /// Show version
    #[arg(short = 'v')]
    version: bool,

    /// Show license
    #[arg(short = 'w')]
    license: bool,

    /// Show downloadable device paths, one per line
    #[arg(short = 'l')]
    list: bool,

    /// Add Bootloader file
    #[arg(short = 'b', value_name = "FILE")]
    bootloader: Option<String>,

    /// Add AP image file
    #[arg(short = 'a', value_name = "FILE")]
    ap: Option<String>,

    /// Add CP image file
    #[arg(short = 'c', value_name = "FILE")]
    cp: Option<String>,

    /// Add CSC file
    #[arg(short = 's', value_name = "FILE")]
    csc: Option<String>,

    /// Add UMS file
    #[arg(short = 'u', value_name = "FILE")]
    ums: Option<String>,

    /// Home binary validation check with PIT file
    #[arg(short = 'V', value_name = "FILE")]
    pit: Option<String>,

    /// Set NAND erase option
    #[arg(short = 'e')]
    erase: bool,

    /// Set a device path (detected automatically without this option)
    #[arg(short = 'd', value_name = "PATH")]
    device: Vec<String>,

    /// Reboot into normal mode after flashing
    #[arg(long)]
    reboot: bool,

    /// Reboot into download mode if possible
    #[arg(long)]
    redownload: bool,
}

/// Observer that prints per-device progress to stderr. Log lines go
/// through tracing; this is the human-facing progress channel.
struct CliObserver {
    prefix: String,
}

impl CliObserver {
    fn new(device_path: &str, multi_device: bool) -> Self {
        let prefix = if multi_device {
            format!("[{device_path}] ")
        } else {
            String::new()
        };
        Self { prefix }
    }
}

impl FlashObserver for CliObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { path } => {
                eprintln!("{}Device connected: {path}", self.prefix);
            }
            FlashEvent::PhaseChanged { to, .. } => {
                eprintln!("{}-> {to}", self.prefix);
            }
            FlashEvent::Progress {
                partition,
                sent,
                total,
            } => {
                let pct = if *total > 0 { sent * 100 / total } else { 0 };
                eprintln!("{}{partition}: {pct}%", self.prefix);
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Error => eprintln!("{}ERROR: {message}", self.prefix),
                LogLevel::Warn => eprintln!("{}WARN: {message}", self.prefix),
                _ => {}
            },
            FlashEvent::Error { message } => {
                eprintln!("{}FAILED: {message}", self.prefix);
            }
            FlashEvent::Complete => {
                eprintln!("{}All done!", self.prefix);
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if args.version {
        println!("odin4 version {VERSION}");
        return ExitCode::SUCCESS;
    }

    if args.license {
        println!("{LICENSE_TEXT}");
        return ExitCode::SUCCESS;
    }

    if args.list {
        return match list_download_devices() {
            Ok(devices) => {
                for dev in devices {
                    println!("{}", dev.path);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Device enumeration failed");
                ExitCode::FAILURE
            }
        };
    }

    eprintln!("WARNING: Flashing firmware can brick your device. Use at your own risk.\n");

    let config = SessionConfig {
        bootloader: args.bootloader,
        ap: args.ap,
        cp: args.cp,
        csc: args.csc,
        ums: args.ums,
        pit: args.pit,
        erase: args.erase,
        reboot: args.reboot,
        redownload: args.redownload,
    };

    // Ingest every payload once; threads get their own copy of the
    // metadata and share the entry buffers read-only.
    let package = match config.build_package() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Package ingest failed");
            return ExitCode::FAILURE;
        }
    };

    if package.entries().is_empty() && package.pit_path().is_none() && !config.redownload {
        eprintln!("Usage: odin4 -h");
        return ExitCode::FAILURE;
    }

    // Without -d, every matching device is flashed.
    let device_paths = if args.device.is_empty() {
        match list_download_devices() {
            Ok(devices) if !devices.is_empty() => {
                devices.into_iter().map(|d| d.path).collect::<Vec<_>>()
            }
            Ok(_) => {
                error!("cannot find device");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!(error = %e, "Device enumeration failed");
                return ExitCode::FAILURE;
            }
        }
    } else {
        args.device
    };

    let multi_device = device_paths.len() > 1;
    if multi_device {
        info!(devices = device_paths.len(), "Multi-device mode");
    }

    // One OS thread per device; the only shared state is the counter.
    let success_count = AtomicUsize::new(0);
    thread::scope(|scope| {
        for path in &device_paths {
            let package = package.clone();
            let config = config.clone();
            let success_count = &success_count;
            scope.spawn(move || {
                let observer = Arc::new(CliObserver::new(path, multi_device));
                let session = FlashSession::with_observer(path.clone(), package, config, observer);
                match session.run() {
                    Ok(()) => {
                        success_count.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        error!(device = %path, error = %e, "Download failed");
                    }
                }
            });
        }
    });

    let succeeded = success_count.load(Ordering::SeqCst);
    let total = device_paths.len();
    info!(succeeded, failed = total - succeeded, "All sessions completed");

    if succeeded == total {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
