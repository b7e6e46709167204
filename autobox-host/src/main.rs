//! autobox-host — headless reference host.
//!
//! Claims the first attached adapter, runs the session, and prints
//! the upward event stream. Reconnects across unplug/replug.
//!
//! ```text
//! autobox-host                         800×480 @ 20 fps defaults
//! autobox-host --width 1280 --height 720 --fps 30
//! autobox-host --wifi 24g --car-name "my car"
//! RUST_LOG=autobox_core=debug autobox-host
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use autobox_core::mic::CpalBackend;
use autobox_core::usb::DongleEndpoint;
use autobox_core::{
    CoreEvent, DongleConfig, HotplugEvent, HotplugWatcher, SessionBuilder, UsbDongle, WifiType,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WifiBand {
    #[value(name = "24g")]
    Ghz24,
    #[value(name = "5g")]
    Ghz5,
}

#[derive(Parser, Debug)]
#[command(name = "autobox-host", about = "Headless host for Carlinkit-class adapters")]
struct Cli {
    /// Display width in pixels.
    #[arg(long, default_value_t = 800)]
    width: u32,

    /// Display height in pixels.
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Target frame rate.
    #[arg(long, default_value_t = 20)]
    fps: u32,

    /// Display density.
    #[arg(long, default_value_t = 160)]
    dpi: u32,

    /// WiFi band advertised to the phone.
    #[arg(long, value_enum, default_value = "5g")]
    wifi: WifiBand,

    /// Name shown on the phone.
    #[arg(long, default_value = "autobox")]
    car_name: String,

    /// Start in night mode.
    #[arg(long)]
    night_mode: bool,

    /// Right-hand-drive layout.
    #[arg(long)]
    right_hand_drive: bool,

    /// Leave microphone/audio upstream to the phone.
    #[arg(long)]
    audio_transfer: bool,
}

impl Cli {
    fn into_config(self) -> DongleConfig {
        DongleConfig {
            width: self.width,
            height: self.height,
            fps: self.fps,
            dpi: self.dpi,
            wifi_type: match self.wifi {
                WifiBand::Ghz24 => WifiType::Ghz24,
                WifiBand::Ghz5 => WifiType::Ghz5,
            },
            car_name: self.car_name.clone(),
            oem_name: self.car_name,
            night_mode: self.night_mode,
            drive_hand_right: self.right_hand_drive,
            audio_transfer_mode: self.audio_transfer,
            ..Default::default()
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config();
    let (_watcher, mut hotplug) = HotplugWatcher::spawn()?;

    loop {
        // Wait for an adapter.
        let dongle = loop {
            match UsbDongle::open() {
                Ok(dongle) => break dongle,
                Err(autobox_core::AutoboxError::NoDevice) => {
                    info!("no adapter attached, waiting…");
                    match hotplug.recv().await {
                        Some(HotplugEvent::Attached) => continue,
                        Some(HotplugEvent::Detached) => continue,
                        None => anyhow::bail!("hotplug watcher stopped"),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        };
        info!("adapter claimed: {:?}", dongle.identity());

        let endpoint: Arc<dyn DongleEndpoint> = Arc::new(dongle);
        let (session, mut outputs) = SessionBuilder::new(config.clone(), endpoint)
            .with_mic_backend(Box::new(CpalBackend::new()))
            .build();

        // Audio hand-offs would feed the platform sink; the headless
        // host just reports them.
        tokio::spawn(async move {
            while let Some(handoff) = outputs.audio_handoffs.recv().await {
                info!(
                    "audio stream opened: decode {} type {} ({} Hz, {} ch)",
                    handoff.key.decode_type,
                    handoff.key.audio_type,
                    handoff.format.frequency,
                    handoff.format.channels
                );
            }
        });

        if let Err(err) = session.start().await {
            warn!("session start failed: {err}");
            session.stop().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            continue;
        }
        info!("session streaming");

        // Event loop until the session ends or the user quits.
        let mut session_over = false;
        while !session_over {
            tokio::select! {
                event = outputs.events.recv() => match event {
                    Some(CoreEvent::Failure(reason)) => {
                        warn!("session failure: {reason}");
                        session_over = true;
                    }
                    Some(CoreEvent::Unplugged) => {
                        info!("unplugged");
                        if session.phase().is_closed() {
                            session_over = true;
                        }
                    }
                    Some(event) => info!("event: {event:?}"),
                    None => session_over = true,
                },
                event = hotplug.recv() => match event {
                    Some(HotplugEvent::Detached) => {
                        info!("adapter detached");
                        session_over = true;
                    }
                    Some(HotplugEvent::Attached) => {}
                    None => session_over = true,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    session.stop().await;
                    return Ok(());
                }
            }
        }

        session.stop().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
