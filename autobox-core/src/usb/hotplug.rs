//! Hot-plug watcher for the known adapter vendor/product pairs.
//!
//! Emits a serialized stream of [`HotplugEvent`]s. Duplicate
//! notifications (libusb can deliver several per physical event, and
//! the polling fallback re-observes state every tick) are filtered by
//! the current "last known connected" flag, so consumers see strict
//! Attached/Detached alternation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rusb::{Context, Device, UsbContext};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::AutoboxError;
use crate::usb::is_dongle;

// ── HotplugEvent ─────────────────────────────────────────────────

/// Transport-level attach/detach. Authoritative over any in-band
/// Plugged/Unplugged message from the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Attached,
    Detached,
}

// ── Listener ─────────────────────────────────────────────────────

/// libusb callback target; owns the dedup flag.
struct Listener {
    connected: bool,
    tx: mpsc::UnboundedSender<HotplugEvent>,
}

impl Listener {
    fn emit(&mut self, connected: bool) {
        if self.connected == connected {
            return; // duplicate notification
        }
        self.connected = connected;
        let event = if connected {
            HotplugEvent::Attached
        } else {
            HotplugEvent::Detached
        };
        debug!("hotplug: {event:?}");
        let _ = self.tx.send(event);
    }
}

impl<T: UsbContext> rusb::Hotplug<T> for Listener {
    fn device_arrived(&mut self, device: Device<T>) {
        if device_matches(&device) {
            self.emit(true);
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        if device_matches(&device) {
            self.emit(false);
        }
    }
}

fn device_matches<T: UsbContext>(device: &Device<T>) -> bool {
    device
        .device_descriptor()
        .map(|desc| is_dongle(&desc))
        .unwrap_or(false)
}

// ── HotplugWatcher ───────────────────────────────────────────────

/// Background watcher thread. Dropping (or [`stop`](Self::stop)) ends
/// the thread; the event receiver then drains and closes.
pub struct HotplugWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Spawn the watcher and return the event stream.
    ///
    /// Uses libusb hotplug callbacks where the platform supports them,
    /// otherwise falls back to enumerating the bus twice a second.
    pub fn spawn() -> Result<(Self, mpsc::UnboundedReceiver<HotplugEvent>), AutoboxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = if rusb::has_hotplug() {
            let ctx = Context::new()?;
            thread::Builder::new()
                .name("usb-hotplug".into())
                .spawn(move || callback_loop(ctx, tx, stop_flag))
                .expect("spawn usb-hotplug thread")
        } else {
            thread::Builder::new()
                .name("usb-hotplug-poll".into())
                .spawn(move || poll_loop(tx, stop_flag))
                .expect("spawn usb-hotplug-poll thread")
        };

        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            rx,
        ))
    }

    /// Stop the watcher and join its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn callback_loop(ctx: Context, tx: mpsc::UnboundedSender<HotplugEvent>, stop: Arc<AtomicBool>) {
    let listener = Listener {
        connected: false,
        tx,
    };
    let registration = rusb::HotplugBuilder::new()
        .vendor_id(super::VENDOR_ID)
        .enumerate(true) // fire Attached for devices already present
        .register(&ctx, Box::new(listener));

    let _registration: rusb::Registration<Context> = match registration {
        Ok(r) => r,
        Err(err) => {
            warn!("hotplug registration failed: {err}");
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        if let Err(err) = ctx.handle_events(Some(Duration::from_millis(200))) {
            warn!("hotplug event loop: {err}");
            break;
        }
    }
}

fn poll_loop(tx: mpsc::UnboundedSender<HotplugEvent>, stop: Arc<AtomicBool>) {
    let mut listener = Listener {
        connected: false,
        tx,
    };
    while !stop.load(Ordering::SeqCst) {
        let present = rusb::devices()
            .map(|list| {
                list.iter().any(|d| {
                    d.device_descriptor()
                        .map(|desc| is_dongle(&desc))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        listener.emit(present);
        thread::sleep(Duration::from_millis(500));
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_filters_duplicates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = Listener {
            connected: false,
            tx,
        };

        listener.emit(true);
        listener.emit(true); // duplicate
        listener.emit(false);
        listener.emit(false); // duplicate
        listener.emit(true);

        assert_eq!(rx.try_recv().unwrap(), HotplugEvent::Attached);
        assert_eq!(rx.try_recv().unwrap(), HotplugEvent::Detached);
        assert_eq!(rx.try_recv().unwrap(), HotplugEvent::Attached);
        assert!(rx.try_recv().is_err());
    }
}
