//! USB transport: enumeration, open/claim, bulk IO, reset.
//!
//! The adapter family enumerates as vendor 0x1314, product 0x1520 or
//! 0x1521, exposing one vendor-specific interface with a bulk in/out
//! endpoint pair. Everything above this module talks to the device
//! through [`DongleEndpoint`], so the session and its tests never
//! touch libusb directly.

pub mod hotplug;

use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, info, warn};

use crate::error::AutoboxError;

pub use hotplug::{HotplugEvent, HotplugWatcher};

// ── Identity ─────────────────────────────────────────────────────

/// Adapter vendor id.
pub const VENDOR_ID: u16 = 0x1314;

/// Known adapter product ids.
pub const PRODUCT_IDS: [u16; 2] = [0x1520, 0x1521];

/// Timeout for descriptor string reads.
const STRING_TIMEOUT: Duration = Duration::from_millis(200);

/// Descriptor-derived identity of an attached adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub manufacturer: String,
    pub product: String,
    /// bcdDevice rendered as "M.mm".
    pub fw_version: String,
}

/// `true` when the descriptor matches a known adapter.
pub fn is_dongle(desc: &DeviceDescriptor) -> bool {
    desc.vendor_id() == VENDOR_ID && PRODUCT_IDS.contains(&desc.product_id())
}

// ── DongleEndpoint ───────────────────────────────────────────────

/// A raw bidirectional byte pipe to the adapter.
///
/// `read_bulk` returns `Ok(0)` on timeout (no data within the window);
/// both directions map a vanished device to
/// [`AutoboxError::DeviceGone`] so the session can treat it as a
/// detach rather than a fatal IO error.
pub trait DongleEndpoint: Send + Sync + 'static {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, AutoboxError>;

    fn write_bulk(&self, bytes: &[u8], timeout: Duration) -> Result<(), AutoboxError>;

    /// Reset the device, forcing re-enumeration. A device that reports
    /// "no device" mid-call has already left the bus, which is what a
    /// reset is for — that is success.
    fn reset(&self) -> Result<(), AutoboxError>;

    /// Descriptor identity, when the transport knows it.
    fn identity(&self) -> Option<DeviceIdentity> {
        None
    }
}

fn map_usb_err(err: rusb::Error) -> AutoboxError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => AutoboxError::DeviceGone,
        other => AutoboxError::Usb(other),
    }
}

// ── UsbDongle ────────────────────────────────────────────────────

/// An opened and claimed adapter.
///
/// Dropping the value releases the interface, which is how the
/// session "releases the device" on stop.
pub struct UsbDongle {
    device: Device<Context>,
    handle: DeviceHandle<Context>,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
    identity: DeviceIdentity,
}

impl UsbDongle {
    /// Open the first attached adapter on a fresh libusb context.
    pub fn open() -> Result<Self, AutoboxError> {
        let ctx = Context::new()?;
        Self::open_with(&ctx)
    }

    /// Open the first attached adapter on the given context.
    pub fn open_with(ctx: &Context) -> Result<Self, AutoboxError> {
        for device in ctx.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if is_dongle(&desc) {
                return Self::claim(device, desc);
            }
        }
        Err(AutoboxError::NoDevice)
    }

    fn claim(device: Device<Context>, desc: DeviceDescriptor) -> Result<Self, AutoboxError> {
        let mut handle = device.open()?;

        // Let libusb juggle cdc/hid drivers some distros bind to the
        // vendor interface. Unsupported on non-Linux hosts.
        if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
            if err != rusb::Error::NotSupported {
                return Err(err.into());
            }
        }

        let (interface, ep_in, ep_out) = Self::find_bulk_pair(&device)?;
        handle.claim_interface(interface)?;

        let identity = Self::read_identity(&handle, &desc);
        info!(
            product = %identity.product,
            serial = %identity.serial,
            fw = %identity.fw_version,
            "claimed dongle interface {interface} (in {ep_in:#04x}, out {ep_out:#04x})"
        );

        Ok(Self {
            device,
            handle,
            interface,
            ep_in,
            ep_out,
            identity,
        })
    }

    /// Locate the vendor interface's bulk endpoint pair.
    fn find_bulk_pair(device: &Device<Context>) -> Result<(u8, u8, u8), AutoboxError> {
        let config = device.active_config_descriptor()?;
        for interface in config.interfaces() {
            for idesc in interface.descriptors() {
                let mut ep_in = None;
                let mut ep_out = None;
                for ep in idesc.endpoint_descriptors() {
                    if ep.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match ep.direction() {
                        Direction::In => ep_in = Some(ep.address()),
                        Direction::Out => ep_out = Some(ep.address()),
                    }
                }
                if let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) {
                    return Ok((idesc.interface_number(), ep_in, ep_out));
                }
            }
        }
        Err(AutoboxError::NoBulkEndpoints)
    }

    fn read_identity(handle: &DeviceHandle<Context>, desc: &DeviceDescriptor) -> DeviceIdentity {
        let lang = handle
            .read_languages(STRING_TIMEOUT)
            .ok()
            .and_then(|langs| langs.first().copied());

        let read = |f: &dyn Fn() -> rusb::Result<String>| f().unwrap_or_default();
        let (serial, manufacturer, product) = match lang {
            Some(lang) => (
                read(&|| handle.read_serial_number_string(lang, desc, STRING_TIMEOUT)),
                read(&|| handle.read_manufacturer_string(lang, desc, STRING_TIMEOUT)),
                read(&|| handle.read_product_string(lang, desc, STRING_TIMEOUT)),
            ),
            None => Default::default(),
        };

        let version = desc.device_version();
        DeviceIdentity {
            serial,
            manufacturer,
            product,
            fw_version: format!("{}.{}{}", version.major(), version.minor(), version.sub_minor()),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

impl Drop for UsbDongle {
    fn drop(&mut self) {
        if let Err(err) = self.handle.release_interface(self.interface) {
            debug!("release_interface: {err}");
        }
    }
}

impl DongleEndpoint for UsbDongle {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, AutoboxError> {
        match self.handle.read_bulk(self.ep_in, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(err) => Err(map_usb_err(err)),
        }
    }

    fn write_bulk(&self, bytes: &[u8], timeout: Duration) -> Result<(), AutoboxError> {
        let mut sent = 0;
        while sent < bytes.len() {
            match self.handle.write_bulk(self.ep_out, &bytes[sent..], timeout) {
                Ok(n) => sent += n,
                Err(rusb::Error::Timeout) => {
                    return Err(AutoboxError::Timeout(timeout));
                }
                Err(err) => return Err(map_usb_err(err)),
            }
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), AutoboxError> {
        // A fresh handle keeps the reset off the claimed IO handle.
        let mut handle = match self.device.open() {
            Ok(handle) => handle,
            Err(rusb::Error::NoDevice | rusb::Error::NotFound) => {
                warn!("device already off the bus before reset (treated as success)");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        match handle.reset() {
            Ok(()) => Ok(()),
            Err(rusb::Error::NoDevice | rusb::Error::NotFound) => {
                warn!("device dropped off the bus during reset (treated as success)");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn identity(&self) -> Option<DeviceIdentity> {
        Some(self.identity.clone())
    }
}

// ── Tests ────────────────────────────────────────────────────────
