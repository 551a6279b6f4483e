//! Hardware quirks database.
//!
//! Maps USB VID:PID to the device's role (IR, visible or combined), its
//! capture format and the UVC extension unit parameters for IR commands.
//! Quirk files are embedded at compile time from `contrib/hw/*.toml`.

use crate::usb::{SensorChannel, UsbId};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const QUIRK_0BDA_5830: &str = include_str!("../../../contrib/hw/0bda-5830.toml");
const QUIRK_0BDA_5840: &str = include_str!("../../../contrib/hw/0bda-5840.toml");
const QUIRK_0BDA_3901: &str = include_str!("../../../contrib/hw/0bda-3901.toml");

static QUIRK_DB: OnceLock<Vec<QuirkFile>> = OnceLock::new();

/// Top-level quirk file structure (one per `contrib/hw/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct QuirkFile {
    pub device: DeviceInfo,
    pub stream: StreamInfo,
    /// Absent for devices without an IR command channel.
    pub commands: Option<CommandInfo>,
}

impl QuirkFile {
    pub fn usb_id(&self) -> UsbId {
        UsbId::new(self.device.vendor_id, self.device.product_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
    pub role: DeviceRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Ir,
    Visible,
    /// Both sensors behind one enumeration.
    Combined,
}

impl DeviceRole {
    /// Channel sessions a device of this role opens, in interface order.
    pub fn channels(self) -> Vec<SensorChannel> {
        match self {
            DeviceRole::Ir => vec![SensorChannel::Ir],
            DeviceRole::Visible => vec![SensorChannel::Visible],
            DeviceRole::Combined => vec![SensorChannel::Ir, SensorChannel::Visible],
        }
    }
}

/// Capture format from the `[stream]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub fourcc: String,
}

/// UVC extension unit parameters from the `[commands]` section.
///
/// Each command's payload is its prefix followed by the encoded argument.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandInfo {
    pub unit: u8,
    pub selector: u8,
    pub gain_prefix: Vec<u8>,
    pub protection_prefix: Vec<u8>,
    pub alignment_prefix: Vec<u8>,
}

fn quirk_db() -> &'static Vec<QuirkFile> {
    QUIRK_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [QUIRK_0BDA_5830, QUIRK_0BDA_5840, QUIRK_0BDA_3901] {
            match toml::from_str::<QuirkFile>(src) {
                Ok(q) => db.push(q),
                Err(e) => tracing::error!(error = %e, "bad quirk TOML"),
            }
        }
        db
    })
}

/// Look up a quirk by USB id.
pub fn lookup_quirk(id: UsbId) -> Option<&'static QuirkFile> {
    quirk_db().iter().find(|q| q.usb_id() == id)
}

/// List all known quirks.
pub fn list_quirks() -> &'static [QuirkFile] {
    quirk_db()
}

/// Resolve the USB device directory in sysfs for a `/dev/videoN` node.
pub fn usb_device_dir(device_path: &str) -> Option<PathBuf> {
    // /dev/video2 → "video2"
    let dev_name = Path::new(device_path).file_name()?.to_str()?;
    // /sys/class/video4linux/video2/device is a symlink to the USB interface dir
    let device_link = format!("/sys/class/video4linux/{dev_name}/device");
    let interface_dir = std::fs::canonicalize(device_link).ok()?;
    interface_dir.parent().map(Path::to_path_buf)
}

/// Read the USB id from sysfs for a `/dev/videoN` node.
///
/// Returns `None` if the device is not USB or sysfs is unavailable.
pub fn get_usb_ids(device_path: &str) -> Option<UsbId> {
    read_usb_ids(&usb_device_dir(device_path)?)
}

/// Read `idVendor`/`idProduct` from a USB device directory.
pub fn read_usb_ids(usb_device_dir: &Path) -> Option<UsbId> {
    let vid_str = std::fs::read_to_string(usb_device_dir.join("idVendor")).ok()?;
    let pid_str = std::fs::read_to_string(usb_device_dir.join("idProduct")).ok()?;

    let vid = u16::from_str_radix(vid_str.trim(), 16).ok()?;
    let pid = u16::from_str_radix(pid_str.trim(), 16).ok()?;
    Some(UsbId::new(vid, pid))
}
