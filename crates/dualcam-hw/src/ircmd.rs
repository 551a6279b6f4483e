//! IR command channel.
//!
//! The pipeline decides *what* to write to the IR module (gain register,
//! overexposure protection, dual-sensor alignment); an [`IrCommandSink`]
//! decides how it is transported. [`CommandQueue`] hands commands to a
//! writer thread so the capture thread never blocks on a USB control
//! transfer, and [`UvcXuWriter`] sends them as UVC extension unit
//! `SET_CUR` requests.

use crate::quirks::{lookup_quirk, CommandInfo};
use crate::usb::UsbId;
use dualcam_core::GainStatus;
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::thread;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrCommand {
    SetGain(GainStatus),
    OverexposureProtection(bool),
    /// Pixel offset of the visible image relative to the IR image.
    SetAlignment { dx: i16, dy: i16 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command channel closed")]
    Closed,
    #[error("no IR command parameters for device {0}")]
    NoQuirk(UsbId),
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("UVC ioctl failed: {0}")]
    Ioctl(String),
}

/// Fire-and-forget destination for IR commands.
///
/// `submit` must not block on the hardware. `Ok` means the command was
/// accepted for delivery.
pub trait IrCommandSink: Send + Sync {
    fn submit(&self, command: IrCommand) -> Result<(), CommandError>;
}

/// Blocking command transport, driven from the [`CommandQueue`] thread.
pub trait CommandWriter: Send {
    fn write(&mut self, command: IrCommand) -> Result<(), CommandError>;
}

/// Queue feeding a dedicated writer thread.
pub struct CommandQueue {
    tx: mpsc::Sender<IrCommand>,
}

impl CommandQueue {
    pub fn spawn(mut writer: Box<dyn CommandWriter>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<IrCommand>();
        thread::Builder::new()
            .name("dualcam-ircmd".into())
            .spawn(move || {
                for command in rx {
                    match writer.write(command) {
                        Ok(()) => tracing::debug!(?command, "IR command written"),
                        Err(e) => tracing::warn!(?command, error = %e, "IR command failed"),
                    }
                }
                tracing::debug!("IR command channel closed");
            })?;
        Ok(Self { tx })
    }
}

impl IrCommandSink for CommandQueue {
    fn submit(&self, command: IrCommand) -> Result<(), CommandError> {
        self.tx.send(command).map_err(|_| CommandError::Closed)
    }
}

/// Sink for devices without an IR command channel. Accepts and drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl IrCommandSink for DiscardSink {
    fn submit(&self, command: IrCommand) -> Result<(), CommandError> {
        tracing::trace!(?command, "no IR command channel; dropped");
        Ok(())
    }
}

/// `UVCIOC_CTRL_QUERY` = `_IOWR('u', 0x21, struct uvc_xu_control_query)`
/// where sizeof(struct uvc_xu_control_query) = 16 bytes (verified by assert below).
const UVCIOC_CTRL_QUERY: libc::c_ulong = 0xC010_7521;

/// UVC_SET_CUR: set the current value of a control.
const UVC_SET_CUR: u8 = 0x01;

/// Mirror of `struct uvc_xu_control_query` from `<linux/uvcvideo.h>`.
///
/// Layout (64-bit Linux):
///   unit:u8 selector:u8 query:u8 _pad0:u8 size:u16 _pad1:u16 data:*mut u8
#[repr(C)]
struct UvcXuControlQuery {
    unit: u8,
    selector: u8,
    query: u8,
    _pad0: u8,
    size: u16,
    _pad1: u16,
    data: *mut u8,
}

const _SIZE_ASSERT: () = assert!(
    std::mem::size_of::<UvcXuControlQuery>() == 16,
    "UvcXuControlQuery must be 16 bytes to match the kernel ABI"
);

/// Writes IR commands to a V4L2 node as UVC extension unit requests.
pub struct UvcXuWriter {
    device_path: String,
    info: CommandInfo,
}

impl UvcXuWriter {
    /// Writer for `id` at `device_path`, if the quirk database lists
    /// command parameters for it.
    pub fn for_device(device_path: &str, id: UsbId) -> Result<Self, CommandError> {
        let info = lookup_quirk(id)
            .and_then(|q| q.commands.clone())
            .ok_or(CommandError::NoQuirk(id))?;
        Ok(Self {
            device_path: device_path.to_string(),
            info,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Payload bytes for one command.
    pub fn encode(&self, command: IrCommand) -> Vec<u8> {
        encode(&self.info, command)
    }

    fn send_uvc_control(&self, payload: &mut [u8]) -> Result<(), CommandError> {
        // Read+write access is needed for UVC ioctls; the capture fd belongs
        // to the streaming thread, so open a second one.
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device_path)
            .map_err(|e| CommandError::Open(e.to_string()))?;

        let mut query = UvcXuControlQuery {
            unit: self.info.unit,
            selector: self.info.selector,
            query: UVC_SET_CUR,
            _pad0: 0,
            size: payload.len() as u16,
            _pad1: 0,
            data: payload.as_mut_ptr(),
        };

        // SAFETY:
        // - fd is valid for the lifetime of `file`
        // - `query` is correctly sized and repr(C), matching the kernel ABI
        // - `payload` is valid and lives for the duration of this call
        let ret = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                UVCIOC_CTRL_QUERY,
                &mut query as *mut UvcXuControlQuery,
            )
        };

        if ret < 0 {
            Err(CommandError::Ioctl(std::io::Error::last_os_error().to_string()))
        } else {
            Ok(())
        }
    }
}

impl CommandWriter for UvcXuWriter {
    fn write(&mut self, command: IrCommand) -> Result<(), CommandError> {
        let mut payload = self.encode(command);
        tracing::debug!(device = %self.device_path, ?command, len = payload.len(), "sending UVC XU command");
        self.send_uvc_control(&mut payload)
    }
}

fn encode(info: &CommandInfo, command: IrCommand) -> Vec<u8> {
    match command {
        IrCommand::SetGain(status) => {
            let mut payload = info.gain_prefix.clone();
            payload.push(match status {
                GainStatus::High => 1,
                GainStatus::Low => 0,
            });
            payload
        }
        IrCommand::OverexposureProtection(on) => {
            let mut payload = info.protection_prefix.clone();
            payload.push(u8::from(on));
            payload
        }
        IrCommand::SetAlignment { dx, dy } => {
            let mut payload = info.alignment_prefix.clone();
            payload.extend_from_slice(&dx.to_le_bytes());
            payload.extend_from_slice(&dy.to_le_bytes());
            payload
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn info() -> CommandInfo {
        CommandInfo {
            unit: 0x0a,
            selector: 0x02,
            gain_prefix: vec![0x14, 0xc5],
            protection_prefix: vec![0x14, 0xc7],
            alignment_prefix: vec![0x14, 0xc9],
        }
    }

    #[test]
    fn test_encode_commands() {
        let info = info();
        assert_eq!(encode(&info, IrCommand::SetGain(GainStatus::Low)), vec![0x14, 0xc5, 0]);
        assert_eq!(encode(&info, IrCommand::SetGain(GainStatus::High)), vec![0x14, 0xc5, 1]);
        assert_eq!(encode(&info, IrCommand::OverexposureProtection(true)), vec![0x14, 0xc7, 1]);
        assert_eq!(
            encode(&info, IrCommand::SetAlignment { dx: -2, dy: 3 }),
            vec![0x14, 0xc9, 0xfe, 0xff, 0x03, 0x00]
        );
    }

    #[test]
    fn test_writer_requires_quirk() {
        assert!(matches!(
            UvcXuWriter::for_device("/dev/video0", UsbId::new(0x0bda, 0x3901)),
            Err(CommandError::NoQuirk(_))
        ));
        let writer = UvcXuWriter::for_device("/dev/video0", UsbId::new(0x0bda, 0x5830)).unwrap();
        assert_eq!(writer.device_path(), "/dev/video0");
    }

    struct Recording(Arc<Mutex<Vec<IrCommand>>>);

    impl CommandWriter for Recording {
        fn write(&mut self, command: IrCommand) -> Result<(), CommandError> {
            self.0.lock().unwrap().push(command);
            Ok(())
        }
    }

    #[test]
    fn test_queue_delivers_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = CommandQueue::spawn(Box::new(Recording(Arc::clone(&log)))).unwrap();
        queue.submit(IrCommand::SetGain(GainStatus::Low)).unwrap();
        queue.submit(IrCommand::OverexposureProtection(true)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while log.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                IrCommand::SetGain(GainStatus::Low),
                IrCommand::OverexposureProtection(true)
            ]
        );
    }
}
