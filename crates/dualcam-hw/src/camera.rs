//! V4L2 capture backend via the `v4l` crate.
//!
//! Each [`V4lTransport`] drives one capture node. Streaming runs on a
//! dedicated thread that owns the device while it streams and hands it back
//! through its join handle when stopped.

use crate::quirks::lookup_quirk;
use crate::sync::lock;
use crate::usb::{
    ControlHandle, DeviceIdentity, FrameSink, SensorChannel, SessionFactory, TransportError, UsbId,
    UvcTransport,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture format for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
}

impl CaptureFormat {
    /// Format from a quirk's fourcc string, padded with spaces.
    pub fn new(width: u32, height: u32, fourcc: &str) -> Self {
        let mut code = *b"    ";
        for (dst, src) in code.iter_mut().zip(fourcc.bytes()) {
            *dst = src;
        }
        Self {
            width,
            height,
            fourcc: code,
        }
    }
}

struct CaptureWorker<D> {
    stop: Arc<AtomicBool>,
    thread: ThreadId,
    handle: JoinHandle<D>,
}

/// Where the capture device lives: idle in the slot, or lent to a capture
/// thread that returns it through its join handle.
///
/// A thread told to stop from inside its own sink cannot be joined there;
/// it stays parked until the next `lend` or `recall` from another thread.
struct DeviceSlot<D> {
    idle: Mutex<Option<D>>,
    worker: Mutex<Option<CaptureWorker<D>>>,
}

impl<D: Send + 'static> DeviceSlot<D> {
    fn new() -> Self {
        Self {
            idle: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn put(&self, device: D) {
        *lock(&self.idle) = Some(device);
    }

    /// Hand the device to a thread built by `spawn`. A no-op while a
    /// capture thread is running.
    fn lend<F>(&self, spawn: F) -> Result<(), TransportError>
    where
        F: FnOnce(D, Arc<AtomicBool>) -> std::io::Result<JoinHandle<D>>,
    {
        let current = lock(&self.worker).take();
        if let Some(worker) = current {
            let running = !worker.stop.load(Ordering::Acquire) && !worker.handle.is_finished();
            let here = worker.thread == thread::current().id();
            if running || here {
                *lock(&self.worker) = Some(worker);
                return if running {
                    Ok(())
                } else {
                    Err(TransportError::Io("capture thread is still winding down".into()))
                };
            }
            self.reclaim(worker);
        }

        let device = lock(&self.idle).take().ok_or(TransportError::NotOpen)?;
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn(device, Arc::clone(&stop))
            .map_err(|e| TransportError::Io(format!("failed to spawn capture thread: {e}")))?;
        *lock(&self.worker) = Some(CaptureWorker {
            stop,
            thread: handle.thread().id(),
            handle,
        });
        Ok(())
    }

    /// Stop the capture thread and take the device back.
    fn recall(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        if worker.thread == thread::current().id() {
            tracing::debug!("capture stop requested from capture thread");
            *lock(&self.worker) = Some(worker);
            return;
        }
        self.reclaim(worker);
    }

    /// Drop the device wherever it is. Returns whether one was held.
    fn release(&self) -> bool {
        self.recall();
        // Only left behind on the capture thread itself, which drops the
        // device when it exits.
        let parked = lock(&self.worker).take().is_some();
        lock(&self.idle).take().is_some() || parked
    }

    fn reclaim(&self, worker: CaptureWorker<D>) {
        match worker.handle.join() {
            Ok(device) => self.put(device),
            Err(_) => tracing::error!("capture thread panicked"),
        }
    }
}

pub struct V4lTransport {
    channel: SensorChannel,
    format: Option<CaptureFormat>,
    path: Mutex<Option<String>>,
    slot: DeviceSlot<Device>,
}

impl V4lTransport {
    /// `format` of `None` keeps whatever the driver is configured for.
    pub fn new(channel: SensorChannel, format: Option<CaptureFormat>) -> Self {
        Self {
            channel,
            format,
            path: Mutex::new(None),
            slot: DeviceSlot::new(),
        }
    }

    fn negotiate(&self, device: &Device, path: &str) -> Result<(), TransportError> {
        let caps = device
            .query_caps()
            .map_err(|e| TransportError::Io(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = path,
            driver = %caps.driver,
            card = %caps.card,
            channel = %self.channel,
            "opened capture node"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(TransportError::Io(format!("{path}: not a capture device")));
        }

        let Some(wanted) = self.format else {
            return Ok(());
        };

        let mut fmt = device
            .format()
            .map_err(|e| TransportError::Io(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(&wanted.fourcc);
        fmt.width = wanted.width;
        fmt.height = wanted.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| TransportError::Io(format!("failed to set format: {e}")))?;

        if negotiated.width != wanted.width
            || negotiated.height != wanted.height
            || negotiated.fourcc != fmt.fourcc
        {
            return Err(TransportError::Io(format!(
                "driver negotiated {}x{} {:?}, wanted {}x{} {:?}",
                negotiated.width,
                negotiated.height,
                negotiated.fourcc,
                wanted.width,
                wanted.height,
                fmt.fourcc
            )));
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );
        Ok(())
    }
}

impl UvcTransport for V4lTransport {
    fn open(&self, handle: &ControlHandle) -> Result<(), TransportError> {
        let path = handle
            .node(self.channel.index())
            .ok_or_else(|| TransportError::NotFound("no capture node".into()))?;
        if !Path::new(path).exists() {
            return Err(TransportError::NotFound(path.to_string()));
        }

        let device = Device::with_path(path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                TransportError::Busy(path.to_string())
            } else {
                TransportError::NotFound(format!("{path}: {e}"))
            }
        })?;
        self.negotiate(&device, path)?;

        *lock(&self.path) = Some(path.to_string());
        self.slot.put(device);
        Ok(())
    }

    fn start_streaming(&self, sink: FrameSink) -> Result<(), TransportError> {
        let path = lock(&self.path).clone().unwrap_or_default();
        let name = format!("dualcam-capture-{}", self.channel);
        self.slot.lend(move |device, stop_flag| {
            thread::Builder::new().name(name).spawn(move || {
                let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, 4) {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(device = %path, error = %e, "failed to create mmap stream");
                        sink(&[]);
                        return device;
                    }
                };
                while !stop_flag.load(Ordering::Acquire) {
                    match stream.next() {
                        Ok((buf, meta)) => {
                            tracing::trace!(device = %path, seq = meta.sequence, len = buf.len(), "frame");
                            sink(buf);
                        }
                        Err(e) => {
                            tracing::warn!(device = %path, error = %e, "failed to dequeue buffer");
                            sink(&[]);
                            break;
                        }
                    }
                }
                drop(stream);
                device
            })
        })
    }

    fn stop_streaming(&self) {
        self.slot.recall();
    }

    fn close(&self) {
        if self.slot.release() {
            tracing::debug!(channel = %self.channel, "capture node closed");
        }
        *lock(&self.path) = None;
    }
}

/// Builds [`V4lTransport`]s, taking the capture format from the quirk database.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lFactory;

impl V4lFactory {
    fn format_for(id: UsbId, channel: SensorChannel) -> Option<CaptureFormat> {
        let quirk = lookup_quirk(id)?;
        // The quirk format describes the primary interface; the visible
        // channel of a combined device keeps its driver default.
        let primary = quirk.device.role.channels().first().copied() == Some(channel);
        primary.then(|| CaptureFormat::new(quirk.stream.width, quirk.stream.height, &quirk.stream.fourcc))
    }
}

impl SessionFactory for V4lFactory {
    fn transport(&self, identity: &DeviceIdentity, channel: SensorChannel) -> Arc<dyn UvcTransport> {
        Arc::new(V4lTransport::new(channel, Self::format_for(identity.id, channel)))
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
    pub usb: Option<UsbId>,
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..64 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        let usb = crate::quirks::get_usb_ids(&path);
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
            usb,
        });
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_format_pads_fourcc() {
        assert_eq!(CaptureFormat::new(256, 384, "YUYV").fourcc, *b"YUYV");
        assert_eq!(CaptureFormat::new(256, 192, "Y16").fourcc, *b"Y16 ");
    }

    #[test]
    fn test_factory_format_from_quirk() {
        let ir = V4lFactory::format_for(UsbId::new(0x0bda, 0x5830), SensorChannel::Ir).unwrap();
        assert_eq!((ir.width, ir.height), (256, 384));
        assert!(V4lFactory::format_for(UsbId::new(0x0bda, 0x5840), SensorChannel::Visible).is_none());
        assert!(V4lFactory::format_for(UsbId::new(0xdead, 0xbeef), SensorChannel::Ir).is_none());
    }

    #[test]
    fn test_slot_reclaims_device_stopped_from_its_own_thread() {
        let slot = Arc::new(DeviceSlot::new());
        slot.put(7u32);

        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let inner = Arc::clone(&slot);
        slot.lend(move |device, stop| {
            thread::Builder::new().spawn(move || {
                go_rx.recv().unwrap();
                // Stop requested from inside the sink.
                inner.recall();
                done_tx.send(stop.load(Ordering::Acquire)).unwrap();
                device
            })
        })
        .unwrap();
        go_tx.send(()).unwrap();
        assert!(done_rx.recv().unwrap());

        // Restarting from another thread gets the same device back.
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        slot.lend(move |device, _stop| {
            thread::Builder::new().spawn(move || {
                seen_tx.send(device).unwrap();
                device
            })
        })
        .unwrap();
        assert_eq!(seen_rx.recv().unwrap(), 7);

        slot.recall();
        assert!(slot.release());
        assert!(!slot.release());
    }

    #[test]
    fn test_slot_lend_while_running_is_noop() {
        let slot = DeviceSlot::new();
        slot.put(1u8);
        slot.lend(|device, stop| {
            thread::Builder::new().spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(std::time::Duration::from_millis(1));
                }
                device
            })
        })
        .unwrap();
        slot.lend(|_, _| unreachable!("second capture thread")).unwrap();
        slot.recall();
        assert_eq!(*lock(&slot.idle), Some(1));
    }

    #[test]
    fn test_open_missing_node() {
        let transport = V4lTransport::new(SensorChannel::Ir, None);
        let err = transport
            .open(&ControlHandle::single("/dev/video-does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
        assert_eq!(
            transport.start_streaming(Arc::new(|_: &[u8]| {})),
            Err(TransportError::NotOpen)
        );
    }
}
