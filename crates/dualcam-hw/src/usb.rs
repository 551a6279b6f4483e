//! USB device identity and the transport contract sessions drive.
//!
//! The transport (enumeration, isochronous transfers, buffer framing) is an
//! external collaborator; this module only fixes the calls a session makes
//! and the guarantees it relies on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// USB vendor/product id pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected VID:PID, got {s:?}"))?;
        let parse = |part: &str| {
            u16::from_str_radix(part.trim_start_matches("0x"), 16)
                .map_err(|e| format!("bad USB id component {part:?}: {e}"))
        };
        Ok(Self::new(parse(vid)?, parse(pid)?))
    }
}

/// Opaque OS-level handle for one enumerated USB device.
///
/// On Linux this is the set of V4L2 capture nodes the device exposes, in
/// interface order; a combined endpoint exposes one node per sensor channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ControlHandle {
    nodes: Vec<String>,
}

impl ControlHandle {
    pub fn new(nodes: Vec<String>) -> Self {
        Self { nodes }
    }

    pub fn single(node: impl Into<String>) -> Self {
        Self {
            nodes: vec![node.into()],
        }
    }

    /// Node backing the `index`-th channel, falling back to the first node
    /// for devices that multiplex every channel through one interface.
    pub fn node(&self, index: usize) -> Option<&str> {
        self.nodes
            .get(index)
            .or_else(|| self.nodes.first())
            .map(String::as_str)
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }
}

/// Identity used to route lifecycle events to the right state instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub id: UsbId,
    pub handle: ControlHandle,
}

impl DeviceIdentity {
    pub fn new(id: UsbId, handle: ControlHandle) -> Self {
        Self { id, handle }
    }
}

/// One sensor behind a USB identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorChannel {
    Ir,
    Visible,
}

impl SensorChannel {
    /// Interface index of this channel on a combined endpoint.
    pub fn index(self) -> usize {
        match self {
            SensorChannel::Ir => 0,
            SensorChannel::Visible => 1,
        }
    }
}

impl fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SensorChannel::Ir => "ir",
            SensorChannel::Visible => "visible",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device busy: {0}")]
    Busy(String),
    #[error("device node not found: {0}")]
    NotFound(String),
    #[error("transport not open")]
    NotOpen,
    #[error("transport I/O failed: {0}")]
    Io(String),
}

/// Frame delivery callback handed to the transport. Invoked on the
/// transport's capture thread; the slice is only valid for the call.
pub type FrameSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One streaming USB camera endpoint.
///
/// Contract relied on by [`crate::session::DeviceSession`]:
/// - a zero-length delivery reports a hardware fault;
/// - `stop_streaming` does not return while a `sink` call is in progress,
///   unless it is called from inside that call, and no `sink` call starts
///   after it returns.
pub trait UvcTransport: Send + Sync {
    fn open(&self, handle: &ControlHandle) -> Result<(), TransportError>;

    fn start_streaming(&self, sink: FrameSink) -> Result<(), TransportError>;

    fn stop_streaming(&self);

    fn close(&self);
}

/// Creates the transport for one channel of an attached identity.
pub trait SessionFactory: Send + Sync {
    fn transport(&self, identity: &DeviceIdentity, channel: SensorChannel) -> Arc<dyn UvcTransport>;
}

/// The USB subsystem's permission service.
pub trait UsbHost: Send + Sync {
    /// Ask for access to the device. The answer arrives later as a
    /// permission event on the lifecycle manager, never from inside this call.
    fn request_permission(&self, identity: &DeviceIdentity);
}
