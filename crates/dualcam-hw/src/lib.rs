//! dualcam-hw — USB device lifecycle and the dual-camera capture pipeline.
//!
//! Layers a device state machine and per-endpoint capture sessions over an
//! abstract UVC transport, and composes them into one logical dual-sensor
//! feed. A V4L2 transport backend and the IR command channel live here too.

pub mod camera;
pub mod dual;
pub mod ircmd;
pub mod lifecycle;
pub mod quirks;
pub mod session;
pub mod sync;
pub mod usb;

pub use camera::{V4lFactory, V4lTransport};
pub use dual::{
    AlignOffset, CameraVariant, ControllerConfig, ControllerError, ControllerParts,
    DualCameraController, FrameCorrupt, FrameListener, NoopObserver, PipelineObserver,
    RenderSurface, DEFAULT_AMPLIFY_MULTIPLE,
};
pub use ircmd::{
    CommandError, CommandQueue, CommandWriter, DiscardSink, IrCommand, IrCommandSink, UvcXuWriter,
};
pub use lifecycle::{
    ConnectedDevice, ConnectionState, DeviceLifecycleManager, LifecycleError, LifecycleEvent,
    LifecycleListener,
};
pub use session::{
    in_frame_callback, DeviceSession, FrameCallback, SessionError, SessionFault, SessionState,
};
pub use usb::{
    ControlHandle, DeviceIdentity, FrameSink, SensorChannel, SessionFactory, TransportError,
    UsbHost, UsbId, UvcTransport,
};
