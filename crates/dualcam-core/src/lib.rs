//! dualcam-core — Frame demultiplexing and sensor control logic.
//!
//! Pure, hardware-free building blocks for the dual-sensor camera pipeline:
//! the composite frame layout, the auto-gain and overexposure control
//! loops, and the image-processing contract the pipeline renders through.

pub mod gain;
pub mod isp;
pub mod layout;
pub mod types;

pub use gain::{
    GainController, GainError, GainOutcome, GainParams, GainState, GainStatus, OverexposureParams,
    OverexposureTransition, SwitchState,
};
pub use isp::{ImageProcessor, IspError, SoftwareIsp};
pub use layout::{FrameLayout, LayoutError, Plane, PlaneBuffers, Resolution, Resolutions};
pub use types::{FusionType, Rotation};
