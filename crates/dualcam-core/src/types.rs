use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which composite planes are rendered, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusionType {
    /// Fused infrared + visible image.
    FusionOnly,
    /// Infrared image on the fused (dual-resolution) path.
    IrOnly,
    /// Raw infrared plane at sensor resolution, bypassing fusion.
    IrOnlyNoFusion,
    /// Vendor-defined blend, rendered like the fused path.
    Custom,
}

impl FusionType {
    pub fn name(self) -> &'static str {
        match self {
            FusionType::FusionOnly => "fusion-only",
            FusionType::IrOnly => "ir-only",
            FusionType::IrOnlyNoFusion => "ir-only-no-fusion",
            FusionType::Custom => "custom",
        }
    }

    /// Whether listeners receive the raw rather than the remapped temperature plane.
    pub fn uses_raw_temperature(self) -> bool {
        self == FusionType::IrOnlyNoFusion
    }
}

impl fmt::Display for FusionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FusionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fusion-only" | "fusion" => Ok(FusionType::FusionOnly),
            "ir-only" | "ir" => Ok(FusionType::IrOnly),
            "ir-only-no-fusion" | "ir-raw" => Ok(FusionType::IrOnlyNoFusion),
            "custom" => Ok(FusionType::Custom),
            other => Err(format!("unknown fusion type: {other}")),
        }
    }
}

/// Output rotation, fixed for the lifetime of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Map a degree value; anything other than 90/180/270 is no rotation.
    pub fn from_degrees(degrees: u32) -> Self {
        match degrees % 360 {
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            270 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether width and height trade places.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}
