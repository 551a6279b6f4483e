use crate::engine::{Control, EngineError, EngineHandle};
use dualcam_core::{FusionType, GainStatus};
use zbus::interface;

/// D-Bus control interface for the dual-camera daemon.
///
/// Bus name: org.freedesktop.DualCam1
/// Object path: /org/freedesktop/DualCam1
pub struct DualCamService {
    pub engine: EngineHandle,
}

impl DualCamService {
    async fn run(&self, control: Control) -> zbus::fdo::Result<()> {
        self.engine.control(control).await.map_err(to_fdo)
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.freedesktop.DualCam1")]
impl DualCamService {
    /// Return daemon status as a JSON document.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.engine.status().await.map_err(to_fdo)?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Select the rendering path: fusion-only, ir-only, ir-only-no-fusion or custom.
    async fn set_fusion_type(&self, fusion: &str) -> zbus::fdo::Result<()> {
        let fusion: FusionType = fusion.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        self.run(Control::Fusion(fusion)).await
    }

    async fn set_amplification(&self, enabled: bool) -> zbus::fdo::Result<()> {
        self.run(Control::Amplification(enabled)).await
    }

    /// Force the sensor gain ("high" or "low") and reset the auto-gain counters.
    async fn set_gain_status(&self, status: &str) -> zbus::fdo::Result<()> {
        let status: GainStatus = status.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        self.run(Control::Gain(status)).await
    }

    async fn start_preview(&self) -> zbus::fdo::Result<()> {
        self.run(Control::StartPreview).await
    }

    async fn stop_preview(&self) -> zbus::fdo::Result<()> {
        self.run(Control::StopPreview).await
    }
}
