//! Single-threaded event engine.
//!
//! Every lifecycle and control operation of the daemon runs on one OS
//! thread, fed by one queue. Hotplug, permission answers, lifecycle
//! notifications (including restart requests raised on capture threads)
//! and D-Bus requests are all posted here, so device state is only ever
//! mutated in queue order.

use crate::config::Config;
use crate::hotplug::{AccessHost, PermissionCheck};
use dualcam_core::{FusionType, GainState, GainStatus, OverexposureTransition};
use dualcam_hw::{
    CameraVariant, CommandError, CommandQueue, CommandWriter, ConnectedDevice, ConnectionState,
    ControllerError, ControllerParts, DeviceIdentity, DeviceLifecycleManager, DiscardSink,
    DualCameraController, FrameCorrupt, IrCommand, IrCommandSink, LifecycleError,
    LifecycleListener, PipelineObserver, RenderSurface, SensorChannel, SessionFactory, UsbId,
    UvcXuWriter,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("failed to start engine: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Control operations exposed over D-Bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Fusion(FusionType),
    Amplification(bool),
    Gain(GainStatus),
    StartPreview,
    StopPreview,
}

/// Everything the engine thread reacts to.
pub enum EngineEvent {
    Attach(DeviceIdentity),
    Detach(UsbId),
    Permission { id: UsbId, granted: bool },
    Connected(UsbId),
    Disconnected(UsbId),
    RestartRequested(UsbId),
    Reopen(UsbId),
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    Control {
        control: Control,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Stop preview and leave the event loop.
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub state: ConnectionState,
    pub generation: Option<u64>,
    pub open_failures: u32,
}

/// Snapshot returned by the `Status` D-Bus method.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub variant: &'static str,
    pub frame_len: usize,
    pub devices: Vec<DeviceStatus>,
    pub previewing: bool,
    pub fusion: Option<FusionType>,
    pub amplify: bool,
    pub gain: GainStatus,
    pub gain_state: GainState,
    pub protection_engaged: bool,
    pub gain_switches: u64,
    pub overexposure_engaged: u64,
    pub fps: f64,
    pub frames: u64,
    pub corrupt_frames: u64,
    pub companion_frames: u64,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    /// Enqueue an event without waiting. `false` once the engine has exited.
    pub fn post(&self, event: EngineEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        if !self.post(EngineEvent::Status { reply }) {
            return Err(EngineError::ChannelClosed);
        }
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn control(&self, control: Control) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        if !self.post(EngineEvent::Control { control, reply }) {
            return Err(EngineError::ChannelClosed);
        }
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the engine, waiting until preview is down.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.post(EngineEvent::Shutdown { done }) {
            let _ = rx.await;
        }
    }
}

/// Forwards lifecycle notifications into the engine queue.
struct LifecycleBridge {
    engine: EngineHandle,
}

impl LifecycleListener for LifecycleBridge {
    fn on_connect(&self, device: &ConnectedDevice) {
        self.engine.post(EngineEvent::Connected(device.identity.id));
    }

    fn on_disconnect(&self, id: UsbId) {
        self.engine.post(EngineEvent::Disconnected(id));
    }

    fn on_error(&self, id: UsbId, error: &LifecycleError) {
        tracing::warn!(device = %id, error = %error, "device error");
    }

    fn on_unusable(&self, id: UsbId, failures: u32) {
        tracing::error!(device = %id, failures, "camera connected but unusable; replug it");
    }

    fn on_restart_requested(&self, id: UsbId, channel: SensorChannel) {
        tracing::debug!(device = %id, %channel, "queueing restart");
        self.engine.post(EngineEvent::RestartRequested(id));
    }
}

/// IR command writer that follows the IR device across reconnects.
#[derive(Clone, Default)]
struct IrTarget(Arc<Mutex<Option<UvcXuWriter>>>);

impl IrTarget {
    fn set(&self, writer: Option<UvcXuWriter>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = writer;
    }
}

impl CommandWriter for IrTarget {
    fn write(&mut self, command: IrCommand) -> Result<(), CommandError> {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            Some(writer) => writer.write(command),
            None => Err(CommandError::Open("IR device not connected".into())),
        }
    }
}

/// Render surface for headless operation: counts and traces frames.
#[derive(Default)]
struct LogSurface {
    frames: AtomicU64,
}

impl RenderSurface for LogSurface {
    fn draw(&self, pixels: &[u8], width: u32, height: u32) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(frame = n, width, height, bytes = pixels.len(), "frame rendered");
    }
}

/// Counts pipeline signals for the status report.
#[derive(Default)]
struct StatsObserver {
    gain_switches: AtomicU64,
    overexposure_engaged: AtomicU64,
}

impl PipelineObserver for StatsObserver {
    fn on_frame_corrupt(&self, error: &FrameCorrupt) {
        tracing::debug!(expected = error.expected, actual = error.actual, "check the configured resolutions");
    }

    fn on_gain_switch(&self, _status: GainStatus) {
        self.gain_switches.fetch_add(1, Ordering::Relaxed);
    }

    fn on_overexposure(&self, transition: OverexposureTransition) {
        if transition == OverexposureTransition::Engaged {
            self.overexposure_engaged.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Channels each device of the variant must open, from its source and companions.
fn tracked_channels(variant: &CameraVariant) -> BTreeMap<UsbId, Vec<SensorChannel>> {
    let mut channels: BTreeMap<UsbId, Vec<SensorChannel>> = BTreeMap::new();
    for (id, channel) in std::iter::once(variant.source()).chain(variant.companions()) {
        let list = channels.entry(id).or_default();
        if !list.contains(&channel) {
            list.push(channel);
        }
    }
    for list in channels.values_mut() {
        list.sort_by_key(|c| c.index());
    }
    channels
}

struct Engine {
    config: Config,
    manager: Arc<DeviceLifecycleManager>,
    controller: DualCameraController,
    stats: Arc<StatsObserver>,
    ir_target: Option<IrTarget>,
    /// Preview should run whenever every device is open.
    want_preview: bool,
    restarting: HashSet<UsbId>,
    runtime: tokio::runtime::Handle,
    handle: EngineHandle,
}

impl Engine {
    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Attach(identity) => self.manager.attach(identity),
            EngineEvent::Detach(id) => self.on_detach(id),
            EngineEvent::Permission { id, granted } => self.on_permission(id, granted),
            EngineEvent::Connected(id) => self.on_connected(id),
            EngineEvent::Disconnected(id) => {
                tracing::info!(device = %id, "device disconnected");
                if self.is_thermal_source(id) {
                    self.set_ir_device(None);
                }
            }
            EngineEvent::RestartRequested(id) => self.on_restart(id),
            EngineEvent::Reopen(id) => self.on_reopen(id),
            EngineEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineEvent::Control { control, reply } => {
                let _ = reply.send(self.on_control(control));
            }
            // Handled by the event loop.
            EngineEvent::Shutdown { .. } => {}
        }
    }

    fn on_detach(&mut self, id: UsbId) {
        self.manager.detach(id);
        self.restarting.remove(&id);
        if self.config.variant.devices().contains(&id) {
            // The detached device's sessions are already drained; this stops the rest.
            if let Err(e) = self.controller.stop_preview() {
                tracing::warn!(device = %id, error = %e, "stop preview after detach failed");
            }
        }
    }

    fn on_permission(&mut self, id: UsbId, granted: bool) {
        if let Err(e) = self.manager.permission(id, granted) {
            tracing::warn!(device = %id, error = %e, "permission answer rejected");
            return;
        }
        if granted {
            if let Err(e) = self.manager.connect(id) {
                tracing::debug!(device = %id, error = %e, "connect failed");
            }
        }
    }

    fn on_connected(&mut self, id: UsbId) {
        if self.is_thermal_source(id) {
            let node = self
                .manager
                .connected(id)
                .and_then(|d| d.identity.handle.node(SensorChannel::Ir.index()).map(str::to_string));
            match node.map(|path| UvcXuWriter::for_device(&path, id)) {
                Some(Ok(writer)) => self.set_ir_device(Some(writer)),
                Some(Err(e)) => tracing::warn!(device = %id, error = %e, "no IR command channel"),
                None => {}
            }
        }
        self.maybe_start_preview();
    }

    fn on_restart(&mut self, id: UsbId) {
        if !self.restarting.insert(id) {
            return;
        }
        if let Err(e) = self.controller.stop_preview() {
            tracing::warn!(device = %id, error = %e, "stop preview before restart failed");
        }
        if let Err(e) = self.manager.disconnect(id) {
            tracing::warn!(device = %id, error = %e, "disconnect before restart failed");
        }
        let delay = self.config.restart_delay;
        let engine = self.handle.clone();
        tracing::info!(device = %id, delay_ms = delay.as_millis() as u64, "restart scheduled");
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            engine.post(EngineEvent::Reopen(id));
        });
    }

    fn on_reopen(&mut self, id: UsbId) {
        if !self.restarting.remove(&id) {
            // Detached while waiting.
            return;
        }
        if self.manager.open(id.product_id) {
            tracing::info!(device = %id, "device reopened");
        } else {
            tracing::warn!(device = %id, state = %self.manager.state(id), "reopen failed");
        }
    }

    fn on_control(&mut self, control: Control) -> Result<(), EngineError> {
        tracing::info!(?control, "control request");
        match control {
            Control::Fusion(fusion) => self.controller.set_fusion_type(fusion),
            Control::Amplification(enabled) => self.controller.set_amplification(enabled),
            Control::Gain(status) => self.controller.set_gain_status(status)?,
            Control::StartPreview => {
                self.want_preview = true;
                self.controller.start_preview()?;
            }
            Control::StopPreview => {
                self.want_preview = false;
                self.controller.stop_preview()?;
            }
        }
        Ok(())
    }

    fn maybe_start_preview(&mut self) {
        if !self.want_preview || self.controller.is_previewing() {
            return;
        }
        let devices = self.config.variant.devices();
        if !devices.iter().all(|id| self.manager.state(*id).is_open()) {
            tracing::debug!("waiting for remaining devices before preview");
            return;
        }
        if let Err(e) = self.controller.start_preview() {
            tracing::warn!(error = %e, "automatic preview start failed");
        }
    }

    fn is_thermal_source(&self, id: UsbId) -> bool {
        self.config.variant.has_thermal() && self.config.variant.source().0 == id
    }

    fn set_ir_device(&self, writer: Option<UvcXuWriter>) {
        if let Some(target) = &self.ir_target {
            if let Some(w) = &writer {
                tracing::info!(device = %w.device_path(), "IR command channel ready");
            }
            target.set(writer);
        }
    }

    fn status(&self) -> StatusReport {
        let devices = self
            .config
            .variant
            .devices()
            .into_iter()
            .map(|id| DeviceStatus {
                id: id.to_string(),
                state: self.manager.state(id),
                generation: self.manager.generation(id),
                open_failures: self.manager.open_failures(id),
            })
            .collect();
        let c = &self.controller;
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            variant: c.variant().name(),
            frame_len: c.layout().frame_len(),
            devices,
            previewing: c.is_previewing(),
            fusion: c.fusion_type(),
            amplify: c.amplification(),
            gain: c.effective_gain(),
            gain_state: c.gain_state(),
            protection_engaged: c.protection_engaged(),
            gain_switches: self.stats.gain_switches.load(Ordering::Relaxed),
            overexposure_engaged: self.stats.overexposure_engaged.load(Ordering::Relaxed),
            fps: c.fps(),
            frames: c.frames_processed(),
            corrupt_frames: c.corrupt_frames(),
            companion_frames: c.companion_frames(),
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Builds the lifecycle manager and the controller for the configured
/// variant, then enters the event loop. Devices are brought up as hotplug
/// events arrive.
pub fn spawn_engine(
    config: Config,
    factory: Arc<dyn SessionFactory>,
    check: PermissionCheck,
    runtime: tokio::runtime::Handle,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
    let handle = EngineHandle { tx };

    let host = Arc::new(AccessHost::new(handle.clone(), check));
    let manager = Arc::new(DeviceLifecycleManager::new(host, factory));
    for (id, channels) in tracked_channels(&config.variant) {
        manager.track(id, channels);
    }
    manager.add_listener(Arc::new(LifecycleBridge {
        engine: handle.clone(),
    }));

    let (commands, ir_target): (Arc<dyn IrCommandSink>, Option<IrTarget>) =
        if config.variant.has_thermal() {
            let target = IrTarget::default();
            let queue = CommandQueue::spawn(Box::new(target.clone()))?;
            (Arc::new(queue), Some(target))
        } else {
            (Arc::new(DiscardSink), None)
        };

    let stats = Arc::new(StatsObserver::default());
    let parts = ControllerParts::new(Arc::clone(&manager), commands, Arc::new(LogSurface::default()))
        .with_observer(stats.clone());
    let controller = DualCameraController::new(config.variant, config.controller(), parts);

    tracing::info!(
        variant = config.variant.name(),
        devices = ?manager.tracked(),
        autostart = config.autostart,
        "engine configured"
    );

    let mut engine = Engine {
        want_preview: config.autostart,
        config,
        manager,
        controller,
        stats,
        ir_target,
        restarting: HashSet::new(),
        runtime,
        handle: handle.clone(),
    };

    std::thread::Builder::new()
        .name("dualcam-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut done = None;
            while let Some(event) = rx.blocking_recv() {
                match event {
                    EngineEvent::Shutdown { done: tx } => {
                        done = Some(tx);
                        break;
                    }
                    event => engine.handle_event(event),
                }
            }
            if let Err(e) = engine.controller.stop_preview() {
                tracing::warn!(error = %e, "stop preview on shutdown failed");
            }
            tracing::info!("engine thread exiting");
            if let Some(done) = done {
                let _ = done.send(());
            }
        })?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualcam_core::{FrameLayout, Resolution, Resolutions};
    use dualcam_hw::{ControlHandle, FrameSink, TransportError, UvcTransport};
    use std::time::Duration;

    const IR: UsbId = UsbId::new(0x0bda, 0x5830);

    #[derive(Default)]
    struct Transport {
        sink: Mutex<Option<FrameSink>>,
    }

    impl Transport {
        fn push(&self, frame: &[u8]) -> bool {
            let sink = self.sink.lock().unwrap();
            match sink.as_ref() {
                Some(sink) => {
                    sink(frame);
                    true
                }
                None => false,
            }
        }
    }

    impl UvcTransport for Transport {
        fn open(&self, _handle: &ControlHandle) -> Result<(), TransportError> {
            Ok(())
        }

        fn start_streaming(&self, sink: FrameSink) -> Result<(), TransportError> {
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn stop_streaming(&self) {
            self.sink.lock().unwrap().take();
        }

        fn close(&self) {}
    }

    #[derive(Default)]
    struct Factory {
        made: Mutex<Vec<Arc<Transport>>>,
    }

    impl Factory {
        fn latest(&self) -> Option<Arc<Transport>> {
            self.made.lock().unwrap().last().cloned()
        }
    }

    impl SessionFactory for Factory {
        fn transport(&self, _identity: &DeviceIdentity, _channel: SensorChannel) -> Arc<dyn UvcTransport> {
            let transport = Arc::new(Transport::default());
            self.made.lock().unwrap().push(Arc::clone(&transport));
            transport
        }
    }

    fn config() -> Config {
        let mut config = Config::from_lookup(|_| None);
        config.variant = CameraVariant::IrOnly { device: IR };
        config.resolutions = Resolutions::uniform(Resolution::new(4, 2));
        config.restart_delay = Duration::from_millis(10);
        config
    }

    async fn wait_for(engine: &EngineHandle, what: impl Fn(&StatusReport) -> bool) -> StatusReport {
        for _ in 0..200 {
            let status = engine.status().await.unwrap();
            if what(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_tracked_channels_per_variant() {
        let combined = UsbId::new(0x0bda, 0x5840);
        let vl = UsbId::new(0x0bda, 0x3901);
        let aligned = tracked_channels(&CameraVariant::ManualAligned {
            device: combined,
            offset: Default::default(),
        });
        assert_eq!(aligned[&combined], vec![SensorChannel::Ir, SensorChannel::Visible]);

        let external = tracked_channels(&CameraVariant::ExternalVisible { ir: IR, visible: vl });
        assert_eq!(external[&IR], vec![SensorChannel::Ir]);
        assert_eq!(external[&vl], vec![SensorChannel::Visible]);
    }

    #[tokio::test]
    async fn test_attach_brings_preview_up() {
        let factory = Arc::new(Factory::default());
        let engine = spawn_engine(
            config(),
            factory.clone(),
            Arc::new(|_: &DeviceIdentity| true),
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        engine.post(EngineEvent::Attach(DeviceIdentity::new(IR, ControlHandle::single("/dev/video0"))));
        let status = wait_for(&engine, |s| s.previewing).await;
        assert_eq!(status.devices[0].state, ConnectionState::Previewing);

        let frame_len = FrameLayout::new(Resolutions::ir_only(Resolution::new(4, 2))).frame_len();
        assert_eq!(status.frame_len, frame_len);
        assert!(factory.latest().unwrap().push(&vec![0u8; frame_len]));
        wait_for(&engine, |s| s.frames == 1).await;

        engine.control(Control::StopPreview).await.unwrap();
        let status = engine.status().await.unwrap();
        assert!(!status.previewing);
        assert_eq!(status.devices[0].state, ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_denied_permission_stays_closed() {
        let engine = spawn_engine(
            config(),
            Arc::new(Factory::default()),
            Arc::new(|_: &DeviceIdentity| false),
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        engine.post(EngineEvent::Attach(DeviceIdentity::new(IR, ControlHandle::single("/dev/video0"))));
        let status = wait_for(&engine, |s| s.devices[0].state == ConnectionState::Disconnected).await;
        assert!(!status.previewing);
        assert!(matches!(
            engine.control(Control::StartPreview).await,
            Err(EngineError::Controller(ControllerError::NotConnected { .. }))
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_restarts_device() {
        let factory = Arc::new(Factory::default());
        let engine = spawn_engine(
            config(),
            factory.clone(),
            Arc::new(|_: &DeviceIdentity| true),
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        engine.post(EngineEvent::Attach(DeviceIdentity::new(IR, ControlHandle::single("/dev/video0"))));
        let before = wait_for(&engine, |s| s.previewing).await;
        let first = factory.latest().unwrap();

        first.push(&[]);
        let after = wait_for(&engine, |s| {
            s.previewing && s.devices[0].generation != before.devices[0].generation
        })
        .await;
        assert_eq!(after.devices[0].state, ConnectionState::Previewing);
        assert!(!Arc::ptr_eq(&first, &factory.latest().unwrap()));
    }

    #[tokio::test]
    async fn test_detach_stops_preview() {
        let engine = spawn_engine(
            config(),
            Arc::new(Factory::default()),
            Arc::new(|_: &DeviceIdentity| true),
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        engine.post(EngineEvent::Attach(DeviceIdentity::new(IR, ControlHandle::single("/dev/video0"))));
        wait_for(&engine, |s| s.previewing).await;
        engine.post(EngineEvent::Detach(IR));
        let status = wait_for(&engine, |s| !s.previewing).await;
        assert_eq!(status.devices[0].state, ConnectionState::Detached);
        assert_eq!(status.devices[0].generation, None);
    }
}
