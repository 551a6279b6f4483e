//! USB device lifecycle state machine.
//!
//! One [`ConnectionState`] instance per tracked USB id, created on attach and
//! destroyed on detach. Every state-changing operation is serialized on a
//! single operations lock; listeners are notified after all locks are
//! released, in the order the events were produced, so a listener may call
//! back into the manager.
//!
//! The transitions themselves are a pure function ([`ConnectionState::on`])
//! so they can be tested without any USB stack.

use crate::session::{
    in_frame_callback, DeviceSession, FaultHook, FrameCallback, SessionError, SessionFault,
};
use crate::sync::{guarded, lock, ListenerSet};
use crate::usb::{DeviceIdentity, SensorChannel, SessionFactory, UsbHost, UsbId};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Consecutive open failures after which a device is reported unusable.
pub const UNUSABLE_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Detached,
    Attached,
    PermissionRequested,
    PermissionGranted,
    Connecting,
    Open,
    Previewing,
    Closing,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Attach,
    RequestPermission,
    Granted,
    Denied,
    Cancelled,
    Connect,
    Opened,
    OpenFailed,
    StartPreview,
    StopPreview,
    Detach,
    Disconnect,
    Closed,
}

impl ConnectionState {
    /// Apply one event. Anything outside the transition table is rejected.
    pub fn on(self, event: LifecycleEvent) -> Result<Self, LifecycleError> {
        use ConnectionState::*;
        use LifecycleEvent as E;

        let next = match (self, event) {
            (Detached, E::Attach) => Attached,
            (Attached, E::RequestPermission) => PermissionRequested,
            (PermissionRequested, E::Granted) => PermissionGranted,
            (PermissionRequested, E::Denied | E::Cancelled) => Disconnected,
            (PermissionGranted, E::Connect) => Connecting,
            (Connecting, E::Opened) => Open,
            (Connecting, E::OpenFailed) => Disconnected,
            (Open, E::StartPreview) => Previewing,
            (Previewing, E::StopPreview) => Open,
            (
                Attached | PermissionRequested | PermissionGranted | Connecting | Open | Previewing
                | Closing,
                E::Detach,
            ) => Disconnected,
            (Open | Previewing, E::Disconnect) => Closing,
            (Closing, E::Closed) => Disconnected,
            (from, event) => return Err(LifecycleError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Sessions exist and are open.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Previewing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("device {0} is not tracked")]
    Untracked(UsbId),
    #[error("device {0} is not attached")]
    NotAttached(UsbId),
    #[error("invalid transition: {event:?} in state {from:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: LifecycleEvent,
    },
    #[error("device {id} has no {channel} channel")]
    NoChannel { id: UsbId, channel: SensorChannel },
    #[error("opening {id} ({channel}) failed: {source}")]
    OpenFailed {
        id: UsbId,
        channel: SensorChannel,
        source: SessionError,
    },
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// A device that reached `Open`, with one session per channel.
#[derive(Clone)]
pub struct ConnectedDevice {
    pub identity: DeviceIdentity,
    /// Distinguishes state instances across reconnects of the same id.
    pub generation: u64,
    sessions: Vec<Arc<DeviceSession>>,
}

impl ConnectedDevice {
    pub fn session(&self, channel: SensorChannel) -> Option<&Arc<DeviceSession>> {
        self.sessions.iter().find(|s| s.channel() == channel)
    }

    pub fn channels(&self) -> Vec<SensorChannel> {
        self.sessions.iter().map(|s| s.channel()).collect()
    }

    /// Two sensors behind one enumeration.
    pub fn is_combined(&self) -> bool {
        self.sessions.len() > 1
    }
}

impl fmt::Debug for ConnectedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedDevice")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("channels", &self.channels())
            .finish()
    }
}

/// Lifecycle notifications. Every method defaults to a no-op.
pub trait LifecycleListener: Send + Sync {
    fn on_attach(&self, _identity: &DeviceIdentity) {}
    fn on_granted(&self, _id: UsbId, _granted: bool) {}
    fn on_connect(&self, _device: &ConnectedDevice) {}
    fn on_disconnect(&self, _id: UsbId) {}
    fn on_detach(&self, _id: UsbId) {}
    fn on_error(&self, _id: UsbId, _error: &LifecycleError) {}
    /// Repeated open failures: connected but unusable.
    fn on_unusable(&self, _id: UsbId, _failures: u32) {}
    /// A session delivered a zero-length frame. Called on the capture thread.
    fn on_restart_requested(&self, _id: UsbId, _channel: SensorChannel) {}
}

enum Notice {
    Attach(DeviceIdentity),
    Granted(UsbId, bool),
    Connect(ConnectedDevice),
    Disconnect(UsbId),
    Detach(UsbId),
    Error(UsbId, LifecycleError),
    Unusable(UsbId, u32),
}

struct Entry {
    identity: DeviceIdentity,
    state: ConnectionState,
    generation: u64,
    sessions: Vec<Arc<DeviceSession>>,
    /// Connect was announced and no disconnect has followed yet.
    announced: bool,
    /// Ended by a clean disconnect with the device still attached.
    reopenable: bool,
}

impl Entry {
    fn apply(&mut self, event: LifecycleEvent) -> Result<ConnectionState, LifecycleError> {
        let next = self.state.on(event)?;
        tracing::debug!(
            device = %self.identity.id,
            from = ?self.state,
            to = ?next,
            ?event,
            "lifecycle transition"
        );
        self.state = next;
        Ok(next)
    }
}

#[derive(Default)]
struct Inner {
    tracked: HashMap<UsbId, Vec<SensorChannel>>,
    entries: HashMap<UsbId, Entry>,
    open_failures: HashMap<UsbId, u32>,
    next_generation: u64,
}

impl Inner {
    fn entry(&mut self, id: UsbId) -> Result<&mut Entry, LifecycleError> {
        self.entries.get_mut(&id).ok_or(LifecycleError::NotAttached(id))
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

pub struct DeviceLifecycleManager {
    host: Arc<dyn UsbHost>,
    factory: Arc<dyn SessionFactory>,
    inner: Mutex<Inner>,
    /// Single-writer lock for every state-changing operation.
    ops: Mutex<()>,
    listeners: Arc<ListenerSet<dyn LifecycleListener>>,
    auto_request_permission: bool,
}

impl DeviceLifecycleManager {
    pub fn new(host: Arc<dyn UsbHost>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            host,
            factory,
            inner: Mutex::new(Inner::default()),
            ops: Mutex::new(()),
            listeners: Arc::new(ListenerSet::new()),
            auto_request_permission: true,
        }
    }

    /// Whether `attach` immediately asks the host for permission (default on).
    pub fn with_auto_permission(mut self, enabled: bool) -> Self {
        self.auto_request_permission = enabled;
        self
    }

    /// Start routing events for `id`. A combined endpoint lists both channels.
    pub fn track(&self, id: UsbId, channels: Vec<SensorChannel>) {
        tracing::info!(device = %id, ?channels, "tracking device");
        lock(&self.inner).tracked.insert(id, channels);
    }

    pub fn tracked(&self) -> Vec<UsbId> {
        let mut ids: Vec<UsbId> = lock(&self.inner).tracked.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LifecycleListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Current state; `Detached` when no instance exists.
    pub fn state(&self, id: UsbId) -> ConnectionState {
        lock(&self.inner)
            .entries
            .get(&id)
            .map_or(ConnectionState::Detached, |e| e.state)
    }

    pub fn generation(&self, id: UsbId) -> Option<u64> {
        lock(&self.inner).entries.get(&id).map(|e| e.generation)
    }

    pub fn session(&self, id: UsbId, channel: SensorChannel) -> Option<Arc<DeviceSession>> {
        lock(&self.inner)
            .entries
            .get(&id)?
            .sessions
            .iter()
            .find(|s| s.channel() == channel)
            .cloned()
    }

    pub fn connected(&self, id: UsbId) -> Option<ConnectedDevice> {
        let inner = lock(&self.inner);
        let entry = inner.entries.get(&id)?;
        entry.state.is_open().then(|| ConnectedDevice {
            identity: entry.identity.clone(),
            generation: entry.generation,
            sessions: entry.sessions.clone(),
        })
    }

    /// Consecutive open failures recorded for `id`.
    pub fn open_failures(&self, id: UsbId) -> u32 {
        lock(&self.inner).open_failures.get(&id).copied().unwrap_or(0)
    }

    /// USB attach event. Creates a fresh state instance; a duplicate attach
    /// for a live instance is ignored.
    pub fn attach(&self, identity: DeviceIdentity) {
        let id = identity.id;
        let mut notices = Vec::new();
        let mut ask = false;
        {
            let _ops = lock(&self.ops);
            let mut inner = lock(&self.inner);
            if !inner.tracked.contains_key(&id) {
                tracing::debug!(device = %id, "ignoring attach of untracked device");
                return;
            }
            if let Some(existing) = inner.entries.get(&id) {
                if existing.state != ConnectionState::Disconnected {
                    tracing::debug!(device = %id, state = ?existing.state, "duplicate attach ignored");
                    return;
                }
            }
            let generation = inner.generation();
            let mut entry = Entry {
                identity: identity.clone(),
                state: ConnectionState::Detached,
                generation,
                sessions: Vec::new(),
                announced: false,
                reopenable: false,
            };
            // Detached --attach--> Attached is always valid.
            if entry.apply(LifecycleEvent::Attach).is_ok() && self.auto_request_permission {
                ask = entry.apply(LifecycleEvent::RequestPermission).is_ok();
            }
            tracing::info!(device = %id, generation, "device attached");
            inner.entries.insert(id, entry);
            notices.push(Notice::Attach(identity.clone()));
        }
        if ask {
            self.host.request_permission(&identity);
        }
        self.dispatch(notices);
    }

    /// Explicit permission request for an attached device.
    pub fn request_permission(&self, id: UsbId) -> Result<(), LifecycleError> {
        let identity = {
            let _ops = lock(&self.ops);
            let mut inner = lock(&self.inner);
            let entry = inner.entry(id)?;
            entry.apply(LifecycleEvent::RequestPermission)?;
            entry.identity.clone()
        };
        self.host.request_permission(&identity);
        Ok(())
    }

    /// Permission answer from the USB host.
    pub fn permission(&self, id: UsbId, granted: bool) -> Result<(), LifecycleError> {
        {
            let _ops = lock(&self.ops);
            let mut inner = lock(&self.inner);
            let entry = inner.entry(id)?;
            if granted {
                entry.apply(LifecycleEvent::Granted)?;
            } else {
                entry.apply(LifecycleEvent::Denied)?;
                tracing::warn!(device = %id, "permission denied");
            }
        }
        self.dispatch(vec![Notice::Granted(id, granted)]);
        Ok(())
    }

    /// The user dismissed the permission prompt.
    pub fn cancel(&self, id: UsbId) -> Result<(), LifecycleError> {
        let _ops = lock(&self.ops);
        let mut inner = lock(&self.inner);
        inner.entry(id)?.apply(LifecycleEvent::Cancelled)?;
        tracing::info!(device = %id, "permission request cancelled");
        Ok(())
    }

    /// Open every channel session of a device whose permission was granted.
    ///
    /// `on_connect` fires only once all channels are open. If any channel
    /// fails the ones already opened are torn down and the instance ends.
    pub fn connect(&self, id: UsbId) -> Result<ConnectedDevice, LifecycleError> {
        let mut notices = Vec::new();
        let result = {
            let _ops = lock(&self.ops);
            let (identity, channels, generation) = {
                let mut inner = lock(&self.inner);
                let channels = inner
                    .tracked
                    .get(&id)
                    .cloned()
                    .ok_or(LifecycleError::Untracked(id))?;
                let entry = inner.entry(id)?;
                entry.apply(LifecycleEvent::Connect)?;
                (entry.identity.clone(), channels, entry.generation)
            };

            let mut opened: Vec<Arc<DeviceSession>> = Vec::with_capacity(channels.len());
            let mut failure = None;
            for channel in channels {
                let transport = self.factory.transport(&identity, channel);
                let session = Arc::new(
                    DeviceSession::new(id, channel, transport).with_fault_hook(self.fault_hook()),
                );
                match session.open(&identity.handle) {
                    Ok(()) => opened.push(session),
                    Err(source) => {
                        failure = Some(LifecycleError::OpenFailed {
                            id,
                            channel,
                            source,
                        });
                        break;
                    }
                }
            }

            match failure {
                None => {
                    let mut guard = lock(&self.inner);
                    let inner = &mut *guard;
                    inner.open_failures.remove(&id);
                    let entry = inner.entry(id)?;
                    entry.apply(LifecycleEvent::Opened)?;
                    entry.sessions = opened.clone();
                    entry.announced = true;
                    let device = ConnectedDevice {
                        identity,
                        generation,
                        sessions: opened,
                    };
                    tracing::info!(device = %id, generation, channels = ?device.channels(), "device open");
                    notices.push(Notice::Connect(device.clone()));
                    Ok(device)
                }
                Some(err) => {
                    for session in &opened {
                        session.retire();
                    }
                    let mut guard = lock(&self.inner);
                    let inner = &mut *guard;
                    let failures = {
                        let count = inner.open_failures.entry(id).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let entry = inner.entry(id)?;
                    entry.apply(LifecycleEvent::OpenFailed)?;
                    entry.reopenable = true;
                    tracing::warn!(device = %id, failures, error = %err, "device open failed");
                    notices.push(Notice::Error(id, err.clone()));
                    if failures >= UNUSABLE_AFTER {
                        tracing::error!(device = %id, failures, "device connected but unusable");
                        notices.push(Notice::Unusable(id, failures));
                    }
                    Err(err)
                }
            }
        };
        self.dispatch(notices);
        result
    }

    /// Synchronous open attempt used for manual reconnection.
    ///
    /// Succeeds if a device with product id `pid` is already open, has
    /// permission, or was cleanly disconnected while staying attached (the
    /// latter starts a new state instance).
    pub fn open(&self, pid: u16) -> bool {
        let id = {
            let _ops = lock(&self.ops);
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let Some(id) = inner
                .entries
                .keys()
                .copied()
                .filter(|id| id.product_id == pid)
                .min()
            else {
                tracing::debug!(pid = format_args!("{pid:04x}"), "open: no attached device");
                return false;
            };
            let generation = inner.generation();
            let Ok(entry) = inner.entry(id) else {
                return false;
            };
            match entry.state {
                ConnectionState::Open | ConnectionState::Previewing => return true,
                ConnectionState::PermissionGranted => {}
                ConnectionState::Disconnected if entry.reopenable => {
                    // Permission carries over to the new instance.
                    entry.state = ConnectionState::Detached;
                    entry.generation = generation;
                    entry.reopenable = false;
                    let renewed = entry
                        .apply(LifecycleEvent::Attach)
                        .and_then(|_| entry.apply(LifecycleEvent::RequestPermission))
                        .and_then(|_| entry.apply(LifecycleEvent::Granted));
                    if renewed.is_err() {
                        return false;
                    }
                    tracing::info!(device = %id, generation, "reopening device");
                }
                state => {
                    tracing::debug!(device = %id, ?state, "open: not reopenable");
                    return false;
                }
            }
            id
        };
        self.connect(id).is_ok()
    }

    /// Register `callback` on one channel and move the device to `Previewing`.
    pub fn start_preview(
        &self,
        id: UsbId,
        channel: SensorChannel,
        callback: FrameCallback,
    ) -> Result<(), LifecycleError> {
        let _ops = lock(&self.ops);
        let session = {
            let mut inner = lock(&self.inner);
            let entry = inner.entry(id)?;
            if !entry.state.is_open() {
                return Err(LifecycleError::InvalidTransition {
                    from: entry.state,
                    event: LifecycleEvent::StartPreview,
                });
            }
            entry
                .sessions
                .iter()
                .find(|s| s.channel() == channel)
                .cloned()
                .ok_or(LifecycleError::NoChannel { id, channel })?
        };
        session.start_preview(callback)?;
        let mut inner = lock(&self.inner);
        let entry = inner.entry(id)?;
        if entry.state == ConnectionState::Open {
            entry.apply(LifecycleEvent::StartPreview)?;
        }
        Ok(())
    }

    /// Stop every channel of a previewing device. Blocks until no frame
    /// callback of this device is running or will run.
    ///
    /// Safe from a frame callback: there the single-writer lock is skipped,
    /// since a detach or disconnect holding it may be waiting for that very
    /// callback to drain.
    pub fn stop_preview(&self, id: UsbId) -> Result<(), LifecycleError> {
        let _ops = if in_frame_callback() {
            None
        } else {
            Some(lock(&self.ops))
        };
        let sessions = {
            let mut inner = lock(&self.inner);
            let entry = inner.entry(id)?;
            if entry.state != ConnectionState::Previewing {
                return Ok(());
            }
            entry.sessions.clone()
        };
        for session in &sessions {
            session.stop_preview()?;
        }
        let mut inner = lock(&self.inner);
        let entry = inner.entry(id)?;
        // Without the writer lock a disconnect may have moved on already.
        if entry.state == ConnectionState::Previewing {
            entry.apply(LifecycleEvent::StopPreview)?;
        }
        Ok(())
    }

    /// Close an open device while it stays attached. Fires one disconnect.
    pub fn disconnect(&self, id: UsbId) -> Result<(), LifecycleError> {
        {
            let _ops = lock(&self.ops);
            let sessions = {
                let mut inner = lock(&self.inner);
                let entry = inner.entry(id)?;
                if entry.state == ConnectionState::Disconnected {
                    return Ok(());
                }
                entry.apply(LifecycleEvent::Disconnect)?;
                std::mem::take(&mut entry.sessions)
            };
            for session in &sessions {
                if let Err(e) = session.close() {
                    tracing::warn!(device = %id, error = %e, "session close failed");
                }
                session.retire();
            }
            let mut inner = lock(&self.inner);
            let entry = inner.entry(id)?;
            entry.apply(LifecycleEvent::Closed)?;
            entry.announced = false;
            entry.reopenable = true;
            tracing::info!(device = %id, "device disconnected");
        }
        self.dispatch(vec![Notice::Disconnect(id)]);
        Ok(())
    }

    /// USB detach event. Terminal for the current instance; sessions are
    /// torn down and a disconnect fires if connect had been announced.
    pub fn detach(&self, id: UsbId) {
        let mut notices = Vec::new();
        {
            let _ops = lock(&self.ops);
            let Some(mut entry) = lock(&self.inner).entries.remove(&id) else {
                tracing::debug!(device = %id, "detach of unknown device ignored");
                return;
            };
            if entry.state != ConnectionState::Disconnected {
                // Every live state accepts a detach.
                let _ = entry.apply(LifecycleEvent::Detach);
            }
            for session in &entry.sessions {
                session.retire();
            }
            if entry.announced {
                notices.push(Notice::Disconnect(id));
            }
            notices.push(Notice::Detach(id));
            tracing::info!(device = %id, generation = entry.generation, "device detached");
        }
        self.dispatch(notices);
    }

    fn fault_hook(&self) -> FaultHook {
        let listeners = Arc::clone(&self.listeners);
        Arc::new(move |id, channel, fault| match fault {
            SessionFault::RestartRequested => {
                for listener in listeners.snapshot().iter() {
                    guarded("lifecycle", || listener.on_restart_requested(id, channel));
                }
            }
        })
    }

    fn dispatch(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let listeners = self.listeners.snapshot();
        for notice in &notices {
            for listener in listeners.iter() {
                guarded("lifecycle", || match notice {
                    Notice::Attach(identity) => listener.on_attach(identity),
                    Notice::Granted(id, granted) => listener.on_granted(*id, *granted),
                    Notice::Connect(device) => listener.on_connect(device),
                    Notice::Disconnect(id) => listener.on_disconnect(*id),
                    Notice::Detach(id) => listener.on_detach(*id),
                    Notice::Error(id, error) => listener.on_error(*id, error),
                    Notice::Unusable(id, failures) => listener.on_unusable(*id, *failures),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{ControlHandle, FrameSink, TransportError, UvcTransport};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const IR: UsbId = UsbId::new(0x0bda, 0x5830);
    const COMBINED: UsbId = UsbId::new(0x0bda, 0x5840);

    #[derive(Default)]
    struct Host {
        requests: AtomicUsize,
    }

    impl UsbHost for Host {
        fn request_permission(&self, _identity: &DeviceIdentity) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullTransport {
        fail_open: bool,
        closed: Arc<AtomicUsize>,
    }

    impl UvcTransport for NullTransport {
        fn open(&self, _handle: &ControlHandle) -> Result<(), TransportError> {
            if self.fail_open {
                Err(TransportError::Busy("EBUSY".into()))
            } else {
                Ok(())
            }
        }
        fn start_streaming(&self, _sink: FrameSink) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_streaming(&self) {}
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Factory {
        fail_visible: AtomicBool,
        fail_all: AtomicBool,
        closed: Arc<AtomicUsize>,
    }

    impl SessionFactory for Factory {
        fn transport(&self, _identity: &DeviceIdentity, channel: SensorChannel) -> Arc<dyn UvcTransport> {
            let fail_open = self.fail_all.load(Ordering::SeqCst)
                || (channel == SensorChannel::Visible && self.fail_visible.load(Ordering::SeqCst));
            Arc::new(NullTransport {
                fail_open,
                closed: Arc::clone(&self.closed),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            lock(&self.events).clone()
        }
        fn push(&self, e: String) {
            lock(&self.events).push(e);
        }
    }

    impl LifecycleListener for Recorder {
        fn on_attach(&self, identity: &DeviceIdentity) {
            self.push(format!("attach {}", identity.id));
        }
        fn on_granted(&self, id: UsbId, granted: bool) {
            self.push(format!("granted {id} {granted}"));
        }
        fn on_connect(&self, device: &ConnectedDevice) {
            self.push(format!("connect {} x{}", device.identity.id, device.channels().len()));
        }
        fn on_disconnect(&self, id: UsbId) {
            self.push(format!("disconnect {id}"));
        }
        fn on_detach(&self, id: UsbId) {
            self.push(format!("detach {id}"));
        }
        fn on_error(&self, id: UsbId, _error: &LifecycleError) {
            self.push(format!("error {id}"));
        }
        fn on_unusable(&self, id: UsbId, failures: u32) {
            self.push(format!("unusable {id} {failures}"));
        }
    }

    fn setup() -> (DeviceLifecycleManager, Arc<Host>, Arc<Factory>, Arc<Recorder>) {
        let host = Arc::new(Host::default());
        let factory = Arc::new(Factory::default());
        let manager = DeviceLifecycleManager::new(
            Arc::clone(&host) as Arc<dyn UsbHost>,
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
        );
        manager.track(IR, vec![SensorChannel::Ir]);
        manager.track(COMBINED, vec![SensorChannel::Ir, SensorChannel::Visible]);
        let recorder = Arc::new(Recorder::default());
        manager.add_listener(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);
        (manager, host, factory, recorder)
    }

    fn identity(id: UsbId) -> DeviceIdentity {
        DeviceIdentity::new(id, ControlHandle::single("/dev/video0"))
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        use LifecycleEvent as E;
        assert_eq!(Detached.on(E::Attach).unwrap(), Attached);
        assert_eq!(Previewing.on(E::Detach).unwrap(), Disconnected);
        assert_eq!(Open.on(E::Disconnect).unwrap(), Closing);
        assert_eq!(Closing.on(E::Closed).unwrap(), Disconnected);
        assert_eq!(PermissionRequested.on(E::Cancelled).unwrap(), Disconnected);
        assert!(Detached.on(E::Connect).is_err());
        assert!(Attached.on(E::Granted).is_err());
        assert!(Disconnected.on(E::Detach).is_err());
        assert!(Disconnected.on(E::Granted).is_err());
    }

    #[test]
    fn test_attach_requests_permission() {
        let (manager, host, _, recorder) = setup();
        manager.attach(identity(IR));
        assert_eq!(manager.state(IR), ConnectionState::PermissionRequested);
        assert_eq!(host.requests.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.events(), vec!["attach 0bda:5830"]);
    }

    #[test]
    fn test_duplicate_attach_is_ignored() {
        let (manager, host, _, recorder) = setup();
        manager.attach(identity(IR));
        let generation = manager.generation(IR);
        manager.attach(identity(IR));
        assert_eq!(manager.generation(IR), generation);
        assert_eq!(host.requests.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn test_untracked_attach_is_ignored() {
        let (manager, _, _, recorder) = setup();
        manager.attach(identity(UsbId::new(0x1234, 0x5678)));
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_denied_permission_is_terminal() {
        let (manager, _, _, _) = setup();
        manager.attach(identity(IR));
        manager.permission(IR, false).unwrap();
        assert_eq!(manager.state(IR), ConnectionState::Disconnected);
        assert!(manager.connect(IR).is_err());
        assert!(!manager.open(IR.product_id));
        assert_eq!(manager.state(IR), ConnectionState::Disconnected);
    }

    #[test]
    fn test_combined_connect_fires_once_after_both_open() {
        let (manager, _, _, recorder) = setup();
        manager.attach(identity(COMBINED));
        manager.permission(COMBINED, true).unwrap();
        let device = manager.connect(COMBINED).unwrap();
        assert!(device.is_combined());
        assert_eq!(manager.state(COMBINED), ConnectionState::Open);
        let connects: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("connect"))
            .collect();
        assert_eq!(connects, vec!["connect 0bda:5840 x2"]);
    }

    #[test]
    fn test_partial_open_tears_down_the_other_channel() {
        let (manager, _, factory, recorder) = setup();
        factory.fail_visible.store(true, Ordering::SeqCst);
        manager.attach(identity(COMBINED));
        manager.permission(COMBINED, true).unwrap();
        let err = manager.connect(COMBINED).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::OpenFailed {
                channel: SensorChannel::Visible,
                ..
            }
        ));
        assert_eq!(manager.state(COMBINED), ConnectionState::Disconnected);
        // The IR channel opened and was closed again.
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert!(!recorder.events().iter().any(|e| e.starts_with("connect")));
        assert!(recorder.events().contains(&"error 0bda:5840".to_string()));
    }

    #[test]
    fn test_repeated_open_failures_report_unusable() {
        let (manager, _, factory, recorder) = setup();
        factory.fail_all.store(true, Ordering::SeqCst);
        for _ in 0..UNUSABLE_AFTER {
            manager.attach(identity(IR));
            manager.permission(IR, true).unwrap();
            assert!(manager.connect(IR).is_err());
            manager.detach(IR);
        }
        assert_eq!(manager.open_failures(IR), UNUSABLE_AFTER);
        assert!(recorder.events().contains(&"unusable 0bda:5830 3".to_string()));

        factory.fail_all.store(false, Ordering::SeqCst);
        manager.attach(identity(IR));
        manager.permission(IR, true).unwrap();
        manager.connect(IR).unwrap();
        assert_eq!(manager.open_failures(IR), 0);
    }

    #[test]
    fn test_disconnect_then_detach_fires_one_disconnect() {
        let (manager, _, _, recorder) = setup();
        manager.attach(identity(IR));
        manager.permission(IR, true).unwrap();
        manager.connect(IR).unwrap();
        manager.disconnect(IR).unwrap();
        manager.disconnect(IR).unwrap();
        manager.detach(IR);
        let disconnects = recorder
            .events()
            .iter()
            .filter(|e| e.starts_with("disconnect"))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(manager.state(IR), ConnectionState::Detached);
    }

    #[test]
    fn test_open_reopens_after_clean_disconnect() {
        let (manager, _, _, _) = setup();
        manager.attach(identity(IR));
        manager.permission(IR, true).unwrap();
        manager.connect(IR).unwrap();
        let first = manager.generation(IR).unwrap();
        assert!(manager.open(IR.product_id));

        manager.disconnect(IR).unwrap();
        assert!(manager.open(IR.product_id));
        assert_eq!(manager.state(IR), ConnectionState::Open);
        assert!(manager.generation(IR).unwrap() > first);
    }

    #[test]
    fn test_open_unknown_pid_fails() {
        let (manager, _, _, _) = setup();
        assert!(!manager.open(0x9999));
    }

    #[test]
    fn test_listener_removed_stops_receiving() {
        let (manager, _, _, recorder) = setup();
        let as_dyn = Arc::clone(&recorder) as Arc<dyn LifecycleListener>;
        assert!(manager.remove_listener(&as_dyn));
        manager.attach(identity(IR));
        assert!(recorder.events().is_empty());
    }
}
